use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DkiError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: unable to parse '{token}' as a number", path.display())]
    Parse { path: PathBuf, token: String },
    #[error("{}: {reason}", path.display())]
    Table { path: PathBuf, reason: String },
    #[error("invalid gradient table: {0}")]
    GradientTable(String),
    #[error("expected the same number of b-value and b-vector files, got {bvals} and {bvecs}")]
    ArgumentCount { bvals: usize, bvecs: usize },
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("failed to read or write nifti {}: {source}", path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::error::NiftiError,
    },
    #[error("invalid settings file {}: {reason}", path.display())]
    Settings { path: PathBuf, reason: String },
    #[error("failed to serialize settings: {0}")]
    SettingsFormat(#[from] toml::ser::Error),
    #[error("linear solve failed: {0}")]
    Linalg(&'static str),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, DkiError>;

impl DkiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DkiError::Io { path: path.into(), source }
    }

    pub(crate) fn nifti(path: impl Into<PathBuf>, source: nifti::error::NiftiError) -> Self {
        DkiError::Nifti { path: path.into(), source }
    }
}
