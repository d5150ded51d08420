use crate::error::{DkiError, Result};
use clap::error::ErrorKind;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command, FromArgMatches};
use std::path::PathBuf;

pub const DEFAULT_B0_THRESHOLD: &str = "50";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// estimate model parameters from diffusion-weighted data
    Fit,
    /// synthesize diffusion-weighted signal from model parameters
    Predict,
}

impl ToolKind {
    fn suffix(&self) -> &'static str {
        match self {
            ToolKind::Fit => "fit",
            ToolKind::Predict => "predict",
        }
    }
}

fn parse_b0_threshold(s: &str) -> std::result::Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if v.is_finite() && v >= 0. {
        Ok(v)
    } else {
        Err(format!("b0 threshold must be non-negative, got {v}"))
    }
}

fn path_arg(id: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
        .help(help)
}

/// Builds the argument schema for a `model` tool of the given kind. The binary is named
/// `<model>-fit` or `<model>-predict`.
pub fn model_command(kind: ToolKind, model: &'static str) -> Command {
    let cmd = Command::new(model)
        .bin_name(format!("{model}-{}", kind.suffix()))
        .version(env!("CARGO_PKG_VERSION"));

    let cmd = match kind {
        ToolKind::Fit => cmd
            .about(format!("Fit the {model} model to diffusion-weighted data"))
            .arg(path_arg("dwi", "diffusion-weighted image (4-D nifti)").required(true))
            .arg(path_arg("bval", "b-value text file").required(true))
            .arg(path_arg("bvec", "b-vector text file").required(true))
            .arg(path_arg("mask", "brain mask restricting the fit (3-D nifti)")),
        ToolKind::Predict => cmd
            .about(format!("Predict diffusion-weighted signal from fitted {model} parameters"))
            .arg(path_arg("params", "fitted parameter volume (4-D nifti)").required(true))
            .arg(
                path_arg("bval", "b-value text files, paired in order with --bvec")
                    .num_args(1..)
                    .action(ArgAction::Append)
                    .required(true),
            )
            .arg(
                path_arg("bvec", "b-vector text files, paired in order with --bval")
                    .num_args(1..)
                    .action(ArgAction::Append)
                    .required(true),
            )
            .arg(path_arg("s0_file", "baseline signal used to scale the prediction (3-D nifti)")),
    };

    cmd.arg(
        Arg::new("out_dir")
            .long("out_dir")
            .value_name("DIR")
            .value_parser(value_parser!(PathBuf))
            .required(true)
            .help("directory the output volumes are written to"),
    )
    .arg(
        Arg::new("b0_threshold")
            .long("b0_threshold")
            .value_name("BVAL")
            .value_parser(parse_b0_threshold)
            .allow_negative_numbers(true)
            .default_value(DEFAULT_B0_THRESHOLD)
            .help("b-values at or below this are treated as baseline volumes"),
    )
}

fn required<T: Clone + Send + Sync + 'static>(m: &ArgMatches, id: &str) -> std::result::Result<T, clap::Error> {
    m.get_one::<T>(id)
        .cloned()
        .ok_or_else(|| clap::Error::raw(ErrorKind::MissingRequiredArgument, format!("--{id} is required\n")))
}

fn required_many(m: &ArgMatches, id: &str) -> std::result::Result<Vec<PathBuf>, clap::Error> {
    match m.get_many::<PathBuf>(id) {
        Some(values) => Ok(values.cloned().collect()),
        None => Err(clap::Error::raw(ErrorKind::MissingRequiredArgument, format!("--{id} is required\n"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitArgs {
    pub dwi: PathBuf,
    pub bval: PathBuf,
    pub bvec: PathBuf,
    pub mask: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub b0_threshold: f64,
}

impl FromArgMatches for FitArgs {
    fn from_arg_matches(m: &ArgMatches) -> std::result::Result<Self, clap::Error> {
        Ok(Self {
            dwi: required(m, "dwi")?,
            bval: required(m, "bval")?,
            bvec: required(m, "bvec")?,
            mask: m.get_one::<PathBuf>("mask").cloned(),
            out_dir: required(m, "out_dir")?,
            b0_threshold: required(m, "b0_threshold")?,
        })
    }

    fn update_from_arg_matches(&mut self, m: &ArgMatches) -> std::result::Result<(), clap::Error> {
        *self = Self::from_arg_matches(m)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictArgs {
    pub params: PathBuf,
    pub bval: Vec<PathBuf>,
    pub bvec: Vec<PathBuf>,
    pub s0_file: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub b0_threshold: f64,
}

impl PredictArgs {
    /// Pairs b-value and b-vector files by position. Lists of different length are rejected rather
    /// than truncated to the shorter one.
    pub fn pairs(&self) -> Result<Vec<(PathBuf, PathBuf)>> {
        if self.bval.len() != self.bvec.len() {
            return Err(DkiError::ArgumentCount { bvals: self.bval.len(), bvecs: self.bvec.len() });
        }
        Ok(self.bval.iter().cloned().zip(self.bvec.iter().cloned()).collect())
    }
}

impl FromArgMatches for PredictArgs {
    fn from_arg_matches(m: &ArgMatches) -> std::result::Result<Self, clap::Error> {
        Ok(Self {
            params: required(m, "params")?,
            bval: required_many(m, "bval")?,
            bvec: required_many(m, "bvec")?,
            s0_file: m.get_one::<PathBuf>("s0_file").cloned(),
            out_dir: required(m, "out_dir")?,
            b0_threshold: required(m, "b0_threshold")?,
        })
    }

    fn update_from_arg_matches(&mut self, m: &ArgMatches) -> std::result::Result<(), clap::Error> {
        *self = Self::from_arg_matches(m)?;
        Ok(())
    }
}
