pub mod cli;
pub mod dki;
pub mod error;
pub mod gradients;
pub mod settings;
pub mod sphere;
pub mod volume;
pub mod workflow;

pub use error::{DkiError, Result};

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber for the command line tools. `RUST_LOG` overrides the default `info`
/// level.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
