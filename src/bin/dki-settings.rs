use anyhow::Context;
use clap::Parser;
use dki_tools::settings::{FitSettings, SETTINGS_ENV};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Writes the default fit settings. Point DKI_SETTINGS at the edited file to use it.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// path to settings file to write
    settings_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut toml_string = FitSettings::default().to_toml()?;
    toml_string.push('\n');
    let filename = args.settings_file.with_extension("toml");
    let mut f = File::create(&filename).with_context(|| format!("can't create {}", filename.display()))?;
    f.write_all(toml_string.as_bytes())
        .with_context(|| format!("can't write {}", filename.display()))?;
    println!("wrote default settings to {} (use with {SETTINGS_ENV})", filename.display());
    Ok(())
}
