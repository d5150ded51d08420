use anyhow::Context;
use clap::FromArgMatches;
use dki_tools::cli::{model_command, FitArgs, ToolKind};
use dki_tools::settings::FitSettings;
use dki_tools::workflow::fit_dki;

fn main() -> anyhow::Result<()> {
    let matches = model_command(ToolKind::Fit, "dki").get_matches();
    let args = FitArgs::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    dki_tools::init_logging();
    let settings = FitSettings::from_env().context("failed to load fit settings")?;
    let written = fit_dki(&args, &settings)
        .with_context(|| format!("failed to fit dki model to {}", args.dwi.display()))?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
