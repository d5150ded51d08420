use anyhow::Context;
use clap::FromArgMatches;
use dki_tools::cli::{model_command, PredictArgs, ToolKind};
use dki_tools::settings::FitSettings;
use dki_tools::workflow::predict_dki;

fn main() -> anyhow::Result<()> {
    let matches = model_command(ToolKind::Predict, "dki").get_matches();
    let args = PredictArgs::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    dki_tools::init_logging();
    let settings = FitSettings::from_env().context("failed to load settings")?;
    let path = predict_dki(&args, &settings)
        .with_context(|| format!("failed to predict signal from {}", args.params.display()))?;
    println!("{}", path.display());
    Ok(())
}
