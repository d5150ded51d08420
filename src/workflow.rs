use crate::cli::{FitArgs, PredictArgs};
use crate::dki::{self, DkiModel, ScalarMap, ScalarMaps};
use crate::error::{DkiError, Result};
use crate::gradients::GradientTable;
use crate::settings::FitSettings;
use crate::volume::{derived_header, read_mask, read_volume, write_volume, NiftiVolume};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

pub const PARAMS_NAME: &str = "params";
pub const PREDICTION_NAME: &str = "prediction";

/// file name of a dki output volume
pub fn output_file(out_dir: &Path, name: &str) -> PathBuf {
    out_dir.join(format!("dki_{name}.nii.gz"))
}

/// names of every volume written by [fit_dki], in write order
pub fn fit_output_names() -> Vec<&'static str> {
    ScalarMap::ALL.iter().map(|m| m.name()).chain([PARAMS_NAME]).collect()
}

fn thread_pool(settings: &FitSettings) -> Result<ThreadPool> {
    Ok(ThreadPoolBuilder::new().num_threads(settings.threads).build()?)
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        info!(dir = %dir.display(), "creating output directory");
    }
    fs::create_dir_all(dir).map_err(|e| DkiError::io(dir, e))
}

fn log_settings(settings: &FitSettings) {
    info!(
        fit_method = ?settings.fit_method,
        min_signal = settings.min_signal,
        threads = settings.threads,
        "fit settings"
    );
}

fn log_gradient_table(gtab: &GradientTable) {
    info!(
        entries = gtab.len(),
        b0s = gtab.n_b0(),
        shells = gtab.n_shells(),
        b0_threshold = gtab.b0_threshold(),
        "gradient table loaded"
    );
}

/// Fits the kurtosis model and writes the scalar maps and the parameter volume to the output
/// directory. Returns the written files.
pub fn fit_dki(args: &FitArgs, settings: &FitSettings) -> Result<Vec<PathBuf>> {
    let now = Instant::now();
    log_settings(settings);
    let gtab = GradientTable::from_files(&[(&args.bval, &args.bvec)], args.b0_threshold)?;
    log_gradient_table(&gtab);

    info!(dwi = %args.dwi.display(), "loading diffusion-weighted image");
    let dwi = read_volume(&args.dwi)?;
    let header = derived_header(&dwi.header);
    let data = dwi.into_4d()?;
    let mask = args.mask.as_ref().map(read_mask).transpose()?;

    let model = DkiModel::new(gtab, settings.clone())?;
    let pool = thread_pool(settings)?;
    let params = pool.install(|| model.fit(data.view(), mask.as_ref().map(|m| m.view())))?;
    let maps = pool.install(|| ScalarMaps::new(settings).compute(params.view()))?;

    ensure_dir(&args.out_dir)?;
    let mut written = Vec::with_capacity(maps.len() + 1);
    for (map, vol) in &maps {
        let path = output_file(&args.out_dir, map.name());
        write_volume(&path, vol, &header)?;
        written.push(path);
    }
    let path = output_file(&args.out_dir, PARAMS_NAME);
    write_volume(&path, &params, &header)?;
    written.push(path);

    info!(files = written.len(), secs = now.elapsed().as_secs_f32(), "fit complete");
    Ok(written)
}

/// Predicts the signal for the concatenated gradient tables and writes it to the output directory
pub fn predict_dki(args: &PredictArgs, settings: &FitSettings) -> Result<PathBuf> {
    let now = Instant::now();
    log_settings(settings);
    let pairs = args.pairs()?;
    let gtab = GradientTable::from_files(&pairs, args.b0_threshold)?;
    log_gradient_table(&gtab);

    info!(params = %args.params.display(), "loading model parameters");
    let params = read_volume(&args.params)?;
    let header = derived_header(&params.header);
    let params = params.into_4d()?;
    let s0 = args
        .s0_file
        .as_ref()
        .map(|p| read_volume(p).and_then(NiftiVolume::into_3d))
        .transpose()?;

    let pool = thread_pool(settings)?;
    let predicted = pool.install(|| dki::predict(params.view(), &gtab, s0.as_ref().map(|s| s.view())))?;

    ensure_dir(&args.out_dir)?;
    let path = output_file(&args.out_dir, PREDICTION_NAME);
    write_volume(&path, &predicted, &header)?;

    info!(volumes = gtab.len(), secs = now.elapsed().as_secs_f32(), "prediction complete");
    Ok(path)
}
