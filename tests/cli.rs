use std::fs;
use std::path::Path;

use assert_cmd::Command;
use dki_tools::volume::{read_volume, write_volume};
use dki_tools::workflow::{fit_output_names, output_file, PARAMS_NAME, PREDICTION_NAME};
use ndarray::{Array4, Axis, ShapeBuilder};
use nifti::NiftiHeader;
use tempfile::TempDir;

fn write_four_direction_dataset(dir: &Path) {
    fs::write(dir.join("d.bval"), "0 1000 1000 1000\n").unwrap();
    fs::write(dir.join("d.bvec"), "0 1 0 0\n0 0 1 0\n0 0 0 1\n").unwrap();
    let attenuation = [1., 0.4, 0.6, 0.7];
    let data = Array4::<f32>::from_shape_fn((3, 3, 2, 4).f(), |(x, _, _, t)| 100. * (1 + x) as f32 * attenuation[t]);
    write_volume(dir.join("d.nii"), &data, &NiftiHeader::default()).unwrap();
}

#[test]
fn help_smoke() {
    for bin in ["dki-fit", "dki-predict", "dki-settings"] {
        Command::cargo_bin(bin).unwrap().arg("--help").assert().success();
    }
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn missing_required_flag_exits_before_io() {
    let tmp = TempDir::new().unwrap();
    write_four_direction_dataset(tmp.path());

    let output = Command::cargo_bin("dki-fit")
        .unwrap()
        .current_dir(tmp.path())
        .args(["--dwi", "d.nii", "--bval", "d.bval", "--out_dir", "out"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("--bvec"));

    let output = Command::cargo_bin("dki-predict")
        .unwrap()
        .current_dir(tmp.path())
        .args(["--bval", "d.bval", "--bvec", "d.bvec", "--out_dir", "out"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("--params"));

    assert!(!tmp.path().join("out").exists());
}

#[test]
fn settings_file_from_environment() {
    let tmp = TempDir::new().unwrap();
    write_four_direction_dataset(tmp.path());
    fs::write(tmp.path().join("ols.toml"), "fit_method = \"ols\"\n").unwrap();
    fs::write(tmp.path().join("bad.toml"), "min_kurtosis = 5.0\nmax_kurtosis = 1.0\n").unwrap();

    let output = Command::cargo_bin("dki-fit")
        .unwrap()
        .current_dir(tmp.path())
        .env("DKI_SETTINGS", tmp.path().join("ols.toml"))
        .env("RUST_LOG", "info")
        .args(["--dwi", "d.nii", "--bval", "d.bval", "--bvec", "d.bvec", "--out_dir", "ols"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr_of(&output));
    assert!(stderr_of(&output).contains("Ols"));
    assert!(output_file(&tmp.path().join("ols"), PARAMS_NAME).exists());

    let output = Command::cargo_bin("dki-fit")
        .unwrap()
        .current_dir(tmp.path())
        .env("DKI_SETTINGS", tmp.path().join("bad.toml"))
        .args(["--dwi", "d.nii", "--bval", "d.bval", "--bvec", "d.bvec", "--out_dir", "bad"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("min_kurtosis"));
    assert!(!tmp.path().join("bad").exists());
}

#[test]
fn fit_writes_parameter_maps() {
    let tmp = TempDir::new().unwrap();
    write_four_direction_dataset(tmp.path());

    Command::cargo_bin("dki-fit")
        .unwrap()
        .current_dir(tmp.path())
        .args(["--dwi", "d.nii", "--bval", "d.bval", "--bvec", "d.bvec", "--out_dir", "out", "--b0_threshold", "50"])
        .assert()
        .success();

    let out = tmp.path().join("out");
    let mut found = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    found.sort();
    let mut expected = fit_output_names()
        .iter()
        .map(|n| output_file(Path::new(""), n).to_string_lossy().to_string())
        .collect::<Vec<_>>();
    expected.sort();
    assert_eq!(found, expected);

    let params = read_volume(output_file(&out, PARAMS_NAME)).unwrap().into_4d().unwrap();
    assert_eq!(params.dim(), (3, 3, 2, 27));
}

#[test]
fn predict_concatenates_gradient_files() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.bval"), "0 1000 1000\n").unwrap();
    fs::write(dir.join("a.bvec"), "0 0 0\n1 0 0\n0 1 0\n").unwrap();
    fs::write(dir.join("b.bval"), "5 2000 2000 2000 2000\n").unwrap();
    fs::write(dir.join("b.bvec"), "0 1 0 0 0.6\n0 0 1 0 0.8\n0 0 0 1 0\n").unwrap();

    let mut params = Array4::<f32>::zeros((2, 2, 1, 27).f());
    // isotropic tensor with identity eigenvectors and no kurtosis
    for idx in [0, 1, 2] {
        params.index_axis_mut(Axis(3), idx).fill(1e-3);
    }
    for idx in [3, 7, 11] {
        params.index_axis_mut(Axis(3), idx).fill(1.);
    }
    write_volume(dir.join("params.nii.gz"), &params, &NiftiHeader::default()).unwrap();

    Command::cargo_bin("dki-predict")
        .unwrap()
        .current_dir(dir)
        .args([
            "--params", "params.nii.gz", "--bval", "a.bval", "b.bval", "--bvec", "a.bvec", "b.bvec", "--out_dir", "pred",
        ])
        .assert()
        .success();

    let predicted = read_volume(output_file(&dir.join("pred"), PREDICTION_NAME)).unwrap().into_4d().unwrap();
    assert_eq!(predicted.dim(), (2, 2, 1, 8));
    assert_eq!(predicted[[0, 0, 0, 0]], 1.);
    assert!(predicted[[0, 0, 0, 1]] < 1.);
}

#[test]
fn predict_rejects_unpaired_gradient_files() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.bval"), "0 1000 1000\n").unwrap();
    fs::write(dir.join("a.bvec"), "0 0 0\n1 0 0\n0 1 0\n").unwrap();

    Command::cargo_bin("dki-predict")
        .unwrap()
        .current_dir(dir)
        .args([
            "--params", "params.nii.gz", "--bval", "a.bval", "a.bval", "--bvec", "a.bvec", "--out_dir", "pred",
        ])
        .assert()
        .failure();
    assert!(!dir.join("pred").exists());
}

#[test]
fn settings_tool_writes_defaults() {
    let tmp = TempDir::new().unwrap();
    Command::cargo_bin("dki-settings")
        .unwrap()
        .arg(tmp.path().join("fit"))
        .assert()
        .success();
    let text = fs::read_to_string(tmp.path().join("fit.toml")).unwrap();
    assert!(text.contains("fit_method = \"wls\""));
}
