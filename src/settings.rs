use crate::error::{DkiError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// environment variable naming a settings file read by the fit and predict tools
pub const SETTINGS_ENV: &str = "DKI_SETTINGS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    /// ordinary least squares on the log signal
    Ols,
    /// least squares on the log signal weighted by the OLS signal estimate
    Wls,
}

/// Numerical settings for the kurtosis fit and the derived scalar maps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSettings {
    pub fit_method: FitMethod,
    /// signal values are clamped to at least this before taking the log
    pub min_signal: f64,
    /// lower bound applied to apparent kurtosis in MK/AK/RK
    pub min_kurtosis: f64,
    /// upper bound applied to apparent kurtosis in MK/AK/RK
    pub max_kurtosis: f64,
    /// number of sphere directions averaged for mean kurtosis
    pub sphere_points: usize,
    /// worker threads for voxel-wise work (0 = one per core)
    pub threads: usize,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            fit_method: FitMethod::Wls,
            min_signal: 1e-4,
            min_kurtosis: -1.,
            max_kurtosis: 3.,
            sphere_points: 200,
            threads: 0,
        }
    }
}

impl FitSettings {
    /// Reads settings from a toml file, or json when the extension is `.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DkiError::io(path, e))?;
        let settings: FitSettings = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text).map_err(|e| settings_err(path, e))?
        } else {
            toml::from_str(&text).map_err(|e| settings_err(path, e))?
        };
        settings.validate(path)?;
        Ok(settings)
    }

    /// Uses the file named by `DKI_SETTINGS` when set, otherwise the defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(SETTINGS_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let reason = if !(self.min_signal > 0.) {
            "min_signal must be positive"
        } else if !(self.min_kurtosis < self.max_kurtosis) {
            "min_kurtosis must be less than max_kurtosis"
        } else if self.sphere_points == 0 {
            "sphere_points must be at least 1"
        } else {
            return Ok(());
        };
        Err(settings_err(path, reason))
    }
}

fn settings_err(path: &Path, reason: impl ToString) -> DkiError {
    DkiError::Settings { path: path.to_path_buf(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn toml_round_trips_defaults() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("settings.toml");
        fs::write(&p, FitSettings::default().to_toml().unwrap()).unwrap();
        assert_eq!(FitSettings::from_file(&p).unwrap(), FitSettings::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("settings.toml");
        fs::write(&p, "fit_method = \"ols\"\nmax_kurtosis = 10.0\n").unwrap();
        let s = FitSettings::from_file(&p).unwrap();
        assert_eq!(s.fit_method, FitMethod::Ols);
        assert_eq!(s.max_kurtosis, 10.);
        assert_eq!(s.min_signal, FitSettings::default().min_signal);
    }

    #[test]
    fn serialize_errors_do_not_name_a_file() {
        let e = DkiError::from(<toml::ser::Error as serde::ser::Error>::custom("unsupported value"));
        assert!(matches!(e, DkiError::SettingsFormat(_)));
        let msg = e.to_string();
        assert!(msg.starts_with("failed to serialize settings: "), "{msg}");
        assert!(msg.contains("unsupported value"), "{msg}");
    }

    #[test]
    fn json_settings_and_validation() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("settings.json");
        fs::write(&p, r#"{"sphere_points": 50}"#).unwrap();
        assert_eq!(FitSettings::from_file(&p).unwrap().sphere_points, 50);

        fs::write(&p, r#"{"min_kurtosis": 4.0}"#).unwrap();
        assert!(matches!(FitSettings::from_file(&p), Err(DkiError::Settings { .. })));
    }
}
