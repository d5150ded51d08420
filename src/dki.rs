use crate::error::{DkiError, Result};
use crate::gradients::GradientTable;
use crate::settings::{FitMethod, FitSettings};
use crate::sphere::{dot, fibonacci_sphere, perpendicular_circle};
use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen};
use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, ShapeBuilder};
use rayon::prelude::*;
use tracing::{info, warn};

/// values stored per voxel in a parameter volume: 3 eigenvalues, 9 eigenvector entries, 15 kurtosis
/// tensor entries
pub const N_PARAMS: usize = 27;

/// unknowns of the log-linear system: 6 diffusion, 15 kurtosis and ln(S0)
pub const N_COEFFS: usize = 22;

const RADIAL_POINTS: usize = 64;

/// diffusivities below this are treated as no diffusion
const MIN_DIFFUSIVITY: f64 = 1e-12;

/// Fitted model for a single voxel. Eigenvalues are sorted in descending order and `evecs[j]` is the
/// eigenvector belonging to `evals[j]`. The kurtosis tensor entries are ordered
/// {Wxxxx Wyyyy Wzzzz Wxxxy Wxxxz Wxyyy Wyyyz Wxzzz Wyzzz Wxxyy Wxxzz Wyyzz Wxxyz Wxyyz Wxyzz}
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DkiParams {
    pub evals: [f64; 3],
    pub evecs: [[f64; 3]; 3],
    pub kt: [f64; 15],
}

impl DkiParams {
    pub fn zeros() -> Self {
        Self { evals: [0.; 3], evecs: [[0.; 3]; 3], kt: [0.; 15] }
    }

    /// Builds parameters from solved log-linear coefficients {Dxx Dxy Dyy Dxz Dyz Dzz, MD^2 W(15), ln S0}
    fn from_coefficients(c: &[f64]) -> Self {
        let d = Matrix3::new(
            c[0], c[1], c[3],
            c[1], c[2], c[4],
            c[3], c[4], c[5],
        );
        let eig = SymmetricEigen::new(d);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

        let mut params = Self::zeros();
        for (j, &idx) in order.iter().enumerate() {
            params.evals[j] = eig.eigenvalues[idx];
            let v = eig.eigenvectors.column(idx);
            params.evecs[j] = [v[0], v[1], v[2]];
        }

        let md = params.md();
        if md.abs() > MIN_DIFFUSIVITY {
            let md2 = md * md;
            params.kt.iter_mut().zip(&c[6..21]).for_each(|(w, x)| *w = x / md2);
        }
        params
    }

    /// Reads the on-disk layout [evals(3), eigenvector matrix (3x3 row-major, column j = vector j), kt(15)]
    pub fn from_slice(p: &[f64]) -> Result<Self> {
        if p.len() != N_PARAMS {
            return Err(DkiError::Shape(format!("expected {N_PARAMS} parameters per voxel, got {}", p.len())));
        }
        let mut params = Self::zeros();
        params.evals.copy_from_slice(&p[0..3]);
        for i in 0..3 {
            for j in 0..3 {
                params.evecs[j][i] = p[3 + 3 * i + j];
            }
        }
        params.kt.copy_from_slice(&p[12..27]);
        Ok(params)
    }

    pub fn to_array(&self) -> [f64; N_PARAMS] {
        let mut p = [0.; N_PARAMS];
        p[0..3].copy_from_slice(&self.evals);
        for i in 0..3 {
            for j in 0..3 {
                p[3 + 3 * i + j] = self.evecs[j][i];
            }
        }
        p[12..27].copy_from_slice(&self.kt);
        p
    }

    pub fn md(&self) -> f64 {
        self.evals.iter().sum::<f64>() / 3.
    }

    pub fn ad(&self) -> f64 {
        self.evals[0]
    }

    pub fn rd(&self) -> f64 {
        (self.evals[1] + self.evals[2]) / 2.
    }

    pub fn fa(&self) -> f64 {
        let md = self.md();
        let num = self.evals.iter().map(|l| (l - md).powi(2)).sum::<f64>().sqrt();
        let denom = self.evals.iter().map(|l| l.powi(2)).sum::<f64>().sqrt();
        if denom > MIN_DIFFUSIVITY {
            (3. / 2f64).sqrt() * num / denom
        } else {
            0.
        }
    }

    /// apparent diffusion coefficient along the unit direction n
    pub fn apparent_diffusivity(&self, n: &[f64; 3]) -> f64 {
        self.evals.iter().zip(&self.evecs).map(|(l, e)| l * dot(e, n).powi(2)).sum()
    }

    /// the kurtosis tensor contracted four times with the unit direction n
    pub fn directional_kurtosis_tensor(&self, n: &[f64; 3]) -> f64 {
        self.kt.iter().zip(kurtosis_terms(n)).map(|(w, t)| w * t).sum()
    }

    /// apparent kurtosis coefficient along the unit direction n
    pub fn apparent_kurtosis(&self, n: &[f64; 3]) -> f64 {
        let adc = self.apparent_diffusivity(n);
        if adc <= MIN_DIFFUSIVITY {
            return 0.;
        }
        let md = self.md();
        md * md * self.directional_kurtosis_tensor(n) / (adc * adc)
    }

    /// signal predicted for every entry of the gradient table given the baseline signal s0
    pub fn predict(&self, gtab: &GradientTable, s0: f64) -> Vec<f64> {
        let md2 = self.md().powi(2);
        gtab.bvals()
            .iter()
            .zip(gtab.bvecs())
            .map(|(&b, g)| {
                let log_att = -b * self.apparent_diffusivity(g) + b * b / 6. * md2 * self.directional_kurtosis_tensor(g);
                s0 * log_att.exp()
            })
            .collect()
    }
}

/// {gx^2, 2gxgy, gy^2, 2gxgz, 2gygz, gz^2}
fn diffusion_terms(g: &[f64; 3]) -> [f64; 6] {
    let [x, y, z] = *g;
    [x * x, 2. * x * y, y * y, 2. * x * z, 2. * y * z, z * z]
}

/// multiplicities of the 15 unique kurtosis tensor entries for direction g
fn kurtosis_terms(g: &[f64; 3]) -> [f64; 15] {
    let [x, y, z] = *g;
    [
        x.powi(4),
        y.powi(4),
        z.powi(4),
        4. * x.powi(3) * y,
        4. * x.powi(3) * z,
        4. * x * y.powi(3),
        4. * y.powi(3) * z,
        4. * x * z.powi(3),
        4. * y * z.powi(3),
        6. * x * x * y * y,
        6. * x * x * z * z,
        6. * y * y * z * z,
        12. * x * x * y * z,
        12. * x * y * y * z,
        12. * x * y * z * z,
    ]
}

/// Builds the (n_entries x 22) design matrix of the log-linear kurtosis model. Columns are the six
/// diffusion tensor entries {Dxx Dxy Dyy Dxz Dyz Dzz}, the fifteen kurtosis tensor entries scaled by
/// MD^2, and ln(S0). Rows correspond to gradient table entries.
pub fn design_matrix(gtab: &GradientTable) -> DMatrix<f64> {
    let rows = gtab
        .bvals()
        .iter()
        .zip(gtab.bvecs())
        .map(|(&b, g)| {
            let mut row = [0.; N_COEFFS];
            row[0..6].iter_mut().zip(diffusion_terms(g)).for_each(|(a, t)| *a = -b * t);
            row[6..21].iter_mut().zip(kurtosis_terms(g)).for_each(|(a, t)| *a = b * b / 6. * t);
            row[21] = 1.;
            row
        })
        .collect::<Vec<_>>();
    DMatrix::from_fn(rows.len(), N_COEFFS, |r, c| rows[r][c])
}

/// singular values below this fraction of the largest are discarded, matching lstsq conventions
fn rcond(a: &DMatrix<f64>) -> f64 {
    a.nrows().max(a.ncols()) as f64 * f64::EPSILON
}

fn pseudo_inverse(a: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let tol = rcond(&a);
    let svd = a.svd(true, true);
    let eps = svd.singular_values.max() * tol;
    svd.pseudo_inverse(eps).map_err(DkiError::Linalg)
}

/// minimum-norm least squares solution of a x = y
fn least_squares(a: DMatrix<f64>, y: &DVector<f64>) -> Result<DVector<f64>> {
    let tol = rcond(&a);
    let svd = a.svd(true, true);
    let eps = svd.singular_values.max() * tol;
    svd.solve(y, eps).map_err(DkiError::Linalg)
}

/// Kurtosis model bound to one gradient table. Design matrix columns are equilibrated to unit norm
/// before solving, and the OLS pseudo-inverse is computed once and shared by every voxel.
pub struct DkiModel {
    gtab: GradientTable,
    settings: FitSettings,
    design: DMatrix<f64>,
    col_scale: DVector<f64>,
    ols_pinv: DMatrix<f64>,
}

impl DkiModel {
    pub fn new(gtab: GradientTable, settings: FitSettings) -> Result<Self> {
        if gtab.is_empty() {
            return Err(DkiError::GradientTable("gradient table has no entries".to_string()));
        }
        if gtab.len() < N_COEFFS {
            warn!(
                entries = gtab.len(),
                "fewer gradient table entries than model unknowns ({N_COEFFS}); returning minimum-norm estimates"
            );
        }
        if gtab.n_shells() < 2 {
            warn!(shells = gtab.n_shells(), "kurtosis estimation needs at least two non-zero b-value shells");
        }

        let mut design = design_matrix(&gtab);
        let col_scale = DVector::from_iterator(
            N_COEFFS,
            design.column_iter().map(|c| match c.norm() {
                n if n > 0. => 1. / n,
                _ => 1.,
            }),
        );
        design.column_iter_mut().zip(col_scale.iter()).for_each(|(mut c, &f)| c *= f);

        let ols_pinv = pseudo_inverse(design.clone())?;
        Ok(Self { gtab, settings, design, col_scale, ols_pinv })
    }

    pub fn gtab(&self) -> &GradientTable {
        &self.gtab
    }

    /// Fits a single voxel's signal, one value per gradient table entry
    pub fn fit_voxel(&self, signal: &[f64]) -> Result<DkiParams> {
        if signal.len() != self.gtab.len() {
            return Err(DkiError::Shape(format!(
                "signal has {} entries but the gradient table has {}",
                signal.len(),
                self.gtab.len()
            )));
        }
        if signal.iter().any(|s| !s.is_finite()) || signal.iter().all(|&s| s <= 0.) {
            return Ok(DkiParams::zeros());
        }

        let min_signal = self.settings.min_signal;
        let y = DVector::from_iterator(signal.len(), signal.iter().map(|&s| s.max(min_signal).ln()));
        let mut coeffs = &self.ols_pinv * &y;

        if self.settings.fit_method == FitMethod::Wls {
            let w = (&self.design * &coeffs).map(f64::exp);
            if w.iter().all(|x| x.is_finite()) {
                let mut wa = self.design.clone();
                wa.row_iter_mut().zip(w.iter()).for_each(|(mut row, &wi)| row *= wi);
                coeffs = least_squares(wa, &y.component_mul(&w))?;
            }
        }

        // back to unscaled tensor units
        let coeffs = coeffs.component_mul(&self.col_scale);
        Ok(DkiParams::from_coefficients(coeffs.as_slice()))
    }

    /// Fits every voxel of a 4-D volume (x, y, z, entry). Voxels outside the mask are left at zero.
    /// Returns a parameter volume (x, y, z, 27).
    pub fn fit(&self, data: ArrayView4<f32>, mask: Option<ArrayView3<bool>>) -> Result<Array4<f32>> {
        let (nx, ny, nz, nq) = data.dim();
        if nq != self.gtab.len() {
            return Err(DkiError::Shape(format!(
                "image has {nq} volumes but the gradient table has {} entries",
                self.gtab.len()
            )));
        }
        if let Some(mask) = &mask {
            if mask.dim() != (nx, ny, nz) {
                return Err(DkiError::Shape(format!(
                    "mask dimensions {:?} do not match image dimensions {:?}",
                    mask.dim(),
                    (nx, ny, nz)
                )));
            }
        }

        let voxels = (0..nz)
            .flat_map(|k| (0..ny).flat_map(move |j| (0..nx).map(move |i| (i, j, k))))
            .filter(|&(i, j, k)| mask.as_ref().map_or(true, |m| m[[i, j, k]]))
            .collect::<Vec<_>>();
        info!(voxels = voxels.len(), entries = nq, "fitting diffusion kurtosis model");

        let fits = voxels
            .par_iter()
            .map(|&(i, j, k)| {
                let signal = data.slice(s![i, j, k, ..]).iter().map(|&v| v as f64).collect::<Vec<_>>();
                self.fit_voxel(&signal).map(|p| ((i, j, k), p))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut params = Array4::<f32>::zeros((nx, ny, nz, N_PARAMS).f());
        for ((i, j, k), p) in fits {
            params
                .slice_mut(s![i, j, k, ..])
                .iter_mut()
                .zip(p.to_array())
                .for_each(|(dst, v)| *dst = v as f32);
        }
        Ok(params)
    }
}

fn params_at(params: &ArrayView4<f32>, i: usize, j: usize, k: usize) -> Result<DkiParams> {
    let p = params.slice(s![i, j, k, ..]).iter().map(|&v| v as f64).collect::<Vec<_>>();
    DkiParams::from_slice(&p)
}

/// Predicts the signal for every gradient table entry from a parameter volume (x, y, z, 27). The
/// baseline signal defaults to 1 when no S0 volume is given.
pub fn predict(params: ArrayView4<f32>, gtab: &GradientTable, s0: Option<ArrayView3<f32>>) -> Result<Array4<f32>> {
    let (nx, ny, nz, np) = params.dim();
    if np != N_PARAMS {
        return Err(DkiError::Shape(format!("parameter volume has {np} entries per voxel, expected {N_PARAMS}")));
    }
    if let Some(s0) = &s0 {
        if s0.dim() != (nx, ny, nz) {
            return Err(DkiError::Shape(format!(
                "S0 dimensions {:?} do not match parameter dimensions {:?}",
                s0.dim(),
                (nx, ny, nz)
            )));
        }
    }
    info!(voxels = nx * ny * nz, entries = gtab.len(), "predicting diffusion signal");

    let voxels = (0..nz)
        .flat_map(|k| (0..ny).flat_map(move |j| (0..nx).map(move |i| (i, j, k))))
        .collect::<Vec<_>>();
    let predicted = voxels
        .par_iter()
        .map(|&(i, j, k)| {
            let baseline = s0.as_ref().map_or(1., |s| s[[i, j, k]] as f64);
            params_at(&params, i, j, k).map(|p| ((i, j, k), p.predict(gtab, baseline)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = Array4::<f32>::zeros((nx, ny, nz, gtab.len()).f());
    for ((i, j, k), signal) in predicted {
        out.slice_mut(s![i, j, k, ..])
            .iter_mut()
            .zip(signal)
            .for_each(|(dst, v)| *dst = v as f32);
    }
    Ok(out)
}

/// Scalar maps derived from a fitted kurtosis model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarMap {
    Fa,
    Md,
    Ad,
    Rd,
    Mk,
    Ak,
    Rk,
}

impl ScalarMap {
    pub const ALL: [ScalarMap; 7] = [
        ScalarMap::Fa,
        ScalarMap::Md,
        ScalarMap::Ad,
        ScalarMap::Rd,
        ScalarMap::Mk,
        ScalarMap::Ak,
        ScalarMap::Rk,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScalarMap::Fa => "FA",
            ScalarMap::Md => "MD",
            ScalarMap::Ad => "AD",
            ScalarMap::Rd => "RD",
            ScalarMap::Mk => "MK",
            ScalarMap::Ak => "AK",
            ScalarMap::Rk => "RK",
        }
    }
}

/// Evaluates scalar maps with a fixed direction set and kurtosis bounds
pub struct ScalarMaps {
    sphere: Vec<[f64; 3]>,
    min_kurtosis: f64,
    max_kurtosis: f64,
}

impl ScalarMaps {
    pub fn new(settings: &FitSettings) -> Self {
        Self {
            sphere: fibonacci_sphere(settings.sphere_points),
            min_kurtosis: settings.min_kurtosis,
            max_kurtosis: settings.max_kurtosis,
        }
    }

    fn clipped_kurtosis(&self, p: &DkiParams, n: &[f64; 3]) -> f64 {
        p.apparent_kurtosis(n).clamp(self.min_kurtosis, self.max_kurtosis)
    }

    fn mean_kurtosis_over(&self, p: &DkiParams, dirs: &[[f64; 3]]) -> f64 {
        dirs.iter().map(|n| self.clipped_kurtosis(p, n)).sum::<f64>() / dirs.len() as f64
    }

    pub fn mk(&self, p: &DkiParams) -> f64 {
        self.mean_kurtosis_over(p, &self.sphere)
    }

    pub fn ak(&self, p: &DkiParams) -> f64 {
        self.clipped_kurtosis(p, &p.evecs[0])
    }

    pub fn rk(&self, p: &DkiParams) -> f64 {
        self.mean_kurtosis_over(p, &perpendicular_circle(&p.evecs[0], RADIAL_POINTS))
    }

    /// Value of one map for one voxel. Voxels without a fitted tensor map to zero.
    pub fn evaluate(&self, map: ScalarMap, p: &DkiParams) -> f64 {
        if p.evals.iter().all(|&l| l == 0.) {
            return 0.;
        }
        match map {
            ScalarMap::Fa => p.fa(),
            ScalarMap::Md => p.md(),
            ScalarMap::Ad => p.ad(),
            ScalarMap::Rd => p.rd(),
            ScalarMap::Mk => self.mk(p),
            ScalarMap::Ak => self.ak(p),
            ScalarMap::Rk => self.rk(p),
        }
    }

    /// Computes every map in [ScalarMap::ALL] order from a parameter volume (x, y, z, 27)
    pub fn compute(&self, params: ArrayView4<f32>) -> Result<Vec<(ScalarMap, Array3<f32>)>> {
        let (nx, ny, nz, _) = params.dim();
        let voxels = (0..nz)
            .flat_map(|k| (0..ny).flat_map(move |j| (0..nx).map(move |i| (i, j, k))))
            .collect::<Vec<_>>();
        let values = voxels
            .par_iter()
            .map(|&(i, j, k)| -> Result<[f64; 7]> {
                let p = params_at(&params, i, j, k)?;
                Ok(ScalarMap::ALL.map(|m| self.evaluate(m, &p)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ScalarMap::ALL
            .iter()
            .enumerate()
            .map(|(idx, &map)| {
                let mut vol = Array3::<f32>::zeros((nx, ny, nz).f());
                voxels.iter().zip(&values).for_each(|(&(i, j, k), v)| vol[[i, j, k]] = v[idx] as f32);
                (map, vol)
            })
            .collect())
    }
}
