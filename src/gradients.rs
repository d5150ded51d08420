use crate::error::{DkiError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// b-values closer than this are treated as the same shell
const SHELL_TOLERANCE: f64 = 20.;

/// maximum deviation from unit norm tolerated for a diffusion-weighted b-vector
const UNIT_NORM_TOLERANCE: f64 = 1e-2;

/// An ordered acquisition protocol: one (b-value, b-vector) entry per acquired volume. Entries with
/// b-values at or below the b0 threshold are treated as non-diffusion-weighted baselines.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    b0_threshold: f64,
}

impl GradientTable {
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>, b0_threshold: f64) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(DkiError::GradientTable(format!(
                "found {} b-values but {} b-vectors",
                bvals.len(),
                bvecs.len()
            )));
        }
        if !b0_threshold.is_finite() || b0_threshold < 0. {
            return Err(DkiError::GradientTable(format!(
                "b0 threshold must be a non-negative number, got {b0_threshold}"
            )));
        }
        if let Some((idx, b)) = bvals.iter().enumerate().find(|(_, b)| !b.is_finite() || **b < 0.) {
            return Err(DkiError::GradientTable(format!("b-value {b} at entry {idx} is invalid")));
        }

        let mut bvecs = bvecs;
        for (idx, (b, g)) in bvals.iter().zip(bvecs.iter_mut()).enumerate() {
            if *b <= b0_threshold {
                continue;
            }
            let norm = g.iter().map(|x| x * x).sum::<f64>().sqrt();
            if (norm - 1.).abs() > UNIT_NORM_TOLERANCE {
                return Err(DkiError::GradientTable(format!(
                    "b-vector {g:?} at entry {idx} is not a unit vector (norm {norm:.4})"
                )));
            }
            g.iter_mut().for_each(|x| *x /= norm);
        }

        Ok(Self { bvals, bvecs, b0_threshold })
    }

    /// Loads every (b-value file, b-vector file) pair independently and concatenates them in
    /// list order, so entry `i` of the table keeps the b-value and b-vector it was paired with.
    pub fn from_files<P: AsRef<Path>>(pairs: &[(P, P)], b0_threshold: f64) -> Result<Self> {
        if pairs.is_empty() {
            return Err(DkiError::ArgumentCount { bvals: 0, bvecs: 0 });
        }
        let mut bvals = vec![];
        let mut bvecs = vec![];
        for (bval_file, bvec_file) in pairs {
            let b = read_bvals(bval_file)?;
            let g = read_bvecs(bvec_file)?;
            if b.len() != g.len() {
                return Err(DkiError::Table {
                    path: bvec_file.as_ref().to_path_buf(),
                    reason: format!(
                        "contains {} b-vectors but {} lists {} b-values",
                        g.len(),
                        bval_file.as_ref().display(),
                        b.len()
                    ),
                });
            }
            debug!(bval = %bval_file.as_ref().display(), entries = b.len(), "loaded gradient pair");
            bvals.extend(b);
            bvecs.extend(g);
        }
        if bvals.is_empty() {
            return Err(DkiError::GradientTable("gradient files contain no entries".to_string()));
        }
        Self::new(bvals, bvecs, b0_threshold)
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn b0_threshold(&self) -> f64 {
        self.b0_threshold
    }

    /// true for entries that are baseline (non-diffusion-weighted) acquisitions
    pub fn b0s_mask(&self) -> Vec<bool> {
        self.bvals.iter().map(|&b| b <= self.b0_threshold).collect()
    }

    pub fn n_b0(&self) -> usize {
        self.b0s_mask().iter().filter(|&&m| m).count()
    }

    /// number of distinct non-zero b-value shells
    pub fn n_shells(&self) -> usize {
        let mut dw = self.bvals.iter().copied().filter(|&b| b > self.b0_threshold).collect::<Vec<_>>();
        dw.sort_by(f64::total_cmp);
        let mut shells: Vec<f64> = vec![];
        for b in dw {
            match shells.last() {
                Some(&s) if b - s <= SHELL_TOLERANCE => {}
                _ => shells.push(b),
            }
        }
        shells.len()
    }
}

/// reads whitespace-delimited numeric rows, skipping blank lines
fn read_numeric_rows(txt_file: &Path) -> Result<Vec<Vec<f64>>> {
    let s = fs::read_to_string(txt_file).map_err(|e| DkiError::io(txt_file, e))?;
    s.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_ascii_whitespace()
                .map(|tok| {
                    tok.parse::<f64>().map_err(|_| DkiError::Parse {
                        path: txt_file.to_path_buf(),
                        token: tok.to_string(),
                    })
                })
                .collect()
        })
        .collect()
}

/// read b-values from a text file with whitespace delimiter. Row and column layouts are both accepted.
pub fn read_bvals(txt_file: impl AsRef<Path>) -> Result<Vec<f64>> {
    let rows = read_numeric_rows(txt_file.as_ref())?;
    Ok(rows.into_iter().flatten().collect())
}

/// read vectors from a text file with whitespace delimiter. Accepts one vector per row (N x 3) and
/// the FSL layout (3 x N). A table with more columns than rows is read as FSL layout.
pub fn read_bvecs(txt_file: impl AsRef<Path>) -> Result<Vec<[f64; 3]>> {
    let path = txt_file.as_ref();
    let table_err = |reason: String| DkiError::Table { path: PathBuf::from(path), reason };

    let rows = read_numeric_rows(path)?;
    if rows.is_empty() {
        return Ok(vec![]);
    }
    let n_cols = rows[0].len();
    if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_cols) {
        return Err(table_err(format!(
            "row {} has {} entries, expected {}",
            idx + 1,
            row.len(),
            n_cols
        )));
    }

    let n_rows = rows.len();
    if n_rows.min(n_cols) != 3 {
        return Err(table_err(format!(
            "expected a 3 x N or N x 3 table of b-vectors, found {n_rows} x {n_cols}"
        )));
    }
    if n_cols > n_rows {
        Ok((0..n_cols).map(|j| [rows[0][j], rows[1][j], rows[2][j]]).collect())
    } else {
        Ok(rows.into_iter().map(|r| [r[0], r[1], r[2]]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let p = dir.path().join(name);
        fs::write(&p, contents).unwrap();
        p
    }

    #[test]
    fn bvecs_fsl_and_row_layouts_agree() {
        let tmp = TempDir::new().unwrap();
        let fsl = write(&tmp, "a.bvec", "0 1 0 0\n0 0 1 0\n0 0 0 1\n");
        let rows = write(&tmp, "b.bvec", "0 0 0\n1 0 0\n0 1 0\n0 0 1\n");
        let a = read_bvecs(&fsl).unwrap();
        let b = read_bvecs(&rows).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[1], [1., 0., 0.]);
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn bvecs_reject_bad_shapes() {
        let tmp = TempDir::new().unwrap();
        let ragged = write(&tmp, "r.bvec", "0 1 0\n0 0\n0 0 1\n");
        assert!(matches!(read_bvecs(&ragged), Err(DkiError::Table { .. })));
        let wrong = write(&tmp, "w.bvec", "0 1\n0 0\n");
        assert!(matches!(read_bvecs(&wrong), Err(DkiError::Table { .. })));
        // two vectors in FSL layout cannot be told apart from a 3 x 2 row table
        let short = write(&tmp, "s.bvec", "1 0\n0 1\n0 0\n");
        assert!(matches!(read_bvecs(&short), Err(DkiError::Table { .. })));
        let wide = write(&tmp, "x.bvec", "1 0 0 0\n0 1 0 0\n");
        assert!(matches!(read_bvecs(&wide), Err(DkiError::Table { .. })));
    }

    #[test]
    fn square_bvecs_are_one_vector_per_row() {
        let tmp = TempDir::new().unwrap();
        let p = write(&tmp, "sq.bvec", "0.6 0.8 0\n0 0.6 0.8\n0.8 0 0.6\n");
        let g = read_bvecs(&p).unwrap();
        assert_eq!(g, vec![[0.6, 0.8, 0.], [0., 0.6, 0.8], [0.8, 0., 0.6]]);
    }

    #[test]
    fn rejects_invalid_bvals() {
        let vecs = vec![[0., 0., 0.], [1., 0., 0.]];
        for bad in [-1000., f64::NAN, f64::INFINITY] {
            let r = GradientTable::new(vec![0., bad], vecs.clone(), 50.);
            assert!(matches!(r, Err(DkiError::GradientTable(_))), "accepted b-value {bad}");
        }
    }

    #[test]
    fn empty_files_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let b = write(&tmp, "e.bval", "");
        let g = write(&tmp, "e.bvec", "\n");
        assert!(matches!(GradientTable::from_files(&[(&b, &g)], 50.), Err(DkiError::GradientTable(_))));
    }

    #[test]
    fn bvals_parse_error_names_token() {
        let tmp = TempDir::new().unwrap();
        let bad = write(&tmp, "bad.bval", "0 1000 abc 2000\n");
        match read_bvals(&bad) {
            Err(DkiError::Parse { token, .. }) => assert_eq!(token, "abc"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn b0_mask_uses_threshold() {
        let gtab = GradientTable::new(
            vec![0., 50., 51., 1000.],
            vec![[0., 0., 0.], [1., 0., 0.], [0., 1., 0.], [0., 0., 1.]],
            50.,
        )
        .unwrap();
        assert_eq!(gtab.b0s_mask(), vec![true, true, false, false]);
        assert_eq!(gtab.n_b0(), 2);
    }

    #[test]
    fn rejects_non_unit_diffusion_vectors() {
        let r = GradientTable::new(vec![0., 1000.], vec![[0., 0., 0.], [0.5, 0., 0.]], 50.);
        assert!(matches!(r, Err(DkiError::GradientTable(_))));
        let r = GradientTable::new(vec![0., 1000.], vec![[0., 0., 0.]], 50.);
        assert!(matches!(r, Err(DkiError::GradientTable(_))));
        let r = GradientTable::new(vec![0.], vec![[0., 0., 0.]], -1.);
        assert!(matches!(r, Err(DkiError::GradientTable(_))));
    }

    #[test]
    fn concatenates_pairs_in_file_order() {
        let tmp = TempDir::new().unwrap();
        let b1 = write(&tmp, "1.bval", "0 1000 1000\n");
        let g1 = write(&tmp, "1.bvec", "0 0 0\n1 0 0\n0 1 0\n");
        let b2 = write(&tmp, "2.bval", "0 2000 2000 2000 2000\n");
        let g2 = write(&tmp, "2.bvec", "0 0 0\n0 0 1\n0 1 0\n1 0 0\n0 0 -1\n");

        let gtab = GradientTable::from_files(&[(&b1, &g1), (&b2, &g2)], 50.).unwrap();
        assert_eq!(gtab.len(), 8);
        assert_eq!(gtab.bvals(), &[0., 1000., 1000., 0., 2000., 2000., 2000., 2000.]);
        assert_eq!(gtab.bvecs()[1], [1., 0., 0.]);
        assert_eq!(gtab.bvecs()[2], [0., 1., 0.]);
        assert_eq!(gtab.bvecs()[4], [0., 0., 1.]);
        assert_eq!(gtab.bvecs()[7], [0., 0., -1.]);
        assert_eq!(gtab.n_shells(), 2);
    }

    #[test]
    fn mismatched_pair_lengths_fail() {
        let tmp = TempDir::new().unwrap();
        let b = write(&tmp, "1.bval", "0 1000\n");
        let g = write(&tmp, "1.bvec", "0 1 0\n0 0 1\n0 0 0\n");
        assert!(matches!(GradientTable::from_files(&[(&b, &g)], 50.), Err(DkiError::Table { .. })));
        let empty: [(&Path, &Path); 0] = [];
        assert!(matches!(GradientTable::from_files(&empty, 50.), Err(DkiError::ArgumentCount { .. })));
    }
}
