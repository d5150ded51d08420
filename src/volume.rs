use crate::error::{DkiError, Result};
use ndarray::{Array, Array3, Array4, ArrayD, Axis, Dimension, Ix3, Ix4, RemoveAxis};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Image data together with the header it was read with. The header is reused as the reference
/// when writing derived volumes so that the spatial transform carries over.
#[derive(Debug, Clone)]
pub struct NiftiVolume {
    pub path: PathBuf,
    pub data: ArrayD<f32>,
    pub header: NiftiHeader,
}

/// read a .nii or .nii.gz file into an f32 array (scaling from the header is applied)
pub fn read_volume(path: impl AsRef<Path>) -> Result<NiftiVolume> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| DkiError::nifti(path, e))?;
    let header = obj.header().clone();
    let data = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| DkiError::nifti(path, e))?;
    debug!(path = %path.display(), shape = ?data.shape(), "read nifti volume");
    Ok(NiftiVolume { path: path.to_path_buf(), data, header })
}

impl NiftiVolume {
    /// 4-D view of the data (x, y, z, volume). A 3-D image is treated as a single volume.
    pub fn into_4d(self) -> Result<Array4<f32>> {
        let ndim = self.data.ndim();
        let data = match ndim {
            3 => self.data.insert_axis(Axis(3)),
            _ => self.data,
        };
        data.into_dimensionality::<Ix4>().map_err(|_| {
            DkiError::Shape(format!("{} must be a 4-D image, found {} dimensions", self.path.display(), ndim))
        })
    }

    /// 3-D view of the data. A 4-D image with a single volume is accepted.
    pub fn into_3d(self) -> Result<Array3<f32>> {
        let shape = self.data.shape().to_vec();
        let data = match shape.as_slice() {
            [_, _, _, 1] => self.data.index_axis_move(Axis(3), 0),
            _ => self.data,
        };
        data.into_dimensionality::<Ix3>().map_err(|_| {
            DkiError::Shape(format!("{} must be a 3-D image, found shape {:?}", self.path.display(), shape))
        })
    }
}

/// read a 3-D mask where any non-zero voxel is inside
pub fn read_mask(path: impl AsRef<Path>) -> Result<Array3<bool>> {
    Ok(read_volume(path)?.into_3d()?.mapv(|v| v != 0.))
}

/// Copy of an input header suitable for derived float volumes: intensity scaling and display range
/// are reset while the spatial transform is kept.
pub fn derived_header(reference: &NiftiHeader) -> NiftiHeader {
    NiftiHeader {
        scl_slope: 1.,
        scl_inter: 0.,
        cal_max: 0.,
        cal_min: 0.,
        ..reference.clone()
    }
}

/// Write an array to disk using the reference header's spatial information. Files ending in .gz are
/// compressed. Existing files are overwritten.
pub fn write_volume<D: Dimension + RemoveAxis>(path: impl AsRef<Path>, data: &Array<f32, D>, reference: &NiftiHeader) -> Result<()> {
    let path = path.as_ref();
    WriterOptions::new(path)
        .reference_header(reference)
        .write_nifti(data)
        .map_err(|e| DkiError::nifti(path, e))?;
    debug!(path = %path.display(), shape = ?data.shape(), "wrote nifti volume");
    Ok(())
}
