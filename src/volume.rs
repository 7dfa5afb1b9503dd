//! Image volumes and format dispatch
//!
//! A [`VoxelVolume`] is a 3D or 4D intensity array with its voxel-to-scanner
//! (RAS) affine. Data is x-fastest with frames outermost:
//! `index = i + j*nx + k*nx*ny + t*nx*ny*nz`.

use std::path::Path;

use crate::affine::Affine;
use crate::error::{Result, UnwarpError};
use crate::{mgh_io, nifti_io};

#[derive(Debug, Clone, PartialEq)]
pub struct VoxelVolume {
    pub data: Vec<f64>,
    /// Spatial dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Number of frames along the fourth axis (1 for 3D)
    pub frames: usize,
    /// Voxel to scanner RAS transform
    pub affine: Affine,
}

impl VoxelVolume {
    pub fn new(
        data: Vec<f64>,
        dims: (usize, usize, usize),
        frames: usize,
        affine: Affine,
    ) -> Result<Self> {
        let expected = dims.0 * dims.1 * dims.2 * frames;
        if data.len() != expected || expected == 0 {
            return Err(UnwarpError::ShapeMismatch {
                expected: vec![dims.0, dims.1, dims.2, frames],
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            dims,
            frames,
            affine,
        })
    }

    /// Single-frame volume
    pub fn from_3d(data: Vec<f64>, dims: (usize, usize, usize), affine: Affine) -> Result<Self> {
        Self::new(data, dims, 1, affine)
    }

    /// Voxels per frame
    pub fn frame_len(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn frame(&self, t: usize) -> &[f64] {
        let n = self.frame_len();
        &self.data[t * n..(t + 1) * n]
    }

    pub fn frames_iter(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks(self.frame_len())
    }

    /// Voxel pitch (mm) from the affine column norms
    pub fn voxel_size(&self) -> [f64; 3] {
        self.affine.voxel_sizes()
    }
}

/// On-disk container, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    Nifti,
    NiftiGz,
    Mgh,
    Mgz,
}

impl VolumeFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".nii.gz") {
            Ok(VolumeFormat::NiftiGz)
        } else if name.ends_with(".nii") {
            Ok(VolumeFormat::Nifti)
        } else if name.ends_with(".mgz") {
            Ok(VolumeFormat::Mgz)
        } else if name.ends_with(".mgh") {
            Ok(VolumeFormat::Mgh)
        } else {
            Err(UnwarpError::volume_io(format!(
                "unsupported volume format for '{}' (expected .nii, .nii.gz, .mgh or .mgz)",
                path.display()
            )))
        }
    }
}

/// Load a volume, selecting the reader from the file extension.
pub fn load_volume(path: &Path) -> Result<VoxelVolume> {
    match VolumeFormat::from_path(path)? {
        VolumeFormat::Nifti | VolumeFormat::NiftiGz => nifti_io::read_nifti_file(path),
        VolumeFormat::Mgh | VolumeFormat::Mgz => mgh_io::read_mgh_file(path),
    }
}

/// Save a volume, selecting the writer from the file extension.
pub fn save_volume(volume: &VoxelVolume, path: &Path) -> Result<()> {
    match VolumeFormat::from_path(path)? {
        VolumeFormat::Nifti | VolumeFormat::NiftiGz => nifti_io::save_nifti_to_file(path, volume),
        VolumeFormat::Mgh | VolumeFormat::Mgz => mgh_io::save_mgh_to_file(path, volume),
    }
}
