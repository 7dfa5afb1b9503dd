//! NIfTI-1 file I/O
//!
//! Reading goes through the `nifti` crate; the voxel-to-scanner affine comes
//! from the sform, then the qform, then bare voxel scaling. Writing emits a
//! single-file NIfTI-1 (`.nii`, optionally gzipped) with float32 data and the
//! sform set from the volume affine.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix4, Quaternion, UnitQuaternion};
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::affine::Affine;
use crate::error::{Result, UnwarpError};
use crate::volume::VoxelVolume;

/// Header (348 bytes) plus the 4-byte empty extension block
const DATA_OFFSET: usize = 352;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Load a NIfTI volume from bytes
///
/// Supports both .nii and .nii.gz content (gzip is auto-detected). 4D
/// inputs keep all frames.
pub fn load_nifti(bytes: &[u8]) -> Result<VoxelVolume> {
    let obj = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
    }
    .map_err(|e| UnwarpError::volume_io(format!("Failed to read NIfTI ({} bytes): {}", bytes.len(), e)))?;

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(UnwarpError::volume_io(format!(
            "Expected at least 3D volume, got {}D",
            ndim
        )));
    }
    let affine = header_affine(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| UnwarpError::volume_io(format!("Failed to convert to ndarray: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(UnwarpError::volume_io(format!(
            "Expected at least 3D array, got {}D",
            shape.len()
        )));
    }
    if shape.iter().skip(4).any(|&d| d > 1) {
        return Err(UnwarpError::volume_io(format!(
            "Volumes with more than 4 dimensions are not supported (shape {:?})",
            shape
        )));
    }

    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    // x varies fastest, frames outermost: index = x + y*nx + z*nx*ny + t*nx*ny*nz
    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    let mut idx = vec![0usize; shape.len()];
    for t in 0..nt {
        if shape.len() >= 4 {
            idx[3] = t;
        }
        for k in 0..nz {
            idx[2] = k;
            for j in 0..ny {
                idx[1] = j;
                for i in 0..nx {
                    idx[0] = i;
                    data.push(array[idx.as_slice()]);
                }
            }
        }
    }

    VoxelVolume::new(data, (nx, ny, nz), nt, affine)
}

/// Voxel-to-scanner affine of a header: sform, else qform, else voxel scaling.
fn header_affine(header: &NiftiHeader) -> Affine {
    let pixdim = |a: usize| header.pixdim[a] as f64;
    if header.sform_code > 0 {
        let mut m = Matrix4::identity();
        for (r, row) in [header.srow_x, header.srow_y, header.srow_z].iter().enumerate() {
            for c in 0..4 {
                m[(r, c)] = row[c] as f64;
            }
        }
        Affine::from_matrix(m)
    } else if header.qform_code > 0 {
        qform_affine(header)
    } else {
        Affine::scale_translate([pixdim(1), pixdim(2), pixdim(3)], [0.0; 3])
    }
}

/// Rotation from the quaternion (b, c, d), columns scaled by voxel size with
/// the qfac sign on z, offset by (qoffset_x, qoffset_y, qoffset_z).
fn qform_affine(header: &NiftiHeader) -> Affine {
    let (b, c, d) = (
        header.quatern_b as f64,
        header.quatern_c as f64,
        header.quatern_d as f64,
    );
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(a, b, c, d)).to_rotation_matrix();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = [
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64 * qfac,
    ];
    let offset = [
        header.quatern_x as f64,
        header.quatern_y as f64,
        header.quatern_z as f64,
    ];

    let mut m = Matrix4::identity();
    for r in 0..3 {
        for col in 0..3 {
            m[(r, col)] = rotation[(r, col)] * scale[col];
        }
        m[(r, 3)] = offset[r];
    }
    Affine::from_matrix(m)
}

/// Save a volume as NIfTI bytes
///
/// Writes an uncompressed .nii image with float32 data.
pub fn save_nifti(volume: &VoxelVolume) -> Result<Vec<u8>> {
    let (nx, ny, nz) = volume.dims;
    let nt = volume.frames;
    let [vsx, vsy, vsz] = volume.voxel_size();
    let affine = volume.affine.to_row_major();

    for (axis, &d) in [nx, ny, nz, nt].iter().enumerate() {
        if d > i16::MAX as usize {
            return Err(UnwarpError::volume_io(format!(
                "dimension {} of size {} exceeds the NIfTI-1 limit",
                axis, d
            )));
        }
    }

    // Create NIfTI-1 header (348 bytes)
    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nt as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0] is the qfac; keep it at 1
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    header[108..112].copy_from_slice(&(DATA_OFFSET as f32).to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm + sec
    header[123] = 2 | 8;

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(DATA_OFFSET + volume.data.len() * 4);
    buffer.write_all(&header)?;
    // Extension block (all zeros = no extension)
    buffer.write_all(&[0u8; 4])?;
    for &val in &volume.data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }

    Ok(buffer)
}

/// Save a volume as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(volume: &VoxelVolume) -> Result<Vec<u8>> {
    let uncompressed = save_nifti(volume)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)?;
    Ok(encoder.finish()?)
}

/// Read a NIfTI file from a filesystem path
///
/// Supports both .nii and .nii.gz files.
pub fn read_nifti_file(path: &Path) -> Result<VoxelVolume> {
    let bytes = std::fs::read(path).map_err(|e| {
        UnwarpError::volume_io(format!("Failed to read file '{}': {}", path.display(), e))
    })?;
    load_nifti(&bytes)
}

/// Save a volume to a NIfTI file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn save_nifti_to_file(path: &Path, volume: &VoxelVolume) -> Result<()> {
    let path_str = path.to_string_lossy().to_ascii_lowercase();
    let bytes = if path_str.ends_with(".nii.gz") {
        save_nifti_gz(volume)?
    } else {
        save_nifti(volume)?
    };

    std::fs::write(path, &bytes).map_err(|e| {
        UnwarpError::volume_io(format!("Failed to write file '{}': {}", path.display(), e))
    })
}
