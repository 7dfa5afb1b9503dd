//! FreeSurfer MGH/MGZ volume I/O
//!
//! MGH files are big-endian: a fixed 284-byte header followed by the voxel
//! data in x-fastest order with frames outermost. MGZ is the same stream
//! gzip-compressed. The voxel-to-RAS affine is stored as direction cosines,
//! voxel sizes and the RAS coordinate of the volume center.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix3, Vector3};

use crate::affine::Affine;
use crate::error::{Result, UnwarpError};
use crate::volume::VoxelVolume;

pub const MGH_VERSION: i32 = 1;
/// Byte offset of the voxel data
pub const MGH_DATA_START: usize = 284;

pub const MRI_UCHAR: i32 = 0;
pub const MRI_INT: i32 = 1;
pub const MRI_FLOAT: i32 = 3;
pub const MRI_SHORT: i32 = 4;

/// Geometry part of an MGH header
#[derive(Debug, Clone, PartialEq)]
pub struct MghHeader {
    pub dims: [usize; 4],
    pub dtype: i32,
    pub dof: i32,
    pub ras_good: bool,
    /// Voxel sizes (mm)
    pub delta: [f32; 3],
    /// Direction cosines, column by column (x_r, x_a, x_s, y_r, ..)
    pub mdc: [f32; 9],
    /// RAS coordinate of the volume center
    pub p_xyz_c: [f32; 3],
}

impl MghHeader {
    pub fn read<R: Read>(input: &mut R) -> Result<Self> {
        let version = input.read_i32::<BigEndian>()?;
        if version != MGH_VERSION {
            return Err(UnwarpError::volume_io(format!(
                "not an MGH stream (version code {})",
                version
            )));
        }
        let mut dims = [0usize; 4];
        for d in dims.iter_mut() {
            let v = input.read_i32::<BigEndian>()?;
            if v <= 0 {
                return Err(UnwarpError::volume_io(format!("invalid MGH dimension {}", v)));
            }
            *d = v as usize;
        }
        let dtype = input.read_i32::<BigEndian>()?;
        let dof = input.read_i32::<BigEndian>()?;
        let ras_good = input.read_i16::<BigEndian>()? == 1;

        let mut delta = [1.0f32; 3];
        let mut mdc = [-1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0];
        let mut p_xyz_c = [0.0f32; 3];
        // Always consume the geometry block to keep the stream aligned
        let mut geometry = [0.0f32; 15];
        for v in geometry.iter_mut() {
            *v = input.read_f32::<BigEndian>()?;
        }
        if ras_good {
            delta.copy_from_slice(&geometry[0..3]);
            mdc.copy_from_slice(&geometry[3..12]);
            p_xyz_c.copy_from_slice(&geometry[12..15]);
        }

        Ok(Self {
            dims,
            dtype,
            dof,
            ras_good,
            delta,
            mdc,
            p_xyz_c,
        })
    }

    /// Voxel to RAS affine
    ///
    /// Without valid RAS information FreeSurfer's default coronal
    /// orientation with unit voxels is used.
    pub fn affine(&self) -> Affine {
        let m = Matrix3::from_fn(|r, c| (self.mdc[c * 3 + r] * self.delta[c]) as f64);
        let center = Vector3::new(
            self.dims[0] as f64 / 2.0,
            self.dims[1] as f64 / 2.0,
            self.dims[2] as f64 / 2.0,
        );
        let c_ras = Vector3::new(
            self.p_xyz_c[0] as f64,
            self.p_xyz_c[1] as f64,
            self.p_xyz_c[2] as f64,
        );
        let p0 = c_ras - m * center;
        let mut out = [0.0; 16];
        for r in 0..3 {
            for c in 0..3 {
                out[r * 4 + c] = m[(r, c)];
            }
            out[r * 4 + 3] = p0[r];
        }
        out[15] = 1.0;
        Affine::from_row_major(&out)
    }

    /// Header describing `volume` as float data
    pub fn for_volume(volume: &VoxelVolume) -> Self {
        let lin = volume.affine.linear();
        let delta = volume.voxel_size();
        let mut mdc = [0.0f32; 9];
        for c in 0..3 {
            let scale = if delta[c] > 0.0 { delta[c] } else { 1.0 };
            for r in 0..3 {
                mdc[c * 3 + r] = (lin[(r, c)] / scale) as f32;
            }
        }
        let (nx, ny, nz) = volume.dims;
        let center = volume
            .affine
            .apply([nx as f64 / 2.0, ny as f64 / 2.0, nz as f64 / 2.0]);
        Self {
            dims: [nx, ny, nz, volume.frames],
            dtype: MRI_FLOAT,
            dof: 0,
            ras_good: true,
            delta: [delta[0] as f32, delta[1] as f32, delta[2] as f32],
            mdc,
            p_xyz_c: [center[0] as f32, center[1] as f32, center[2] as f32],
        }
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_i32::<BigEndian>(MGH_VERSION)?;
        for &d in &self.dims {
            let d = i32::try_from(d)
                .map_err(|_| UnwarpError::volume_io(format!("dimension {} too large for MGH", d)))?;
            out.write_i32::<BigEndian>(d)?;
        }
        out.write_i32::<BigEndian>(self.dtype)?;
        out.write_i32::<BigEndian>(self.dof)?;
        out.write_i16::<BigEndian>(if self.ras_good { 1 } else { 0 })?;
        for &v in self.delta.iter().chain(self.mdc.iter()).chain(self.p_xyz_c.iter()) {
            out.write_f32::<BigEndian>(v)?;
        }
        // 7 i32 + 1 i16 + 15 f32 written so far
        let written = 7 * 4 + 2 + 15 * 4;
        out.write_all(&vec![0u8; MGH_DATA_START - written])?;
        Ok(())
    }
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Load an MGH volume from (possibly gzipped) bytes
pub fn load_mgh(bytes: &[u8]) -> Result<VoxelVolume> {
    let raw;
    let bytes = if is_gzip(bytes) {
        let mut buf = Vec::new();
        GzDecoder::new(Cursor::new(bytes))
            .read_to_end(&mut buf)
            .map_err(|e| UnwarpError::volume_io(format!("Failed to decompress MGZ: {}", e)))?;
        raw = buf;
        &raw[..]
    } else {
        bytes
    };

    if bytes.len() < MGH_DATA_START {
        return Err(UnwarpError::volume_io(format!(
            "MGH stream too small ({} bytes, need at least {})",
            bytes.len(),
            MGH_DATA_START
        )));
    }
    let header = MghHeader::read(&mut Cursor::new(bytes))?;
    let [nx, ny, nz, nt] = header.dims;
    let n = nx * ny * nz * nt;

    let mut input = Cursor::new(&bytes[MGH_DATA_START..]);
    let mut data = Vec::with_capacity(n);
    let truncated = |e: std::io::Error| UnwarpError::volume_io(format!("truncated MGH data: {}", e));
    match header.dtype {
        MRI_UCHAR => {
            for _ in 0..n {
                data.push(input.read_u8().map_err(truncated)? as f64);
            }
        }
        MRI_INT => {
            for _ in 0..n {
                data.push(input.read_i32::<BigEndian>().map_err(truncated)? as f64);
            }
        }
        MRI_FLOAT => {
            for _ in 0..n {
                data.push(input.read_f32::<BigEndian>().map_err(truncated)? as f64);
            }
        }
        MRI_SHORT => {
            for _ in 0..n {
                data.push(input.read_i16::<BigEndian>().map_err(truncated)? as f64);
            }
        }
        other => {
            return Err(UnwarpError::volume_io(format!(
                "unsupported MGH data type {}",
                other
            )))
        }
    }

    VoxelVolume::new(data, (nx, ny, nz), nt, header.affine())
}

/// Serialize a volume as uncompressed MGH bytes (float data)
pub fn save_mgh(volume: &VoxelVolume) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(MGH_DATA_START + volume.data.len() * 4);
    MghHeader::for_volume(volume).write(&mut out)?;
    for &v in &volume.data {
        out.write_f32::<BigEndian>(v as f32)?;
    }
    Ok(out)
}

/// Read an MGH or MGZ file
pub fn read_mgh_file(path: &Path) -> Result<VoxelVolume> {
    let bytes = std::fs::read(path).map_err(|e| {
        UnwarpError::volume_io(format!("Failed to read file '{}': {}", path.display(), e))
    })?;
    load_mgh(&bytes)
}

/// Write an MGH file, gzip-compressed when the path ends in `.mgz`
pub fn save_mgh_to_file(path: &Path, volume: &VoxelVolume) -> Result<()> {
    let raw = save_mgh(volume)?;
    let bytes = if path.to_string_lossy().to_ascii_lowercase().ends_with(".mgz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?
    } else {
        raw
    };
    std::fs::write(path, &bytes).map_err(|e| {
        UnwarpError::volume_io(format!("Failed to write file '{}': {}", path.display(), e))
    })
}
