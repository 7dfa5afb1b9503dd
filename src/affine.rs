//! 4x4 homogeneous affine transforms
//!
//! Wraps a nalgebra `Matrix4<f64>` with the handful of operations the
//! unwarper needs: composition, inversion, batched coordinate transforms and
//! the fixed RAS to LAI flip. Affines are exchanged with the volume I/O layer
//! as row-major `[f64; 16]`.

use nalgebra::{Matrix3, Matrix4};

use crate::error::{Result, UnwarpError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(Matrix4<f64>);

impl Affine {
    pub fn identity() -> Self {
        Affine(Matrix4::identity())
    }

    pub fn from_matrix(m: Matrix4<f64>) -> Self {
        Affine(m)
    }

    /// Build from a row-major 4x4 array
    pub fn from_row_major(m: &[f64; 16]) -> Self {
        Affine(Matrix4::from_row_slice(m))
    }

    pub fn to_row_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for r in 0..4 {
            for c in 0..4 {
                out[r * 4 + c] = self.0[(r, c)];
            }
        }
        out
    }

    /// Diagonal scaling followed by translation
    pub fn scale_translate(scale: [f64; 3], offset: [f64; 3]) -> Self {
        let mut m = Matrix4::identity();
        for a in 0..3 {
            m[(a, a)] = scale[a];
            m[(a, 3)] = offset[a];
        }
        Affine(m)
    }

    /// Flip from RAS scanner coordinates to LAI (negates x and z)
    pub fn ras_to_lai() -> Self {
        Affine::scale_translate([-1.0, 1.0, -1.0], [0.0; 3])
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.0[(row, col)]
    }

    /// `self * other`: apply `other` first, then `self`
    pub fn compose(&self, other: &Affine) -> Affine {
        Affine(self.0 * other.0)
    }

    pub fn try_inverse(&self) -> Result<Affine> {
        self.0
            .try_inverse()
            .map(Affine)
            .ok_or_else(|| UnwarpError::numeric("affine transform is singular and cannot be inverted"))
    }

    /// Rotation/scaling part
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn determinant3(&self) -> f64 {
        self.linear().determinant()
    }

    /// Column norms of the linear part (voxel pitch for a voxel-to-world affine)
    pub fn voxel_sizes(&self) -> [f64; 3] {
        let lin = self.linear();
        [lin.column(0).norm(), lin.column(1).norm(), lin.column(2).norm()]
    }

    /// Add half a voxel along the two in-plane axes to the translation.
    pub fn with_half_voxel_shift(&self) -> Affine {
        let mut m = self.0;
        m[(0, 3)] += self.0[(0, 0)] / 2.0;
        m[(1, 3)] += self.0[(1, 1)] / 2.0;
        Affine(m)
    }

    #[inline]
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [
            m[(0, 0)] * p[0] + m[(0, 1)] * p[1] + m[(0, 2)] * p[2] + m[(0, 3)],
            m[(1, 0)] * p[0] + m[(1, 1)] * p[1] + m[(1, 2)] * p[2] + m[(1, 3)],
            m[(2, 0)] * p[0] + m[(2, 1)] * p[1] + m[(2, 2)] * p[2] + m[(2, 3)],
        ]
    }

    /// Transform coordinate arrays in place: (x, y, z) <- M (x, y, z, 1)
    pub fn transform_coordinates(&self, xs: &mut [f64], ys: &mut [f64], zs: &mut [f64]) {
        debug_assert_eq!(xs.len(), ys.len());
        debug_assert_eq!(xs.len(), zs.len());
        for idx in 0..xs.len() {
            let p = self.apply([xs[idx], ys[idx], zs[idx]]);
            xs[idx] = p[0];
            ys[idx] = p[1];
            zs[idx] = p[2];
        }
    }

    /// Transform coordinate arrays into separate output buffers
    pub fn transform_coordinates_into(
        &self,
        xs: &[f64], ys: &[f64], zs: &[f64],
        out_x: &mut [f64], out_y: &mut [f64], out_z: &mut [f64],
    ) {
        for idx in 0..xs.len() {
            let p = self.apply([xs[idx], ys[idx], zs[idx]]);
            out_x[idx] = p[0];
            out_y[idx] = p[1];
            out_z[idx] = p[2];
        }
    }
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}
