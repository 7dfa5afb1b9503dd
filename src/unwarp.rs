//! Unwarping pipeline
//!
//! [`UnwarpRunner`] owns one run: it loads the coefficients, evaluates the
//! displacement and Jacobian fields once on the evaluation grid, then
//! resamples the volume slice by slice. Slices are independent given the
//! read-only fields, so they are processed in parallel and assembled in
//! slice order. A run either produces every slice or fails as a whole.
//!
//! [`UnwarpJob`] wraps a runner with file I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::affine::Affine;
use crate::coeffs::{load_coefficients, CoefficientSet};
use crate::config::{Polarity, RunConfig, WarpConvention};
use crate::error::{Result, UnwarpError};
use crate::harmonics::{evaluate, DisplacementField, EvaluationGrid};
use crate::interpolation::SplineVolume;
use crate::jacobian::{self, JacobianField};
use crate::resample::{vox_to_fsl, AnomalyCounts, SliceOutput, SliceResampler};
use crate::volume::{load_volume, save_volume, VolumeFormat, VoxelVolume};

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Init,
    CoefficientsLoaded,
    GridEvaluated,
    Resampling { total: usize },
    Done,
}

/// Result of a complete run, voxel-aligned with the input.
#[derive(Debug, Clone)]
pub struct OutputVolume {
    /// Corrected intensities, same layout and frame count as the input
    pub data: Vec<f64>,
    /// Jacobian multiplier applied to each voxel (3D)
    pub jacobian: Vec<f64>,
    /// Warp field as (nx, ny, nz, 3), component outermost
    pub full_warp: Vec<f64>,
    pub dims: (usize, usize, usize),
    pub frames: usize,
    /// Input voxel-to-RAS affine, shared by all outputs
    pub affine: Affine,
    pub anomalies: AnomalyCounts,
}

impl OutputVolume {
    fn volume(&self, data: Vec<f64>, frames: usize) -> VoxelVolume {
        VoxelVolume {
            data,
            dims: self.dims,
            frames,
            affine: self.affine,
        }
    }

    pub fn corrected_volume(&self) -> VoxelVolume {
        self.volume(self.data.clone(), self.frames)
    }

    pub fn jacobian_volume(&self) -> VoxelVolume {
        self.volume(self.jacobian.clone(), 1)
    }

    pub fn warp_volume(&self) -> VoxelVolume {
        self.volume(self.full_warp.clone(), 3)
    }

    /// One warp component (0 = x, 1 = y, 2 = z)
    pub fn warp_component(&self, c: usize) -> &[f64] {
        let n = self.dims.0 * self.dims.1 * self.dims.2;
        &self.full_warp[c * n..(c + 1) * n]
    }
}

/// Drives one unwarping run.
pub struct UnwarpRunner {
    config: RunConfig,
    stage: RunStage,
    coeffs: Option<CoefficientSet>,
    grid: EvaluationGrid,
    field: Option<DisplacementField>,
    jacobian: Option<JacobianField>,
}

impl UnwarpRunner {
    /// Create a runner; grid parameters are checked here.
    pub fn new(config: RunConfig) -> Result<Self> {
        let grid = config.evaluation_grid()?;
        Ok(Self {
            config,
            stage: RunStage::Init,
            coeffs: None,
            grid,
            field: None,
            jacobian: None,
        })
    }

    /// Create a runner around an already parsed coefficient set.
    pub fn from_coefficients(config: RunConfig, coeffs: CoefficientSet) -> Result<Self> {
        let mut runner = Self::new(config)?;
        runner.coeffs = Some(coeffs);
        runner.stage = RunStage::CoefficientsLoaded;
        Ok(runner)
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn grid(&self) -> &EvaluationGrid {
        &self.grid
    }

    pub fn coefficients(&self) -> Option<&CoefficientSet> {
        self.coeffs.as_ref()
    }

    pub fn displacement_field(&self) -> Option<&DisplacementField> {
        self.field.as_ref()
    }

    /// Multiplier field on the grid (already inverted in warp polarity)
    pub fn jacobian_field(&self) -> Option<&JacobianField> {
        self.jacobian.as_ref()
    }

    /// Parse the configured coefficient file.
    pub fn load_coefficients(&mut self) -> Result<()> {
        let source = self.config.coefficient_source()?;
        let coeffs = load_coefficients(self.config.vendor, source.path())?;
        self.coeffs = Some(coeffs);
        self.field = None;
        self.jacobian = None;
        self.stage = RunStage::CoefficientsLoaded;
        Ok(())
    }

    /// Evaluate the displacement field and, if enabled, the Jacobian multiplier.
    pub fn evaluate_grid(&mut self) -> Result<()> {
        let coeffs = self.coeffs.as_ref().ok_or_else(|| {
            UnwarpError::configuration("coefficients must be loaded before evaluating the grid")
        })?;

        let field = evaluate(coeffs, self.config.vendor, &self.grid);
        debug!("Maximum displacement on grid: {:.3} mm", field.max_abs());

        let jacobian = if self.config.apply_jacobian {
            let h = self.grid.spacing_mm();
            let jac = jacobian::compute(&field, [h, h, h], self.config.vendor.max_jacobian_det())?;
            Some(match self.config.polarity {
                Polarity::Unwarp => jac,
                Polarity::Warp => jac.inverted(),
            })
        } else {
            None
        };

        self.field = Some(field);
        self.jacobian = jacobian;
        self.stage = RunStage::GridEvaluated;
        Ok(())
    }

    /// Run the whole pipeline on `volume`.
    pub fn run(&mut self, volume: &VoxelVolume) -> Result<OutputVolume> {
        self.run_with_progress(volume, |_, _| {})
    }

    /// Run with a progress callback, called as `progress(done, total)` once
    /// per finished slice, possibly from worker threads.
    pub fn run_with_progress<F>(&mut self, volume: &VoxelVolume, progress: F) -> Result<OutputVolume>
    where
        F: Fn(usize, usize) + Sync,
    {
        if self.coeffs.is_none() {
            self.load_coefficients()?;
        }
        if self.field.is_none() {
            self.evaluate_grid()?;
        }
        let (field, jacobian) = match (self.field.take(), self.jacobian.take()) {
            (Some(field), jacobian) => (field, jacobian),
            (None, _) => {
                return Err(UnwarpError::configuration("displacement field was not evaluated"))
            }
        };

        let result = self.resample(volume, &field, jacobian.as_ref(), progress);
        // Fields are only needed for one volume
        self.stage = if result.is_ok() { RunStage::Done } else { RunStage::CoefficientsLoaded };
        result
    }

    fn resample<F>(
        &mut self,
        volume: &VoxelVolume,
        field: &DisplacementField,
        jacobian: Option<&JacobianField>,
        progress: F,
    ) -> Result<OutputVolume>
    where
        F: Fn(usize, usize) + Sync,
    {
        let (nx, ny, nz) = volume.dims;
        let order = self.config.order;

        // Global transforms, computed once
        let vox_to_lai = Affine::ras_to_lai()
            .compose(&volume.affine)
            .with_half_voxel_shift();
        let lai_to_vox = vox_to_lai.try_inverse()?;

        let gdims = field.dims();
        let displacement = [
            SplineVolume::new(&field.dx, gdims, order)?,
            SplineVolume::new(&field.dy, gdims, order)?,
            SplineVolume::new(&field.dz, gdims, order)?,
        ];
        let jacobian_spline = match jacobian {
            Some(jac) => Some(SplineVolume::new(jac.data(), jac.dims(), order)?),
            None => None,
        };
        let frames = volume
            .frames_iter()
            .map(|frame| SplineVolume::new(frame, volume.dims, order))
            .collect::<Result<Vec<_>>>()?;

        let resampler = SliceResampler {
            frames: &frames,
            displacement: &displacement,
            jacobian: jacobian_spline.as_ref(),
            vox_to_lai,
            lai_to_vox,
            lai_to_grid: self.grid.xyz_to_index(),
            vox_to_fsl: vox_to_fsl(&volume.affine, nx),
            polarity: self.config.polarity,
            convention: self.config.warp_convention,
            dims: volume.dims,
        };

        info!(
            "Resampling {} slices of a {}x{}x{} volume ({} frame(s), order {})",
            nz,
            nx,
            ny,
            nz,
            volume.frames,
            order.degree()
        );
        self.stage = RunStage::Resampling { total: nz };

        let done = AtomicUsize::new(0);
        let slices: Vec<SliceOutput> = (0..nz)
            .into_par_iter()
            .map(|k| {
                let out = resampler.resample_slice(k);
                progress(done.fetch_add(1, Ordering::Relaxed) + 1, nz);
                out
            })
            .collect();

        let mut anomalies = AnomalyCounts::default();
        if let Some(jac) = jacobian {
            anomalies.jacobian_clipped = jac.clipped;
            anomalies.jacobian_non_finite = jac.non_finite;
        }

        let plane = nx * ny;
        let n = plane * nz;
        let mut data = vec![0.0; n * volume.frames];
        let mut jac_out = vec![0.0; n];
        let mut full_warp = vec![0.0; n * 3];
        for slice in slices {
            let offset = slice.slice * plane;
            for (t, frame) in slice.intensity.iter().enumerate() {
                data[t * n + offset..t * n + offset + plane].copy_from_slice(frame);
            }
            jac_out[offset..offset + plane].copy_from_slice(&slice.jacobian);
            for (c, component) in slice.warp.iter().enumerate() {
                full_warp[c * n + offset..c * n + offset + plane].copy_from_slice(component);
            }
            anomalies += slice.anomalies;
        }

        if anomalies.total() > 0 {
            warn!(
                "Repaired numeric anomalies: {} displacement, {} intensity, {} jacobian samples; \
                 {} determinants clipped, {} non-finite",
                anomalies.displacement,
                anomalies.intensity,
                anomalies.jacobian,
                anomalies.jacobian_clipped,
                anomalies.jacobian_non_finite
            );
        }

        Ok(OutputVolume {
            data,
            jacobian: jac_out,
            full_warp,
            dims: volume.dims,
            frames: volume.frames,
            affine: volume.affine,
            anomalies,
        })
    }
}

/// File-level unwarping: read the input, run, write every output.
#[derive(Debug, Clone)]
pub struct UnwarpJob {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Full warp destination; defaults next to the output
    pub warp_field: Option<PathBuf>,
    /// Optional destination for the Jacobian multiplier volume
    pub jacobian_output: Option<PathBuf>,
    pub config: RunConfig,
}

impl UnwarpJob {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, config: RunConfig) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            warp_field: None,
            jacobian_output: None,
            config,
        }
    }

    /// Full warp path: explicit, or `fullWarp_abs.nii.gz` / `fullWarp_rel.nii.gz`
    /// in the output's directory.
    pub fn warp_field_path(&self) -> PathBuf {
        if let Some(path) = &self.warp_field {
            return path.clone();
        }
        let name = match self.config.warp_convention {
            WarpConvention::Absolute => "fullWarp_abs.nii.gz",
            WarpConvention::Relative => "fullWarp_rel.nii.gz",
        };
        self.output
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(name)
    }

    /// Run the job. Nothing is written unless every stage succeeds.
    pub fn execute(&self) -> Result<OutputVolume> {
        self.config.validate()?;
        let warp_path = self.warp_field_path();
        VolumeFormat::from_path(&self.output)?;
        VolumeFormat::from_path(&warp_path)?;
        if let Some(path) = &self.jacobian_output {
            VolumeFormat::from_path(path)?;
        }

        let mut runner = UnwarpRunner::new(self.config.clone())?;
        runner.load_coefficients()?;

        info!("Reading {}", self.input.display());
        let volume = load_volume(&self.input)?;
        let output = runner.run(&volume)?;

        let mut outputs = vec![
            ("output", output.corrected_volume(), self.output.clone()),
            ("full warp", output.warp_volume(), warp_path),
        ];
        if let Some(path) = &self.jacobian_output {
            outputs.push(("Jacobian multiplier", output.jacobian_volume(), path.clone()));
        }
        write_all_or_nothing(&outputs)?;
        Ok(output)
    }
}

/// Sibling of `path` that keeps its extension, so format dispatch still works.
fn staged_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".partial-{}", name))
}

/// Write every volume to a staged sibling, then rename them all into place.
/// Staged files are removed if any write fails.
fn write_all_or_nothing(outputs: &[(&str, VoxelVolume, PathBuf)]) -> Result<()> {
    let mut staged = Vec::with_capacity(outputs.len());
    for (label, volume, path) in outputs {
        let tmp = staged_path(path);
        info!("Writing {} to {}", label, path.display());
        if let Err(e) = save_volume(volume, &tmp) {
            discard(&staged);
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        staged.push((tmp, path.clone()));
    }

    for (i, (tmp, path)) in staged.iter().enumerate() {
        if let Err(e) = std::fs::rename(tmp, path) {
            discard(&staged[i..]);
            return Err(UnwarpError::volume_io(format!(
                "Failed to move '{}' into place: {}",
                path.display(),
                e
            )));
        }
    }
    Ok(())
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        if let Err(e) = std::fs::remove_file(tmp) {
            warn!("Could not remove {}: {}", tmp.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GridParams, Vendor};
    use crate::interpolation::InterpolationOrder;

    fn small_config() -> RunConfig {
        RunConfig::new(Vendor::Siemens).with_grid(GridParams {
            fov_min: Some(-0.05),
            fov_max: Some(0.05),
            numpoints: Some(11),
        })
    }

    fn small_volume() -> VoxelVolume {
        let dims = (6, 5, 4);
        let data: Vec<f64> = (0..120).map(|i| (i as f64 * 0.37).sin() * 100.0).collect();
        let affine = Affine::scale_translate([2.0, 2.0, 2.0], [-6.0, -5.0, -4.0]);
        VoxelVolume::from_3d(data, dims, affine).unwrap()
    }

    #[test]
    fn test_stage_transitions() {
        let coeffs = CoefficientSet::zeros(3, 0.25).unwrap();
        let mut runner = UnwarpRunner::from_coefficients(small_config(), coeffs).unwrap();
        assert_eq!(runner.stage(), RunStage::CoefficientsLoaded);

        runner.evaluate_grid().unwrap();
        assert_eq!(runner.stage(), RunStage::GridEvaluated);
        assert!(runner.displacement_field().is_some());
        assert!(runner.jacobian_field().is_some());

        runner.run(&small_volume()).unwrap();
        assert_eq!(runner.stage(), RunStage::Done);
        assert!(runner.displacement_field().is_none());
    }

    #[test]
    fn test_evaluate_without_coefficients_fails() {
        let mut runner = UnwarpRunner::new(small_config()).unwrap();
        assert_eq!(runner.stage(), RunStage::Init);
        assert!(matches!(
            runner.evaluate_grid(),
            Err(UnwarpError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_missing_coefficient_source_aborts_run() {
        let mut runner = UnwarpRunner::new(small_config()).unwrap();
        assert!(matches!(
            runner.run(&small_volume()),
            Err(UnwarpError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_zero_coefficients_identity() {
        let coeffs = CoefficientSet::zeros(4, 0.25).unwrap();
        let config = small_config()
            .with_order(InterpolationOrder::CUBIC)
            .with_warp_convention(WarpConvention::Relative);
        let mut runner = UnwarpRunner::from_coefficients(config, coeffs).unwrap();
        let volume = small_volume();
        let out = runner.run(&volume).unwrap();

        for (a, b) in out.data.iter().zip(volume.data.iter()) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
        assert!(out.jacobian.iter().all(|&v| (v - 1.0).abs() < 1e-12));
        assert!(out.full_warp.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_disabled_jacobian_is_constant_one() {
        let coeffs = CoefficientSet::zeros(2, 0.25).unwrap();
        let config = small_config().with_jacobian(false);
        let mut runner = UnwarpRunner::from_coefficients(config, coeffs).unwrap();
        runner.evaluate_grid().unwrap();
        assert!(runner.jacobian_field().is_none());
        let out = runner.run(&small_volume()).unwrap();
        assert!(out.jacobian.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_progress_called_per_slice() {
        let coeffs = CoefficientSet::zeros(1, 0.25).unwrap();
        let mut runner = UnwarpRunner::from_coefficients(small_config(), coeffs).unwrap();
        let calls = AtomicUsize::new(0);
        runner
            .run_with_progress(&small_volume(), |_, total| {
                assert_eq!(total, 4);
                calls.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_singular_affine_is_numeric_failure() {
        let coeffs = CoefficientSet::zeros(1, 0.25).unwrap();
        let mut runner = UnwarpRunner::from_coefficients(small_config(), coeffs).unwrap();
        let volume = VoxelVolume::from_3d(
            vec![1.0; 8],
            (2, 2, 2),
            Affine::scale_translate([1.0, 0.0, 1.0], [0.0; 3]),
        )
        .unwrap();
        assert!(matches!(
            runner.run(&volume),
            Err(UnwarpError::NumericFailure(_))
        ));
    }

    #[test]
    fn test_default_warp_path() {
        let job = UnwarpJob::new("in.nii", "/data/out/corrected.nii.gz", small_config());
        assert_eq!(job.warp_field_path(), PathBuf::from("/data/out/fullWarp_abs.nii.gz"));
        let job = UnwarpJob::new(
            "in.nii",
            "corrected.mgz",
            small_config().with_warp_convention(WarpConvention::Relative),
        );
        assert_eq!(job.warp_field_path(), PathBuf::from("fullWarp_rel.nii.gz"));
    }

    #[test]
    fn test_staged_path_keeps_extension() {
        let staged = staged_path(Path::new("/data/out/corrected.nii.gz"));
        assert_eq!(staged, PathBuf::from("/data/out/.partial-corrected.nii.gz"));
        assert_eq!(VolumeFormat::from_path(&staged).unwrap(), VolumeFormat::NiftiGz);
        assert_eq!(staged_path(Path::new("t1.mgz")), PathBuf::from(".partial-t1.mgz"));
    }

    #[test]
    fn test_failed_write_removes_staged_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.nii");
        let second = dir.path().join("missing").join("second.nii");
        let outputs = vec![
            ("first", small_volume(), first.clone()),
            ("second", small_volume(), second.clone()),
        ];

        assert!(write_all_or_nothing(&outputs).is_err());
        assert!(!first.exists());
        assert!(!staged_path(&first).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
