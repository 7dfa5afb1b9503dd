use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gradunwarp_core::config::GridParams;
use gradunwarp_core::{InterpolationOrder, Polarity, RunConfig, UnwarpJob, Vendor, WarpConvention};

#[derive(Parser, Debug)]
#[command(name = "gradient_unwarp")]
#[command(about = "Correct gradient nonlinearity distortion in MR volumes")]
struct Cli {
    /// Input volume (.nii, .nii.gz, .mgh or .mgz)
    infile: PathBuf,

    /// Output volume
    outfile: PathBuf,

    /// Scanner vendor (siemens or ge)
    vendor: Vendor,

    /// Siemens .grad coefficient file
    #[arg(short = 'g', long = "gradfile", conflicts_with = "coeffile")]
    gradfile: Option<PathBuf>,

    /// Flat .coef coefficient table
    #[arg(short = 'c', long = "coeffile")]
    coeffile: Option<PathBuf>,

    /// Re-apply the distortion instead of removing it
    #[arg(short, long)]
    warp: bool,

    /// Skip Jacobian intensity correction
    #[arg(short = 'n', long = "nojacobian")]
    nojac: bool,

    /// Evaluation grid lower bound (m)
    #[arg(long, allow_hyphen_values = true)]
    fovmin: Option<f64>,

    /// Evaluation grid upper bound (m)
    #[arg(long, allow_hyphen_values = true)]
    fovmax: Option<f64>,

    /// Evaluation grid points per axis
    #[arg(long)]
    numpoints: Option<usize>,

    /// Spline interpolation order (1-4)
    #[arg(long = "interp-order", alias = "interp_order", default_value_t = 1)]
    interp_order: u8,

    /// Full warp output (default: fullWarp_abs.nii.gz next to the output)
    #[arg(long)]
    warp_field: Option<PathBuf>,

    /// Write the Jacobian multiplier volume here
    #[arg(long)]
    jacobian_out: Option<PathBuf>,

    /// Write the warp as displacement rather than absolute source position
    #[arg(long)]
    relative_warp: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = RunConfig::new(cli.vendor)
        .with_polarity(if cli.warp { Polarity::Warp } else { Polarity::Unwarp })
        .with_jacobian(!cli.nojac)
        .with_order(InterpolationOrder::new(cli.interp_order)?)
        .with_grid(GridParams {
            fov_min: cli.fovmin,
            fov_max: cli.fovmax,
            numpoints: cli.numpoints,
        })
        .with_warp_convention(if cli.relative_warp {
            WarpConvention::Relative
        } else {
            WarpConvention::Absolute
        });
    if let Some(path) = cli.gradfile {
        config = config.with_grad_file(path);
    }
    if let Some(path) = cli.coeffile {
        config = config.with_coef_file(path);
    }

    let mut job = UnwarpJob::new(&cli.infile, &cli.outfile, config);
    job.warp_field = cli.warp_field;
    job.jacobian_output = cli.jacobian_out;

    let output = job
        .execute()
        .with_context(|| format!("unwarping {} failed", cli.infile.display()))?;

    info!(
        "Done: {} ({} repaired samples)",
        cli.outfile.display(),
        output.anomalies.total()
    );
    Ok(())
}
