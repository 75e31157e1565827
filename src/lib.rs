use std::path::Path;

use thiserror::Error;
use tracing::info;

pub mod color;
pub mod engine;
pub mod format;
pub mod job;
pub mod kernels;
pub mod model;
pub mod noise;
pub mod params;
pub mod pixel;
pub mod plane;
pub mod queue;
pub mod runner;
pub mod shrink;

mod rng;

pub use color::Bitmap;
pub use engine::{Enlarger, enlarge_plane};
pub use format::{Format, Placement, SourceClip, TargetSpec};
pub use job::{DirectoryBatchJob, Job, JobErrorKind, JobId, JobKind, JobStatus, SingleImageJob};
pub use model::{Coefficients, derive_coefficients};
pub use noise::FractalNoiseTable;
pub use params::{
    CliArgs, EnlargeParams, FitMode, JobConfig, ParamsError, ParamsResult, build_job_config,
};
pub use pixel::{Pixel, Rgb, Rgba};
pub use plane::{FilterScratch, Plane};
pub use queue::{JobQueue, QueueNotice};
pub use runner::{
    Activity, Delivery, EnlargeRequest, EnlargeRunner, RunnerEvent, RunnerEventKind, RunnerState,
};

pub type EnlargeResult<T> = Result<T, EnlargeError>;

#[derive(Debug, Error)]
pub enum EnlargeError {
    #[error("parameter error: {0}")]
    Params(#[from] ParamsError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not allocate {bytes} bytes")]
    Alloc { bytes: usize },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
}

/// Enlarges an in-memory bitmap on the calling thread.
pub fn enlarge_bitmap(
    bitmap: &Bitmap,
    format: &Format,
    params: &EnlargeParams,
) -> EnlargeResult<Bitmap> {
    let noise = (params.fractal_noise > 0 && !format.only_shrinking())
        .then(|| FractalNoiseTable::new(Placement::new(format).scale_x));
    bitmap.enlarge(format, params, noise.as_ref(), None, &mut |_| {})
}

/// Loads `input`, enlarges it according to `target` and saves it to `output`.
///
/// Returns the saved width and height.
pub fn enlarge_file(
    input: &Path,
    output: &Path,
    target: &TargetSpec,
    clip: Option<SourceClip>,
    params: &EnlargeParams,
    quality: u8,
) -> EnlargeResult<(usize, usize)> {
    let source = Bitmap::load(input)?;
    let format = target.compute_format(source.width(), source.height(), clip);
    info!(
        input = %input.display(),
        scale_x = format.scale_x,
        scale_y = format.scale_y,
        "enlarging file"
    );
    let result = enlarge_bitmap(&source, &format, params)?;
    result.save(output, quality)?;
    Ok(result.dimensions())
}
