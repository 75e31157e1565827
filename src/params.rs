use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::format::{SourceClip, TargetSpec};
use crate::job::child_file_name;

const MAX_NAME_SUFFIX: u32 = 1000;

/// The six user-facing sliders, each an integer in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnlargeParams {
    pub sharpness: u8,
    pub flatness: u8,
    pub denoise: u8,
    pub pre_sharpen: u8,
    pub dither: u8,
    pub fractal_noise: u8,
}

impl Default for EnlargeParams {
    fn default() -> Self {
        Self {
            sharpness: 80,
            flatness: 20,
            denoise: 20,
            pre_sharpen: 0,
            dither: 10,
            fractal_noise: 0,
        }
    }
}

impl EnlargeParams {
    pub fn validate(&self) -> ParamsResult<()> {
        ensure_slider(self.sharpness, "sharp")?;
        ensure_slider(self.flatness, "flat")?;
        ensure_slider(self.denoise, "denoise")?;
        ensure_slider(self.pre_sharpen, "presharp")?;
        ensure_slider(self.dither, "dither")?;
        ensure_slider(self.fractal_noise, "fractal")?;
        Ok(())
    }
}

/// How `--width`/`--height` are honoured when both are given.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum FitMode {
    Fit,
    Cover,
    Crop,
    Bars,
    Stretch,
}

/// Raw command-line values before validation.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub save_to: Option<PathBuf>,
    pub zoom_percent: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: FitMode,
    pub clip: Option<String>,
    pub sharpness: u32,
    pub flatness: u32,
    pub denoise: u32,
    pub pre_sharpen: u32,
    pub dither: u32,
    pub fractal_noise: u32,
    pub quality: u32,
}

/// Validated settings for one console run.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub save_to: Option<PathBuf>,
    pub target: TargetSpec,
    pub clip: Option<SourceClip>,
    pub params: EnlargeParams,
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct ParamsError {
    pub field: &'static str,
    pub message: String,
}

impl ParamsError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub type ParamsResult<T> = Result<T, ParamsError>;

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ParamsError {}

impl TryFrom<CliArgs> for JobConfig {
    type Error = ParamsError;

    fn try_from(args: CliArgs) -> ParamsResult<Self> {
        let params = EnlargeParams {
            sharpness: to_slider(args.sharpness, "sharp")?,
            flatness: to_slider(args.flatness, "flat")?,
            denoise: to_slider(args.denoise, "denoise")?,
            pre_sharpen: to_slider(args.pre_sharpen, "presharp")?,
            dither: to_slider(args.dither, "dither")?,
            fractal_noise: to_slider(args.fractal_noise, "fractal")?,
        };
        let quality = to_slider(args.quality, "quality")?;
        let target = resolve_target(args.zoom_percent, args.width, args.height, args.fit)?;
        let clip = parse_clip(args.clip.as_deref())?;
        if args.output_path.is_some() && args.save_to.is_some() {
            return Err(ParamsError::new(
                "output",
                "use either --output or --saveto, not both",
            ));
        }

        Ok(Self {
            input_path: args.input_path,
            output_path: args.output_path,
            save_to: args.save_to,
            target,
            clip,
            params,
            quality,
        })
    }
}

impl JobConfig {
    pub fn is_batch(&self) -> bool {
        self.input_path.is_dir()
    }

    /// Destination file, or destination directory for a batch.
    ///
    /// Without `--output`, a file lands next to its source (or in `--saveto`)
    /// as `<stem>_e.<ext>`, numbered upwards while that name is taken. A batch
    /// writes into `--saveto`, or `<dir>_e` beside the source directory.
    pub fn resolved_output(&self) -> PathBuf {
        if let Some(output) = &self.output_path {
            return output.clone();
        }
        if self.is_batch() {
            return self.save_to.clone().unwrap_or_else(|| {
                let mut name = self
                    .input_path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_default();
                name.push("_e");
                self.input_path.with_file_name(name)
            });
        }
        let dir = self.save_to.clone().unwrap_or_else(|| {
            self.input_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        });
        let file_name = self
            .input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        unused_destination(&dir, &child_file_name(&file_name))
    }
}

/// `dir/name`, or the first `dir/<body><n>.<ext>` that does not exist yet.
fn unused_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let body = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    let mut num = stem[body.len()..].parse::<u32>().map_or(0, |n| n + 1);
    let mut candidate = dir.join(format!("{body}{num}{ext}"));
    while candidate.exists() && num < MAX_NAME_SUFFIX {
        num += 1;
        candidate = dir.join(format!("{body}{num}{ext}"));
    }
    candidate
}

pub fn build_job_config(args: CliArgs) -> ParamsResult<JobConfig> {
    JobConfig::try_from(args)
}

fn resolve_target(
    zoom_percent: f64,
    width: Option<u32>,
    height: Option<u32>,
    fit: FitMode,
) -> ParamsResult<TargetSpec> {
    let width = width.map(|w| ensure_dimension(w, "width")).transpose()?;
    let height = height.map(|h| ensure_dimension(h, "height")).transpose()?;
    let target = match (width, height) {
        (Some(width), Some(height)) => match fit {
            FitMode::Fit => TargetSpec::MaxBound { width, height },
            FitMode::Cover => TargetSpec::Cover { width, height },
            FitMode::Crop => TargetSpec::Crop {
                width,
                height,
                stretch: 1.0,
            },
            FitMode::Bars => TargetSpec::MaxBoundBars { width, height },
            FitMode::Stretch => TargetSpec::Stretch { width, height },
        },
        (Some(width), None) => TargetSpec::FixedWidth {
            width,
            stretch: 1.0,
        },
        (None, Some(height)) => TargetSpec::FixedHeight {
            height,
            stretch: 1.0,
        },
        (None, None) => {
            let zoom = to_positive_f32(zoom_percent, "zoom")? / 100.0;
            TargetSpec::zoom(zoom)
        }
    };
    Ok(target)
}

fn ensure_slider(value: u8, field: &'static str) -> ParamsResult<u8> {
    if value > 100 {
        return Err(ParamsError::new(field, "value must lie in 0..=100"));
    }
    Ok(value)
}

fn ensure_dimension(value: u32, field: &'static str) -> ParamsResult<u32> {
    if value == 0 {
        return Err(ParamsError::new(field, "value must be greater than 0"));
    }
    Ok(value)
}

fn to_slider(value: u32, field: &'static str) -> ParamsResult<u8> {
    let narrowed = u8::try_from(value)
        .map_err(|_| ParamsError::new(field, "value must lie in 0..=100"))?;
    ensure_slider(narrowed, field)
}

fn to_positive_f32(value: f64, field: &'static str) -> ParamsResult<f32> {
    if !value.is_finite() {
        return Err(ParamsError::new(field, "value must be finite"));
    }
    if value <= 0.0 {
        return Err(ParamsError::new(field, "value must be greater than 0"));
    }
    if value > f32::MAX as f64 {
        return Err(ParamsError::new(
            field,
            "value is too large for single precision",
        ));
    }
    Ok(value as f32)
}

fn parse_clip(raw: Option<&str>) -> ParamsResult<Option<SourceClip>> {
    let Some(text) = raw else {
        return Ok(None);
    };
    let mut parts = text.split(':');
    let start = parts
        .next()
        .ok_or_else(|| ParamsError::new("clip", "expected X0,Y0:X1,Y1"))?;
    let end = parts
        .next()
        .ok_or_else(|| ParamsError::new("clip", "expected X0,Y0:X1,Y1"))?;
    if parts.next().is_some() {
        return Err(ParamsError::new("clip", "unexpected extra ':'"));
    }
    let (x0, y0) = parse_pair(start, "clip")?;
    let (x1, y1) = parse_pair(end, "clip")?;
    if x1 <= x0 || y1 <= y0 {
        return Err(ParamsError::new(
            "clip",
            "clip end must be greater than start (exclusive bounds)",
        ));
    }
    Ok(Some(SourceClip {
        x0: x0 as f32,
        y0: y0 as f32,
        x1: x1 as f32,
        y1: y1 as f32,
    }))
}

fn parse_pair(raw: &str, field: &'static str) -> ParamsResult<(u32, u32)> {
    let mut parts = raw.split(',');
    let first = parts
        .next()
        .ok_or_else(|| ParamsError::new(field, "expected two comma-separated integers"))?;
    let second = parts
        .next()
        .ok_or_else(|| ParamsError::new(field, "expected two comma-separated integers"))?;
    if parts.next().is_some() {
        return Err(ParamsError::new(field, "too many commas"));
    }
    Ok((parse_u32(first, field)?, parse_u32(second, field)?))
}

fn parse_u32(raw: &str, field: &'static str) -> ParamsResult<u32> {
    raw.trim()
        .parse()
        .map_err(|_| ParamsError::new(field, "expected an unsigned integer without suffixes"))
}
