use crate::params::{ParamsError, ParamsResult};

/// Geometry of one enlarge run: source size, per-axis scale and the
/// destination-space clip rectangle.
///
/// The clip rectangle may reach outside `0..dst_width` / `0..dst_height`; the
/// uncovered part of the output is then filled with the background colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Format {
    pub src_width: usize,
    pub src_height: usize,
    pub scale_x: f32,
    pub scale_y: f32,
    pub clip_x0: i32,
    pub clip_y0: i32,
    pub clip_x1: i32,
    pub clip_y1: i32,
}

impl Format {
    /// A format covering the whole destination.
    pub fn new(src_width: usize, src_height: usize, scale_x: f32, scale_y: f32) -> Self {
        let mut format = Self {
            src_width,
            src_height,
            scale_x,
            scale_y,
            clip_x0: 0,
            clip_y0: 0,
            clip_x1: 0,
            clip_y1: 0,
        };
        format.set_full_clip();
        format
    }

    pub fn uniform(src_width: usize, src_height: usize, scale: f32) -> Self {
        Self::new(src_width, src_height, scale, scale)
    }

    pub fn dst_width(&self) -> usize {
        (self.src_width as f32 * self.scale_x + 0.5) as usize
    }

    pub fn dst_height(&self) -> usize {
        (self.src_height as f32 * self.scale_y + 0.5) as usize
    }

    pub fn set_full_clip(&mut self) {
        self.clip_x0 = 0;
        self.clip_y0 = 0;
        self.clip_x1 = i32::try_from(self.dst_width()).unwrap_or(i32::MAX);
        self.clip_y1 = i32::try_from(self.dst_height()).unwrap_or(i32::MAX);
    }

    pub fn with_dst_clip(mut self, x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        self.clip_x0 = x0;
        self.clip_y0 = y0;
        self.clip_x1 = x1;
        self.clip_y1 = y1;
        self
    }

    /// Sets the clip from a rectangle given in source coordinates.
    pub fn set_src_clip(&mut self, x0: f32, y0: f32, x1: f32, y1: f32) {
        self.clip_x0 = (self.scale_x * x0) as i32;
        self.clip_y0 = (self.scale_y * y0) as i32;
        self.clip_x1 = self
            .clip_x0
            .saturating_add(((x1 - x0) * self.scale_x + 0.5) as i32);
        self.clip_y1 = self
            .clip_y0
            .saturating_add(((y1 - y0) * self.scale_y + 0.5) as i32);
    }

    pub fn clip_width(&self) -> usize {
        span(self.clip_x0, self.clip_x1)
    }

    pub fn clip_height(&self) -> usize {
        span(self.clip_y0, self.clip_y1)
    }

    /// True when the fast area-weighted path applies.
    pub fn only_shrinking(&self) -> bool {
        self.scale_x < 1.0 && self.scale_y < 1.0
    }

    pub fn validate(&self) -> ParamsResult<()> {
        if self.src_width == 0 || self.src_height == 0 {
            return Err(ParamsError::new("format", "source image is empty"));
        }
        ensure_scale(self.scale_x, "scale-x")?;
        ensure_scale(self.scale_y, "scale-y")?;
        let (dst_w, dst_h) = (self.dst_width(), self.dst_height());
        if dst_w == 0 || dst_h == 0 {
            return Err(ParamsError::new("format", "destination would be empty"));
        }
        if dst_w > i32::MAX as usize || dst_h > i32::MAX as usize {
            return Err(ParamsError::new(
                "format",
                format!("destination {dst_w}x{dst_h} exceeds {} pixels per side", i32::MAX),
            ));
        }
        if self.clip_width() == 0 || self.clip_height() == 0 {
            return Err(ParamsError::new("clip", "clip rectangle is empty"));
        }
        let inner_w = i64::from(self.clip_x1).min(dst_w as i64) - i64::from(self.clip_x0).max(0);
        let inner_h = i64::from(self.clip_y1).min(dst_h as i64) - i64::from(self.clip_y0).max(0);
        if inner_w < 0 || inner_h < 0 {
            return Err(ParamsError::new(
                "clip",
                "clip rectangle does not touch the destination",
            ));
        }
        Ok(())
    }
}

/// A [`Format`] resolved against the destination bounds.
///
/// The clip is intersected with `0..dst_width` / `0..dst_height`; whatever
/// was cut off on the top-left becomes `offset_x` / `offset_y` in the output
/// buffer, which keeps the full requested `out_width x out_height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub src_width: usize,
    pub src_height: usize,
    pub scale_x: f32,
    pub scale_y: f32,
    pub inv_scale_x: f32,
    pub inv_scale_y: f32,
    pub dst_width: usize,
    pub dst_height: usize,
    pub clip_x0: usize,
    pub clip_y0: usize,
    pub clip_x1: usize,
    pub clip_y1: usize,
    pub offset_x: usize,
    pub offset_y: usize,
    pub out_width: usize,
    pub out_height: usize,
}

impl Placement {
    pub fn new(format: &Format) -> Self {
        let dst_width = format.dst_width();
        let dst_height = format.dst_height();
        // Snap the scale to the rounded destination size so both axes map exactly.
        let scale_x = dst_width as f32 / format.src_width.max(1) as f32;
        let scale_y = dst_height as f32 / format.src_height.max(1) as f32;
        let (clip_x0, clip_x1, offset_x) =
            clip_axis(format.clip_x0, format.clip_x1, dst_width);
        let (clip_y0, clip_y1, offset_y) =
            clip_axis(format.clip_y0, format.clip_y1, dst_height);
        Self {
            src_width: format.src_width,
            src_height: format.src_height,
            scale_x,
            scale_y,
            inv_scale_x: 1.0 / scale_x,
            inv_scale_y: 1.0 / scale_y,
            dst_width,
            dst_height,
            clip_x0,
            clip_y0,
            clip_x1,
            clip_y1,
            offset_x,
            offset_y,
            out_width: format.clip_width(),
            out_height: format.clip_height(),
        }
    }

    pub fn inner_width(&self) -> usize {
        self.clip_x1 - self.clip_x0
    }

    pub fn inner_height(&self) -> usize {
        self.clip_y1 - self.clip_y0
    }

    /// Source index covering destination index `d` on the x axis.
    #[inline]
    pub fn src_x(&self, d: usize) -> isize {
        (d as f32 * self.inv_scale_x) as isize
    }

    #[inline]
    pub fn src_y(&self, d: usize) -> isize {
        (d as f32 * self.inv_scale_y) as isize
    }
}

// Length of `c0..c1`, zero when reversed.
fn span(c0: i32, c1: i32) -> usize {
    (i64::from(c1) - i64::from(c0)).max(0) as usize
}

fn clip_axis(c0: i32, c1: i32, len: usize) -> (usize, usize, usize) {
    let len = len as i64;
    let (c0, c1) = (c0 as i64, c1 as i64);
    let offset = (-c0).max(0);
    let start = c0.clamp(0, len);
    let end = c1.clamp(start, len);
    (start as usize, end as usize, offset as usize)
}

fn ensure_scale(value: f32, field: &'static str) -> ParamsResult<f32> {
    if !value.is_finite() {
        return Err(ParamsError::new(field, "scale must be finite"));
    }
    if value <= 0.0 {
        return Err(ParamsError::new(field, "scale must be greater than 0"));
    }
    Ok(value)
}

/// Source-space crop rectangle, exclusive on the far edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceClip {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl SourceClip {
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x0: 0.0,
            y0: 0.0,
            x1: width as f32,
            y1: height as f32,
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    fn mid_x(&self) -> f32 {
        0.5 * (self.x0 + self.x1)
    }

    fn mid_y(&self) -> f32 {
        0.5 * (self.y0 + self.y1)
    }
}

/// How the output size is chosen from the source size.
///
/// `stretch` is the horizontal-over-vertical scale ratio applied on top of a
/// uniform zoom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSpec {
    Zoom { x: f32, y: f32 },
    FixedWidth { width: u32, stretch: f32 },
    FixedHeight { height: u32, stretch: f32 },
    Stretch { width: u32, height: u32 },
    /// Fill `width x height` exactly, cropping whatever does not fit.
    Crop { width: u32, height: u32, stretch: f32 },
    /// Largest uniform zoom that fits inside the box.
    MaxBound { width: u32, height: u32 },
    /// Smallest uniform zoom that covers the box.
    Cover { width: u32, height: u32 },
    /// Fits inside the box and pads the rest with black bars.
    MaxBoundBars { width: u32, height: u32 },
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec::Zoom { x: 2.0, y: 2.0 }
    }
}

impl TargetSpec {
    pub fn zoom(factor: f32) -> Self {
        TargetSpec::Zoom {
            x: factor,
            y: factor,
        }
    }

    /// Resolves the format for a `src_width x src_height` source, optionally
    /// restricted to a source-space crop.
    pub fn compute_format(
        &self,
        src_width: usize,
        src_height: usize,
        clip: Option<SourceClip>,
    ) -> Format {
        let mut src = clip.unwrap_or_else(|| SourceClip::full(src_width, src_height));
        let (scale_x, scale_y) = match *self {
            TargetSpec::Zoom { x, y } => (x, y),
            TargetSpec::FixedWidth { width, stretch } => {
                let zoom = width as f32 / src.width();
                (zoom, zoom / stretch)
            }
            TargetSpec::FixedHeight { height, stretch } => {
                let zoom = height as f32 / src.height();
                (zoom * stretch, zoom)
            }
            TargetSpec::Stretch { width, height } => {
                (width as f32 / src.width(), height as f32 / src.height())
            }
            TargetSpec::Crop {
                width,
                height,
                stretch,
            } => {
                let zoom_x = width as f32 / (src.width() * stretch);
                let zoom_y = height as f32 / src.height();
                if zoom_x < zoom_y {
                    let clip_w = width as f32 / (zoom_y * stretch);
                    let mid = src.mid_x();
                    src.x0 = mid - 0.5 * clip_w;
                    src.x1 = mid + 0.5 * clip_w;
                    (zoom_y * stretch, zoom_y)
                } else {
                    let clip_h = height as f32 / zoom_x;
                    let mid = src.mid_y();
                    src.y0 = mid - 0.5 * clip_h;
                    src.y1 = mid + 0.5 * clip_h;
                    (zoom_x * stretch, zoom_x)
                }
            }
            TargetSpec::MaxBound { width, height } => {
                let zoom = (width as f32 / src.width()).min(height as f32 / src.height());
                (zoom, zoom)
            }
            TargetSpec::Cover { width, height } => {
                let zoom_x = width as f32 / src.width();
                let zoom_y = height as f32 / src.height();
                let zoom = zoom_x.max(zoom_y);
                if zoom_x < zoom_y {
                    let clip_w = width as f32 / zoom;
                    let mid = src.mid_x();
                    src.x0 = mid - 0.5 * clip_w;
                    src.x1 = mid + 0.5 * clip_w;
                } else {
                    let clip_h = height as f32 / zoom;
                    let mid = src.mid_y();
                    src.y0 = mid - 0.5 * clip_h;
                    src.y1 = mid + 0.5 * clip_h;
                }
                (zoom, zoom)
            }
            TargetSpec::MaxBoundBars { width, height } => {
                let zoom_x = width as f32 / src.width();
                let zoom_y = height as f32 / src.height();
                if zoom_x < zoom_y {
                    let clip_h = height as f32 / zoom_x;
                    let mid = src.mid_y();
                    src.y0 = mid - 0.5 * clip_h;
                    src.y1 = mid + 0.5 * clip_h;
                    (zoom_x, zoom_x)
                } else {
                    let clip_w = width as f32 / zoom_y;
                    let mid = src.mid_x();
                    src.x0 = mid - 0.5 * clip_w;
                    src.x1 = mid + 0.5 * clip_w;
                    (zoom_y, zoom_y)
                }
            }
        };
        let mut format = Format::new(src_width, src_height, scale_x, scale_y);
        format.set_src_clip(src.x0, src.y0, src.x1, src.y1);
        format
    }
}
