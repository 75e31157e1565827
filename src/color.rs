use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
use tracing::debug;

use crate::engine::{CancelFn, Enlarger};
use crate::format::Format;
use crate::noise::FractalNoiseTable;
use crate::params::EnlargeParams;
use crate::pixel::{Rgb, Rgba};
use crate::plane::Plane;
use crate::{EnlargeError, EnlargeResult};

/// A decoded image in one of the two layouts the engine works on.
#[derive(Debug, Clone, PartialEq)]
pub enum Bitmap {
    Rgb(Plane<Rgb>),
    Rgba(Plane<Rgba>),
}

impl Bitmap {
    pub fn width(&self) -> usize {
        match self {
            Bitmap::Rgb(plane) => plane.width,
            Bitmap::Rgba(plane) => plane.width,
        }
    }

    pub fn height(&self) -> usize {
        match self {
            Bitmap::Rgb(plane) => plane.height,
            Bitmap::Rgba(plane) => plane.height,
        }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, Bitmap::Rgba(_))
    }

    pub fn load(path: &Path) -> EnlargeResult<Self> {
        let image = image::open(path)?;
        Ok(Self::from_dynamic(&image))
    }

    pub fn from_dynamic(image: &DynamicImage) -> Self {
        let width = image.width() as usize;
        let height = image.height() as usize;
        if image.color().has_alpha() {
            let data = image
                .to_rgba32f()
                .into_raw()
                .chunks_exact(4)
                .map(|c| Rgba::new(clamp01(c[0]), clamp01(c[1]), clamp01(c[2]), clamp01(c[3])))
                .collect();
            Bitmap::Rgba(Plane::from_vec(width, height, data))
        } else {
            let data = image
                .to_rgb32f()
                .into_raw()
                .chunks_exact(3)
                .map(|c| Rgb::new(clamp01(c[0]), clamp01(c[1]), clamp01(c[2])))
                .collect();
            Bitmap::Rgb(Plane::from_vec(width, height, data))
        }
    }

    pub fn to_dynamic(&self) -> EnlargeResult<DynamicImage> {
        let (width, height) = (self.width() as u32, self.height() as u32);
        match self {
            Bitmap::Rgb(plane) => {
                let buffer = plane
                    .pixels()
                    .iter()
                    .flat_map(|p| [to_u8(p.r), to_u8(p.g), to_u8(p.b)])
                    .collect();
                let image = RgbImage::from_vec(width, height, buffer)
                    .ok_or_else(|| EnlargeError::Message("failed to create RGB image".into()))?;
                Ok(DynamicImage::ImageRgb8(image))
            }
            Bitmap::Rgba(plane) => {
                let buffer = plane
                    .pixels()
                    .iter()
                    .flat_map(|p| [to_u8(p.r), to_u8(p.g), to_u8(p.b), to_u8(p.a)])
                    .collect();
                let image = RgbaImage::from_vec(width, height, buffer)
                    .ok_or_else(|| EnlargeError::Message("failed to create RGBA image".into()))?;
                Ok(DynamicImage::ImageRgba8(image))
            }
        }
    }

    /// Encodes to `path`, picking the format from the extension.
    ///
    /// `quality` only affects JPEG output; alpha is dropped there.
    pub fn save(&self, path: &Path, quality: u8) -> EnlargeResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let format = ImageFormat::from_path(path)?;
        let image = self.to_dynamic()?;
        debug!(path = %path.display(), ?format, quality, "saving image");
        match format {
            ImageFormat::Jpeg => {
                let writer = BufWriter::new(File::create(path)?);
                let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
                encoder.encode_image(&image.to_rgb8())?;
                Ok(())
            }
            _ => image.save_with_format(path, format).map_err(EnlargeError::from),
        }
    }

    /// Runs the engine over this bitmap and returns the clipped result.
    pub fn enlarge(
        &self,
        format: &Format,
        params: &EnlargeParams,
        noise: Option<&FractalNoiseTable>,
        cancel: CancelFn<'_>,
        progress: &mut dyn FnMut(f32),
    ) -> EnlargeResult<Bitmap> {
        match self {
            Bitmap::Rgb(src) => {
                let mut enlarger = Enlarger::new(format, params)?;
                let mut dst = enlarger.allocate_output()?;
                enlarger.run(src, &mut dst, noise, cancel, progress)?;
                Ok(Bitmap::Rgb(dst))
            }
            Bitmap::Rgba(src) => {
                let mut enlarger = Enlarger::new(format, params)?;
                let mut dst = enlarger.allocate_output()?;
                enlarger.run(src, &mut dst, noise, cancel, progress)?;
                Ok(Bitmap::Rgba(dst))
            }
        }
    }
}

impl From<Plane<Rgb>> for Bitmap {
    fn from(plane: Plane<Rgb>) -> Self {
        Bitmap::Rgb(plane)
    }
}

impl From<Plane<Rgba>> for Bitmap {
    fn from(plane: Plane<Rgba>) -> Self {
        Bitmap::Rgba(plane)
    }
}

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

fn to_u8(value: f32) -> u8 {
    (clamp01(value) * 255.0 + 0.5).floor() as u8
}
