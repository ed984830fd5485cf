//! Thumbnail rendering

use std::path::{Path, PathBuf};

use dicom_pixeldata::PixelDecoder;
use image::ImageFormat;
use tracing::debug;

use crate::error::{PacsError, Result};

/// Longest edge of rendered thumbnails, in pixels
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Turns a retrieved DICOM file into an image file
pub trait Renderer: Send + Sync {
    /// Render `dicom_path` and return the path of the written image
    fn render(&self, dicom_path: &Path) -> Result<PathBuf>;
}

/// Renders the first frame as a PNG next to the source file
#[derive(Debug, Clone)]
pub struct PngRenderer {
    max_size: u32,
}

impl PngRenderer {
    pub fn new(max_size: u32) -> Self {
        Self { max_size }
    }
}

impl Default for PngRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_THUMBNAIL_SIZE)
    }
}

impl Renderer for PngRenderer {
    fn render(&self, dicom_path: &Path) -> Result<PathBuf> {
        let obj = dicom_object::open_file(dicom_path)
            .map_err(|e| PacsError::render(format!("open dicom: {}", e)))?;
        let pixel_data = obj
            .decode_pixel_data()
            .map_err(|e| PacsError::render(format!("decode pixel data: {}", e)))?;
        let image = pixel_data
            .to_dynamic_image(0)
            .map_err(|e| PacsError::render(format!("to image: {}", e)))?;

        let thumbnail = image.thumbnail(self.max_size, self.max_size);
        let png_path = dicom_path.with_extension("png");
        thumbnail
            .save_with_format(&png_path, ImageFormat::Png)
            .map_err(|e| PacsError::render(format!("png encode: {}", e)))?;

        debug!("Rendered {} to {}", dicom_path.display(), png_path.display());
        Ok(png_path)
    }
}
