use crate::error::{CaptionError, CaptionResult};
use image::{DynamicImage, ImageFormat};
use std::path::Path;
use strum_macros::EnumString;

/// Image formats accepted at the upload boundary, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum SupportedFormat {
    #[strum(serialize = "jpg", serialize = "jpeg")]
    Jpeg,
    #[strum(serialize = "png")]
    Png,
}

impl SupportedFormat {
    pub const EXTENSIONS: [&'static str; 3] = ["jpg", "jpeg", "png"];

    pub fn from_file_name(file_name: &str) -> CaptionResult<Self> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| {
                CaptionError::UnsupportedFormat(format!("{:?} has no file extension", file_name))
            })?;

        extension.parse::<Self>().map_err(|_| {
            CaptionError::UnsupportedFormat(format!(
                ".{} (expected one of: {})",
                extension,
                Self::EXTENSIONS.join(", ")
            ))
        })
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
        }
    }
}

/// Decodes `bytes` as `format`. Content that does not match the extension is
/// rejected here rather than sniffed.
pub fn decode_image(format: SupportedFormat, bytes: &[u8]) -> CaptionResult<DynamicImage> {
    let image = image::load_from_memory_with_format(bytes, format.image_format())
        .map_err(CaptionError::invalid_image)?;

    if image.width() == 0 || image.height() == 0 {
        return Err(CaptionError::InvalidImage("image has no pixels".into()));
    }

    Ok(image)
}
