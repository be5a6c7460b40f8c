use super::Model;
use image::DynamicImage;
use std::{fmt, ops::Deref};

#[derive(Debug, Clone)]
pub struct ImageCaptionInput {
    pub image: DynamicImage,
}

impl From<DynamicImage> for ImageCaptionInput {
    fn from(image: DynamicImage) -> Self {
        Self { image }
    }
}

/// Caption text. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caption(String);

impl Caption {
    /// Trims surrounding whitespace; returns `None` if nothing is left.
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        let text = text.as_ref().trim();
        if text.is_empty() {
            None
        } else {
            Some(Self(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for Caption {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ImageCaptionOutput = Caption;

pub trait ImageCaptionModel: Model<Item = ImageCaptionInput, Output = ImageCaptionOutput> {}

impl<T> ImageCaptionModel for T where T: Model<Item = ImageCaptionInput, Output = ImageCaptionOutput> {}

#[cfg(test)]
mod tests {
    use super::Caption;

    #[test]
    fn caption_is_trimmed_and_never_empty() {
        assert_eq!(Caption::new("  a dog on grass \n").unwrap().as_str(), "a dog on grass");
        assert!(Caption::new("").is_none());
        assert!(Caption::new(" \t\n").is_none());
    }
}
