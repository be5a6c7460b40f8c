use thiserror::Error;

pub type CaptionResult<T> = std::result::Result<T, CaptionError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptionError {
    /// The model could not be fetched, instantiated or bound to its device.
    /// Once raised, the provider keeps answering with it until restart.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model provider already initialized")]
    AlreadyInitialized,
}

impl CaptionError {
    pub(crate) fn model_load(e: impl std::fmt::Display) -> Self {
        Self::ModelLoad(e.to_string())
    }

    pub(crate) fn inference(e: impl std::fmt::Display) -> Self {
        Self::Inference(e.to_string())
    }

    pub(crate) fn invalid_image(e: impl std::fmt::Display) -> Self {
        Self::InvalidImage(e.to_string())
    }

    /// Errors scoped to a single request leave the model handle usable.
    pub fn is_request_local(&self) -> bool {
        matches!(
            self,
            Self::InvalidImage(_) | Self::UnsupportedFormat(_) | Self::Inference(_)
        )
    }
}
