use ai::CaptionError;
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Caption(#[from] CaptionError),

    #[error("missing multipart field `image`")]
    MissingImage,

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Caption(e) => match e {
                CaptionError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                CaptionError::InvalidImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CaptionError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
                CaptionError::Inference(_) | CaptionError::AlreadyInitialized => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::MissingImage => StatusCode::BAD_REQUEST,
            // 413 when the upload is over the body limit
            Self::Multipart(e) => e.status(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
