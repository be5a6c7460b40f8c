use crate::{ApiError, Ctx};
use ai::ImageCaptionModel;
use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;

pub const IMAGE_FIELD: &str = "image";

#[derive(Serialize, Debug)]
pub struct CaptionResponse {
    pub caption: String,
}

pub async fn caption<M>(
    State(ctx): State<Ctx<M>>,
    mut multipart: Multipart,
) -> Result<Json<CaptionResponse>, ApiError>
where
    M: ImageCaptionModel + Send + 'static,
{
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;

        let caption = ctx
            .caption_service()
            .caption_upload(&file_name, &bytes)
            .await?;

        return Ok(Json(CaptionResponse {
            caption: caption.into_string(),
        }));
    }

    Err(ApiError::MissingImage)
}
