use crate::Ctx;
use ai::ImageCaptionModel;
use axum::{extract::State, response::Html, Json};
use serde::Serialize;

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><title>Image caption</title></head>
  <body>
    <form action="/caption" method="post" enctype="multipart/form-data">
      <input type="file" name="image" accept=".jpg,.jpeg,.png">
      <button type="submit">Caption</button>
    </form>
  </body>
</html>
"#;

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_id: String,
    pub model_loaded: bool,
}

pub async fn health<M>(State(ctx): State<Ctx<M>>) -> Json<HealthResponse>
where
    M: ImageCaptionModel + Send + 'static,
{
    let provider = ctx.caption_service().provider();
    Json(HealthResponse {
        status: "ok",
        model_id: provider.model_id().to_string(),
        model_loaded: provider.is_loaded(),
    })
}
