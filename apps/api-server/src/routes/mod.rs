mod caption;
mod status;

pub use caption::*;
pub use status::*;

use crate::Ctx;
use ai::ImageCaptionModel;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn get_routes<M>(ctx: Ctx<M>, max_upload_bytes: usize) -> Router
where
    M: ImageCaptionModel + Send + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/health", get(health::<M>))
        .route(
            "/caption",
            post(caption::<M>).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai::{Caption, CaptionService, ImageCaptionInput, Model, ModelProvider};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use candle_core::Device;
    use serde_json::Value;
    use std::{io::Cursor, sync::Arc};
    use tower::ServiceExt;

    const BOUNDARY: &str = "caption-test-boundary";

    struct SizeCaptioner;

    impl Model for SizeCaptioner {
        type Item = ImageCaptionInput;
        type Output = Caption;

        fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            Ok(items
                .into_iter()
                .map(|item| {
                    Caption::new(format!("{} by {}", item.image.width(), item.image.height()))
                        .ok_or(anyhow::anyhow!("empty caption"))
                })
                .collect())
        }

        fn batch_size_limit(&self) -> usize {
            1
        }
    }

    fn app(load_fails: bool) -> Router {
        let provider = ModelProvider::new("mock/size", Device::Cpu, move |_| async move {
            if load_fails {
                anyhow::bail!("registry unreachable");
            }
            Ok(SizeCaptioner)
        });
        let service = CaptionService::new(Arc::new(provider));
        get_routes(Ctx::new(service), 64 * 1024)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Cursor::new(vec![]);
        image::DynamicImage::new_rgb8(width, height)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn upload(field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/caption")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[test_log::test(tokio::test)]
    async fn index_serves_upload_form() {
        let request = Request::get("/").body(Body::empty()).unwrap();
        let response = app(false).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains(r#"name="image""#));
        assert!(html.contains(".jpg,.jpeg,.png"));
    }

    #[test_log::test(tokio::test)]
    async fn health_reports_lazy_model() {
        let app = app(false);

        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, json) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["model_id"], "mock/size");
        assert_eq!(json["model_loaded"], false);

        let (status, _) = send(app.clone(), upload("image", "dog.png", &png(4, 3))).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (_, json) = send(app, request).await;
        assert_eq!(json["model_loaded"], true);
    }

    #[test_log::test(tokio::test)]
    async fn png_upload_is_captioned() {
        let (status, json) = send(app(false), upload("image", "Dog.PNG", &png(40, 30))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["caption"], "40 by 30");
    }

    #[test_log::test(tokio::test)]
    async fn gif_upload_is_unsupported() {
        let (status, json) = send(app(false), upload("image", "dog.gif", b"GIF89a")).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(json["error"].as_str().unwrap().contains("gif"));
    }

    #[test_log::test(tokio::test)]
    async fn corrupt_png_is_unprocessable() {
        let bytes = png(40, 30);
        let (status, json) = send(app(false), upload("image", "dog.png", &bytes[..20])).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].is_string());
    }

    #[test_log::test(tokio::test)]
    async fn missing_image_field_is_a_bad_request() {
        let (status, _) = send(app(false), upload("file", "dog.png", &png(4, 4))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test_log::test(tokio::test)]
    async fn oversized_upload_is_rejected() {
        let big = vec![0u8; 128 * 1024];
        let (status, _) = send(app(false), upload("image", "big.png", &big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test_log::test(tokio::test)]
    async fn model_load_failure_is_unavailable() {
        let (status, json) = send(app(true), upload("image", "dog.png", &png(4, 4))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("registry unreachable"));
    }
}
