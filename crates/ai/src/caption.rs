use crate::{
    error::{CaptionError, CaptionResult},
    provider::ModelProvider,
    traits::{Caption, ImageCaptionInput, ImageCaptionModel},
    upload::{decode_image, SupportedFormat},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Turns one image into one caption using the provider's model.
pub struct CaptionService<M> {
    provider: Arc<ModelProvider<M>>,
    inference_timeout: Option<Duration>,
}

impl<M> Clone for CaptionService<M> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            inference_timeout: self.inference_timeout,
        }
    }
}

impl<M> CaptionService<M>
where
    M: ImageCaptionModel + Send + 'static,
{
    pub fn new(provider: Arc<ModelProvider<M>>) -> Self {
        Self {
            provider,
            inference_timeout: None,
        }
    }

    /// Bounds how long a caller waits for the model and for inference. A
    /// request that times out while queued never runs. One that already holds
    /// the model finishes in the background and then frees it.
    pub fn with_inference_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn provider(&self) -> &Arc<ModelProvider<M>> {
        &self.provider
    }

    #[tracing::instrument(name = "CaptionService::generate_caption", err(Debug), skip_all, fields(model_id = %self.provider.model_id()))]
    pub async fn generate_caption(&self, input: ImageCaptionInput) -> CaptionResult<Caption> {
        if input.image.width() == 0 || input.image.height() == 0 {
            return Err(CaptionError::InvalidImage("image has no pixels".into()));
        }

        let handle = self.provider.get_model_handle().await?;

        let start = std::time::Instant::now();
        let inference = async move {
            // waiting here is cancelled together with the caller
            let mut model = handle.lock().await;
            debug!("model locked for inference");
            tokio::task::spawn_blocking(move || model.process_single(input)).await
        };

        let joined = match self.inference_timeout {
            Some(timeout) => tokio::time::timeout(timeout, inference)
                .await
                .map_err(|_| CaptionError::Inference(format!("timed out after {:?}", timeout)))?,
            None => inference.await,
        };

        let caption = joined
            .map_err(|e| CaptionError::inference(format!("inference task failed: {}", e)))?
            .map_err(|e| CaptionError::Inference(format!("{:#}", e)))?;

        info!("caption generated in {:?}: {}", start.elapsed(), caption);

        Ok(caption)
    }

    /// Upload entry point: checks the extension, decodes, then captions.
    #[tracing::instrument(name = "CaptionService::caption_upload", err(Debug), skip(self, bytes), fields(size = bytes.len()))]
    pub async fn caption_upload(&self, file_name: &str, bytes: &[u8]) -> CaptionResult<Caption> {
        let format = SupportedFormat::from_file_name(file_name)?;
        let image = decode_image(format, bytes)?;
        self.generate_caption(image.into()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{traits::Model, upload::tests::encoded_image};
    use candle_core::Device;
    use image::ImageFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Describes the image size; fails on request.
    struct MockCaptioner {
        calls: Arc<AtomicUsize>,
        fail_next: bool,
        delay: Duration,
    }

    impl Model for MockCaptioner {
        type Item = ImageCaptionInput;
        type Output = Caption;

        fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            std::thread::sleep(self.delay);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if std::mem::take(&mut self.fail_next) {
                anyhow::bail!("out of memory");
            }
            Ok(items
                .into_iter()
                .map(|item| {
                    Caption::new(format!(
                        "a {}x{} picture",
                        item.image.width(),
                        item.image.height()
                    ))
                    .ok_or(anyhow::anyhow!("empty caption"))
                })
                .collect())
        }

        fn batch_size_limit(&self) -> usize {
            1
        }
    }

    fn service(
        fail_first: bool,
        delay: Duration,
    ) -> (CaptionService<MockCaptioner>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = ModelProvider::new("mock/captioner", Device::Cpu, {
            let calls = calls.clone();
            move |_device| {
                let calls = calls.clone();
                async move {
                    Ok(MockCaptioner {
                        calls,
                        fail_next: fail_first,
                        delay,
                    })
                }
            }
        });
        (CaptionService::new(Arc::new(provider)), calls)
    }

    #[test_log::test(tokio::test)]
    async fn sequential_calls_reuse_the_model() {
        let (service, calls) = service(false, Duration::ZERO);
        let png = encoded_image(224, 224, ImageFormat::Png);

        let first = service.caption_upload("dog.png", &png).await.unwrap();
        let second = service.caption_upload("dog.png", &png).await.unwrap();

        assert_eq!(first.as_str(), "a 224x224 picture");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.provider().load_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn unsupported_extension_never_reaches_the_model() {
        let (service, calls) = service(false, Duration::ZERO);
        let png = encoded_image(16, 16, ImageFormat::Png);

        let err = service.caption_upload("dog.gif", &png).await.unwrap_err();
        assert!(matches!(err, CaptionError::UnsupportedFormat(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.provider().load_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn corrupt_upload_leaves_the_handle_usable() {
        let (service, _) = service(false, Duration::ZERO);
        let png = encoded_image(64, 48, ImageFormat::Png);

        service.caption_upload("warmup.png", &png).await.unwrap();
        let handle = service.provider().get_model_handle().await.unwrap();

        let err = service
            .caption_upload("broken.png", &png[..png.len() / 2])
            .await
            .unwrap_err();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
        assert!(err.is_request_local());

        let caption = service.caption_upload("dog.png", &png).await.unwrap();
        assert_eq!(caption.as_str(), "a 64x48 picture");
        assert!(Arc::ptr_eq(
            &handle,
            &service.provider().get_model_handle().await.unwrap()
        ));
        assert_eq!(service.provider().load_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn inference_error_is_local_to_one_request() {
        let (service, _) = service(true, Duration::ZERO);
        let jpg = encoded_image(32, 32, ImageFormat::Jpeg);

        let err = service.caption_upload("dog.jpg", &jpg).await.unwrap_err();
        assert_eq!(err, CaptionError::Inference("out of memory".into()));

        let caption = service.caption_upload("dog.jpg", &jpg).await.unwrap();
        assert_eq!(caption.as_str(), "a 32x32 picture");
    }

    #[test_log::test(tokio::test)]
    async fn empty_image_is_rejected() {
        let (service, calls) = service(false, Duration::ZERO);
        let err = service
            .generate_caption(image::DynamicImage::new_rgb8(0, 0).into())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn model_load_failure_is_surfaced() {
        let provider = ModelProvider::<MockCaptioner>::new("mock/broken", Device::Cpu, |_| async {
            anyhow::bail!("connection refused")
        });
        let service = CaptionService::new(Arc::new(provider));
        let png = encoded_image(8, 8, ImageFormat::Png);

        for _ in 0..2 {
            let err = service.caption_upload("dog.png", &png).await.unwrap_err();
            assert!(matches!(err, CaptionError::ModelLoad(_)));
            assert!(!err.is_request_local());
        }
        assert_eq!(service.provider().load_count(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_callers_are_serialized() {
        let (service, calls) = service(false, Duration::from_millis(20));
        let png = encoded_image(10, 10, ImageFormat::Png);

        let tasks = (0..6)
            .map(|_| {
                let service = service.clone();
                let png = png.clone();
                tokio::spawn(async move { service.caption_upload("dog.png", &png).await })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().as_str(), "a 10x10 picture");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(service.provider().load_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn slow_inference_times_out_but_model_stays_usable() {
        let (service, _) = service(false, Duration::from_millis(200));
        let service = service.with_inference_timeout(Some(Duration::from_millis(20)));
        let png = encoded_image(10, 10, ImageFormat::Png);

        let err = service.caption_upload("dog.png", &png).await.unwrap_err();
        assert!(matches!(err, CaptionError::Inference(msg) if msg.contains("timed out")));

        let service = service.with_inference_timeout(None);
        assert!(service.caption_upload("dog.png", &png).await.is_ok());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn requests_timing_out_in_the_queue_never_run() {
        let (service, calls) = service(false, Duration::from_millis(100));
        let service = service.with_inference_timeout(Some(Duration::from_millis(30)));
        let png = encoded_image(10, 10, ImageFormat::Png);
        service.provider().get_model_handle().await.unwrap();

        let tasks = (0..5)
            .map(|_| {
                let service = service.clone();
                let png = png.clone();
                tokio::spawn(async move { service.caption_upload("dog.png", &png).await })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, CaptionError::Inference(msg) if msg.contains("timed out")));
        }

        // only the request that got the model runs, in the background
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let service = service.with_inference_timeout(None);
        assert!(service.caption_upload("dog.png", &png).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
