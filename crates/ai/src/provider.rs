use crate::{error::CaptionResult, loader::ModelLoader};
use candle_core::Device;
use futures::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A loaded model bound to its device.
///
/// Created once by [`ModelProvider`] and kept until the process exits. The
/// model sits behind a single-slot mutex: one inference at a time.
pub struct ModelHandle<M> {
    model_id: String,
    device: Device,
    model: Arc<Mutex<M>>,
}

impl<M> ModelHandle<M> {
    pub fn new(model_id: impl Into<String>, device: Device, model: M) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            model: Arc::new(Mutex::new(model)),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Waits until the model is free. Dropping the future leaves the queue,
    /// so a caller that gives up never reaches the model.
    ///
    /// The guard is owned and can be moved onto a blocking thread.
    pub async fn lock(&self) -> OwnedMutexGuard<M> {
        self.model.clone().lock_owned().await
    }
}

impl<M> std::fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("device", &self.device.location())
            .finish()
    }
}

/// Lazily builds one [`ModelHandle`] and shares it.
pub struct ModelProvider<M> {
    model_id: String,
    loader: ModelLoader<ModelHandle<M>>,
}

impl<M> ModelProvider<M>
where
    M: Send + 'static,
{
    /// `create_model` runs on the first [`Self::get_model_handle`] call and
    /// never again, whether it succeeds or not.
    pub fn new<F, Fut>(model_id: impl Into<String>, device: Device, create_model: F) -> Self
    where
        F: Fn(Device) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M>> + Send + 'static,
    {
        let model_id = model_id.into();

        let loader = ModelLoader::new({
            let model_id = model_id.clone();
            move || {
                let model_id = model_id.clone();
                let device = device.clone();
                let create = create_model(device.clone());
                async move {
                    let model = create.await?;
                    Ok(ModelHandle::new(model_id, device, model))
                }
            }
        });

        Self { model_id, loader }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub async fn get_model_handle(&self) -> CaptionResult<Arc<ModelHandle<M>>> {
        self.loader.load().await
    }

    pub fn is_loaded(&self) -> bool {
        self.loader.get().is_some()
    }

    pub fn load_count(&self) -> usize {
        self.loader.load_count()
    }
}

impl<M> std::fmt::Debug for ModelProvider<M>
where
    M: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("model_id", &self.model_id)
            .field("loaded", &self.loader.get().is_some())
            .finish()
    }
}
