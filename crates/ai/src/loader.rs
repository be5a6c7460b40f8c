use crate::error::{CaptionError, CaptionResult};
use futures::{
    future::{BoxFuture, Shared},
    Future, FutureExt,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};
use tracing::{debug, error};

type LoadOutcome<T> = Result<Arc<T>, String>;
type CreateModelFn<T> = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Runs `create_model` at most once and hands every caller the same `Arc`.
///
/// Loading runs on its own task, so a caller dropping its future does not
/// restart it. A failed load is kept as well: later callers get the same
/// error and nothing is retried.
pub(crate) struct ModelLoader<T> {
    model: OnceLock<Shared<BoxFuture<'static, LoadOutcome<T>>>>,
    create_model_fn: CreateModelFn<T>,
    load_count: AtomicUsize,
}

impl<T> ModelLoader<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F, Fut>(create_model: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            model: OnceLock::new(),
            create_model_fn: Box::new(move || create_model().boxed()),
            load_count: AtomicUsize::new(0),
        }
    }

    pub async fn load(&self) -> CaptionResult<Arc<T>> {
        let shared = self
            .model
            .get_or_init(|| {
                self.load_count.fetch_add(1, Ordering::SeqCst);
                let create = (self.create_model_fn)();

                let task = tokio::spawn(async move {
                    debug!("loading model");
                    match create.await {
                        Ok(model) => {
                            debug!("model loaded");
                            Ok(Arc::new(model))
                        }
                        Err(e) => {
                            error!("failed to load model: {:#}", e);
                            Err(format!("{:#}", e))
                        }
                    }
                });

                async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(format!("model loading task failed: {}", e)),
                    }
                }
                .boxed()
                .shared()
            })
            .clone();

        shared.await.map_err(CaptionError::ModelLoad)
    }

    /// The loaded model, if loading has finished successfully.
    pub fn get(&self) -> Option<Arc<T>> {
        self.model
            .get()
            .and_then(|shared| shared.peek())
            .and_then(|outcome| outcome.as_ref().ok().cloned())
    }

    /// How many times `create_model` has been started.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }
}
