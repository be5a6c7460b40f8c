mod config;
mod model;
mod processor;

pub use config::*;
pub use model::GitForCausalLM;
pub use processor::*;

use crate::{
    device::DeviceConfig,
    error::{CaptionError, CaptionResult},
    generation::GenerationConfig,
    provider::{ModelHandle, ModelProvider},
    traits::{Caption, ImageCaptionInput, ImageCaptionOutput, Model},
};
use anyhow::{anyhow, bail};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use file_downloader::{FileDownload, FileDownloadConfig, DEFAULT_REGISTRY_URL};
use image::DynamicImage;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};
use tracing::debug;

pub const GIT_BASE_MODEL_ID: &str = "microsoft/git-base";

const CONFIG_FILE: &str = "config.json";
const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Where the model comes from and how it decodes.
#[derive(Debug, Clone)]
pub struct GitOptions {
    pub model_id: String,
    pub revision: String,
    pub registry_url: String,
    pub resources_dir: PathBuf,
    pub device: DeviceConfig,
    pub generation: GenerationConfig,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            model_id: GIT_BASE_MODEL_ID.to_string(),
            revision: "main".to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            resources_dir: PathBuf::from("resources"),
            device: DeviceConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Local copies of the files a GIT checkpoint is made of.
#[derive(Debug, Clone)]
pub struct GitFiles {
    pub config: PathBuf,
    pub preprocessor_config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl GitFiles {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            config: dir.join(CONFIG_FILE),
            preprocessor_config: dir.join(PREPROCESSOR_CONFIG_FILE),
            tokenizer: dir.join(TOKENIZER_FILE),
            weights: dir.join(WEIGHTS_FILE),
        }
    }
}

pub struct Git {
    processor: GitProcessor,
    model: GitForCausalLM,
    generation: GenerationConfig,
    device: Device,
}

impl Git {
    pub fn new(
        processor: GitProcessor,
        model: GitForCausalLM,
        generation: GenerationConfig,
        device: Device,
    ) -> Self {
        Self {
            processor,
            model,
            generation,
            device,
        }
    }

    /// Fetches the checkpoint files unless they are already under
    /// `options.resources_dir`, then builds the model on `device`.
    pub async fn load(options: &GitOptions, device: Device) -> anyhow::Result<Self> {
        let download = FileDownload::new(FileDownloadConfig {
            url: options.registry_url.clone(),
            resources_dir: options.resources_dir.clone(),
        });

        for file_name in [
            CONFIG_FILE,
            PREPROCESSOR_CONFIG_FILE,
            TOKENIZER_FILE,
            WEIGHTS_FILE,
        ] {
            download
                .download_repo_file_if_not_exists(&options.model_id, &options.revision, file_name)
                .await?;
        }

        let files = GitFiles::in_dir(options.resources_dir.join(&options.model_id));
        let generation = options.generation.clone();

        tokio::task::spawn_blocking(move || Self::from_files(&files, generation, device)).await?
    }

    pub fn from_files(
        files: &GitFiles,
        generation: GenerationConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let config = std::fs::read_to_string(&files.config)?;
        let config = GitConfig::from_json(&config)?;

        let processor =
            GitProcessor::from_files(&files.preprocessor_config, &files.tokenizer, &config)?;
        let image_size = config.vision_config.image_size as u32;
        if processor.image_processor().output_size() != image_size {
            bail!(
                "preprocessor outputs {}px images but the vision encoder expects {}px",
                processor.image_processor().output_size(),
                image_size
            );
        }

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device)?
        };
        let model = GitForCausalLM::new(&config, vb)?;

        debug!("git model loaded on {:?}", device.location());

        Ok(Self::new(processor, model, generation, device))
    }

    fn caption(&mut self, image: &DynamicImage) -> anyhow::Result<Caption> {
        if image.width() == 0 || image.height() == 0 {
            bail!("image has no pixels");
        }

        let pixel_values = self.processor.pixel_values(image, &self.device)?;
        let image_features = self.model.encode_image(&pixel_values)?;

        // every caption starts from an empty cache
        self.model.clear_kv_cache();
        let mut logits_processor = self.generation.logits_processor();

        let mut token_ids = vec![self.processor.bos_token_id()];
        let mut generated = 0;

        for index in 0..self.generation.max_new_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;

            let logits = self.model.forward(&input_ids, &image_features)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let token = logits_processor.sample(&logits)?;
            if token == self.processor.eos_token_id() {
                break;
            }
            token_ids.push(token);
            generated += 1;
        }

        debug!("generated {} tokens", generated);

        let text = self.processor.decode(&token_ids)?;
        Caption::new(text).ok_or(anyhow!("model produced an empty caption"))
    }
}

impl Model for Git {
    type Item = ImageCaptionInput;
    type Output = ImageCaptionOutput;

    fn batch_size_limit(&self) -> usize {
        1
    }

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        if items.len() > self.batch_size_limit() {
            bail!("too many items");
        }

        Ok(items
            .into_iter()
            .map(|item| self.caption(&item.image))
            .collect())
    }
}

pub type GitProvider = ModelProvider<Git>;

/// A provider that loads `options.model_id` on `device` when first asked.
pub fn git_provider(options: GitOptions, device: Device) -> GitProvider {
    let model_id = options.model_id.clone();
    ModelProvider::new(model_id, device, move |device| {
        let options = options.clone();
        async move { Git::load(&options, device).await }
    })
}

static GIT_PROVIDER: OnceLock<Arc<GitProvider>> = OnceLock::new();

/// Installs the process wide provider. Only the first call wins.
pub fn init_global_provider(options: GitOptions) -> CaptionResult<Arc<GitProvider>> {
    if GIT_PROVIDER.get().is_some() {
        return Err(CaptionError::AlreadyInitialized);
    }

    let device = options.device.resolve()?;
    let provider = Arc::new(git_provider(options, device));
    GIT_PROVIDER
        .set(provider.clone())
        .map_err(|_| CaptionError::AlreadyInitialized)?;

    Ok(provider)
}

/// The process wide provider, installed with default options if nobody did.
pub fn global_provider() -> CaptionResult<Arc<GitProvider>> {
    if let Some(provider) = GIT_PROVIDER.get() {
        return Ok(provider.clone());
    }

    match init_global_provider(GitOptions::default()) {
        Err(CaptionError::AlreadyInitialized) => GIT_PROVIDER
            .get()
            .cloned()
            .ok_or(CaptionError::AlreadyInitialized),
        other => other,
    }
}

/// Shared model handle of the process wide provider.
pub async fn get_model_handle() -> CaptionResult<Arc<ModelHandle<Git>>> {
    global_provider()?.get_model_handle().await
}
