use candle_core::{Module, Result, Tensor};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    Gelu,
    QuickGelu,
    Relu,
}

impl Module for HiddenAct {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?,
            Self::Relu => xs.relu(),
        }
    }
}

// https://huggingface.co/microsoft/git-base/blob/main/config.json
#[derive(Debug, Clone, Deserialize)]
pub struct GitVisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    #[serde(default = "default_vision_act")]
    pub hidden_act: HiddenAct,
    #[serde(default = "default_vision_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl GitVisionConfig {
    /// Patch tokens plus the class token.
    pub fn num_image_tokens(&self) -> usize {
        (self.image_size / self.patch_size).pow(2) + 1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    pub vision_config: GitVisionConfig,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_text_act")]
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    #[serde(default = "default_text_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_position_embedding_type")]
    pub position_embedding_type: String,
    /// Only set by the video variants, which add a temporal embedding per frame.
    #[serde(default)]
    pub num_image_with_embedding: Option<usize>,
}

fn default_num_channels() -> usize {
    3
}

fn default_vision_act() -> HiddenAct {
    HiddenAct::QuickGelu
}

fn default_text_act() -> HiddenAct {
    HiddenAct::Gelu
}

fn default_vision_layer_norm_eps() -> f64 {
    1e-5
}

fn default_text_layer_norm_eps() -> f64 {
    1e-12
}

fn default_bos_token_id() -> u32 {
    101
}

fn default_eos_token_id() -> u32 {
    102
}

fn default_position_embedding_type() -> String {
    "absolute".to_string()
}

impl GitConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("invalid model config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.position_embedding_type != "absolute" {
            anyhow::bail!(
                "unsupported position embedding type: {}",
                self.position_embedding_type
            );
        }
        if self.num_image_with_embedding.is_some() {
            anyhow::bail!("multi-frame GIT models are not supported");
        }
        if self.hidden_size % self.num_attention_heads != 0
            || self.vision_config.hidden_size % self.vision_config.num_attention_heads != 0
        {
            anyhow::bail!("hidden size must be divisible by the number of attention heads");
        }
        if self.vision_config.image_size % self.vision_config.patch_size != 0 {
            anyhow::bail!("image size must be a multiple of the patch size");
        }
        Ok(())
    }
}
