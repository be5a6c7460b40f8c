use super::config::{GitConfig, GitVisionConfig, HiddenAct};
use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding, LayerNorm,
    Linear, VarBuilder,
};

fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    scale: f64,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let attn_weights = (query.matmul(&key.t()?.contiguous()?)? * scale)?;
    let attn_weights = match mask {
        Some(mask) => attn_weights.broadcast_add(mask)?,
        None => attn_weights,
    };
    candle_nn::ops::softmax_last_dim(&attn_weights)?.matmul(value)
}

/// `(batch, seq, hidden)` -> `(batch, heads, seq, head_dim)`
fn split_heads(xs: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch_size, seq_len, _) = xs.dims3()?;
    xs.reshape((batch_size, seq_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// `(batch, heads, seq, head_dim)` -> `(batch, seq, hidden)`
fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    let (batch_size, num_heads, seq_len, head_dim) = xs.dims4()?;
    xs.transpose(1, 2)?
        .reshape((batch_size, seq_len, num_heads * head_dim))
}

// https://github.com/huggingface/transformers/blob/main/src/transformers/models/git/modeling_git.py
#[derive(Debug, Clone)]
struct VisionEmbeddings {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Embedding,
    position_ids: Tensor,
}

impl VisionEmbeddings {
    fn new(vb: VarBuilder, c: &GitVisionConfig) -> Result<Self> {
        let class_embedding = vb.get(c.hidden_size, "class_embedding")?;
        let num_positions = c.num_image_tokens();

        let conv2dconfig = Conv2dConfig {
            stride: c.patch_size,
            ..Default::default()
        };
        let patch_embedding = conv2d_no_bias(
            c.num_channels,
            c.hidden_size,
            c.patch_size,
            conv2dconfig,
            vb.pp("patch_embedding"),
        )?;
        let position_embedding =
            embedding(num_positions, c.hidden_size, vb.pp("position_embedding"))?;
        let position_ids = Tensor::arange(0u32, num_positions as u32, vb.device())?;

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            position_ids,
        })
    }
}

impl Module for VisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch_size = pixel_values.dim(0)?;
        let patch_embeds = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let hidden_size = self.class_embedding.dim(0)?;
        let class_embeds = self
            .class_embedding
            .reshape((1, 1, hidden_size))?
            .broadcast_as((batch_size, 1, hidden_size))?;
        let embeddings = Tensor::cat(&[&class_embeds, &patch_embeds], 1)?;
        let position_embedding = self.position_embedding.forward(&self.position_ids)?;
        embeddings.broadcast_add(&position_embedding)
    }
}

#[derive(Debug, Clone)]
struct VisionAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(vb: VarBuilder, c: &GitVisionConfig) -> Result<Self> {
        let embed_dim = c.hidden_size;
        let head_dim = embed_dim / c.num_attention_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads: c.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }
}

impl Module for VisionAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let query = split_heads(&self.q_proj.forward(xs)?, self.num_heads, self.head_dim)?;
        let key = split_heads(&self.k_proj.forward(xs)?, self.num_heads, self.head_dim)?;
        let value = split_heads(&self.v_proj.forward(xs)?, self.num_heads, self.head_dim)?;
        let attn_output = scaled_dot_product_attention(&query, &key, &value, self.scale, None)?;
        self.out_proj.forward(&merge_heads(&attn_output)?)
    }
}

#[derive(Debug, Clone)]
struct VisionEncoderLayer {
    self_attn: VisionAttention,
    layer_norm1: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    activation: HiddenAct,
    layer_norm2: LayerNorm,
}

impl VisionEncoderLayer {
    fn new(vb: VarBuilder, c: &GitVisionConfig) -> Result<Self> {
        Ok(Self {
            self_attn: VisionAttention::new(vb.pp("self_attn"), c)?,
            layer_norm1: layer_norm(c.hidden_size, c.layer_norm_eps, vb.pp("layer_norm1"))?,
            fc1: linear(c.hidden_size, c.intermediate_size, vb.pp("mlp.fc1"))?,
            fc2: linear(c.intermediate_size, c.hidden_size, vb.pp("mlp.fc2"))?,
            activation: c.hidden_act,
            layer_norm2: layer_norm(c.hidden_size, c.layer_norm_eps, vb.pp("layer_norm2"))?,
        })
    }
}

impl Module for VisionEncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.layer_norm1.forward(xs)?;
        let xs = self.self_attn.forward(&xs)?;
        let xs = (xs + residual)?;

        let residual = &xs;
        let hidden = self.layer_norm2.forward(&xs)?;
        let hidden = self.fc1.forward(&hidden)?;
        let hidden = self.fc2.forward(&self.activation.forward(&hidden)?)?;
        hidden + residual
    }
}

/// CLIP ViT. Unlike CLIP, GIT keeps every output token and applies the
/// post layer norm to all of them.
#[derive(Debug, Clone)]
struct VisionTransformer {
    embeddings: VisionEmbeddings,
    pre_layrnorm: LayerNorm,
    layers: Vec<VisionEncoderLayer>,
    post_layernorm: LayerNorm,
}

impl VisionTransformer {
    fn new(vb: VarBuilder, c: &GitVisionConfig) -> Result<Self> {
        let embeddings = VisionEmbeddings::new(vb.pp("embeddings"), c)?;
        let pre_layrnorm = layer_norm(c.hidden_size, c.layer_norm_eps, vb.pp("pre_layrnorm"))?;
        let layers = (0..c.num_hidden_layers)
            .map(|index| VisionEncoderLayer::new(vb.pp("encoder.layers").pp(index.to_string()), c))
            .collect::<Result<Vec<_>>>()?;
        let post_layernorm =
            layer_norm(c.hidden_size, c.layer_norm_eps, vb.pp("post_layernorm"))?;

        Ok(Self {
            embeddings,
            pre_layrnorm,
            layers,
            post_layernorm,
        })
    }
}

impl Module for VisionTransformer {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = pixel_values
            .apply(&self.embeddings)?
            .apply(&self.pre_layrnorm)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
        }
        xs.apply(&self.post_layernorm)
    }
}

#[derive(Debug, Clone)]
struct TextEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    max_position_embeddings: usize,
}

impl TextEmbeddings {
    fn new(vb: VarBuilder, c: &GitConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(c.vocab_size, c.hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                c.max_position_embeddings,
                c.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            layer_norm: layer_norm(c.hidden_size, c.layer_norm_eps, vb.pp("LayerNorm"))?,
            max_position_embeddings: c.max_position_embeddings,
        })
    }

    fn forward(&self, input_ids: &Tensor, position_offset: usize) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let end = position_offset + seq_len;
        if end > self.max_position_embeddings {
            candle_core::bail!(
                "text length {} exceeds max position embeddings {}",
                end,
                self.max_position_embeddings
            );
        }
        let position_ids = Tensor::arange(position_offset as u32, end as u32, input_ids.device())?;
        let embeddings = self.word_embeddings.forward(input_ids)?;
        let position_embeddings = self.position_embeddings.forward(&position_ids)?;
        embeddings
            .broadcast_add(&position_embeddings)?
            .apply(&self.layer_norm)
    }
}

#[derive(Debug, Clone)]
struct TextSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl TextSelfAttention {
    fn new(vb: VarBuilder, c: &GitConfig) -> Result<Self> {
        let head_dim = c.hidden_size / c.num_attention_heads;
        Ok(Self {
            query: linear(c.hidden_size, c.hidden_size, vb.pp("query"))?,
            key: linear(c.hidden_size, c.hidden_size, vb.pp("key"))?,
            value: linear(c.hidden_size, c.hidden_size, vb.pp("value"))?,
            num_heads: c.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            kv_cache: None,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let query = split_heads(&self.query.forward(xs)?, self.num_heads, self.head_dim)?;
        let key = split_heads(&self.key.forward(xs)?, self.num_heads, self.head_dim)?;
        let value = split_heads(&self.value.forward(xs)?, self.num_heads, self.head_dim)?;

        let (key, value) = match self.kv_cache.take() {
            Some((past_key, past_value)) => (
                Tensor::cat(&[&past_key, &key], 2)?,
                Tensor::cat(&[&past_value, &value], 2)?,
            ),
            None => (key, value),
        };
        self.kv_cache = Some((key.clone(), value.clone()));

        let attn_output = scaled_dot_product_attention(&query, &key, &value, self.scale, mask)?;
        merge_heads(&attn_output)
    }
}

/// Post layer norm BERT block.
#[derive(Debug, Clone)]
struct TextLayer {
    attention: TextSelfAttention,
    attention_dense: Linear,
    attention_layer_norm: LayerNorm,
    intermediate_dense: Linear,
    activation: HiddenAct,
    output_dense: Linear,
    output_layer_norm: LayerNorm,
}

impl TextLayer {
    fn new(vb: VarBuilder, c: &GitConfig) -> Result<Self> {
        let eps = c.layer_norm_eps;
        Ok(Self {
            attention: TextSelfAttention::new(vb.pp("attention.self"), c)?,
            attention_dense: linear(c.hidden_size, c.hidden_size, vb.pp("attention.output.dense"))?,
            attention_layer_norm: layer_norm(c.hidden_size, eps, vb.pp("attention.output.LayerNorm"))?,
            intermediate_dense: linear(c.hidden_size, c.intermediate_size, vb.pp("intermediate.dense"))?,
            activation: c.hidden_act,
            output_dense: linear(c.intermediate_size, c.hidden_size, vb.pp("output.dense"))?,
            output_layer_norm: layer_norm(c.hidden_size, eps, vb.pp("output.LayerNorm"))?,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let attn_output = self.attention.forward(xs, mask)?;
        let attn_output = (self.attention_dense.forward(&attn_output)? + xs)?
            .apply(&self.attention_layer_norm)?;

        let hidden = self.intermediate_dense.forward(&attn_output)?;
        let hidden = self.activation.forward(&hidden)?;
        (self.output_dense.forward(&hidden)? + attn_output)?.apply(&self.output_layer_norm)
    }
}

/// Mask for queries at positions `past_len..past_len + q_len` of the joint
/// `[image tokens, text tokens]` sequence. Image tokens only see image
/// tokens; text tokens see every image token and the text up to themselves.
fn attention_mask(
    num_image_tokens: usize,
    past_len: usize,
    q_len: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let total = past_len + q_len;
    let mask = (past_len..total)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j < num_image_tokens || (i >= num_image_tokens && j <= i) {
                    0f32
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect::<Vec<_>>();
    Tensor::from_vec(mask, (1, 1, q_len, total), device)
}

/// GIT: image encoder + visual projection feeding a causal text decoder.
///
/// Decoding is incremental. The first [`Self::forward`] after
/// [`Self::clear_kv_cache`] takes the image features and the prompt ids;
/// later calls take only the newly sampled ids.
#[derive(Debug, Clone)]
pub struct GitForCausalLM {
    image_encoder: VisionTransformer,
    visual_projection: Linear,
    visual_projection_layer_norm: LayerNorm,
    embeddings: TextEmbeddings,
    layers: Vec<TextLayer>,
    output: Linear,
    num_image_tokens: usize,
    cached_len: usize,
    text_len: usize,
}

impl GitForCausalLM {
    pub fn new(config: &GitConfig, vb: VarBuilder) -> Result<Self> {
        let vision_config = &config.vision_config;
        let git = vb.pp("git");

        let image_encoder =
            VisionTransformer::new(git.pp("image_encoder.vision_model"), vision_config)?;
        let visual_projection = linear(
            vision_config.hidden_size,
            config.hidden_size,
            git.pp("visual_projection.visual_projection.0"),
        )?;
        let visual_projection_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            git.pp("visual_projection.visual_projection.1"),
        )?;
        let embeddings = TextEmbeddings::new(git.pp("embeddings"), config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|index| TextLayer::new(git.pp("encoder.layer").pp(index.to_string()), config))
            .collect::<Result<Vec<_>>>()?;
        let output = linear(config.hidden_size, config.vocab_size, vb.pp("output"))?;

        Ok(Self {
            image_encoder,
            visual_projection,
            visual_projection_layer_norm,
            embeddings,
            layers,
            output,
            num_image_tokens: vision_config.num_image_tokens(),
            cached_len: 0,
            text_len: 0,
        })
    }

    /// `(batch, 3, size, size)` pixels -> `(batch, image_tokens, hidden)`.
    pub fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor> {
        pixel_values
            .apply(&self.image_encoder)?
            .apply(&self.visual_projection)?
            .apply(&self.visual_projection_layer_norm)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.attention.kv_cache = None;
        }
        self.cached_len = 0;
        self.text_len = 0;
    }

    /// Logits `(batch, vocab)` for the last position of `input_ids`.
    pub fn forward(&mut self, input_ids: &Tensor, image_features: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let text = self.embeddings.forward(input_ids, self.text_len)?;

        let past_len = self.cached_len;
        let xs = if past_len == 0 {
            self.num_image_tokens = image_features.dim(1)?;
            Tensor::cat(&[image_features, &text], 1)?
        } else {
            text
        };

        let q_len = xs.dim(1)?;
        let mask = if q_len > 1 {
            Some(attention_mask(
                self.num_image_tokens,
                past_len,
                q_len,
                xs.device(),
            )?)
        } else {
            None
        };

        let mut xs = xs;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask.as_ref())?;
        }
        self.cached_len = past_len + q_len;
        self.text_len += seq_len;

        xs.i((.., q_len - 1, ..))?.apply(&self.output)
    }
}
