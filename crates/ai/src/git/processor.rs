use super::config::GitConfig;
use anyhow::anyhow;
use candle_core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};
use tokenizers::Tokenizer;

/// Pixels kept on each side of the crop window before resizing, in output
/// pixels. Covers the Catmull-Rom support.
const CROP_MARGIN: u32 = 4;

/// `size` / `crop_size` come either as a bare number or as a map such as
/// `{"shortest_edge": 224}` or `{"height": 224, "width": 224}`.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SizeSpec {
    Edge(u32),
    Map(HashMap<String, u32>),
}

impl SizeSpec {
    fn edge(&self) -> Option<u32> {
        match self {
            Self::Edge(v) => Some(*v),
            Self::Map(m) => m
                .get("shortest_edge")
                .or_else(|| m.get("height"))
                .or_else(|| m.get("width"))
                .copied(),
        }
    }
}

// https://huggingface.co/microsoft/git-base/blob/main/preprocessor_config.json
#[derive(Deserialize, Debug, Clone)]
pub struct HFPreProcessorConfig {
    #[serde(default)]
    pub size: Option<SizeSpec>,
    #[serde(default)]
    pub crop_size: Option<SizeSpec>,
    #[serde(default)]
    pub do_resize: Option<bool>,
    #[serde(default)]
    pub do_center_crop: Option<bool>,
    #[serde(default)]
    pub do_rescale: Option<bool>,
    #[serde(default)]
    pub rescale_factor: Option<f32>,
    #[serde(default)]
    pub do_normalize: Option<bool>,
    #[serde(default)]
    pub image_mean: Option<Vec<f32>>,
    #[serde(default)]
    pub image_std: Option<Vec<f32>>,
}

/// CLIP-style image preprocessing: shortest edge resize, center crop,
/// rescale, normalize, channels first.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    pub size: u32,
    pub do_resize: bool,
    pub do_center_crop: bool,
    pub crop_size: u32,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            size: 224,
            do_resize: true,
            do_center_crop: true,
            crop_size: 224,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.48145466, 0.4578275, 0.40821073],
            image_std: [0.26862954, 0.2613026, 0.2757771],
        }
    }
}

impl ImageProcessor {
    pub fn from_hf_preprocessor_config(config: &HFPreProcessorConfig) -> anyhow::Result<Self> {
        let default = Self::default();

        let channels = |values: &Option<Vec<f32>>, fallback: [f32; 3]| -> anyhow::Result<[f32; 3]> {
            match values {
                None => Ok(fallback),
                Some(v) => <[f32; 3]>::try_from(v.as_slice())
                    .map_err(|_| anyhow!("expected 3 channel values, got {}", v.len())),
            }
        };

        let size = config.size.as_ref().and_then(SizeSpec::edge).unwrap_or(default.size);
        let crop_size = config
            .crop_size
            .as_ref()
            .and_then(SizeSpec::edge)
            .unwrap_or(size);

        if size == 0 || crop_size == 0 {
            anyhow::bail!("image size must be positive");
        }

        Ok(Self {
            size,
            do_resize: config.do_resize.unwrap_or(default.do_resize),
            do_center_crop: config.do_center_crop.unwrap_or(default.do_center_crop),
            crop_size,
            do_rescale: config.do_rescale.unwrap_or(default.do_rescale),
            rescale_factor: config.rescale_factor.unwrap_or(default.rescale_factor),
            do_normalize: config.do_normalize.unwrap_or(default.do_normalize),
            image_mean: channels(&config.image_mean, default.image_mean)?,
            image_std: channels(&config.image_std, default.image_std)?,
        })
    }

    /// Side length of the square the model consumes.
    pub fn output_size(&self) -> u32 {
        if self.do_center_crop {
            self.crop_size
        } else {
            self.size
        }
    }

    /// Shortest edge to `self.size`, the other edge keeps the aspect ratio.
    ///
    /// With center cropping on, the long edge is first trimmed to the part
    /// that survives the crop (plus a resampling margin), so the resized
    /// image stays close to `crop_size` whatever the input aspect ratio.
    pub fn resize(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = (image.width(), image.height());
        let size = self.size;
        let portrait = width <= height;
        let (short, long) = if portrait {
            (width, height)
        } else {
            (height, width)
        };
        if short == 0 || size == 0 {
            return image.clone();
        }

        let kept_long = if self.do_center_crop {
            let window = (self.crop_size + 2 * CROP_MARGIN) as u64 * short as u64;
            window.div_ceil(size as u64).min(long as u64) as u32
        } else {
            long
        };
        let image = if kept_long < long {
            let offset = (long - kept_long) / 2;
            if portrait {
                image.crop_imm(0, offset, width, kept_long)
            } else {
                image.crop_imm(offset, 0, kept_long, height)
            }
        } else {
            image.clone()
        };
        if short == size {
            return image;
        }

        let new_long = ((size as u64 * kept_long as u64) / short as u64).max(1) as u32;
        let (new_width, new_height) = if portrait {
            (size, new_long)
        } else {
            (new_long, size)
        };
        image.resize_exact(new_width, new_height, FilterType::CatmullRom)
    }

    pub fn center_crop(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = (image.width(), image.height());
        let crop_size = self.crop_size;
        let (left, top) = calculate_middle((width, height), (crop_size, crop_size));
        let cropped = image.crop_imm(left, top, crop_size, crop_size);
        if cropped.width() != crop_size || cropped.height() != crop_size {
            // smaller than the crop window
            cropped.resize_exact(crop_size, crop_size, FilterType::CatmullRom)
        } else {
            cropped
        }
    }

    pub fn to_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let (width, height) = (image.width(), image.height());
        let img = image.to_rgb8().into_raw();
        Tensor::from_vec(img, (height as usize, width as usize, 3), &Device::Cpu)?
            .to_dtype(DType::F32)
    }

    pub fn rescale(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.affine(self.rescale_factor as f64, 0.0)
    }

    pub fn normalize(&self, tensor: &Tensor) -> Result<Tensor> {
        let mean = Tensor::new(&self.image_mean, &Device::Cpu)?;
        let std = Tensor::new(&self.image_std, &Device::Cpu)?;
        tensor.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    /// Returns a `(3, size, size)` f32 tensor on the CPU.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let image = if self.do_resize {
            self.resize(image)
        } else {
            image.clone()
        };
        let image = if self.do_center_crop {
            self.center_crop(&image)
        } else {
            image
        };
        let tensor = self.to_tensor(&image)?;
        let tensor = if self.do_rescale {
            self.rescale(&tensor)?
        } else {
            tensor
        };
        let tensor = if self.do_normalize {
            self.normalize(&tensor)?
        } else {
            tensor
        };
        tensor.permute((2, 0, 1))?.contiguous()
    }
}

pub fn calculate_middle(image_size: (u32, u32), center_size: (u32, u32)) -> (u32, u32) {
    let (width, height) = image_size;
    let (center_width, center_height) = center_size;
    let left = width.saturating_sub(center_width) / 2;
    let top = height.saturating_sub(center_height) / 2;
    (left, top)
}

/// Image side and text side of GIT: pixels in, caption text out.
pub struct GitProcessor {
    image_processor: ImageProcessor,
    tokenizer: Tokenizer,
    bos_token_id: u32,
    eos_token_id: u32,
    pad_token_id: u32,
}

impl GitProcessor {
    pub fn new(image_processor: ImageProcessor, tokenizer: Tokenizer, config: &GitConfig) -> Self {
        Self {
            image_processor,
            tokenizer,
            bos_token_id: config.bos_token_id,
            eos_token_id: config.eos_token_id,
            pad_token_id: config.pad_token_id,
        }
    }

    pub fn from_files(
        preprocessor_config_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        config: &GitConfig,
    ) -> anyhow::Result<Self> {
        let preprocessor_config = std::fs::read_to_string(preprocessor_config_path)?;
        let preprocessor_config: HFPreProcessorConfig = serde_json::from_str(&preprocessor_config)
            .map_err(|e| anyhow!("invalid preprocessor config: {}", e))?;
        let image_processor = ImageProcessor::from_hf_preprocessor_config(&preprocessor_config)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to initialize tokenizer: {}", e))?;

        Ok(Self::new(image_processor, tokenizer, config))
    }

    pub fn image_processor(&self) -> &ImageProcessor {
        &self.image_processor
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// `(1, 3, size, size)` pixel values on `device`.
    pub fn pixel_values(&self, image: &DynamicImage, device: &Device) -> Result<Tensor> {
        self.image_processor
            .preprocess(image)?
            .unsqueeze(0)?
            .to_device(device)
    }

    /// Token ids to text with bos/eos/pad and other special tokens removed.
    pub fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String> {
        let special = [self.bos_token_id, self.eos_token_id, self.pad_token_id];
        let token_ids = token_ids
            .iter()
            .copied()
            .filter(|id| !special.contains(id))
            .collect::<Vec<_>>();

        let text = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| anyhow!("failed to decode tokens: {}", e))?;

        Ok(text.trim().to_string())
    }
}
