use candle_transformers::generation::{LogitsProcessor, Sampling};

pub const DEFAULT_MAX_NEW_TOKENS: usize = 50;

/// How the next token is picked from the logits.
///
/// `Greedy` is the default and makes captions reproducible for a given set of
/// weights. `Sample` is only deterministic for a fixed `seed`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DecodingStrategy {
    #[default]
    Greedy,
    Sample {
        temperature: f64,
        top_p: Option<f64>,
        seed: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub strategy: DecodingStrategy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            strategy: DecodingStrategy::default(),
        }
    }
}

impl GenerationConfig {
    pub fn logits_processor(&self) -> LogitsProcessor {
        match &self.strategy {
            DecodingStrategy::Greedy => LogitsProcessor::from_sampling(0, Sampling::ArgMax),
            DecodingStrategy::Sample {
                temperature,
                top_p,
                seed,
            } => {
                let temperature = *temperature;
                let sampling = if temperature <= 0.0 {
                    Sampling::ArgMax
                } else {
                    match top_p {
                        Some(p) => Sampling::TopP { p: *p, temperature },
                        None => Sampling::All { temperature },
                    }
                };
                LogitsProcessor::from_sampling(*seed, sampling)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn greedy_picks_the_largest_logit() {
        let logits = Tensor::new(&[0.1f32, 2.5, -1.0, 0.7], &Device::Cpu).unwrap();
        let mut processor = GenerationConfig::default().logits_processor();
        assert_eq!(processor.sample(&logits).unwrap(), 1);
        assert_eq!(processor.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let config = GenerationConfig {
            max_new_tokens: 8,
            strategy: DecodingStrategy::Sample {
                temperature: 1.0,
                top_p: None,
                seed: 42,
            },
        };
        let logits = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0, 1.0], &Device::Cpu).unwrap();

        let draw = |config: &GenerationConfig| {
            let mut processor = config.logits_processor();
            (0..16)
                .map(|_| processor.sample(&logits).unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(draw(&config), draw(&config));
    }

    #[test]
    fn zero_temperature_falls_back_to_argmax() {
        let config = GenerationConfig {
            max_new_tokens: 8,
            strategy: DecodingStrategy::Sample {
                temperature: 0.0,
                top_p: Some(0.9),
                seed: 7,
            },
        };
        let logits = Tensor::new(&[0.0f32, 0.0, 3.0], &Device::Cpu).unwrap();
        assert_eq!(config.logits_processor().sample(&logits).unwrap(), 2);
    }
}
