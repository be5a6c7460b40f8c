use crate::routes::DEFAULT_MAX_UPLOAD_BYTES;
use ai::{
    git::{GitOptions, GIT_BASE_MODEL_ID},
    DecodingStrategy, DeviceConfig, GenerationConfig, DEFAULT_MAX_NEW_TOKENS,
};
use anyhow::{anyhow, bail};
use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_LISTEN_ADDR: &str = "[::]:3001";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub git: GitOptions,
    pub inference_timeout: Option<Duration>,
    pub max_upload_bytes: usize,
    pub preload: bool,
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr: SocketAddr = match parse(&get, "CAPTION_LISTEN_ADDR")? {
            Some(addr) => addr,
            None => DEFAULT_LISTEN_ADDR.parse()?,
        };

        let defaults = GitOptions::default();
        let git = GitOptions {
            model_id: get("CAPTION_MODEL_ID").unwrap_or_else(|| GIT_BASE_MODEL_ID.to_string()),
            revision: get("CAPTION_MODEL_REVISION").unwrap_or(defaults.revision),
            registry_url: get("CAPTION_REGISTRY_URL").unwrap_or(defaults.registry_url),
            resources_dir: get("CAPTION_RESOURCES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.resources_dir),
            device: parse::<DeviceConfig>(&get, "CAPTION_DEVICE")?.unwrap_or_default(),
            generation: generation_config(&get)?,
        };

        let inference_timeout = parse::<u64>(&get, "CAPTION_INFERENCE_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let max_upload_bytes =
            parse(&get, "CAPTION_MAX_UPLOAD_BYTES")?.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        Ok(Self {
            listen_addr,
            git,
            inference_timeout,
            max_upload_bytes,
            preload: parse(&get, "CAPTION_PRELOAD")?.unwrap_or(false),
            log_dir: get("LOCAL_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid ${}={:?}: {}", key, value, e))
        })
        .transpose()
}

fn generation_config(get: &impl Fn(&str) -> Option<String>) -> anyhow::Result<GenerationConfig> {
    let max_new_tokens = parse(get, "CAPTION_MAX_NEW_TOKENS")?.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
    if max_new_tokens == 0 {
        bail!("$CAPTION_MAX_NEW_TOKENS must be positive");
    }

    let decoding = get("CAPTION_DECODING").map(|v| v.trim().to_ascii_lowercase());
    let strategy = match decoding.as_deref() {
        None | Some("greedy") => DecodingStrategy::Greedy,
        Some("sample") => DecodingStrategy::Sample {
            temperature: parse(get, "CAPTION_TEMPERATURE")?.unwrap_or(1.0),
            top_p: parse(get, "CAPTION_TOP_P")?,
            seed: parse(get, "CAPTION_SEED")?
                .ok_or(anyhow!("$CAPTION_SEED is required when sampling"))?,
        },
        Some(other) => bail!("invalid $CAPTION_DECODING={:?}: expected greedy or sample", other),
    };

    Ok(GenerationConfig {
        max_new_tokens,
        strategy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr, "[::]:3001".parse().unwrap());
        assert_eq!(config.git.model_id, "microsoft/git-base");
        assert_eq!(config.git.registry_url, "https://huggingface.co");
        assert_eq!(config.git.device, DeviceConfig::Auto);
        assert_eq!(config.git.generation, GenerationConfig::default());
        assert_eq!(config.git.generation.max_new_tokens, 50);
        assert_eq!(config.inference_timeout, None);
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
        assert!(!config.preload);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("CAPTION_LISTEN_ADDR", "127.0.0.1:8080"),
            ("CAPTION_RESOURCES_DIR", "/models"),
            ("CAPTION_DEVICE", "cuda:1"),
            ("CAPTION_MAX_NEW_TOKENS", "20"),
            ("CAPTION_DECODING", "sample"),
            ("CAPTION_TEMPERATURE", "0.7"),
            ("CAPTION_SEED", "42"),
            ("CAPTION_INFERENCE_TIMEOUT_SECS", "30"),
            ("CAPTION_PRELOAD", "true"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.git.resources_dir, PathBuf::from("/models"));
        assert_eq!(config.git.device, DeviceConfig::Cuda(1));
        assert_eq!(
            config.git.generation,
            GenerationConfig {
                max_new_tokens: 20,
                strategy: DecodingStrategy::Sample {
                    temperature: 0.7,
                    top_p: None,
                    seed: 42,
                },
            }
        );
        assert_eq!(config.inference_timeout, Some(Duration::from_secs(30)));
        assert!(config.preload);
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(config(&[("CAPTION_DEVICE", "tpu")]).is_err());
        assert!(config(&[("CAPTION_MAX_NEW_TOKENS", "0")]).is_err());
        assert!(config(&[("CAPTION_MAX_NEW_TOKENS", "many")]).is_err());
        assert!(config(&[("CAPTION_DECODING", "beam")]).is_err());
        assert!(config(&[("CAPTION_DECODING", "sample")]).is_err());
        assert!(config(&[("CAPTION_LISTEN_ADDR", "localhost")]).is_err());
    }
}
