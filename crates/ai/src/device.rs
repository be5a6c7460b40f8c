use crate::error::{CaptionError, CaptionResult};
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use std::{fmt, str::FromStr};
use tracing::info;

/// Where tensors live. `Auto` prefers an accelerator and falls back to the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceConfig {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceConfig {
    pub fn resolve(&self) -> CaptionResult<Device> {
        let device = match self {
            Self::Auto => {
                if cuda_is_available() {
                    Device::new_cuda(0)
                } else if metal_is_available() {
                    Device::new_metal(0)
                } else {
                    Ok(Device::Cpu)
                }
            }
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(*ordinal),
            Self::Metal(ordinal) => Device::new_metal(*ordinal),
        }
        .map_err(|e| CaptionError::model_load(format!("device {} unavailable: {}", self, e)))?;

        info!("using device {:?} (configured: {})", device.location(), self);
        Ok(device)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            Self::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

impl FromStr for DeviceConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|e| anyhow::anyhow!("invalid device ordinal {:?}: {}", ordinal, e))?;
                (kind, ordinal)
            }
            None => (s.as_str(), 0),
        };

        match kind {
            "auto" if !s.contains(':') => Ok(Self::Auto),
            "cpu" if !s.contains(':') => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => anyhow::bail!("unknown device: {}", s),
        }
    }
}
