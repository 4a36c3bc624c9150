use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute device a model runs on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// GPU or other accelerator exposed by the model library
    Accelerator,
    #[default]
    Cpu,
}

impl Device {
    /// Get the string identifier for this device
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Accelerator => "accelerator",
            Device::Cpu => "cpu",
        }
    }

    /// Device used when the accelerator runs out of memory
    pub fn fallback() -> Device {
        Device::Cpu
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accelerator" | "gpu" | "cuda" | "metal" => Ok(Device::Accelerator),
            "cpu" => Ok(Device::Cpu),
            _ => Err(format!(
                "Unknown device: {}. Available: accelerator (gpu, cuda, metal), cpu",
                s
            )),
        }
    }
}

/// Numeric precision of model weights
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// bfloat16 - widest-range 16-bit float
    Bf16,
    /// IEEE half precision
    F16,
    F32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Bf16 => "bf16",
            Precision::F16 => "f16",
            Precision::F32 => "f32",
        }
    }

    /// Accelerator preference order, widest-range 16-bit type first
    pub fn accelerator_ladder() -> &'static [Precision] {
        &[Precision::Bf16, Precision::F16, Precision::F32]
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f16" | "fp16" | "float16" | "half" => Ok(Precision::F16),
            "f32" | "fp32" | "float32" | "float" => Ok(Precision::F32),
            _ => Err(format!(
                "Unknown precision: {}. Available: bf16, f16, f32",
                s
            )),
        }
    }
}
