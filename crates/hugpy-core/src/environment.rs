//! Compute device and precision detection.
//!
//! The probe runs once per process (per [`EnvironmentProbe`]) and its result
//! is reused by every handle. Explicit overrides always win over detection.

use serde::Serialize;
use std::sync::OnceLock;

use crate::backend::ModelLibrary;
use crate::config::{Device, Precision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvironmentDescriptor {
    pub device: Device,
    pub precision: Precision,
}

impl EnvironmentDescriptor {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::F32,
        }
    }

    /// Apply per-model overrides on top of the probed descriptor
    pub fn with_overrides(self, library: &dyn ModelLibrary, overrides: &EnvironmentOverrides) -> Self {
        let device = overrides.device.unwrap_or(self.device);
        let precision = match (overrides.precision, overrides.device) {
            (Some(precision), _) => precision,
            // Device changed but precision not pinned: re-derive for the new device
            (None, Some(device)) if device != self.device => preferred_precision(library, device),
            (None, _) => self.precision,
        };
        Self { device, precision }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentOverrides {
    pub device: Option<Device>,
    pub precision: Option<Precision>,
}

/// Widest-range precision the library supports on `device`
fn preferred_precision(library: &dyn ModelLibrary, device: Device) -> Precision {
    match device {
        Device::Accelerator => Precision::accelerator_ladder()
            .iter()
            .copied()
            .find(|p| library.supports_precision(device, *p))
            .unwrap_or(Precision::F32),
        Device::Cpu => Precision::F32,
    }
}

/// Pick device and precision for this host
pub fn probe(library: &dyn ModelLibrary, overrides: &EnvironmentOverrides) -> EnvironmentDescriptor {
    let device = overrides.device.unwrap_or_else(|| {
        if library.accelerator_available() {
            Device::Accelerator
        } else {
            Device::Cpu
        }
    });

    let precision = overrides
        .precision
        .unwrap_or_else(|| preferred_precision(library, device));

    crate::verbose!(
        "Environment: {} via {} ({})",
        device,
        library.name(),
        precision
    );

    EnvironmentDescriptor { device, precision }
}

/// Once-per-process cache around [`probe`] and optional capability checks
#[derive(Debug, Default)]
pub struct EnvironmentProbe {
    overrides: EnvironmentOverrides,
    descriptor: OnceLock<EnvironmentDescriptor>,
    quantization: OnceLock<bool>,
}

impl EnvironmentProbe {
    pub fn new(overrides: EnvironmentOverrides) -> Self {
        Self {
            overrides,
            descriptor: OnceLock::new(),
            quantization: OnceLock::new(),
        }
    }

    /// Probe on first call, cached afterwards
    pub fn get(&self, library: &dyn ModelLibrary) -> EnvironmentDescriptor {
        *self
            .descriptor
            .get_or_init(|| probe(library, &self.overrides))
    }

    /// Descriptor if already probed
    pub fn cached(&self) -> Option<EnvironmentDescriptor> {
        self.descriptor.get().copied()
    }

    /// Whether 4-bit loading is possible, logged the first time it is asked
    pub fn quantization_available(&self, library: &dyn ModelLibrary) -> bool {
        *self.quantization.get_or_init(|| {
            let available = library.supports_quantization();
            if available {
                crate::verbose!("4-bit quantization available via {}", library.name());
            } else {
                crate::warning!(
                    "4-bit quantization not available in {}; loading full precision instead",
                    library.name()
                );
            }
            available
        })
    }
}
