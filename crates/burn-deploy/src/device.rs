use crate::error::panic_message;
use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

/// Device requested by the deployment configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    /// Accelerator ordinal, written `cuda:N` or `gpu:N` in configuration files.
    Accelerator(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown device `{0}` (expected `cpu`, `cuda[:N]` or `gpu[:N]`)")]
pub struct ParseDeviceError(String);

impl FromStr for DeviceSpec {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        if normalized == "cpu" {
            return Ok(DeviceSpec::Cpu);
        }
        let rest = normalized
            .strip_prefix("cuda")
            .or_else(|| normalized.strip_prefix("gpu"))
            .ok_or_else(|| ParseDeviceError(s.to_string()))?;
        match rest.strip_prefix(':') {
            None if rest.is_empty() => Ok(DeviceSpec::Accelerator(0)),
            Some(index) => index
                .parse()
                .map(DeviceSpec::Accelerator)
                .map_err(|_| ParseDeviceError(s.to_string())),
            None => Err(ParseDeviceError(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = ParseDeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSpec> for String {
    fn from(value: DeviceSpec) -> Self {
        value.to_string()
    }
}

impl Display for DeviceSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Accelerator(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// Backends that can map a [`DeviceSpec`] to one of their devices.
pub trait DeviceProvider: Backend {
    fn cpu_device() -> Self::Device;

    /// Returns `None` when the accelerator is not available on this backend or host.
    fn accelerator_device(index: usize) -> Option<Self::Device>;
}

/// Whether `device` can allocate and read back a tensor.
///
/// Backends initialize their runtime on first use and panic when no matching adapter exists,
/// so the round trip runs under `catch_unwind`.
pub fn probe_device<B: Backend>(device: &B::Device) -> bool {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        Tensor::<B, 1>::zeros([1], device).into_data()
    }));
    match outcome {
        Ok(_) => true,
        Err(payload) => {
            log::debug!(
                "Device {device:?} is unavailable: {}",
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

#[cfg(any(feature = "ndarray", test))]
impl DeviceProvider for burn::backend::NdArray {
    fn cpu_device() -> Self::Device {
        burn::backend::ndarray::NdArrayDevice::Cpu
    }

    fn accelerator_device(_index: usize) -> Option<Self::Device> {
        None
    }
}

#[cfg(feature = "wgpu")]
impl DeviceProvider for burn::backend::Wgpu {
    fn cpu_device() -> Self::Device {
        burn::backend::wgpu::WgpuDevice::Cpu
    }

    fn accelerator_device(index: usize) -> Option<Self::Device> {
        let device = burn::backend::wgpu::WgpuDevice::DiscreteGpu(index);
        probe_device::<Self>(&device).then_some(device)
    }
}

/// The device a model was bound to, and whether that differs from what was requested.
#[derive(Debug, Clone)]
pub struct DeviceBinding<B: Backend> {
    pub requested: Option<DeviceSpec>,
    pub device: B::Device,
    pub fell_back: bool,
}

impl<B: Backend> DeviceBinding<B> {
    /// Binding to an explicit device, bypassing configuration.
    pub fn exact(device: B::Device) -> Self {
        Self {
            requested: None,
            device,
            fell_back: false,
        }
    }
}

impl<B: DeviceProvider> DeviceBinding<B> {
    /// Resolves `spec`, falling back to the CPU when the accelerator is unavailable.
    pub fn select(spec: DeviceSpec) -> Self {
        let (device, fell_back) = match spec {
            DeviceSpec::Cpu => (B::cpu_device(), false),
            DeviceSpec::Accelerator(index) => match B::accelerator_device(index) {
                Some(device) => (device, false),
                None => {
                    log::warn!(
                        "Accelerator `{spec}` is not available on this backend, falling back to cpu"
                    );
                    (B::cpu_device(), true)
                }
            },
        };
        log::debug!("Bound model to device {device:?} (requested `{spec}`)");
        Self {
            requested: Some(spec),
            device,
            fell_back,
        }
    }
}
