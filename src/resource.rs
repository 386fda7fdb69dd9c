//! Platform and device descriptions returned by a runtime.

use std::fmt;
use std::str::FromStr;

/// Capability class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    Custom,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Gpu => write!(f, "GPU"),
            DeviceType::Accelerator => write!(f, "Accelerator"),
            DeviceType::Custom => write!(f, "Custom"),
        }
    }
}

/// Type filter used when listing devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceFilter {
    #[default]
    All,
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceFilter {
    pub fn matches(self, device_type: DeviceType) -> bool {
        match self {
            DeviceFilter::All => true,
            DeviceFilter::Cpu => device_type == DeviceType::Cpu,
            DeviceFilter::Gpu => device_type == DeviceType::Gpu,
            DeviceFilter::Accelerator => device_type == DeviceType::Accelerator,
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::All => write!(f, "any"),
            DeviceFilter::Cpu => write!(f, "CPU"),
            DeviceFilter::Gpu => write!(f, "GPU"),
            DeviceFilter::Accelerator => write!(f, "accelerator"),
        }
    }
}

impl FromStr for DeviceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "any" => Ok(DeviceFilter::All),
            "cpu" => Ok(DeviceFilter::Cpu),
            "gpu" => Ok(DeviceFilter::Gpu),
            "accelerator" | "accel" => Ok(DeviceFilter::Accelerator),
            other => Err(format!("unknown device type '{other}'")),
        }
    }
}

/// A compute platform (vendor runtime). Owned by the runtime, never released
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Position in the runtime's platform list.
    pub id: usize,
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// A compute device belonging to exactly one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Position in the platform's unfiltered device list.
    pub id: usize,
    pub platform: usize,
    pub name: String,
    pub device_type: DeviceType,
    pub max_work_group_size: usize,
}
