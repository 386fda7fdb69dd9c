//! Platform and device discovery.

use log::{debug, info};

use crate::error::{DispatchError, Result};
use crate::resource::{Device, DeviceFilter, Platform};
use crate::runtime::RuntimeHandle;

/// Read-only queries against a runtime's platform and device lists.
#[derive(Clone)]
pub struct ResourceEnumerator {
    runtime: RuntimeHandle,
}

impl ResourceEnumerator {
    pub fn new(runtime: RuntimeHandle) -> Self {
        ResourceEnumerator { runtime }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Every installed platform. Fails with [`DispatchError::NoPlatform`]
    /// when there are none.
    pub fn list_platforms(&self) -> Result<Vec<Platform>> {
        let platforms = self.runtime.platforms()?;
        if platforms.is_empty() {
            return Err(DispatchError::NoPlatform);
        }
        info!("{} platform(s) on the {} runtime", platforms.len(), self.runtime.name());
        for p in &platforms {
            debug!("platform {}: {} ({}, {})", p.id, p.name, p.vendor, p.version);
        }
        Ok(platforms)
    }

    /// Devices of `platform` matching `filter`. Fails with
    /// [`DispatchError::NoDevice`] when none match.
    pub fn list_devices(&self, platform: &Platform, filter: DeviceFilter) -> Result<Vec<Device>> {
        let devices = self.runtime.devices(platform, filter)?;
        if devices.is_empty() {
            return Err(DispatchError::NoDevice {
                platform: platform.name.clone(),
                filter,
            });
        }
        info!("{} {filter} device(s) on '{}'", devices.len(), platform.name);
        for d in &devices {
            debug!(
                "device {}: {} ({}, max work-group {})",
                d.id, d.name, d.device_type, d.max_work_group_size
            );
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CL_DEVICE_NOT_FOUND, CL_PLATFORM_NOT_FOUND_KHR};
    use crate::resource::DeviceType;
    use crate::runtime::host::{HostDevice, HostPlatform, HostRuntime};
    use rstest::rstest;

    fn lab() -> ResourceEnumerator {
        ResourceEnumerator::new(
            HostRuntime::empty()
                .with_platform(
                    HostPlatform::new("Vendor A")
                        .device(HostDevice::cpu("A cpu"))
                        .device(HostDevice::gpu("A gpu 0"))
                        .device(HostDevice::gpu("A gpu 1")),
                )
                .with_platform(HostPlatform::new("Vendor B").vendor("B Corp"))
                .into_handle(),
        )
    }

    #[test]
    fn test_no_platform() {
        let enumerator = ResourceEnumerator::new(HostRuntime::empty().into_handle());
        let err = enumerator.list_platforms().unwrap_err();
        assert!(matches!(err, DispatchError::NoPlatform));
        assert_eq!(err.code(), CL_PLATFORM_NOT_FOUND_KHR);
    }

    #[test]
    fn test_platform_order_is_stable() {
        let enumerator = lab();
        let first = enumerator.list_platforms().unwrap();
        let second = enumerator.list_platforms().unwrap();
        assert_eq!(first, second);
        assert_eq!(first[1].vendor, "B Corp");
    }

    #[rstest]
    #[case(DeviceFilter::All, 3)]
    #[case(DeviceFilter::Gpu, 2)]
    #[case(DeviceFilter::Cpu, 1)]
    fn test_device_filter(#[case] filter: DeviceFilter, #[case] count: usize) {
        let enumerator = lab();
        let platform = enumerator.list_platforms().unwrap().remove(0);
        let devices = enumerator.list_devices(&platform, filter).unwrap();
        assert_eq!(devices.len(), count);
        assert!(devices.iter().all(|d| filter.matches(d.device_type)));
    }

    #[test]
    fn test_filtered_devices_keep_platform_ids() {
        let enumerator = lab();
        let platform = enumerator.list_platforms().unwrap().remove(0);
        let gpus = enumerator.list_devices(&platform, DeviceFilter::Gpu).unwrap();
        assert_eq!(gpus[0].id, 1);
        assert_eq!(gpus[1].device_type, DeviceType::Gpu);
    }

    #[test]
    fn test_no_device() {
        let enumerator = lab();
        let platforms = enumerator.list_platforms().unwrap();
        let err = enumerator
            .list_devices(&platforms[1], DeviceFilter::All)
            .unwrap_err();
        assert_eq!(err.code(), CL_DEVICE_NOT_FOUND);
        let err = enumerator
            .list_devices(&platforms[0], DeviceFilter::Accelerator)
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoDevice { .. }));
    }
}
