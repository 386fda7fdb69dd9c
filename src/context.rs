//! Execution context bound to one device.

use log::{debug, info};

use crate::buffer::{AccessMode, Buffer};
use crate::error::Result;
use crate::program::Program;
use crate::queue::CommandQueue;
use crate::resource::Device;
use crate::runtime::{RuntimeContext, RuntimeHandle};

/// A logical execution environment on a single device.
///
/// Every program, buffer, kernel and queue created through a context borrows
/// it, so none of them can outlive it. Dropping the context releases the
/// runtime context (and, on the host runtime, any exclusive device claim).
///
/// # Example
///
/// ```
/// use hostcl::{AccessMode, Context, HostRuntime, ResourceEnumerator, DeviceFilter};
///
/// let runtime = HostRuntime::new().into_handle();
/// let enumerator = ResourceEnumerator::new(runtime.clone());
/// let platform = enumerator.list_platforms().unwrap().remove(0);
/// let device = enumerator.list_devices(&platform, DeviceFilter::All).unwrap().remove(0);
///
/// let context = Context::new(&runtime, &device).unwrap();
/// let buffer = context.allocate(16, AccessMode::ReadWrite, None).unwrap();
/// assert_eq!(buffer.size(), 16);
/// ```
pub struct Context {
    device: Device,
    runtime: String,
    inner: Box<dyn RuntimeContext>,
}

impl Context {
    pub fn new(runtime: &RuntimeHandle, device: &Device) -> Result<Self> {
        let inner = runtime.create_context(device)?;
        info!("context ready on '{}' ({})", device.name, runtime.name());
        Ok(Context {
            device: device.clone(),
            runtime: runtime.name().to_string(),
            inner,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Name of the runtime that created this context.
    pub fn runtime_name(&self) -> &str {
        &self.runtime
    }

    /// Builds `source`. A failed build is reported by the returned program's
    /// status and log.
    pub fn compile(&self, source: &str) -> Program<'_> {
        self.compile_with_options(source, "")
    }

    pub fn compile_with_options(&self, source: &str, options: &str) -> Program<'_> {
        Program::build(self, source, options)
    }

    pub fn allocate(&self, size: usize, mode: AccessMode, init: Option<&[u8]>) -> Result<Buffer<'_>> {
        Buffer::allocate(self, size, mode, init)
    }

    pub fn create_queue(&self) -> Result<CommandQueue<'_>> {
        CommandQueue::new(self)
    }

    pub(crate) fn raw(&self) -> &dyn RuntimeContext {
        self.inner.as_ref()
    }

    pub(crate) fn same_as(&self, other: &Context) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!("releasing context on '{}'", self.device.name);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.name)
            .field("runtime", &self.runtime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::resource::DeviceFilter;
    use crate::runtime::host::{HostDevice, HostPlatform, HostRuntime};

    fn exclusive_runtime() -> (RuntimeHandle, Device) {
        let runtime = HostRuntime::empty()
            .with_platform(HostPlatform::new("Lab").device(HostDevice::gpu("Shared GPU").exclusive()))
            .into_handle();
        let platform = runtime.platforms().unwrap().remove(0);
        let device = runtime.devices(&platform, DeviceFilter::Gpu).unwrap().remove(0);
        (runtime, device)
    }

    #[test]
    fn test_context_records_device() {
        let context = crate::test_support::host_context();
        assert_eq!(context.runtime_name(), "host");
        assert_eq!(context.device().name, crate::runtime::host::DEFAULT_DEVICE_NAME);
    }

    #[test]
    fn test_exclusive_device_refuses_second_context() {
        let (runtime, device) = exclusive_runtime();
        let first = Context::new(&runtime, &device).unwrap();
        let err = Context::new(&runtime, &device).unwrap_err();
        assert!(matches!(err, DispatchError::ContextCreation { .. }));
        assert_eq!(err.stage(), "context creation");

        drop(first);
        assert!(Context::new(&runtime, &device).is_ok());
    }
}
