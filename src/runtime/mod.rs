//! Compute runtime abstraction.
//!
//! A [`Runtime`] stands for the system-wide compute registry (an OpenCL ICD
//! loader, or the in-process host runtime). It is acquired once and passed
//! explicitly as a [`RuntimeHandle`]; nothing here is a global.
//!
//! The object-safe traits below are the raw handle layer. The RAII wrappers in
//! [`crate::context`], [`crate::buffer`], [`crate::kernel`] and
//! [`crate::queue`] sit on top and enforce ownership by the context.

pub mod host;

#[cfg(feature = "opencl")]
pub mod opencl;

use std::any::Any;
use std::sync::Arc;

use crate::buffer::AccessMode;
use crate::element::ScalarValue;
use crate::error::Result;
use crate::program::BuildStatus;
use crate::queue::WorkGrid;
use crate::resource::{Device, DeviceFilter, Platform};
use crate::source::KernelSignature;

pub use host::HostRuntime;

#[cfg(feature = "opencl")]
pub use opencl::OpenClRuntime;

/// Shared handle to a runtime, acquired at process start.
pub type RuntimeHandle = Arc<dyn Runtime>;

/// Entry point into a compute runtime.
pub trait Runtime: Send + Sync {
    /// Short name used in logs ("host", "opencl").
    fn name(&self) -> &str;

    fn platforms(&self) -> Result<Vec<Platform>>;

    /// Devices of `platform` matching `filter`. An empty list is not an error
    /// at this layer.
    fn devices(&self, platform: &Platform, filter: DeviceFilter) -> Result<Vec<Device>>;

    fn create_context(&self, device: &Device) -> Result<Box<dyn RuntimeContext>>;
}

/// Result of a program build. A failed build still yields a log.
pub struct BuildOutput {
    pub status: BuildStatus,
    pub log: String,
    pub program: Option<Box<dyn RuntimeProgram>>,
}

/// A runtime context bound to one device.
pub trait RuntimeContext: Send {
    fn build_program(&self, source: &str, options: &str) -> BuildOutput;

    /// Allocates `size` bytes; `init`, when given, holds at least `size` bytes
    /// and is copied before this returns.
    fn create_buffer(
        &self,
        size: usize,
        mode: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<Box<dyn RuntimeBuffer>>;

    fn create_queue(&self) -> Result<Box<dyn RuntimeQueue>>;
}

/// A successfully built program.
pub trait RuntimeProgram: Send {
    fn kernel_names(&self) -> Vec<String>;

    /// Declared parameters of `name`, when the runtime can describe them.
    fn signature(&self, name: &str) -> Option<KernelSignature>;

    fn create_kernel(&self, name: &str) -> Result<Box<dyn RuntimeKernel>>;
}

pub trait RuntimeKernel: Send {
    fn name(&self) -> &str;

    fn num_args(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

pub trait RuntimeBuffer: Send {
    fn size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

/// One bound kernel argument as handed to a queue.
#[derive(Clone, Copy)]
pub enum LaunchArg<'a> {
    Buffer(&'a dyn RuntimeBuffer),
    Scalar(ScalarValue),
}

/// An in-order command queue.
pub trait RuntimeQueue: Send {
    /// Submits a launch. Execution faults may be reported here or by the next
    /// synchronizing call.
    fn enqueue_kernel(
        &self,
        kernel: &dyn RuntimeKernel,
        args: &[LaunchArg<'_>],
        grid: WorkGrid,
    ) -> Result<()>;

    /// Blocking read: waits for all prior commands, then copies
    /// `dst.len()` bytes from the start of `buffer`.
    fn enqueue_read(&self, buffer: &dyn RuntimeBuffer, dst: &mut [u8]) -> Result<()>;

    /// Waits until every submitted command completed.
    fn finish(&self) -> Result<()>;
}
