//! hostcl: host-side orchestration of a single compute kernel.
//!
//! hostcl walks the classic OpenCL host sequence: enumerate platforms and
//! devices, pick one, create a context, compile kernel source, allocate
//! buffers, bind arguments, launch over a work grid and read the result back.
//!
//! # Architecture
//!
//! - **runtime**: the [`Runtime`] abstraction and its implementations. The
//!   in-process [`HostRuntime`] compiles a subset of OpenCL C and interprets
//!   it; `OpenClRuntime` (feature `opencl`) drives real drivers via `ocl`.
//! - **context / program / kernel / buffer / queue**: RAII handles. Every
//!   handle borrows its [`Context`], so none can outlive it.
//! - **pipeline**: [`PipelineDriver`], the whole sequence as a state machine.
//! - **source**: the OpenCL C grammar (pest) and signature scanning, shared by the
//!   runtimes for argument validation.
//!
//! # Feature Flags
//!
//! - `opencl`: enable the OpenCL runtime (needs an ICD loader)
//!
//! # Example
//!
//! ```
//! use hostcl::{FixedSelection, HostRuntime, PipelineConfig, PipelineDriver, demo_inputs};
//!
//! let mut driver = PipelineDriver::new(HostRuntime::new().into_handle(), PipelineConfig::default());
//! let (a, b) = demo_inputs();
//! let report = driver.run_vector_add(&mut FixedSelection::default(), &a, &b).unwrap();
//! assert!((report.results()[9] - 10.0).abs() < 1e-5);
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod element;
pub mod enumerator;
pub mod error;
pub mod kernel;
pub mod pipeline;
pub mod program;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod selection;
pub mod source;

pub use buffer::{AccessMode, Buffer};
pub use config::{
    DEFAULT_LOCAL_SIZE, DEMO_ELEMENTS, PipelineConfig, REFERENCE_ENTRY, REFERENCE_KERNEL,
    demo_inputs,
};
pub use context::Context;
pub use element::{Element, ScalarType, ScalarValue};
pub use enumerator::ResourceEnumerator;
pub use error::{DispatchError, Result};
pub use kernel::{Kernel, KernelArg};
pub use pipeline::{PipelineDriver, PipelineReport, PipelineState};
pub use program::{BuildStatus, Program};
pub use queue::{CommandQueue, CompletionBarrier, WorkGrid};
pub use resource::{Device, DeviceFilter, DeviceType, Platform};
pub use runtime::host::{HostDevice, HostPlatform};
pub use runtime::{HostRuntime, Runtime, RuntimeHandle};
pub use selection::{FixedSelection, SelectionError, Selector, ValidIndex, parse_index, validate_index};

#[cfg(feature = "opencl")]
pub use runtime::OpenClRuntime;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::context::Context;
    use crate::resource::DeviceFilter;
    use crate::runtime::HostRuntime;

    /// A context on the default host device.
    pub fn host_context() -> Context {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = HostRuntime::new().into_handle();
        let platform = runtime.platforms().unwrap().remove(0);
        let device = runtime.devices(&platform, DeviceFilter::All).unwrap().remove(0);
        Context::new(&runtime, &device).unwrap()
    }
}
