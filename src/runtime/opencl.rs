//! OpenCL runtime backed by the system ICD loader through `ocl`.

use std::any::Any;

use log::{debug, warn};
use ocl::core::{self as cl, KernelInfo, KernelInfoResult};
use ocl::enums::{DeviceInfo, DeviceInfoResult, ProgramInfo, ProgramInfoResult};
use ocl::flags::{self, MemFlags};
use ocl::{
    Buffer as OclBuffer, Context as OclContext, Device as OclDevice, Kernel as OclKernel,
    Platform as OclPlatform, Program as OclProgram, Queue as OclQueue,
};

use crate::buffer::AccessMode;
use crate::element::ScalarValue;
use crate::error::{
    CL_BUILD_PROGRAM_FAILURE, CL_DEVICE_NOT_AVAILABLE, CL_INVALID_KERNEL_NAME,
    CL_OUT_OF_RESOURCES, DispatchError, Result,
};
use crate::program::BuildStatus;
use crate::queue::WorkGrid;
use crate::resource::{Device, DeviceFilter, DeviceType, Platform};
use crate::source::{KernelSignature, scan_kernels};

use super::{
    BuildOutput, LaunchArg, Runtime, RuntimeBuffer, RuntimeContext, RuntimeHandle, RuntimeKernel,
    RuntimeProgram, RuntimeQueue,
};

/// Raw status of an `ocl` error, or `fallback` when it carries none.
fn status_code(e: &ocl::Error, fallback: i32) -> i32 {
    e.api_status().map(|s| s as i32).unwrap_or(fallback)
}

fn runtime_error(what: &str, e: ocl::Error) -> DispatchError {
    DispatchError::Runtime(format!("{what}: {e}"))
}

/// Runtime over the installed OpenCL platforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenClRuntime;

impl OpenClRuntime {
    pub fn new() -> Self {
        OpenClRuntime
    }

    /// Whether any OpenCL platform is installed.
    pub fn is_available() -> bool {
        !OclPlatform::list().is_empty()
    }

    pub fn into_handle(self) -> RuntimeHandle {
        std::sync::Arc::new(self)
    }

    fn ocl_platform(&self, id: usize) -> Result<OclPlatform> {
        OclPlatform::list()
            .get(id)
            .copied()
            .ok_or_else(|| DispatchError::Runtime(format!("platform {id} disappeared")))
    }

    fn ocl_device(&self, device: &Device) -> Result<(OclPlatform, OclDevice)> {
        let platform = self.ocl_platform(device.platform)?;
        let devices = OclDevice::list_all(platform).map_err(|e| runtime_error("device query", e))?;
        let found = devices
            .get(device.id)
            .copied()
            .ok_or_else(|| DispatchError::ContextCreation {
                device: device.name.clone(),
                code: CL_DEVICE_NOT_AVAILABLE,
                reason: "device disappeared".to_string(),
            })?;
        Ok((platform, found))
    }
}

fn device_type(device: &OclDevice) -> DeviceType {
    match device.info(DeviceInfo::Type) {
        Ok(DeviceInfoResult::Type(ty)) if ty.contains(flags::DeviceType::GPU) => DeviceType::Gpu,
        Ok(DeviceInfoResult::Type(ty)) if ty.contains(flags::DeviceType::CPU) => DeviceType::Cpu,
        Ok(DeviceInfoResult::Type(ty)) if ty.contains(flags::DeviceType::ACCELERATOR) => {
            DeviceType::Accelerator
        }
        _ => DeviceType::Custom,
    }
}

impl Runtime for OpenClRuntime {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<Platform>> {
        Ok(OclPlatform::list()
            .into_iter()
            .enumerate()
            .map(|(id, p)| Platform {
                id,
                name: p.name().unwrap_or_else(|_| "Unknown".to_string()),
                vendor: p.vendor().unwrap_or_else(|_| "Unknown".to_string()),
                version: p.version().unwrap_or_else(|_| "Unknown".to_string()),
            })
            .collect())
    }

    fn devices(&self, platform: &Platform, filter: DeviceFilter) -> Result<Vec<Device>> {
        let ocl_platform = self.ocl_platform(platform.id)?;
        // A platform without devices reports DEVICE_NOT_FOUND; that is an
        // empty list here.
        let devices = OclDevice::list_all(ocl_platform).unwrap_or_default();
        Ok(devices
            .iter()
            .enumerate()
            .map(|(id, d)| Device {
                id,
                platform: platform.id,
                name: d.name().unwrap_or_else(|_| "Unknown".to_string()),
                device_type: device_type(d),
                max_work_group_size: d.max_wg_size().unwrap_or(1),
            })
            .filter(|d| filter.matches(d.device_type))
            .collect())
    }

    fn create_context(&self, device: &Device) -> Result<Box<dyn RuntimeContext>> {
        let (platform, ocl_device) = self.ocl_device(device)?;
        let context = OclContext::builder()
            .platform(platform)
            .devices(ocl_device)
            .build()
            .map_err(|e| DispatchError::ContextCreation {
                device: device.name.clone(),
                code: status_code(&e, CL_DEVICE_NOT_AVAILABLE),
                reason: e.to_string(),
            })?;
        debug!("opencl context created on '{}'", device.name);
        Ok(Box::new(ClContext {
            device: ocl_device,
            context,
        }))
    }
}

struct ClContext {
    device: OclDevice,
    context: OclContext,
}

impl RuntimeContext for ClContext {
    fn build_program(&self, source: &str, options: &str) -> BuildOutput {
        let built = OclProgram::builder()
            .src(source)
            .devices(self.device)
            .cmplr_opt(options)
            .build(&self.context);

        let program = match built {
            Ok(program) => program,
            Err(e) => {
                return BuildOutput {
                    status: BuildStatus::Failed {
                        code: status_code(&e, CL_BUILD_PROGRAM_FAILURE),
                    },
                    log: e.to_string(),
                    program: None,
                };
            }
        };

        let signatures = scan_kernels(source, options).unwrap_or_else(|e| {
            warn!("kernel signatures unavailable, argument checks are reduced: {e}");
            Vec::new()
        });
        let names = match program.info(ProgramInfo::KernelNames) {
            Ok(ProgramInfoResult::KernelNames(names)) => names
                .split(';')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            _ => signatures.iter().map(|s| s.name.clone()).collect(),
        };

        BuildOutput {
            status: BuildStatus::Success,
            log: String::new(),
            program: Some(Box::new(ClProgram {
                program,
                signatures,
                names,
            })),
        }
    }

    fn create_buffer(
        &self,
        size: usize,
        mode: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<Box<dyn RuntimeBuffer>> {
        let flags = match mode {
            AccessMode::ReadOnly => MemFlags::new().read_only(),
            AccessMode::WriteOnly => MemFlags::new().write_only(),
            AccessMode::ReadWrite => MemFlags::new().read_write(),
        };
        let mut builder = OclBuffer::<u8>::builder()
            .context(&self.context)
            .flags(flags)
            .len(size);
        if let Some(init) = init {
            let src = init.get(..size).ok_or(DispatchError::SizeMismatch {
                expected: size,
                actual: init.len(),
            })?;
            builder = builder.copy_host_slice(src);
        }
        let buffer = builder.build().map_err(|e| DispatchError::DeviceExecution {
            code: status_code(&e, CL_OUT_OF_RESOURCES),
            reason: format!("buffer allocation failed: {e}"),
        })?;
        Ok(Box::new(ClBuffer { buffer, size }))
    }

    fn create_queue(&self) -> Result<Box<dyn RuntimeQueue>> {
        let queue = OclQueue::new(&self.context, self.device, None)
            .map_err(|e| runtime_error("queue creation", e))?;
        Ok(Box::new(ClQueue { queue }))
    }
}

struct ClProgram {
    program: OclProgram,
    signatures: Vec<KernelSignature>,
    names: Vec<String>,
}

impl RuntimeProgram for ClProgram {
    fn kernel_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn signature(&self, name: &str) -> Option<KernelSignature> {
        self.signatures.iter().find(|s| s.name == name).cloned()
    }

    fn create_kernel(&self, name: &str) -> Result<Box<dyn RuntimeKernel>> {
        let raw = cl::create_kernel(self.program.as_core(), name).map_err(|e| {
            let e = ocl::Error::from(e);
            match status_code(&e, CL_INVALID_KERNEL_NAME) {
                CL_INVALID_KERNEL_NAME => DispatchError::EntryPointNotFound {
                    name: name.to_string(),
                    available: self.names.clone(),
                },
                _ => runtime_error("kernel creation", e),
            }
        })?;
        let num_args = match cl::get_kernel_info(&raw, KernelInfo::NumArgs) {
            Ok(KernelInfoResult::NumArgs(n)) => n as usize,
            _ => self.signature(name).map(|s| s.arity()).unwrap_or(0),
        };
        Ok(Box::new(ClKernel {
            program: self.program.clone(),
            name: name.to_string(),
            num_args,
        }))
    }
}

/// The `ocl` kernel object is built at launch, once every argument is known.
struct ClKernel {
    program: OclProgram,
    name: String,
    num_args: usize,
}

impl RuntimeKernel for ClKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_args(&self) -> usize {
        self.num_args
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ClBuffer {
    buffer: OclBuffer<u8>,
    size: usize,
}

impl RuntimeBuffer for ClBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ClQueue {
    queue: OclQueue,
}

impl RuntimeQueue for ClQueue {
    fn enqueue_kernel(
        &self,
        kernel: &dyn RuntimeKernel,
        args: &[LaunchArg<'_>],
        grid: WorkGrid,
    ) -> Result<()> {
        let Some(kernel) = kernel.as_any().downcast_ref::<ClKernel>() else {
            return Err(DispatchError::Runtime(
                "kernel was not created by the opencl runtime".to_string(),
            ));
        };

        let mut builder = OclKernel::builder();
        builder
            .program(&kernel.program)
            .name(&kernel.name)
            .queue(self.queue.clone())
            .global_work_size(grid.global);
        if let Some(local) = grid.local {
            builder.local_work_size(local);
        }

        for arg in args {
            match arg {
                LaunchArg::Buffer(buffer) => {
                    let Some(buffer) = buffer.as_any().downcast_ref::<ClBuffer>() else {
                        return Err(DispatchError::Runtime(
                            "buffer was not created by the opencl runtime".to_string(),
                        ));
                    };
                    builder.arg(&buffer.buffer);
                }
                LaunchArg::Scalar(ScalarValue::Float(v)) => {
                    builder.arg(*v);
                }
                LaunchArg::Scalar(ScalarValue::Int(v)) => {
                    builder.arg(*v);
                }
                LaunchArg::Scalar(ScalarValue::UInt(v)) => {
                    builder.arg(*v);
                }
            }
        }

        let ocl_kernel = builder.build().map_err(|e| DispatchError::DeviceExecution {
            code: status_code(&e, CL_OUT_OF_RESOURCES),
            reason: format!("kernel setup failed: {e}"),
        })?;
        unsafe {
            ocl_kernel.enq().map_err(|e| DispatchError::DeviceExecution {
                code: status_code(&e, CL_OUT_OF_RESOURCES),
                reason: format!("launch of '{}' failed: {e}", kernel.name),
            })?;
        }
        Ok(())
    }

    fn enqueue_read(&self, buffer: &dyn RuntimeBuffer, dst: &mut [u8]) -> Result<()> {
        let Some(buffer) = buffer.as_any().downcast_ref::<ClBuffer>() else {
            return Err(DispatchError::Runtime(
                "buffer was not created by the opencl runtime".to_string(),
            ));
        };
        buffer
            .buffer
            .read(dst)
            .queue(&self.queue)
            .enq()
            .map_err(|e| DispatchError::DeviceExecution {
                code: status_code(&e, CL_OUT_OF_RESOURCES),
                reason: format!("readback failed: {e}"),
            })
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(|e| DispatchError::DeviceExecution {
            code: status_code(&e, CL_OUT_OF_RESOURCES),
            reason: e.to_string(),
        })
    }
}

// Safety: OpenCL objects are reference counted by the driver and safe to use
// from any thread.
unsafe impl Send for ClContext {}
unsafe impl Send for ClProgram {}
unsafe impl Send for ClKernel {}
unsafe impl Send for ClBuffer {}
unsafe impl Send for ClQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opencl_is_available() {
        let available = OpenClRuntime::is_available();
        println!("OpenCL available: {}", available);
    }

    #[test]
    fn test_platforms_match_ocl_listing() {
        if !OpenClRuntime::is_available() {
            println!("OpenCL not available, skipping test");
            return;
        }
        let runtime = OpenClRuntime::new();
        let platforms = runtime.platforms().unwrap();
        assert_eq!(platforms.len(), OclPlatform::list().len());
        for (index, platform) in platforms.iter().enumerate() {
            assert_eq!(platform.id, index);
        }
    }

    #[test]
    fn test_build_failure_reports_status() {
        if !OpenClRuntime::is_available() {
            println!("OpenCL not available, skipping test");
            return;
        }
        let runtime = OpenClRuntime::new();
        let platform = runtime.platforms().unwrap().remove(0);
        let Some(device) = runtime.devices(&platform, DeviceFilter::All).unwrap().pop() else {
            println!("No OpenCL devices, skipping test");
            return;
        };
        let context = runtime.create_context(&device).unwrap();
        let out = context.build_program("__kernel void f( { }", "");
        assert!(out.program.is_none());
        assert!(matches!(out.status, BuildStatus::Failed { .. }));
    }
}
