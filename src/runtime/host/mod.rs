//! In-process reference runtime.
//!
//! Compiles the supported OpenCL C subset with [`parser`] and runs kernels on
//! the calling thread with [`interp`]. Commands are recorded by the queue and
//! executed in submission order when the queue synchronizes.

pub mod interp;
pub mod parser;

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};

use crate::buffer::AccessMode;
use crate::element::ScalarValue;
use crate::error::{
    CL_BUILD_PROGRAM_FAILURE, CL_DEVICE_NOT_AVAILABLE, CL_OUT_OF_RESOURCES, DispatchError, Result,
};
use crate::program::BuildStatus;
use crate::queue::WorkGrid;
use crate::resource::{Device, DeviceFilter, DeviceType, Platform};
use crate::source::{KernelSignature, macros_from_options};

use super::{
    BuildOutput, LaunchArg, Runtime, RuntimeBuffer, RuntimeContext, RuntimeHandle, RuntimeKernel,
    RuntimeProgram, RuntimeQueue,
};
use interp::Bindings;
use parser::{KernelDef, parse_program};

pub const DEFAULT_PLATFORM_NAME: &str = "hostcl Reference Platform";
pub const DEFAULT_DEVICE_NAME: &str = "Host Interpreter (CPU)";
pub const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 1024;

/// A device exposed by the host runtime.
#[derive(Debug, Clone)]
pub struct HostDevice {
    pub name: String,
    pub device_type: DeviceType,
    pub max_work_group_size: usize,
    /// Unavailable devices are listed but refuse contexts.
    pub available: bool,
    /// Exclusive devices accept one live context at a time.
    pub exclusive: bool,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        HostDevice {
            name: name.into(),
            device_type,
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
            available: true,
            exclusive: false,
        }
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::Cpu)
    }

    pub fn gpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::Gpu)
    }

    pub fn accelerator(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::Accelerator)
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostPlatform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(name: impl Into<String>) -> Self {
        HostPlatform {
            name: name.into(),
            vendor: "hostcl".to_string(),
            version: "OpenCL 1.2 hostcl".to_string(),
            devices: Vec::new(),
        }
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn device(mut self, device: HostDevice) -> Self {
        self.devices.push(device);
        self
    }
}

type Claims = Arc<Mutex<HashSet<(usize, usize)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The in-process runtime.
#[derive(Debug, Clone)]
pub struct HostRuntime {
    platforms: Vec<HostPlatform>,
    claims: Claims,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime {
    /// One platform with one CPU device.
    pub fn new() -> Self {
        Self::empty().with_platform(
            HostPlatform::new(DEFAULT_PLATFORM_NAME).device(HostDevice::cpu(DEFAULT_DEVICE_NAME)),
        )
    }

    /// A runtime with no platforms installed.
    pub fn empty() -> Self {
        HostRuntime {
            platforms: Vec::new(),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platforms.push(platform);
        self
    }

    pub fn into_handle(self) -> RuntimeHandle {
        Arc::new(self)
    }

    fn host_device(&self, device: &Device) -> Option<&HostDevice> {
        self.platforms
            .get(device.platform)
            .and_then(|p| p.devices.get(device.id))
            .filter(|d| d.name == device.name)
    }
}

impl Runtime for HostRuntime {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> Result<Vec<Platform>> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(id, p)| Platform {
                id,
                name: p.name.clone(),
                vendor: p.vendor.clone(),
                version: p.version.clone(),
            })
            .collect())
    }

    fn devices(&self, platform: &Platform, filter: DeviceFilter) -> Result<Vec<Device>> {
        let Some(host) = self.platforms.get(platform.id) else {
            return Err(DispatchError::Runtime(format!(
                "unknown platform '{}'",
                platform.name
            )));
        };
        Ok(host
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| filter.matches(d.device_type))
            .map(|(id, d)| Device {
                id,
                platform: platform.id,
                name: d.name.clone(),
                device_type: d.device_type,
                max_work_group_size: d.max_work_group_size,
            })
            .collect())
    }

    fn create_context(&self, device: &Device) -> Result<Box<dyn RuntimeContext>> {
        let Some(host) = self.host_device(device) else {
            return Err(DispatchError::ContextCreation {
                device: device.name.clone(),
                code: CL_DEVICE_NOT_AVAILABLE,
                reason: "device does not belong to this runtime".to_string(),
            });
        };
        if !host.available {
            return Err(DispatchError::ContextCreation {
                device: device.name.clone(),
                code: CL_DEVICE_NOT_AVAILABLE,
                reason: "device is not available".to_string(),
            });
        }

        let claim = if host.exclusive {
            let key = (device.platform, device.id);
            if !lock(&self.claims).insert(key) {
                return Err(DispatchError::ContextCreation {
                    device: device.name.clone(),
                    code: CL_DEVICE_NOT_AVAILABLE,
                    reason: "device is held exclusively by another context".to_string(),
                });
            }
            Some(Claim {
                key,
                claims: Arc::clone(&self.claims),
            })
        } else {
            None
        };

        debug!("host context created on '{}'", device.name);
        Ok(Box::new(HostContext {
            max_work_group_size: host.max_work_group_size,
            _claim: claim,
        }))
    }
}

struct Claim {
    key: (usize, usize),
    claims: Claims,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.claims).remove(&self.key);
    }
}

struct HostContext {
    max_work_group_size: usize,
    _claim: Option<Claim>,
}

impl RuntimeContext for HostContext {
    fn build_program(&self, source: &str, options: &str) -> BuildOutput {
        let failed = |log: String| BuildOutput {
            status: BuildStatus::Failed {
                code: CL_BUILD_PROGRAM_FAILURE,
            },
            log,
            program: None,
        };

        let (macros, ignored) = match macros_from_options(options) {
            Ok(parsed) => parsed,
            Err(e) => return failed(e.to_string()),
        };

        let mut log = String::new();
        for option in &ignored {
            warn!("host compiler ignores option '{option}'");
            log.push_str(&format!("warning: ignoring unsupported option '{option}'\n"));
        }

        match parse_program(source, &macros) {
            Ok(kernels) => {
                trace!(
                    "host build produced kernels {:?}",
                    kernels.iter().map(|k| &k.name).collect::<Vec<_>>()
                );
                BuildOutput {
                    status: BuildStatus::Success,
                    log,
                    program: Some(Box::new(HostProgram {
                        kernels: kernels.into_iter().map(Arc::new).collect(),
                    })),
                }
            }
            Err(e) => {
                log.push_str(&e.to_string());
                failed(log)
            }
        }
    }

    fn create_buffer(
        &self,
        size: usize,
        mode: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<Box<dyn RuntimeBuffer>> {
        let mut bytes = vec![0u8; size];
        if let Some(init) = init {
            let src = init.get(..size).ok_or(DispatchError::SizeMismatch {
                expected: size,
                actual: init.len(),
            })?;
            bytes.copy_from_slice(src);
        }
        Ok(Box::new(HostBuffer {
            size,
            memory: Arc::new(Mutex::new(HostMemory {
                bytes,
                // Write-only memory has no defined contents until a kernel
                // stores to it.
                defined: init.is_some() || mode != AccessMode::WriteOnly,
            })),
        }))
    }

    fn create_queue(&self) -> Result<Box<dyn RuntimeQueue>> {
        Ok(Box::new(HostQueue {
            max_work_group_size: self.max_work_group_size,
            pending: RefCell::new(VecDeque::new()),
        }))
    }
}

struct HostProgram {
    kernels: Vec<Arc<KernelDef>>,
}

impl HostProgram {
    fn find(&self, name: &str) -> Option<&Arc<KernelDef>> {
        self.kernels.iter().find(|k| k.name == name)
    }
}

impl RuntimeProgram for HostProgram {
    fn kernel_names(&self) -> Vec<String> {
        self.kernels.iter().map(|k| k.name.clone()).collect()
    }

    fn signature(&self, name: &str) -> Option<KernelSignature> {
        self.find(name).map(|k| KernelSignature {
            name: k.name.clone(),
            params: k.params.clone(),
        })
    }

    fn create_kernel(&self, name: &str) -> Result<Box<dyn RuntimeKernel>> {
        let def = self
            .find(name)
            .ok_or_else(|| DispatchError::EntryPointNotFound {
                name: name.to_string(),
                available: self.kernel_names(),
            })?;
        Ok(Box::new(HostKernel {
            def: Arc::clone(def),
        }))
    }
}

struct HostKernel {
    def: Arc<KernelDef>,
}

impl RuntimeKernel for HostKernel {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn num_args(&self) -> usize {
        self.def.params.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct HostMemory {
    bytes: Vec<u8>,
    defined: bool,
}

struct HostBuffer {
    size: usize,
    memory: Arc<Mutex<HostMemory>>,
}

impl RuntimeBuffer for HostBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum HostArg {
    Buffer(Arc<Mutex<HostMemory>>),
    Scalar(ScalarValue),
}

struct Launch {
    kernel: Arc<KernelDef>,
    args: Vec<HostArg>,
    global: usize,
    local: usize,
}

impl Launch {
    fn run(&self) -> Result<()> {
        // Lock each distinct memory once; aliased parameters share a view.
        let mut memories: Vec<&Arc<Mutex<HostMemory>>> = Vec::new();
        let mut param_view = Vec::with_capacity(self.args.len());
        let mut scalars = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            match arg {
                HostArg::Buffer(memory) => {
                    let view = match memories.iter().position(|m| Arc::ptr_eq(m, memory)) {
                        Some(view) => view,
                        None => {
                            memories.push(memory);
                            memories.len() - 1
                        }
                    };
                    param_view.push(Some(view));
                    scalars.push(None);
                }
                HostArg::Scalar(value) => {
                    param_view.push(None);
                    scalars.push(Some(*value));
                }
            }
        }

        let mut guards: Vec<MutexGuard<'_, HostMemory>> =
            memories.iter().map(|m| lock(m)).collect();
        let result = {
            let mut bindings = Bindings {
                views: guards.iter_mut().map(|g| g.bytes.as_mut_slice()).collect(),
                param_view: param_view.clone(),
                scalars,
            };
            interp::execute(&self.kernel, &mut bindings, self.global, self.local)
        };

        // Stores may have happened before a fault; either way the written
        // buffers now hold device-produced contents.
        for (param, view) in param_view.iter().enumerate() {
            if let Some(view) = view {
                if self.kernel.params[param].is_written() {
                    guards[*view].defined = true;
                }
            }
        }

        result.map_err(|fault| DispatchError::DeviceExecution {
            code: CL_OUT_OF_RESOURCES,
            reason: format!("kernel '{}': {fault}", self.kernel.name),
        })
    }
}

struct HostQueue {
    max_work_group_size: usize,
    pending: RefCell<VecDeque<Launch>>,
}

impl HostQueue {
    /// Largest divisor of `global` the device accepts as a work-group size.
    fn pick_local(&self, global: usize) -> usize {
        (1..=self.max_work_group_size.min(global))
            .rev()
            .find(|l| global % l == 0)
            .unwrap_or(1)
    }
}

impl RuntimeQueue for HostQueue {
    fn enqueue_kernel(
        &self,
        kernel: &dyn RuntimeKernel,
        args: &[LaunchArg<'_>],
        grid: WorkGrid,
    ) -> Result<()> {
        let Some(kernel) = kernel.as_any().downcast_ref::<HostKernel>() else {
            return Err(DispatchError::Runtime(
                "kernel was not created by the host runtime".to_string(),
            ));
        };

        let mut host_args = Vec::with_capacity(args.len());
        for arg in args {
            host_args.push(match arg {
                LaunchArg::Buffer(buffer) => {
                    let Some(buffer) = buffer.as_any().downcast_ref::<HostBuffer>() else {
                        return Err(DispatchError::Runtime(
                            "buffer was not created by the host runtime".to_string(),
                        ));
                    };
                    HostArg::Buffer(Arc::clone(&buffer.memory))
                }
                LaunchArg::Scalar(value) => HostArg::Scalar(*value),
            });
        }

        let local = grid.local.unwrap_or_else(|| self.pick_local(grid.global));
        debug!(
            "enqueue '{}' global={} local={local}",
            kernel.def.name, grid.global
        );
        self.pending.borrow_mut().push_back(Launch {
            kernel: Arc::clone(&kernel.def),
            args: host_args,
            global: grid.global,
            local,
        });
        Ok(())
    }

    fn enqueue_read(&self, buffer: &dyn RuntimeBuffer, dst: &mut [u8]) -> Result<()> {
        self.finish()?;
        let Some(buffer) = buffer.as_any().downcast_ref::<HostBuffer>() else {
            return Err(DispatchError::Runtime(
                "buffer was not created by the host runtime".to_string(),
            ));
        };
        let memory = lock(&buffer.memory);
        if !memory.defined {
            return Err(DispatchError::UndefinedRead);
        }
        if dst.len() > memory.bytes.len() {
            return Err(DispatchError::SizeMismatch {
                expected: memory.bytes.len(),
                actual: dst.len(),
            });
        }
        dst.copy_from_slice(&memory.bytes[..dst.len()]);
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        loop {
            let Some(launch) = self.pending.borrow_mut().pop_front() else {
                return Ok(());
            };
            if let Err(e) = launch.run() {
                let dropped = self.pending.borrow().len();
                if dropped > 0 {
                    warn!("dropping {dropped} queued command(s) after device fault");
                }
                self.pending.borrow_mut().clear();
                return Err(e);
            }
        }
    }
}
