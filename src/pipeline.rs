//! The end-to-end dispatch pipeline as an explicit state machine.
//!
//! Enumerate, select, create a context, build, extract the entry point,
//! allocate, bind, launch, read back. Each step either advances the state or
//! records where the run failed; there is no retry and no way back.

use std::fmt;

use log::{error, info};

use crate::buffer::{AccessMode, Buffer};
use crate::config::PipelineConfig;
use crate::context::Context;
use crate::enumerator::ResourceEnumerator;
use crate::error::{DispatchError, Result};
use crate::kernel::Kernel;
use crate::queue::WorkGrid;
use crate::resource::{Device, Platform};
use crate::runtime::RuntimeHandle;
use crate::selection::{SelectionError, Selector};

/// Where a run is, or where it stopped.
///
/// `Launched` only covers submission: the launch is checked and queued but
/// not waited on. A kernel that faults while running (out-of-bounds access,
/// a device error) is reported by the blocking readback, so such a run fails
/// at `ReadBack` with [`DispatchError::DeviceExecution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    PlatformsListed,
    PlatformSelected,
    DevicesListed,
    DeviceSelected,
    ContextReady,
    ProgramBuilt,
    KernelBound,
    BuffersAllocated,
    ArgumentsBound,
    Launched,
    ReadBack,
    Done,
    /// Terminal; `at` is the state the run was trying to reach.
    Failed { at: Box<PipelineState> },
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Failed { at } => write!(f, "Failed at {at}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Outcome of a successful vector-add run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub platform: Platform,
    pub device: Device,
    pub build_log: String,
    /// `(a, b, result)` per element.
    pub rows: Vec<(f32, f32, f32)>,
    pub trace: Vec<PipelineState>,
}

impl PipelineReport {
    pub fn results(&self) -> Vec<f32> {
        self.rows.iter().map(|&(_, _, r)| r).collect()
    }
}

/// Drives one run of the pipeline and records its state trace.
pub struct PipelineDriver {
    runtime: RuntimeHandle,
    config: PipelineConfig,
    state: PipelineState,
    trace: Vec<PipelineState>,
}

impl PipelineDriver {
    pub fn new(runtime: RuntimeHandle, config: PipelineConfig) -> Self {
        PipelineDriver {
            runtime,
            config,
            state: PipelineState::Uninitialized,
            trace: vec![PipelineState::Uninitialized],
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Every state entered so far, starting with `Uninitialized`.
    pub fn trace(&self) -> &[PipelineState] {
        &self.trace
    }

    /// The state a failed run was attempting.
    pub fn failed_at(&self) -> Option<&PipelineState> {
        match &self.state {
            PipelineState::Failed { at } => Some(at),
            _ => None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn advance<T>(&mut self, next: PipelineState, result: Result<T>) -> Result<T> {
        let entered = match &result {
            Ok(_) => {
                info!("pipeline: {next:?}");
                next
            }
            Err(e) => {
                error!("pipeline failed at {next:?} [{}]: {e}", e.stage());
                PipelineState::Failed { at: Box::new(next) }
            }
        };
        self.state = entered.clone();
        self.trace.push(entered);
        result
    }

    /// Runs `config.entry` as `z = x + y` over `a` and `b`, with `x` and `y`
    /// read-only and `z` write-only, and reads `z` back.
    pub fn run_vector_add(
        &mut self,
        selector: &mut dyn Selector,
        a: &[f32],
        b: &[f32],
    ) -> Result<PipelineReport> {
        if self.state != PipelineState::Uninitialized {
            return Err(DispatchError::Runtime(format!(
                "pipeline already ran (state: {})",
                self.state
            )));
        }

        let enumerator = ResourceEnumerator::new(self.runtime.clone());
        let platforms = self.advance(PipelineState::PlatformsListed, enumerator.list_platforms())?;
        let platform = self.advance(
            PipelineState::PlatformSelected,
            choose(selector.select_platform(&platforms), &platforms),
        )?;
        info!("selected platform '{}'", platform.name);

        let devices = self.advance(
            PipelineState::DevicesListed,
            enumerator.list_devices(&platform, self.config.device_filter),
        )?;
        let device = self.advance(
            PipelineState::DeviceSelected,
            choose(selector.select_device(&devices), &devices),
        )?;
        info!("selected device '{}'", device.name);

        let context = self.advance(
            PipelineState::ContextReady,
            Context::new(&self.runtime, &device),
        )?;

        let program = context.compile_with_options(&self.config.source, &self.config.build_options);
        let build_log = program.build_log().to_string();
        self.advance(PipelineState::ProgramBuilt, program.check())?;

        let mut kernel = self.advance(
            PipelineState::KernelBound,
            program.extract_kernel(&self.config.entry),
        )?;

        let (x, y, z) = self.advance(
            PipelineState::BuffersAllocated,
            allocate_operands(&context, a, b),
        )?;

        self.advance(
            PipelineState::ArgumentsBound,
            bind_operands(&mut kernel, [&x, &y, &z]),
        )?;

        let grid = match self.config.local_size {
            Some(local) => WorkGrid::new(a.len(), local),
            None => WorkGrid::global_only(a.len()),
        };
        let launched = context.create_queue().and_then(|queue| {
            // The blocking readback below is the synchronization point, so
            // execution faults are recorded against `ReadBack`.
            queue.enqueue_launch(&kernel, grid).map(drop)?;
            Ok(queue)
        });
        let queue = self.advance(PipelineState::Launched, launched)?;

        let result = self.advance(PipelineState::ReadBack, queue.read_vec::<f32>(&z))?;

        let rows = a
            .iter()
            .zip(b)
            .zip(&result)
            .map(|((&a, &b), &r)| (a, b, r))
            .collect();
        self.state = PipelineState::Done;
        self.trace.push(PipelineState::Done);
        info!("pipeline: Done");

        Ok(PipelineReport {
            platform,
            device,
            build_log,
            rows,
            trace: self.trace.clone(),
        })
    }
}

fn choose<T: Clone>(
    choice: std::result::Result<crate::selection::ValidIndex, SelectionError>,
    items: &[T],
) -> Result<T> {
    let index = choice?;
    items.get(index.get()).cloned().ok_or_else(|| {
        SelectionError::OutOfRange {
            index: index.one_based(),
            count: items.len(),
        }
        .into()
    })
}

fn allocate_operands<'ctx>(
    context: &'ctx Context,
    a: &[f32],
    b: &[f32],
) -> Result<(Buffer<'ctx>, Buffer<'ctx>, Buffer<'ctx>)> {
    if a.len() != b.len() {
        return Err(DispatchError::SizeMismatch {
            expected: a.len() * 4,
            actual: b.len() * 4,
        });
    }
    let x = Buffer::from_slice(context, AccessMode::ReadOnly, a)?;
    let y = Buffer::from_slice(context, AccessMode::ReadOnly, b)?;
    let z = Buffer::zeroed::<f32>(context, AccessMode::WriteOnly, a.len())?;
    Ok((x, y, z))
}

fn bind_operands<'a>(kernel: &mut Kernel<'a>, operands: [&'a Buffer<'a>; 3]) -> Result<()> {
    for (position, buffer) in operands.into_iter().enumerate() {
        kernel.bind_argument(position, buffer)?;
    }
    Ok(())
}
