//! In-order command queue: kernel launches and blocking readback.

use log::{debug, trace};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::element::{Element, from_bytes};
use crate::error::{DispatchError, Result};
use crate::kernel::Kernel;
use crate::runtime::RuntimeQueue;

/// One-dimensional launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGrid {
    pub global: usize,
    /// Work-group size; `None` lets the runtime choose.
    pub local: Option<usize>,
}

impl WorkGrid {
    pub fn new(global: usize, local: usize) -> Self {
        WorkGrid {
            global,
            local: Some(local),
        }
    }

    pub fn global_only(global: usize) -> Self {
        WorkGrid {
            global,
            local: None,
        }
    }

    /// Checks the grid against a device's work-group limit.
    pub fn validate(&self, max_work_group_size: usize) -> Result<()> {
        let fail = |reason: String| DispatchError::work_size(self.global, self.local, reason);
        if self.global == 0 {
            return Err(fail("global size must be non-zero".to_string()));
        }
        if let Some(local) = self.local {
            if local == 0 {
                return Err(fail("local size must be non-zero".to_string()));
            }
            if self.global % local != 0 {
                return Err(fail(format!(
                    "global size {} is not a multiple of local size {local}",
                    self.global
                )));
            }
            if local > max_work_group_size {
                return Err(fail(format!(
                    "local size {local} exceeds the device maximum of {max_work_group_size}"
                )));
            }
        }
        Ok(())
    }
}

/// Handle to a submitted launch.
#[must_use = "a launch is only known to have finished after `wait`"]
pub struct CompletionBarrier<'q> {
    queue: &'q dyn RuntimeQueue,
}

impl CompletionBarrier<'_> {
    /// Blocks until the launch and every earlier command completed. Device
    /// faults surface here.
    pub fn wait(self) -> Result<()> {
        self.queue.finish()
    }
}

/// An in-order queue on the context's device.
pub struct CommandQueue<'ctx> {
    context: &'ctx Context,
    inner: Box<dyn RuntimeQueue>,
}

impl<'ctx> CommandQueue<'ctx> {
    pub fn new(context: &'ctx Context) -> Result<Self> {
        let inner = context.raw().create_queue()?;
        debug!("command queue created on '{}'", context.device().name);
        Ok(CommandQueue { context, inner })
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    /// Submits `kernel` over `grid`. Every argument must be bound.
    pub fn enqueue_launch(&self, kernel: &Kernel<'_>, grid: WorkGrid) -> Result<CompletionBarrier<'_>> {
        if !kernel.context().same_as(self.context) {
            return Err(DispatchError::Runtime(format!(
                "kernel '{}' belongs to another context",
                kernel.name()
            )));
        }
        grid.validate(self.context.device().max_work_group_size)?;
        let args = kernel.launch_args()?;

        trace!(
            "launch '{}' global={} local={:?}",
            kernel.name(),
            grid.global,
            grid.local
        );
        self.inner.enqueue_kernel(kernel.raw(), &args, grid)?;
        Ok(CompletionBarrier {
            queue: self.inner.as_ref(),
        })
    }

    /// Waits for all earlier commands, then copies the first `dst.len()`
    /// bytes of `buffer` into `dst`.
    pub fn enqueue_readback(&self, buffer: &Buffer<'_>, dst: &mut [u8]) -> Result<()> {
        if !buffer.context().same_as(self.context) {
            return Err(DispatchError::Runtime(
                "buffer belongs to another context".to_string(),
            ));
        }
        if dst.len() > buffer.size() {
            return Err(DispatchError::SizeMismatch {
                expected: buffer.size(),
                actual: dst.len(),
            });
        }
        self.inner.enqueue_read(buffer.raw(), dst)?;
        debug!("read back {} bytes", dst.len());
        Ok(())
    }

    /// Reads the whole buffer as elements of `T`.
    pub fn read_vec<T: Element>(&self, buffer: &Buffer<'_>) -> Result<Vec<T>> {
        let elem = T::TYPE.size_bytes();
        let mut bytes = vec![0u8; buffer.size() / elem * elem];
        self.enqueue_readback(buffer, &mut bytes)?;
        Ok(from_bytes(&bytes))
    }

    /// Blocks until every submitted command completed.
    pub fn finish(&self) -> Result<()> {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AccessMode;
    use crate::error::{CL_INVALID_GLOBAL_WORK_SIZE, CL_INVALID_WORK_GROUP_SIZE};
    use crate::test_support::host_context;
    use rstest::rstest;

    #[rstest]
    #[case(10, Some(10), true)]
    #[case(10, Some(5), true)]
    #[case(10, Some(2), true)]
    #[case(10, Some(1), true)]
    #[case(10, Some(3), false)]
    #[case(10, Some(4), false)]
    #[case(10, Some(0), false)]
    #[case(0, Some(1), false)]
    #[case(10, None, true)]
    #[case(0, None, false)]
    #[case(2048, Some(2048), false)]
    fn test_work_grid_validation(#[case] global: usize, #[case] local: Option<usize>, #[case] ok: bool) {
        let grid = WorkGrid { global, local };
        assert_eq!(grid.validate(1024).is_ok(), ok);
    }

    #[test]
    fn test_work_size_codes() {
        let err = WorkGrid::new(10, 3).validate(1024).unwrap_err();
        assert_eq!(err.code(), CL_INVALID_WORK_GROUP_SIZE);
        let err = WorkGrid::global_only(0).validate(1024).unwrap_err();
        assert_eq!(err.code(), CL_INVALID_GLOBAL_WORK_SIZE);
    }

    #[test]
    fn test_readback_prefix_and_overflow() {
        let context = host_context();
        let queue = context.create_queue().unwrap();
        let buffer = Buffer::from_slice(&context, AccessMode::ReadWrite, &[1u32, 2, 3, 4]).unwrap();

        let mut prefix = [0u8; 8];
        queue.enqueue_readback(&buffer, &mut prefix).unwrap();
        assert_eq!(from_bytes::<u32>(&prefix), vec![1, 2]);

        let mut too_long = [0u8; 20];
        let err = queue.enqueue_readback(&buffer, &mut too_long).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SizeMismatch {
                expected: 16,
                actual: 20
            }
        ));
    }

    #[test]
    fn test_write_only_read_before_launch_is_refused() {
        let context = host_context();
        let queue = context.create_queue().unwrap();
        let out = Buffer::zeroed::<f32>(&context, AccessMode::WriteOnly, 4).unwrap();
        assert!(matches!(
            queue.read_vec::<f32>(&out),
            Err(DispatchError::UndefinedRead)
        ));
    }

    #[test]
    fn test_barrier_surfaces_device_fault() {
        let context = host_context();
        let program = context.compile(
            "__kernel void shift(__global int* v) { int i = get_global_id(0); v[i + 1] = i; }",
        );
        let v = Buffer::zeroed::<i32>(&context, AccessMode::ReadWrite, 4).unwrap();
        let mut kernel = program.extract_kernel("shift").unwrap();
        kernel.bind_argument(0, &v).unwrap();
        let queue = context.create_queue().unwrap();

        let barrier = queue.enqueue_launch(&kernel, WorkGrid::new(4, 2)).unwrap();
        let err = barrier.wait().unwrap_err();
        assert_eq!(err.stage(), "device execution");
    }
}
