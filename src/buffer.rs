//! Device memory buffers owned by a context.

use std::fmt;

use log::debug;

use crate::context::Context;
use crate::element::{Element, to_bytes};
use crate::error::{DispatchError, Result};
use crate::runtime::RuntimeBuffer;

/// Kernel-side access permitted on a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn allows_read(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn allows_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::WriteOnly => write!(f, "write-only"),
            AccessMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// A block of device memory. Cannot outlive its context.
pub struct Buffer<'ctx> {
    context: &'ctx Context,
    mode: AccessMode,
    inner: Box<dyn RuntimeBuffer>,
}

impl<'ctx> Buffer<'ctx> {
    /// Allocates `size` bytes. `init`, when given, must hold at least `size`
    /// bytes; extra bytes are ignored. The copy is complete on return.
    pub fn allocate(
        context: &'ctx Context,
        size: usize,
        mode: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(DispatchError::SizeMismatch {
                expected: 1,
                actual: 0,
            });
        }
        if let Some(init) = init {
            if init.len() < size {
                return Err(DispatchError::SizeMismatch {
                    expected: size,
                    actual: init.len(),
                });
            }
        }

        let inner = context.raw().create_buffer(size, mode, init)?;
        debug!(
            "allocated {size} byte {mode} buffer{}",
            if init.is_some() { " (initialized)" } else { "" }
        );
        Ok(Buffer {
            context,
            mode,
            inner,
        })
    }

    /// A buffer holding a copy of `data`.
    pub fn from_slice<T: Element>(context: &'ctx Context, mode: AccessMode, data: &[T]) -> Result<Self> {
        let bytes = to_bytes(data);
        Self::allocate(context, bytes.len(), mode, Some(&bytes))
    }

    /// A buffer for `len` elements of `T` with no host initializer.
    pub fn zeroed<T: Element>(context: &'ctx Context, mode: AccessMode, len: usize) -> Result<Self> {
        Self::allocate(context, len * T::TYPE.size_bytes(), mode, None)
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    pub(crate) fn raw(&self) -> &dyn RuntimeBuffer {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CommandQueue;
    use crate::test_support::host_context;

    #[test]
    fn test_zero_size_rejected() {
        let context = host_context();
        let err = Buffer::allocate(&context, 0, AccessMode::ReadWrite, None).unwrap_err();
        assert!(matches!(err, DispatchError::SizeMismatch { actual: 0, .. }));
    }

    #[test]
    fn test_short_initializer_rejected() {
        let context = host_context();
        let err = Buffer::allocate(&context, 16, AccessMode::ReadOnly, Some(&[0u8; 8])).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SizeMismatch {
                expected: 16,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_long_initializer_truncated() {
        let context = host_context();
        let data = to_bytes(&[1i32, 2, 3]);
        let buffer = Buffer::allocate(&context, 8, AccessMode::ReadOnly, Some(&data)).unwrap();
        assert_eq!(buffer.size(), 8);

        let queue = CommandQueue::new(&context).unwrap();
        assert_eq!(queue.read_vec::<i32>(&buffer).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_typed_helpers() {
        let context = host_context();
        let a = Buffer::from_slice(&context, AccessMode::ReadOnly, &[0.5f32; 10]).unwrap();
        assert_eq!(a.size(), 40);
        let z = Buffer::zeroed::<u32>(&context, AccessMode::WriteOnly, 4).unwrap();
        assert_eq!(z.size(), 16);
        assert_eq!(z.mode(), AccessMode::WriteOnly);
        assert!(!z.mode().allows_read());
        assert!(std::ptr::eq(z.context(), &context));
    }
}
