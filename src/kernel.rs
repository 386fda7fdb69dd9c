//! Kernel entry points and positional argument binding.

use std::fmt;

use log::{trace, warn};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::element::ScalarValue;
use crate::error::{DispatchError, Result};
use crate::runtime::{LaunchArg, RuntimeKernel};
use crate::source::{Access, KernelParam, ParamKind, TypeName};

/// A value bound to one kernel parameter.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(&'a Buffer<'a>),
    Scalar(ScalarValue),
}

impl<'a> From<&'a Buffer<'a>> for KernelArg<'a> {
    fn from(buffer: &'a Buffer<'a>) -> Self {
        KernelArg::Buffer(buffer)
    }
}

impl From<ScalarValue> for KernelArg<'_> {
    fn from(value: ScalarValue) -> Self {
        KernelArg::Scalar(value)
    }
}

impl From<f32> for KernelArg<'_> {
    fn from(value: f32) -> Self {
        KernelArg::Scalar(value.into())
    }
}

impl From<i32> for KernelArg<'_> {
    fn from(value: i32) -> Self {
        KernelArg::Scalar(value.into())
    }
}

impl From<u32> for KernelArg<'_> {
    fn from(value: u32) -> Self {
        KernelArg::Scalar(value.into())
    }
}

impl fmt::Display for KernelArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Buffer(b) => write!(f, "{} byte {} buffer", b.size(), b.mode()),
            KernelArg::Scalar(v) => write!(f, "{} scalar {v}", v.scalar_type()),
        }
    }
}

/// An entry point extracted from a built program, with its argument slots.
///
/// Arguments are bound by position in declaration order and checked against
/// the declared parameter list when the runtime can describe it. A kernel may
/// be declared before the buffers it binds; it only has to be dropped
/// before them.
pub struct Kernel<'a> {
    context: &'a Context,
    inner: Box<dyn RuntimeKernel>,
    params: Option<Vec<KernelParam>>,
    args: Vec<Option<KernelArg<'a>>>,
}

impl<'a> Kernel<'a> {
    pub(crate) fn new(
        context: &'a Context,
        inner: Box<dyn RuntimeKernel>,
        params: Option<Vec<KernelParam>>,
    ) -> Self {
        let arity = inner.num_args();
        let params = params.filter(|p| {
            let matches = p.len() == arity;
            if !matches {
                warn!(
                    "declared parameters of '{}' ({}) disagree with the runtime ({arity}); \
                     type checks disabled",
                    inner.name(),
                    p.len()
                );
            }
            matches
        });
        Kernel {
            context,
            inner,
            params,
            args: vec![None; arity],
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Number of declared parameters.
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Declared parameters, when known.
    pub fn params(&self) -> Option<&[KernelParam]> {
        self.params.as_deref()
    }

    pub fn context(&self) -> &'a Context {
        self.context
    }

    /// Binds `arg` to the parameter at `position` (zero-based), replacing any
    /// earlier binding.
    pub fn bind_argument(&mut self, position: usize, arg: impl Into<KernelArg<'a>>) -> Result<()> {
        let arg = arg.into();
        if position >= self.arity() {
            return Err(DispatchError::InvalidPosition {
                position,
                arity: self.arity(),
            });
        }
        if let KernelArg::Buffer(buffer) = arg {
            if !buffer.context().same_as(self.context) {
                return Err(DispatchError::ArgumentTypeMismatch {
                    position,
                    expected: "buffer from the kernel's context".to_string(),
                    found: "buffer from another context".to_string(),
                });
            }
        }
        if let Some(param) = self.params.as_ref().and_then(|p| p.get(position)) {
            check_argument(position, param, &arg)?;
        }

        trace!("'{}' arg {position} = {arg}", self.name());
        self.args[position] = Some(arg);
        Ok(())
    }

    /// Positions that have no argument bound yet.
    pub fn unbound(&self) -> Vec<usize> {
        self.args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn launch_args(&self) -> Result<Vec<LaunchArg<'_>>> {
        let missing = self.unbound();
        if !missing.is_empty() {
            return Err(DispatchError::UnboundArguments { missing });
        }
        Ok(self
            .args
            .iter()
            .flatten()
            .map(|arg| match arg {
                KernelArg::Buffer(b) => LaunchArg::Buffer(b.raw()),
                KernelArg::Scalar(v) => LaunchArg::Scalar(*v),
            })
            .collect())
    }

    pub(crate) fn raw(&self) -> &dyn RuntimeKernel {
        self.inner.as_ref()
    }
}

fn check_argument(position: usize, param: &KernelParam, arg: &KernelArg<'_>) -> Result<()> {
    let mismatch = || DispatchError::ArgumentTypeMismatch {
        position,
        expected: param.to_string(),
        found: arg.to_string(),
    };

    match (&param.kind, arg) {
        (ParamKind::Pointer { elem, .. }, KernelArg::Buffer(buffer)) => {
            if let Some(elem) = elem.scalar() {
                if buffer.size() % elem.size_bytes() != 0 {
                    return Err(mismatch());
                }
            }
            // Only certain accesses are held against the buffer's mode; an
            // escaping pointer may be used either way.
            let mode = buffer.mode();
            match param.access {
                Access::Write if !mode.allows_write() => Err(DispatchError::AccessModeViolation {
                    position,
                    mode,
                    reason: format!("kernel writes '{}'", param.name),
                }),
                Access::Read if !mode.allows_read() => Err(DispatchError::AccessModeViolation {
                    position,
                    mode,
                    reason: format!("kernel only reads '{}'", param.name),
                }),
                _ => Ok(()),
            }
        }
        // A type the host cannot name (a macro, `half`, ...) is left to the driver.
        (ParamKind::Value(TypeName::Other(_)), KernelArg::Scalar(_)) => Ok(()),
        (ParamKind::Value(ty), KernelArg::Scalar(value)) => {
            if ty.scalar() == Some(value.scalar_type()) {
                Ok(())
            } else {
                Err(mismatch())
            }
        }
        _ => Err(mismatch()),
    }
}

impl fmt::Debug for Kernel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name())
            .field("arity", &self.arity())
            .field("unbound", &self.unbound())
            .finish()
    }
}
