//! Program build and kernel extraction.

use std::fmt;

use log::{info, trace, warn};

use crate::context::Context;
use crate::error::{CL_SUCCESS, DispatchError, Result};
use crate::kernel::Kernel;
use crate::runtime::RuntimeProgram;

/// Outcome of a program build, in OpenCL status numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failed { code: i32 },
}

impl BuildStatus {
    pub fn code(self) -> i32 {
        match self {
            BuildStatus::Success => CL_SUCCESS,
            BuildStatus::Failed { code } => code,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, BuildStatus::Success)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Success => write!(f, "success"),
            BuildStatus::Failed { code } => write!(f, "failed ({code})"),
        }
    }
}

/// Compiled kernel source. A program whose build failed still carries its
/// status and log.
pub struct Program<'ctx> {
    context: &'ctx Context,
    status: BuildStatus,
    log: String,
    inner: Option<Box<dyn RuntimeProgram>>,
}

impl<'ctx> Program<'ctx> {
    pub(crate) fn build(context: &'ctx Context, source: &str, options: &str) -> Self {
        trace!("building program:\n{source}");
        let output = context.raw().build_program(source, options);
        match output.status {
            BuildStatus::Success => info!("program built for '{}'", context.device().name),
            BuildStatus::Failed { code } => warn!("program build failed ({code}):\n{}", output.log),
        }
        Program {
            context,
            status: output.status,
            log: output.log,
            inner: output.program,
        }
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn build_log(&self) -> &str {
        &self.log
    }

    pub fn is_built(&self) -> bool {
        self.status.is_success() && self.inner.is_some()
    }

    /// Entry points defined by the program; empty when the build failed.
    pub fn kernel_names(&self) -> Vec<String> {
        self.inner
            .as_ref()
            .map(|p| p.kernel_names())
            .unwrap_or_default()
    }

    /// Turns a failed build into a [`DispatchError::Compilation`].
    pub fn check(&self) -> Result<()> {
        if self.is_built() {
            Ok(())
        } else {
            Err(DispatchError::Compilation {
                code: self.status.code(),
                log: self.log.clone(),
            })
        }
    }

    pub fn into_result(self) -> Result<Self> {
        self.check().map(|_| self)
    }

    /// Extracts the kernel `name`. Fails when the build did not succeed or
    /// the program defines no such entry point.
    pub fn extract_kernel(&self, name: &str) -> Result<Kernel<'ctx>> {
        let Some(inner) = self.inner.as_ref().filter(|_| self.status.is_success()) else {
            return Err(DispatchError::EntryPointNotFound {
                name: name.to_string(),
                available: Vec::new(),
            });
        };
        let available = inner.kernel_names();
        if !available.iter().any(|n| n == name) {
            return Err(DispatchError::EntryPointNotFound {
                name: name.to_string(),
                available,
            });
        }

        let raw = inner.create_kernel(name)?;
        let params = inner.signature(name).map(|s| s.params);
        Ok(Kernel::new(self.context, raw, params))
    }
}

impl fmt::Debug for Program<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("status", &self.status)
            .field("kernels", &self.kernel_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{REFERENCE_ENTRY, REFERENCE_KERNEL};
    use crate::error::CL_BUILD_PROGRAM_FAILURE;
    use crate::test_support::host_context;

    #[test]
    fn test_reference_kernel_builds() {
        let context = host_context();
        let program = context.compile(REFERENCE_KERNEL);
        assert_eq!(program.status(), BuildStatus::Success);
        assert_eq!(program.status().code(), 0);
        assert_eq!(program.kernel_names(), vec![REFERENCE_ENTRY.to_string()]);
        assert!(program.check().is_ok());
    }

    #[test]
    fn test_syntax_error_reports_status_and_log() {
        let context = host_context();
        let program = context.compile("__kernel void broken(__global float* z) { z[0] = 1.0f }");
        assert_eq!(
            program.status(),
            BuildStatus::Failed {
                code: CL_BUILD_PROGRAM_FAILURE
            }
        );
        assert!(program.build_log().contains("expected ';'"));
        assert!(program.kernel_names().is_empty());

        let err = program.extract_kernel("broken").unwrap_err();
        assert!(matches!(err, DispatchError::EntryPointNotFound { .. }));
        let err = program.into_result().unwrap_err();
        assert_eq!(err.code(), CL_BUILD_PROGRAM_FAILURE);
    }

    #[test]
    fn test_unknown_entry_point_lists_available() {
        let context = host_context();
        let program = context.compile(REFERENCE_KERNEL);
        match program.extract_kernel("parallel_sub") {
            Err(DispatchError::EntryPointNotFound { name, available }) => {
                assert_eq!(name, "parallel_sub");
                assert_eq!(available, vec![REFERENCE_ENTRY.to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_build_options_define_macros() {
        let context = host_context();
        let program = context.compile_with_options(
            "__kernel void fill(__global int* z) { z[get_global_id(0)] = VALUE; }",
            "-D VALUE=42 -cl-fast-relaxed-math",
        );
        assert!(program.is_built(), "{}", program.build_log());
        assert!(program.build_log().contains("-cl-fast-relaxed-math"));
    }
}
