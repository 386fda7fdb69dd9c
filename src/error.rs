//! Error types for the dispatch pipeline.

use thiserror::Error;

use crate::buffer::AccessMode;
use crate::resource::DeviceFilter;
use crate::selection::SelectionError;

/// `CL_SUCCESS`
pub const CL_SUCCESS: i32 = 0;
/// `CL_DEVICE_NOT_FOUND`
pub const CL_DEVICE_NOT_FOUND: i32 = -1;
/// `CL_DEVICE_NOT_AVAILABLE`
pub const CL_DEVICE_NOT_AVAILABLE: i32 = -2;
/// `CL_OUT_OF_RESOURCES`
pub const CL_OUT_OF_RESOURCES: i32 = -5;
/// `CL_BUILD_PROGRAM_FAILURE`
pub const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
/// `CL_INVALID_VALUE`
pub const CL_INVALID_VALUE: i32 = -30;
/// `CL_INVALID_CONTEXT`
pub const CL_INVALID_CONTEXT: i32 = -34;
/// `CL_INVALID_BUFFER_SIZE`
pub const CL_INVALID_BUFFER_SIZE: i32 = -61;
/// `CL_INVALID_KERNEL_NAME`
pub const CL_INVALID_KERNEL_NAME: i32 = -46;
/// `CL_INVALID_ARG_INDEX`
pub const CL_INVALID_ARG_INDEX: i32 = -49;
/// `CL_INVALID_ARG_VALUE`
pub const CL_INVALID_ARG_VALUE: i32 = -50;
/// `CL_INVALID_ARG_SIZE`
pub const CL_INVALID_ARG_SIZE: i32 = -51;
/// `CL_INVALID_KERNEL_ARGS`
pub const CL_INVALID_KERNEL_ARGS: i32 = -52;
/// `CL_INVALID_WORK_GROUP_SIZE`
pub const CL_INVALID_WORK_GROUP_SIZE: i32 = -54;
/// `CL_INVALID_GLOBAL_WORK_SIZE`
pub const CL_INVALID_GLOBAL_WORK_SIZE: i32 = -63;
/// `CL_PLATFORM_NOT_FOUND_KHR`
pub const CL_PLATFORM_NOT_FOUND_KHR: i32 = -1001;

/// Errors surfaced by every stage of the dispatch pipeline.
///
/// Nothing is retried: each variant halts the run and carries enough detail
/// to name the failing component and the raw status code.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no compute platforms found")]
    NoPlatform,

    #[error("no {filter} devices found on platform '{platform}'")]
    NoDevice {
        platform: String,
        filter: DeviceFilter,
    },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("failed to create context on device '{device}' ({code}): {reason}")]
    ContextCreation {
        device: String,
        code: i32,
        reason: String,
    },

    #[error("program build failed with status {code}:\n{log}")]
    Compilation { code: i32, log: String },

    #[error("kernel entry point '{name}' not found (available: {available:?})")]
    EntryPointNotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("argument {position}: expected {expected}, found {found}")]
    ArgumentTypeMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("argument position {position} out of range (kernel takes {arity} arguments)")]
    InvalidPosition { position: usize, arity: usize },

    #[error("argument {position}: {mode} buffer rejected: {reason}")]
    AccessModeViolation {
        position: usize,
        mode: AccessMode,
        reason: String,
    },

    #[error("kernel arguments not bound at positions {missing:?}")]
    UnboundArguments { missing: Vec<usize> },

    #[error("invalid work size (global {global}, local {local:?}): {reason}")]
    InvalidWorkSize {
        global: usize,
        local: Option<usize>,
        reason: String,
    },

    #[error("device execution failed ({code}): {reason}")]
    DeviceExecution { code: i32, reason: String },

    #[error("host read of a write-only buffer before any completed device write")]
    UndefinedRead,

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl DispatchError {
    /// Name of the pipeline component that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            DispatchError::NoPlatform | DispatchError::NoDevice { .. } => "resource enumeration",
            DispatchError::Selection(_) => "selection",
            DispatchError::ContextCreation { .. } => "context creation",
            DispatchError::Compilation { .. } => "program build",
            DispatchError::EntryPointNotFound { .. } => "kernel extraction",
            DispatchError::SizeMismatch { .. } => "buffer allocation",
            DispatchError::ArgumentTypeMismatch { .. }
            | DispatchError::InvalidPosition { .. }
            | DispatchError::AccessModeViolation { .. } => "argument binding",
            DispatchError::UnboundArguments { .. } | DispatchError::InvalidWorkSize { .. } => {
                "kernel launch"
            }
            DispatchError::DeviceExecution { .. } => "device execution",
            DispatchError::UndefinedRead => "readback",
            DispatchError::Runtime(_) => "runtime",
        }
    }

    /// Raw status code in OpenCL numbering.
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::NoPlatform => CL_PLATFORM_NOT_FOUND_KHR,
            DispatchError::NoDevice { .. } => CL_DEVICE_NOT_FOUND,
            DispatchError::Selection(_) => CL_INVALID_VALUE,
            DispatchError::ContextCreation { code, .. } => *code,
            DispatchError::Compilation { code, .. } => *code,
            DispatchError::EntryPointNotFound { .. } => CL_INVALID_KERNEL_NAME,
            DispatchError::SizeMismatch { .. } => CL_INVALID_BUFFER_SIZE,
            DispatchError::ArgumentTypeMismatch { .. } => CL_INVALID_ARG_SIZE,
            DispatchError::InvalidPosition { .. } => CL_INVALID_ARG_INDEX,
            DispatchError::AccessModeViolation { .. } => CL_INVALID_ARG_VALUE,
            DispatchError::UnboundArguments { .. } => CL_INVALID_KERNEL_ARGS,
            DispatchError::InvalidWorkSize { local, .. } => {
                if local.is_some() {
                    CL_INVALID_WORK_GROUP_SIZE
                } else {
                    CL_INVALID_GLOBAL_WORK_SIZE
                }
            }
            DispatchError::DeviceExecution { code, .. } => *code,
            DispatchError::UndefinedRead => CL_INVALID_VALUE,
            DispatchError::Runtime(_) => CL_OUT_OF_RESOURCES,
        }
    }

    pub(crate) fn work_size(global: usize, local: Option<usize>, reason: impl Into<String>) -> Self {
        DispatchError::InvalidWorkSize {
            global,
            local,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
