use thiserror::Error;

use crate::backend::Backend;

/// Failures to acquire a native resource.
///
/// Caller programming errors (out-of-range buffer access, dispatching with no
/// kernel set) are not represented here; they panic.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("no compatible {0} device available")]
    BackendUnavailable(Backend),
    #[error("a compute context is already live in this process")]
    ContextAlreadyLive,
    #[error("kernel source rejected: {description} (reason: {reason})")]
    ShaderCompile { description: String, reason: String },
    #[error("entry point `{0}` not found in kernel source")]
    MissingEntryPoint(String),
    #[error("failed to build compute pipeline: {0}")]
    PipelineBuild(String),
    #[error("gpu work did not complete: {0}")]
    DeviceLost(String),
}
