#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! A minimal cross-backend GPU compute API.
//!
//! One [`Compute`] context owns a device and a serial queue. Callers create
//! [`Buffer`]s and [`Kernel`]s, set a kernel, bind buffers to its slots and
//! dispatch; command buffers and encoders are never exposed. Reading a buffer
//! a dispatch may have written blocks until that work is visible; every other
//! call only records.
//!
//! ```no_run
//! use minicompute::{BufferBinding, BufferKind, Compute};
//!
//! # fn main() -> Result<(), minicompute::ComputeError> {
//! let source = br"
//! @group(0) @binding(0) var<storage, read_write> out: array<u32>;
//! @compute @workgroup_size(64)
//! fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
//!     if (id.x < arrayLength(&out)) { out[id.x] = id.x; }
//! }";
//! let mut compute = Compute::new()?;
//! let mut out = compute.create_structured_buffer(256, 4);
//! let fill = compute.create_kernel(source, "fill")?;
//! compute.set_kernel(&fill);
//! compute.set_kernel_buffer(&mut out, 0, BufferBinding::Output);
//! compute.dispatch([64, 1, 1], [64, 1, 1]);
//! let mut values = [0u32; 64];
//! compute.get_buffer_pod(&mut out, &mut values, 0)?;
//! compute.delete()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod buffer;
mod context;
pub mod encoder;
mod error;
mod kernel;

pub use backend::wgpu_device::{DeviceOptions, WgpuDevice};
pub use backend::{backend, Backend, CompiledKernel, Device};
pub use buffer::{Buffer, BufferBinding, BufferKind, Residency};
pub use context::{Compute, SubmissionStats};
pub use encoder::EncoderState;
pub use error::ComputeError;
pub use kernel::{group_count, group_counts, Kernel};
pub use wgpu;

#[cfg(feature = "mock")]
pub use backend::mock_cpu::{MockDevice, MockEvent, MockInvocation, MockLog, MockProbe};
