//! Build-time backend selection and the [`Device`] seam native backends implement.
//!
//! A [`Device`] exposes the primitives of a serial command queue: allocate a
//! command buffer, open and close one encoder at a time inside it, commit it,
//! and wait for it. It never decides *when* to do any of that; the ordering
//! lives in [`crate::encoder`] and is driven by [`crate::Compute`].

use std::fmt;

use crate::{BufferKind, ComputeError};

#[cfg(feature = "mock")]
pub mod mock_cpu;
pub mod wgpu_device;

#[cfg(not(any(feature = "metal", feature = "d3d11", feature = "vulkan")))]
compile_error!("Choose a backend: enable one of the `metal`, `d3d11` or `vulkan` features.");

#[cfg(any(
    all(feature = "metal", feature = "d3d11"),
    all(feature = "metal", feature = "vulkan"),
    all(feature = "d3d11", feature = "vulkan"),
))]
compile_error!("Only one of the `metal`, `d3d11` and `vulkan` features may be enabled per build.");

/// Native graphics API a build targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Metal,
    D3D11,
    Vulkan,
}

impl Backend {
    /// The backend compiled into this build.
    #[cfg(feature = "metal")]
    pub const ACTIVE: Backend = Backend::Metal;
    #[cfg(feature = "d3d11")]
    pub const ACTIVE: Backend = Backend::D3D11;
    #[cfg(feature = "vulkan")]
    pub const ACTIVE: Backend = Backend::Vulkan;

    /// The `wgpu` backend set that serves this API.
    ///
    /// wgpu dropped its DX11 backend in 0.20, so D3D11 builds run on the
    /// Direct3D 12 path.
    #[must_use]
    pub const fn wgpu_backends(self) -> wgpu::Backends {
        match self {
            Backend::Metal => wgpu::Backends::METAL,
            Backend::D3D11 => wgpu::Backends::DX12,
            Backend::Vulkan => wgpu::Backends::VULKAN,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Metal => "Metal",
            Backend::D3D11 => "Direct3D 11",
            Backend::Vulkan => "Vulkan",
        })
    }
}

/// Reports which native backend this build was compiled for.
#[must_use]
pub const fn backend() -> Backend {
    Backend::ACTIVE
}

/// Granularity of buffer uploads and copies.
pub(crate) const COPY_ALIGNMENT: usize = 4;

/// Allocation size for a logical length: never zero, rounded up to `alignment`.
pub(crate) fn padded_len(len: usize, alignment: usize) -> usize {
    len.max(1).next_multiple_of(alignment)
}

/// Smallest `alignment`-aligned range enclosing `offset..offset + len`.
pub(crate) fn aligned_range(offset: usize, len: usize, alignment: usize) -> (usize, usize) {
    let start = offset - offset % alignment;
    let end = (offset + len).next_multiple_of(alignment);
    (start, end)
}

/// A compiled kernel as handed back by a [`Device`].
pub struct CompiledKernel<P> {
    pub pipeline: P,
    /// Group size fixed by the kernel source, when the backend's shading
    /// language fixes one.
    pub workgroup_size: Option<[u32; 3]>,
    /// Binding slots the entry point reads or writes. Every one of them must
    /// have a buffer bound before a dispatch.
    pub bindings: Vec<u32>,
}

/// Primitives of one native GPU backend.
///
/// Implementations may assume calls arrive in an order accepted by
/// [`crate::encoder::step`]: at most one encoder open, encoders only inside an
/// open command buffer, `commit` only with no encoder open.
pub trait Device {
    /// Native storage handle. Cloning must alias the same allocation.
    type Buffer: Clone;
    /// Native compiled pipeline handle.
    type Pipeline: Clone;

    /// Backend this device speaks to.
    fn backend(&self) -> Backend;

    /// Allocates `len` bytes of GPU storage with a CPU-visible staging copy.
    fn create_buffer(&mut self, len: usize, kind: BufferKind) -> Self::Buffer;

    /// Copies `bytes` into the staging copy at `offset` and declares that
    /// range modified so work committed afterwards observes it.
    fn write_staging(&mut self, buffer: &Self::Buffer, offset: usize, bytes: &[u8]);

    /// Brings the staging bytes that share a copy word with
    /// `offset..offset + len` but lie outside it up to date with the GPU's
    /// view of committed work. Does nothing for a word-aligned range;
    /// otherwise blocks until committed work completes.
    ///
    /// Called before a write to a buffer the GPU may have written, so the
    /// word-widened upload that follows carries the GPU's edge bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if the readback failed.
    fn refresh_edges(
        &mut self,
        buffer: &Self::Buffer,
        offset: usize,
        len: usize,
    ) -> Result<(), ComputeError>;

    /// Copies out of the staging copy. Performs no synchronization.
    fn read_staging(&self, buffer: &Self::Buffer, offset: usize, dest: &mut [u8]);

    /// Compiles `source` and builds a compute pipeline for `entry_point`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ShaderCompile`], [`ComputeError::MissingEntryPoint`]
    /// or [`ComputeError::PipelineBuild`]. No resource outlives a failure.
    fn compile_kernel(
        &mut self,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledKernel<Self::Pipeline>, ComputeError>;

    fn begin_command_buffer(&mut self);
    fn begin_compute_encoder(&mut self);
    fn begin_transfer_encoder(&mut self);
    /// Closes whichever encoder is open.
    fn end_encoder(&mut self);

    fn set_pipeline(&mut self, pipeline: &Self::Pipeline);
    fn set_buffer(&mut self, slot: u32, buffer: &Self::Buffer);
    fn dispatch_threadgroups(&mut self, groups: [u32; 3], group_size: [u32; 3]);

    /// Records a copy that makes the GPU's view of `buffer` visible in its
    /// staging copy once the command buffer completes.
    fn synchronize_resource(&mut self, buffer: &Self::Buffer);

    /// Submits the open command buffer to the queue.
    fn commit(&mut self);

    /// Blocks until every committed command buffer has completed.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if the work could not complete.
    fn wait_until_completed(&mut self) -> Result<(), ComputeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_keeps_allocations_aligned_and_non_empty() {
        assert_eq!(padded_len(0, 4), 4);
        assert_eq!(padded_len(5, 4), 8);
        assert_eq!(padded_len(256, 4), 256);
        assert_eq!(padded_len(20, 16), 32);
    }

    #[test]
    fn upload_range_encloses_the_write() {
        assert_eq!(aligned_range(0, 4, 4), (0, 4));
        assert_eq!(aligned_range(3, 2, 4), (0, 8));
        assert_eq!(aligned_range(8, 1, 4), (8, 12));
    }
}
