//! The compute context: owner of the device and of the command-buffer state.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use bytemuck::Pod;

use crate::backend::wgpu_device::{DeviceOptions, WgpuDevice};
use crate::encoder::{self, Command, EncoderState, Request};
use crate::{
    group_counts, Backend, Buffer, BufferBinding, BufferKind, ComputeError, Device, Kernel, Residency,
};

static CONTEXT_LIVE: AtomicBool = AtomicBool::new(false);

/// Marks the process-wide native context as taken until dropped.
#[derive(Debug)]
struct ContextLease;

impl ContextLease {
    fn acquire() -> Result<Self, ComputeError> {
        CONTEXT_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ContextLease)
            .map_err(|_| ComputeError::ContextAlreadyLive)
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        CONTEXT_LIVE.store(false, Ordering::Release);
    }
}

/// Counters of blocking work, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    pub command_buffers_committed: u64,
    pub waits: u64,
    pub synchronizations: u64,
}

/// A GPU compute context.
///
/// Owns the native device and a single serial queue, and records caller work
/// into at most one open command buffer at a time. Only two calls block:
/// [`Compute::get_buffer`] on a buffer the GPU may have written, and
/// [`Compute::finish_work`] (which [`Compute::delete`] and `Drop` also run).
pub struct Compute<D: Device = WgpuDevice> {
    device: D,
    state: EncoderState,
    active_workgroup_size: Option<[u32; 3]>,
    active_bindings: Vec<u32>,
    bound_slots: BTreeSet<u32>,
    stats: SubmissionStats,
    #[allow(dead_code)] // held until the context drops
    lease: Option<ContextLease>,
}

impl Compute<WgpuDevice> {
    /// Acquires the default device for this build's backend, honouring the
    /// `WGPU_POWER_PREF` and `WGPU_ADAPTER_NAME` environment variables.
    ///
    /// # Errors
    ///
    /// [`ComputeError::ContextAlreadyLive`] if another native context exists,
    /// [`ComputeError::BackendUnavailable`] if no compatible device is found.
    pub fn new() -> Result<Self, ComputeError> {
        Self::with_options(&DeviceOptions::from_env())
    }

    /// Like [`Compute::new`] with explicit device options.
    ///
    /// # Errors
    ///
    /// See [`Compute::new`].
    pub fn with_options(options: &DeviceOptions) -> Result<Self, ComputeError> {
        let lease = ContextLease::acquire()?;
        let device = WgpuDevice::acquire(Backend::ACTIVE, options)?;
        let mut compute = Self::with_device(device);
        compute.lease = Some(lease);
        Ok(compute)
    }
}

impl<D: Device> Compute<D> {
    /// Wraps an already acquired device.
    #[must_use]
    pub fn with_device(device: D) -> Self {
        Self {
            device,
            state: EncoderState::Idle,
            active_workgroup_size: None,
            active_bindings: Vec::new(),
            bound_slots: BTreeSet::new(),
            stats: SubmissionStats::default(),
            lease: None,
        }
    }

    /// Drains all outstanding work and releases the device and queue.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if the outstanding work failed;
    /// the device is released regardless.
    pub fn delete(mut self) -> Result<(), ComputeError> {
        self.finish_work()
    }

    #[must_use]
    pub fn backend(&self) -> Backend {
        self.device.backend()
    }

    #[must_use]
    pub fn encoder_state(&self) -> EncoderState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> SubmissionStats {
        self.stats
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Allocates a buffer of `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is [`BufferKind::Structured`] with a zero stride or a
    /// stride that does not divide `len`.
    pub fn create_buffer(&mut self, len: usize, kind: BufferKind) -> Buffer<D> {
        if let BufferKind::Structured { element_stride } = kind {
            assert!(element_stride >= 1, "structured buffer stride must be at least 1");
            assert!(
                len % element_stride == 0,
                "structured buffer length {len} is not a multiple of its stride {element_stride}"
            );
        }
        let raw = self.device.create_buffer(len, kind);
        tracing::trace!(len, ?kind, "created buffer");
        Buffer::new(raw, len, kind)
    }

    /// Creates a buffer of `len` bytes holding elements of `element_stride` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the stride is zero or does not divide `len`.
    pub fn create_structured_buffer(&mut self, len: usize, element_stride: usize) -> Buffer<D> {
        self.create_buffer(len, BufferKind::Structured { element_stride })
    }

    /// Releases the buffer's native storage.
    pub fn delete_buffer(&mut self, buffer: Buffer<D>) {
        tracing::trace!(len = buffer.len(), "deleting buffer");
        drop(buffer);
    }

    /// Copies `src` into the buffer starting at `dest_offset`.
    ///
    /// The GPU sees the bytes in any work committed afterwards; work already
    /// recorded but not yet committed still overwrites them. Bytes outside
    /// the range keep whatever the GPU last wrote. The buffer's residency is
    /// left untouched.
    ///
    /// Does not block, except for a write that only partly covers a copy
    /// word of a buffer the GPU may have written: committed work is then
    /// waited on so the rest of that word is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if that wait failed.
    ///
    /// # Panics
    ///
    /// Panics if `dest_offset + src.len()` exceeds the buffer length.
    pub fn set_buffer(
        &mut self,
        buffer: &Buffer<D>,
        src: &[u8],
        dest_offset: usize,
    ) -> Result<(), ComputeError> {
        buffer.check_range(dest_offset, src.len());
        if src.is_empty() {
            return Ok(());
        }
        if buffer.residency.needs_sync() {
            self.device.refresh_edges(&buffer.raw, dest_offset, src.len())?;
        }
        self.device.write_staging(&buffer.raw, dest_offset, src);
        Ok(())
    }

    /// Copies from the buffer at `src_offset` into `dest`.
    ///
    /// If the buffer was bound as an output since it was last read, the
    /// recorded work is synchronized, committed and waited on first.
    /// Otherwise this reads the staging copy directly and does not block.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if the synchronizing wait failed.
    ///
    /// # Panics
    ///
    /// Panics if `src_offset + dest.len()` exceeds the buffer length.
    pub fn get_buffer(
        &mut self,
        buffer: &mut Buffer<D>,
        dest: &mut [u8],
        src_offset: usize,
    ) -> Result<(), ComputeError> {
        buffer.check_range(src_offset, dest.len());
        if buffer.residency.needs_sync() {
            self.execute(Request::Synchronize, Some(&buffer.raw))?;
            buffer.residency = Residency::Clean;
        }
        if !dest.is_empty() {
            self.device.read_staging(&buffer.raw, src_offset, dest);
        }
        Ok(())
    }

    /// Typed [`Compute::set_buffer`]; `dest_offset` is in bytes.
    ///
    /// # Errors
    ///
    /// See [`Compute::set_buffer`].
    ///
    /// # Panics
    ///
    /// See [`Compute::set_buffer`].
    pub fn set_buffer_pod<T: Pod>(
        &mut self,
        buffer: &Buffer<D>,
        src: &[T],
        dest_offset: usize,
    ) -> Result<(), ComputeError> {
        self.set_buffer(buffer, bytemuck::cast_slice(src), dest_offset)
    }

    /// Typed [`Compute::get_buffer`]; `src_offset` is in bytes.
    ///
    /// # Errors
    ///
    /// See [`Compute::get_buffer`].
    ///
    /// # Panics
    ///
    /// See [`Compute::get_buffer`].
    pub fn get_buffer_pod<T: Pod>(
        &mut self,
        buffer: &mut Buffer<D>,
        dest: &mut [T],
        src_offset: usize,
    ) -> Result<(), ComputeError> {
        self.get_buffer(buffer, bytemuck::cast_slice_mut(dest), src_offset)
    }

    /// Compiles `source` and builds a pipeline for `entry_point`.
    ///
    /// Leaves the command-buffer state untouched whether it succeeds or not.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ShaderCompile`] for source that is not UTF-8 or
    /// does not compile, [`ComputeError::MissingEntryPoint`] if no compute
    /// entry point has that name, and [`ComputeError::PipelineBuild`] if the
    /// driver rejects the pipeline.
    pub fn create_kernel(&mut self, source: &[u8], entry_point: &str) -> Result<Kernel<D>, ComputeError> {
        let compiled = std::str::from_utf8(source)
            .map_err(|err| ComputeError::ShaderCompile {
                description: "kernel source is not valid UTF-8".to_owned(),
                reason: err.to_string(),
            })
            .and_then(|source| self.device.compile_kernel(source, entry_point));

        match compiled {
            Ok(compiled) => {
                tracing::debug!(
                    entry_point,
                    workgroup_size = ?compiled.workgroup_size,
                    bindings = ?compiled.bindings,
                    "created kernel"
                );
                Ok(Kernel::new(
                    compiled.pipeline,
                    entry_point.to_owned(),
                    compiled.workgroup_size,
                    compiled.bindings,
                ))
            }
            Err(err) => {
                tracing::error!(entry_point, error = %err, "kernel creation failed");
                Err(err)
            }
        }
    }

    pub fn delete_kernel(&mut self, kernel: Kernel<D>) {
        tracing::trace!(entry_point = kernel.entry_point(), "deleting kernel");
        drop(kernel);
    }

    /// Makes `kernel` the target of subsequent buffer bindings and dispatches,
    /// opening a command buffer and compute encoder as needed.
    ///
    /// # Panics
    ///
    /// Panics only if the encoder state machine is internally inconsistent.
    pub fn set_kernel(&mut self, kernel: &Kernel<D>) {
        if let Err(err) = self.execute(Request::ActivateKernel, None) {
            unreachable!("activating a kernel failed: {err}");
        }
        self.device.set_pipeline(&kernel.pipeline);
        self.active_workgroup_size = kernel.workgroup_size;
        self.active_bindings.clone_from(&kernel.bindings);
    }

    /// Binds `buffer` at `slot` of the active kernel.
    ///
    /// Binding as [`BufferBinding::Output`] marks the buffer as pending a GPU
    /// write until it is next read.
    ///
    /// # Panics
    ///
    /// Panics if no kernel is set.
    pub fn set_kernel_buffer(&mut self, buffer: &mut Buffer<D>, slot: u32, binding: BufferBinding) {
        assert_eq!(
            self.state,
            EncoderState::EncodingCompute,
            "set_kernel_buffer called with no kernel set"
        );
        buffer.residency = buffer.residency.bind(binding);
        self.bound_slots.insert(slot);
        self.device.set_buffer(slot, &buffer.raw);
    }

    /// Enqueues enough groups of `group_size` to cover `threads` on every
    /// axis. Does not block.
    ///
    /// # Panics
    ///
    /// Panics if no kernel is set, any group size axis is zero, the group size
    /// differs from the one the kernel declares, or a binding slot the kernel
    /// uses has no buffer bound.
    pub fn dispatch(&mut self, threads: [u32; 3], group_size: [u32; 3]) {
        assert_eq!(
            self.state,
            EncoderState::EncodingCompute,
            "dispatch called with no kernel set"
        );
        if let Some(declared) = self.active_workgroup_size {
            assert_eq!(
                group_size, declared,
                "dispatch group size does not match the kernel's declared workgroup size"
            );
        }
        if let Some(slot) = self
            .active_bindings
            .iter()
            .copied()
            .find(|slot| !self.bound_slots.contains(slot))
        {
            panic!("dispatch with no buffer bound at slot {slot}");
        }
        let groups = group_counts(threads, group_size);
        tracing::trace!(?threads, ?group_size, ?groups, "dispatch");
        self.device.dispatch_threadgroups(groups, group_size);
    }

    /// Commits everything recorded so far and blocks until it completes.
    /// Does nothing when no command buffer is open.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if the wait failed.
    pub fn finish_work(&mut self) -> Result<(), ComputeError> {
        self.execute(Request::Finish, None)
    }

    fn execute(&mut self, request: Request, target: Option<&D::Buffer>) -> Result<(), ComputeError> {
        let commands = encoder::plan(self.state, request);
        if !commands.is_empty() {
            tracing::trace!(from = ?self.state, ?request, ?commands, "encoder transition");
        }
        for command in commands {
            self.state = match encoder::step(self.state, command) {
                Ok(next) => next,
                Err(err) => unreachable!("encoder plan out of sync with step: {err}"),
            };
            match command {
                Command::BeginCommandBuffer => self.device.begin_command_buffer(),
                Command::BeginComputeEncoder => {
                    self.bound_slots.clear();
                    self.device.begin_compute_encoder();
                }
                Command::BeginTransferEncoder => self.device.begin_transfer_encoder(),
                Command::EndEncoder => {
                    self.active_workgroup_size = None;
                    self.active_bindings.clear();
                    self.device.end_encoder();
                }
                Command::SynchronizeResource => {
                    if let Some(buffer) = target {
                        self.stats.synchronizations += 1;
                        self.device.synchronize_resource(buffer);
                    }
                }
                Command::Commit => {
                    self.stats.command_buffers_committed += 1;
                    tracing::debug!(
                        committed = self.stats.command_buffers_committed,
                        "committing command buffer"
                    );
                    self.device.commit();
                }
                Command::WaitUntilCompleted => {
                    self.stats.waits += 1;
                    self.device.wait_until_completed()?;
                    tracing::debug!(waits = self.stats.waits, "gpu work completed");
                }
            }
        }
        Ok(())
    }
}

impl<D: Device> Drop for Compute<D> {
    fn drop(&mut self) {
        if let Err(err) = self.finish_work() {
            tracing::warn!(error = %err, "outstanding gpu work failed while dropping the context");
        }
    }
}
