//! A recording CPU [`Device`] for exercising the context without a GPU.
//!
//! Memory is modelled as discrete: every buffer has a GPU copy and a CPU
//! staging copy, and neither sees the other except through declared writes
//! (uploaded at commit, widened to whole copy words like the native
//! backend) and synchronizations (copied back on execution).
//! Committed work does not execute until [`Device::wait_until_completed`], so
//! a read that skips the synchronization barrier observes stale bytes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{aligned_range, padded_len, Backend, CompiledKernel, Device, COPY_ALIGNMENT};
use crate::{BufferKind, ComputeError};

/// CPU stand-in for a kernel entry point.
pub type MockKernelFn = Arc<dyn Fn(&mut MockInvocation<'_>) + Send + Sync>;

/// What a mock kernel sees when it runs.
pub struct MockInvocation<'a> {
    slots: &'a mut BTreeMap<u32, Vec<u8>>,
    pub groups: [u32; 3],
    pub group_size: [u32; 3],
}

impl MockInvocation<'_> {
    /// GPU-side bytes of the buffer bound at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if nothing is bound at `slot`.
    pub fn slot(&mut self, slot: u32) -> &mut [u8] {
        self.slots
            .get_mut(&slot)
            .unwrap_or_else(|| panic!("mock kernel read unbound slot {slot}"))
    }

    /// Total threads launched per axis (whole groups).
    #[must_use]
    pub fn threads(&self) -> [u32; 3] {
        [
            self.groups[0].saturating_mul(self.group_size[0]),
            self.groups[1].saturating_mul(self.group_size[1]),
            self.groups[2].saturating_mul(self.group_size[2]),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    BeginCommandBuffer,
    BeginComputeEncoder,
    BeginTransferEncoder,
    EndEncoder,
    SetBuffer(u32),
    Dispatch { groups: [u32; 3], group_size: [u32; 3] },
    Synchronize,
    Commit,
    Wait,
    /// Blocking readback of the partial words around an unaligned write.
    EdgeReadback,
}

/// Everything the device has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub events: Vec<MockEvent>,
    pub commits: usize,
    pub waits: usize,
    pub dispatches_executed: usize,
    /// Command buffers committed but not yet executed.
    pub pending_command_buffers: usize,
    /// Whether a command buffer is open and uncommitted.
    pub open_command_buffer: bool,
}

impl MockLog {
    /// No open or committed-but-unexecuted command buffer remains.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending_command_buffers == 0 && !self.open_command_buffer
    }
}

/// Handle for inspecting a [`MockDevice`] after it moved into a context.
#[derive(Clone)]
pub struct MockProbe(Arc<Mutex<MockLog>>);

impl MockProbe {
    #[must_use]
    pub fn snapshot(&self) -> MockLog {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        let mut log = self.0.lock();
        log.events.clear();
        log.commits = 0;
        log.waits = 0;
        log.dispatches_executed = 0;
    }
}

struct MockMemory {
    gpu: Mutex<Vec<u8>>,
    cpu: Mutex<Vec<u8>>,
}

#[derive(Clone)]
pub struct MockBuffer(Arc<MockMemory>);

impl MockBuffer {
    /// Current GPU-side contents, bypassing the staging copy.
    #[must_use]
    pub fn gpu_bytes(&self) -> Vec<u8> {
        self.0.gpu.lock().clone()
    }
}

#[derive(Clone)]
pub struct MockPipeline {
    name: String,
    kernel: MockKernelFn,
}

#[derive(Clone)]
struct RegisteredKernel {
    kernel: MockKernelFn,
    workgroup_size: Option<[u32; 3]>,
    bindings: Vec<u32>,
}

enum MockOp {
    /// Bytes captured from the staging copy at write time.
    Upload(MockBuffer, usize, Vec<u8>),
    SetPipeline(MockPipeline),
    SetBuffer(u32, MockBuffer),
    Dispatch { groups: [u32; 3], group_size: [u32; 3] },
    Synchronize(MockBuffer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockEncoder {
    Compute,
    Transfer,
}

/// Recording device whose kernels are Rust closures registered by name.
#[derive(Default)]
pub struct MockDevice {
    kernels: HashMap<String, RegisteredKernel>,
    log: Arc<Mutex<MockLog>>,
    uploads: Vec<MockOp>,
    recording: Option<Vec<MockOp>>,
    encoder: Option<MockEncoder>,
    committed: Vec<Vec<MockOp>>,
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("encoder", &self.encoder)
            .field("committed", &self.committed.len())
            .finish_non_exhaustive()
    }
}

impl MockDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` as a kernel with no fixed group size.
    #[must_use]
    pub fn with_kernel<F>(self, name: &str, kernel: F) -> Self
    where
        F: Fn(&mut MockInvocation<'_>) + Send + Sync + 'static,
    {
        self.register(name, None, Vec::new(), Arc::new(kernel))
    }

    /// Registers `name` with a declared group size and the slots it uses.
    #[must_use]
    pub fn with_declared_kernel<F>(
        self,
        name: &str,
        workgroup_size: [u32; 3],
        bindings: &[u32],
        kernel: F,
    ) -> Self
    where
        F: Fn(&mut MockInvocation<'_>) + Send + Sync + 'static,
    {
        self.register(name, Some(workgroup_size), bindings.to_vec(), Arc::new(kernel))
    }

    fn register(
        mut self,
        name: &str,
        workgroup_size: Option<[u32; 3]>,
        bindings: Vec<u32>,
        kernel: MockKernelFn,
    ) -> Self {
        self.kernels.insert(
            name.to_owned(),
            RegisteredKernel {
                kernel,
                workgroup_size,
                bindings,
            },
        );
        self
    }

    #[must_use]
    pub fn probe(&self) -> MockProbe {
        MockProbe(Arc::clone(&self.log))
    }

    fn record_event(&self, event: MockEvent) {
        self.log.lock().events.push(event);
    }

    fn record_op(&mut self, op: MockOp) {
        assert_eq!(
            self.encoder,
            Some(MockEncoder::Compute),
            "compute command recorded outside a compute encoder"
        );
        if let Some(ops) = self.recording.as_mut() {
            ops.push(op);
        }
    }

    fn execute(ops: Vec<MockOp>, log: &Mutex<MockLog>) {
        let mut pipeline: Option<MockPipeline> = None;
        let mut bound: BTreeMap<u32, MockBuffer> = BTreeMap::new();
        for op in ops {
            match op {
                MockOp::Upload(buffer, start, bytes) => {
                    buffer.0.gpu.lock()[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                MockOp::SetPipeline(next) => pipeline = Some(next),
                MockOp::SetBuffer(slot, buffer) => {
                    bound.insert(slot, buffer);
                }
                MockOp::Dispatch { groups, group_size } => {
                    let Some(pipeline) = pipeline.as_ref() else {
                        continue;
                    };
                    let mut slots: BTreeMap<u32, Vec<u8>> = bound
                        .iter()
                        .map(|(slot, buffer)| (*slot, buffer.0.gpu.lock().clone()))
                        .collect();
                    (pipeline.kernel)(&mut MockInvocation {
                        slots: &mut slots,
                        groups,
                        group_size,
                    });
                    for (slot, bytes) in slots {
                        if let Some(buffer) = bound.get(&slot) {
                            *buffer.0.gpu.lock() = bytes;
                        }
                    }
                    log.lock().dispatches_executed += 1;
                    tracing::trace!(kernel = %pipeline.name, ?groups, "mock dispatch executed");
                }
                MockOp::Synchronize(buffer) => {
                    let gpu = buffer.0.gpu.lock();
                    buffer.0.cpu.lock().copy_from_slice(&gpu);
                }
            }
        }
    }
}

impl Device for MockDevice {
    type Buffer = MockBuffer;
    type Pipeline = MockPipeline;

    fn backend(&self) -> Backend {
        Backend::ACTIVE
    }

    fn create_buffer(&mut self, len: usize, _kind: BufferKind) -> MockBuffer {
        let padded = padded_len(len, COPY_ALIGNMENT);
        MockBuffer(Arc::new(MockMemory {
            gpu: Mutex::new(vec![0; padded]),
            cpu: Mutex::new(vec![0; padded]),
        }))
    }

    fn write_staging(&mut self, buffer: &MockBuffer, offset: usize, bytes: &[u8]) {
        let mut cpu = buffer.0.cpu.lock();
        cpu[offset..offset + bytes.len()].copy_from_slice(bytes);
        let (start, end) = aligned_range(offset, bytes.len(), COPY_ALIGNMENT);
        self.uploads
            .push(MockOp::Upload(buffer.clone(), start, cpu[start..end].to_vec()));
    }

    fn refresh_edges(
        &mut self,
        buffer: &MockBuffer,
        offset: usize,
        len: usize,
    ) -> Result<(), ComputeError> {
        let (start, end) = aligned_range(offset, len, COPY_ALIGNMENT);
        let write_end = offset + len;
        if start == offset && end == write_end {
            return Ok(());
        }

        // Committed work and every declared write reach the GPU copy first.
        for ops in std::mem::take(&mut self.committed) {
            Self::execute(ops, &self.log);
            self.log.lock().pending_command_buffers -= 1;
        }
        Self::execute(std::mem::take(&mut self.uploads), &self.log);

        let gpu = buffer.0.gpu.lock();
        let mut cpu = buffer.0.cpu.lock();
        cpu[start..offset].copy_from_slice(&gpu[start..offset]);
        cpu[write_end..end].copy_from_slice(&gpu[write_end..end]);
        drop((cpu, gpu));
        self.record_event(MockEvent::EdgeReadback);
        Ok(())
    }

    fn read_staging(&self, buffer: &MockBuffer, offset: usize, dest: &mut [u8]) {
        dest.copy_from_slice(&buffer.0.cpu.lock()[offset..offset + dest.len()]);
    }

    fn compile_kernel(
        &mut self,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledKernel<MockPipeline>, ComputeError> {
        if source.trim().is_empty() {
            return Err(ComputeError::ShaderCompile {
                description: "empty kernel source".to_owned(),
                reason: "no declarations".to_owned(),
            });
        }
        let registered = self
            .kernels
            .get(entry_point)
            .filter(|_| source.contains(entry_point))
            .ok_or_else(|| ComputeError::MissingEntryPoint(entry_point.to_owned()))?;
        Ok(CompiledKernel {
            pipeline: MockPipeline {
                name: entry_point.to_owned(),
                kernel: Arc::clone(&registered.kernel),
            },
            workgroup_size: registered.workgroup_size,
            bindings: registered.bindings.clone(),
        })
    }

    fn begin_command_buffer(&mut self) {
        assert!(self.recording.is_none(), "command buffer already open");
        self.recording = Some(Vec::new());
        self.log.lock().open_command_buffer = true;
        self.record_event(MockEvent::BeginCommandBuffer);
    }

    fn begin_compute_encoder(&mut self) {
        assert!(self.recording.is_some(), "encoder opened outside a command buffer");
        assert!(self.encoder.is_none(), "encoder opened while another is open");
        self.encoder = Some(MockEncoder::Compute);
        self.record_event(MockEvent::BeginComputeEncoder);
    }

    fn begin_transfer_encoder(&mut self) {
        assert!(self.recording.is_some(), "encoder opened outside a command buffer");
        assert!(self.encoder.is_none(), "encoder opened while another is open");
        self.encoder = Some(MockEncoder::Transfer);
        self.record_event(MockEvent::BeginTransferEncoder);
    }

    fn end_encoder(&mut self) {
        assert!(self.encoder.take().is_some(), "no encoder to end");
        self.record_event(MockEvent::EndEncoder);
    }

    fn set_pipeline(&mut self, pipeline: &MockPipeline) {
        self.record_op(MockOp::SetPipeline(pipeline.clone()));
    }

    fn set_buffer(&mut self, slot: u32, buffer: &MockBuffer) {
        self.record_op(MockOp::SetBuffer(slot, buffer.clone()));
        self.record_event(MockEvent::SetBuffer(slot));
    }

    fn dispatch_threadgroups(&mut self, groups: [u32; 3], group_size: [u32; 3]) {
        self.record_op(MockOp::Dispatch { groups, group_size });
        self.record_event(MockEvent::Dispatch { groups, group_size });
    }

    fn synchronize_resource(&mut self, buffer: &MockBuffer) {
        assert_eq!(
            self.encoder,
            Some(MockEncoder::Transfer),
            "synchronize outside a transfer encoder"
        );
        if let Some(ops) = self.recording.as_mut() {
            ops.push(MockOp::Synchronize(buffer.clone()));
        }
        self.record_event(MockEvent::Synchronize);
    }

    fn commit(&mut self) {
        assert!(self.encoder.is_none(), "commit with an encoder open");
        assert!(self.recording.is_some(), "commit without a command buffer");
        let recorded = self.recording.take().unwrap_or_default();
        let mut ops = std::mem::take(&mut self.uploads);
        ops.extend(recorded);
        self.committed.push(ops);
        {
            let mut log = self.log.lock();
            log.commits += 1;
            log.pending_command_buffers += 1;
            log.open_command_buffer = false;
        }
        self.record_event(MockEvent::Commit);
    }

    fn wait_until_completed(&mut self) -> Result<(), ComputeError> {
        for ops in std::mem::take(&mut self.committed) {
            Self::execute(ops, &self.log);
            self.log.lock().pending_command_buffers -= 1;
        }
        self.log.lock().waits += 1;
        self.record_event(MockEvent::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn increment(invocation: &mut MockInvocation<'_>) {
        for byte in invocation.slot(0) {
            *byte += 1;
        }
    }

    #[test]
    fn committed_work_runs_only_on_wait() {
        let mut device = MockDevice::new().with_kernel("inc", increment);
        let probe = device.probe();
        let buffer = device.create_buffer(4, BufferKind::Constant);
        let kernel = device.compile_kernel("fn inc", "inc").unwrap();

        device.begin_command_buffer();
        device.begin_compute_encoder();
        device.set_pipeline(&kernel.pipeline);
        device.set_buffer(0, &buffer);
        device.dispatch_threadgroups([1, 1, 1], [4, 1, 1]);
        device.end_encoder();
        device.commit();

        assert_eq!(buffer.gpu_bytes(), vec![0; 4]);
        assert_eq!(probe.snapshot().pending_command_buffers, 1);

        device.wait_until_completed().unwrap();
        assert_eq!(buffer.gpu_bytes(), vec![1; 4]);
        assert!(probe.snapshot().is_drained());
    }

    #[test]
    fn staging_copy_is_stale_until_synchronized() {
        let mut device = MockDevice::new().with_kernel("inc", increment);
        let buffer = device.create_buffer(2, BufferKind::Constant);
        let kernel = device.compile_kernel("inc", "inc").unwrap();

        device.begin_command_buffer();
        device.begin_compute_encoder();
        device.set_pipeline(&kernel.pipeline);
        device.set_buffer(0, &buffer);
        device.dispatch_threadgroups([1, 1, 1], [1, 1, 1]);
        device.end_encoder();
        device.commit();
        device.wait_until_completed().unwrap();

        let mut bytes = [9u8; 2];
        device.read_staging(&buffer, 0, &mut bytes);
        assert_eq!(bytes, [0, 0]);

        device.begin_command_buffer();
        device.begin_transfer_encoder();
        device.synchronize_resource(&buffer);
        device.end_encoder();
        device.commit();
        device.wait_until_completed().unwrap();

        device.read_staging(&buffer, 0, &mut bytes);
        assert_eq!(bytes, [1, 1]);
    }

    #[test]
    fn writes_reach_the_gpu_at_the_next_commit() {
        let mut device = MockDevice::new();
        let buffer = device.create_buffer(4, BufferKind::Constant);
        device.write_staging(&buffer, 1, &[7, 8]);
        assert_eq!(buffer.gpu_bytes(), vec![0; 4]);

        device.begin_command_buffer();
        device.commit();
        device.wait_until_completed().unwrap();
        assert_eq!(buffer.gpu_bytes(), vec![0, 7, 8, 0]);
    }

    #[test]
    fn uploads_cover_whole_words_from_the_staging_copy() {
        let mut device = MockDevice::new();
        let buffer = device.create_buffer(6, BufferKind::Constant);
        assert_eq!(buffer.gpu_bytes().len(), 8);
        buffer.0.gpu.lock().fill(5);

        device.write_staging(&buffer, 5, &[7]);
        device.begin_command_buffer();
        device.commit();
        device.wait_until_completed().unwrap();
        assert_eq!(buffer.gpu_bytes(), vec![5, 5, 5, 5, 0, 7, 0, 0]);
    }

    #[test]
    fn edge_refresh_preserves_gpu_bytes_beside_a_write() {
        let mut device = MockDevice::new();
        let probe = device.probe();
        let buffer = device.create_buffer(8, BufferKind::Constant);
        buffer.0.gpu.lock().fill(5);

        device.refresh_edges(&buffer, 4, 4).unwrap();
        assert!(probe.snapshot().events.is_empty());

        device.refresh_edges(&buffer, 5, 1).unwrap();
        device.write_staging(&buffer, 5, &[7]);
        device.begin_command_buffer();
        device.commit();
        device.wait_until_completed().unwrap();
        assert_eq!(buffer.gpu_bytes(), vec![5, 5, 5, 5, 5, 7, 5, 5]);
        assert_eq!(probe.snapshot().events[0], MockEvent::EdgeReadback);
    }

    #[test]
    fn thread_count_saturates() {
        let mut slots = BTreeMap::new();
        let invocation = MockInvocation {
            slots: &mut slots,
            groups: [u32::MAX / 2 + 1, 1, 0],
            group_size: [2, 1, 8],
        };
        assert_eq!(invocation.threads(), [u32::MAX, 1, 0]);
    }

    #[test]
    fn unknown_or_empty_sources_fail_to_compile() {
        let mut device = MockDevice::new().with_kernel("inc", increment);
        assert!(matches!(
            device.compile_kernel("   ", "inc"),
            Err(ComputeError::ShaderCompile { .. })
        ));
        assert!(matches!(
            device.compile_kernel("fn other", "inc"),
            Err(ComputeError::MissingEntryPoint(_))
        ));
        assert!(matches!(
            device.compile_kernel("fn nope", "nope"),
            Err(ComputeError::MissingEntryPoint(_))
        ));
    }

    #[test]
    #[should_panic(expected = "encoder opened while another is open")]
    fn rejects_a_second_open_encoder() {
        let mut device = MockDevice::new();
        device.begin_command_buffer();
        device.begin_compute_encoder();
        device.begin_transfer_encoder();
    }
}
