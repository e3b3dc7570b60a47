//! Native backend built on [`wgpu`].
//!
//! wgpu has no long-lived compute encoder object, so an open compute encoder
//! is a list of recorded [`PassCommand`]s that is replayed into a single
//! compute pass when the encoder closes. Each buffer keeps a CPU staging copy;
//! declared writes are uploaded with `Queue::write_buffer` (applied before the
//! next submission) and synchronizations copy into a mappable readback buffer
//! that is folded back into the staging copy on wait.

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;

use crate::backend::{aligned_range, padded_len, Backend, CompiledKernel, Device, COPY_ALIGNMENT};
use crate::{BufferKind, ComputeError};

const UNIFORM_ALIGNMENT: usize = 16;

const _: () = assert!(wgpu::COPY_BUFFER_ALIGNMENT == COPY_ALIGNMENT as u64);

/// Runtime options for acquiring the native device.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    /// Case-insensitive substring of the adapter name to pick.
    pub adapter_name: Option<String>,
    pub label: String,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            adapter_name: None,
            label: "minicompute".to_owned(),
        }
    }
}

impl DeviceOptions {
    /// Defaults overridden by `WGPU_POWER_PREF` and `WGPU_ADAPTER_NAME`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            power_preference: wgpu::util::power_preference_from_env()
                .unwrap_or(defaults.power_preference),
            adapter_name: std::env::var("WGPU_ADAPTER_NAME").ok().filter(|name| !name.is_empty()),
            ..defaults
        }
    }
}

/// Storage handle: GPU allocation plus its staging copy.
#[derive(Clone)]
pub struct WgpuBuffer(Arc<BufferShared>);

struct BufferShared {
    gpu: wgpu::Buffer,
    staging: Mutex<Vec<u8>>,
}

/// Compiled pipeline handle.
#[derive(Clone)]
pub struct WgpuPipeline(Arc<PipelineShared>);

struct PipelineShared {
    pipeline: wgpu::ComputePipeline,
    layout: Option<wgpu::BindGroupLayout>,
    bindings: Vec<u32>,
}

enum PassCommand {
    SetPipeline(WgpuPipeline),
    SetBuffer(u32, WgpuBuffer),
    Dispatch([u32; 3]),
}

enum OpenEncoder {
    Compute(Vec<PassCommand>),
    Transfer,
}

struct Readback {
    target: WgpuBuffer,
    staging: wgpu::Buffer,
}

/// A device and its serial queue.
pub struct WgpuDevice {
    backend: Backend,
    adapter_info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    command_buffer: Option<wgpu::CommandEncoder>,
    encoder: Option<OpenEncoder>,
    recorded_readbacks: Vec<Readback>,
    in_flight_readbacks: Vec<Readback>,
}

impl WgpuDevice {
    /// Picks an adapter for `backend` and opens a device and queue on it.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::BackendUnavailable`] if no adapter matches or
    /// the device request is refused.
    pub fn acquire(backend: Backend, options: &DeviceOptions) -> Result<Self, ComputeError> {
        let backends = backend.wgpu_backends();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = match &options.adapter_name {
            Some(name) => {
                let wanted = name.to_lowercase();
                instance
                    .enumerate_adapters(backends)
                    .into_iter()
                    .find(|adapter| adapter.get_info().name.to_lowercase().contains(&wanted))
            }
            None => pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })),
        }
        .ok_or_else(|| {
            tracing::warn!(%backend, adapter_name = ?options.adapter_name, "no suitable adapter");
            ComputeError::BackendUnavailable(backend)
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(options.label.as_str()),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|err| {
            tracing::warn!(%backend, error = %err, "device request refused");
            ComputeError::BackendUnavailable(backend)
        })?;

        let adapter_info = adapter.get_info();
        tracing::info!(
            %backend,
            adapter = %adapter_info.name,
            native = ?adapter_info.backend,
            "acquired compute device"
        );

        Ok(Self {
            backend,
            adapter_info,
            device,
            queue,
            command_buffer: None,
            encoder: None,
            recorded_readbacks: Vec::new(),
            in_flight_readbacks: Vec::new(),
        })
    }

    #[must_use]
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    fn encode_compute_pass(&mut self, commands: Vec<PassCommand>) {
        let Some(encoder) = self.command_buffer.as_mut() else {
            return;
        };

        // Bind groups must outlive the pass, so resolve every dispatch first.
        let mut pipeline: Option<WgpuPipeline> = None;
        let mut slots: BTreeMap<u32, WgpuBuffer> = BTreeMap::new();
        let mut dispatches = Vec::new();
        for command in commands {
            match command {
                PassCommand::SetPipeline(next) => pipeline = Some(next),
                PassCommand::SetBuffer(slot, buffer) => {
                    slots.insert(slot, buffer);
                }
                PassCommand::Dispatch(groups) => {
                    let Some(pipeline) = pipeline.clone() else {
                        continue;
                    };
                    let bind_group = pipeline.0.layout.as_ref().map(|layout| {
                        let entries: Vec<_> = pipeline
                            .0
                            .bindings
                            .iter()
                            .filter_map(|slot| {
                                slots.get(slot).map(|buffer| wgpu::BindGroupEntry {
                                    binding: *slot,
                                    resource: buffer.0.gpu.as_entire_binding(),
                                })
                            })
                            .collect();
                        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some("minicompute bind group"),
                            layout,
                            entries: &entries,
                        })
                    });
                    dispatches.push((pipeline, bind_group, groups));
                }
            }
        }

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("minicompute pass"),
            timestamp_writes: None,
        });
        for (pipeline, bind_group, groups) in &dispatches {
            pass.set_pipeline(&pipeline.0.pipeline);
            if let Some(bind_group) = bind_group {
                pass.set_bind_group(0, bind_group, &[]);
            }
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
    }
}

impl Device for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Pipeline = WgpuPipeline;

    fn backend(&self) -> Backend {
        self.backend
    }

    fn create_buffer(&mut self, len: usize, kind: BufferKind) -> WgpuBuffer {
        let mut usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let alignment = match kind {
            BufferKind::Constant => {
                usage |= wgpu::BufferUsages::UNIFORM;
                UNIFORM_ALIGNMENT
            }
            BufferKind::Structured { .. } => COPY_ALIGNMENT,
        };
        let padded = padded_len(len, alignment);
        let gpu = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("minicompute buffer"),
            size: padded as u64,
            usage,
            mapped_at_creation: false,
        });
        WgpuBuffer(Arc::new(BufferShared {
            gpu,
            staging: Mutex::new(vec![0; padded]),
        }))
    }

    fn write_staging(&mut self, buffer: &WgpuBuffer, offset: usize, bytes: &[u8]) {
        let mut staging = buffer.0.staging.lock();
        staging[offset..offset + bytes.len()].copy_from_slice(bytes);
        let (start, end) = aligned_range(offset, bytes.len(), COPY_ALIGNMENT);
        self.queue
            .write_buffer(&buffer.0.gpu, start as u64, &staging[start..end]);
    }

    fn refresh_edges(
        &mut self,
        buffer: &WgpuBuffer,
        offset: usize,
        len: usize,
    ) -> Result<(), ComputeError> {
        let (start, end) = aligned_range(offset, len, COPY_ALIGNMENT);
        let write_end = offset + len;
        if start == offset && end == write_end {
            return Ok(());
        }

        // Queued writes are applied ahead of this submission, so the copy
        // sees committed work plus every declared write.
        let size = (end - start) as u64;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("minicompute edge readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("minicompute edge readback"),
            });
        encoder.copy_buffer_to_buffer(&buffer.0.gpu, start as u64, &readback, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        await_mapping(&rx)?;
        {
            let mapped = readback.slice(..).get_mapped_range();
            let mut staging = buffer.0.staging.lock();
            staging[start..offset].copy_from_slice(&mapped[..offset - start]);
            staging[write_end..end].copy_from_slice(&mapped[write_end - start..]);
        }
        readback.unmap();
        tracing::trace!(start, end, "refreshed edge bytes from the gpu");
        Ok(())
    }

    fn read_staging(&self, buffer: &WgpuBuffer, offset: usize, dest: &mut [u8]) {
        let staging = buffer.0.staging.lock();
        dest.copy_from_slice(&staging[offset..offset + dest.len()]);
    }

    fn compile_kernel(
        &mut self,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledKernel<WgpuPipeline>, ComputeError> {
        let reflection = reflect(source, entry_point)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(entry_point),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        let layout = (!reflection.bindings.is_empty()).then(|| pipeline.get_bind_group_layout(0));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::PipelineBuild(err.to_string()));
        }

        Ok(CompiledKernel {
            pipeline: WgpuPipeline(Arc::new(PipelineShared {
                pipeline,
                layout,
                bindings: reflection.bindings.clone(),
            })),
            workgroup_size: Some(reflection.workgroup_size),
            bindings: reflection.bindings,
        })
    }

    fn begin_command_buffer(&mut self) {
        self.command_buffer = Some(self.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor {
                label: Some("minicompute command buffer"),
            },
        ));
    }

    fn begin_compute_encoder(&mut self) {
        self.encoder = Some(OpenEncoder::Compute(Vec::new()));
    }

    fn begin_transfer_encoder(&mut self) {
        self.encoder = Some(OpenEncoder::Transfer);
    }

    fn end_encoder(&mut self) {
        match self.encoder.take() {
            Some(OpenEncoder::Compute(commands)) => self.encode_compute_pass(commands),
            Some(OpenEncoder::Transfer) | None => {}
        }
    }

    fn set_pipeline(&mut self, pipeline: &WgpuPipeline) {
        if let Some(OpenEncoder::Compute(commands)) = self.encoder.as_mut() {
            commands.push(PassCommand::SetPipeline(pipeline.clone()));
        }
    }

    fn set_buffer(&mut self, slot: u32, buffer: &WgpuBuffer) {
        if let Some(OpenEncoder::Compute(commands)) = self.encoder.as_mut() {
            commands.push(PassCommand::SetBuffer(slot, buffer.clone()));
        }
    }

    fn dispatch_threadgroups(&mut self, groups: [u32; 3], _group_size: [u32; 3]) {
        // The group size is baked into the WGSL entry point.
        if let Some(OpenEncoder::Compute(commands)) = self.encoder.as_mut() {
            commands.push(PassCommand::Dispatch(groups));
        }
    }

    fn synchronize_resource(&mut self, buffer: &WgpuBuffer) {
        let Some(encoder) = self.command_buffer.as_mut() else {
            return;
        };
        let size = buffer.0.gpu.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("minicompute readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&buffer.0.gpu, 0, &staging, 0, size);
        self.recorded_readbacks.push(Readback {
            target: buffer.clone(),
            staging,
        });
    }

    fn commit(&mut self) {
        if let Some(encoder) = self.command_buffer.take() {
            self.queue.submit(Some(encoder.finish()));
            self.in_flight_readbacks.append(&mut self.recorded_readbacks);
        }
    }

    fn wait_until_completed(&mut self) -> Result<(), ComputeError> {
        let readbacks = std::mem::take(&mut self.in_flight_readbacks);
        let receivers: Vec<_> = readbacks
            .iter()
            .map(|readback| {
                let (tx, rx) = mpsc::channel();
                readback
                    .staging
                    .slice(..)
                    .map_async(wgpu::MapMode::Read, move |result| {
                        let _ = tx.send(result);
                    });
                rx
            })
            .collect();

        let _ = self.device.poll(wgpu::Maintain::Wait);

        for (readback, rx) in readbacks.iter().zip(receivers) {
            await_mapping(&rx)?;
            {
                let mapped = readback.staging.slice(..).get_mapped_range();
                readback.target.0.staging.lock().copy_from_slice(&mapped);
            }
            readback.staging.unmap();
        }
        Ok(())
    }
}

fn await_mapping(
    rx: &mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
) -> Result<(), ComputeError> {
    rx.recv()
        .map_err(|_| ComputeError::DeviceLost("readback mapping was abandoned".to_owned()))?
        .map_err(|err| ComputeError::DeviceLost(err.to_string()))
}

struct Reflection {
    workgroup_size: [u32; 3],
    bindings: Vec<u32>,
}

/// Parses and validates WGSL with naga and describes `entry_point`.
fn reflect(source: &str, entry_point: &str) -> Result<Reflection, ComputeError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| ComputeError::ShaderCompile {
        description: err.message().to_owned(),
        reason: err.emit_to_string(source),
    })?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|err| ComputeError::ShaderCompile {
        description: "kernel source failed validation".to_owned(),
        reason: err.emit_to_string(source),
    })?;

    let index = module
        .entry_points
        .iter()
        .position(|ep| ep.stage == naga::ShaderStage::Compute && ep.name == entry_point)
        .ok_or_else(|| ComputeError::MissingEntryPoint(entry_point.to_owned()))?;
    let function_info = info.get_entry_point(index);

    let mut bindings = Vec::new();
    for (handle, variable) in module.global_variables.iter() {
        let Some(binding) = &variable.binding else {
            continue;
        };
        if function_info[handle].is_empty() {
            continue;
        }
        if binding.group != 0 {
            return Err(ComputeError::ShaderCompile {
                description: format!("`{entry_point}` uses bind group {}", binding.group),
                reason: "only bind group 0 is supported".to_owned(),
            });
        }
        bindings.push(binding.binding);
    }
    bindings.sort_unstable();
    bindings.dedup();

    Ok(Reflection {
        workgroup_size: module.entry_points[index].workgroup_size,
        bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILL: &str = r"
@group(0) @binding(0) var<storage, read_write> out: array<u32>;
@group(0) @binding(1) var<uniform> params: vec4<u32>;

@compute @workgroup_size(64)
fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&out)) {
        out[id.x] = params.x + id.x;
    }
}

@compute @workgroup_size(8, 8, 1)
fn clear(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&out)) {
        out[id.x] = 0u;
    }
}
";

    #[test]
    fn reflects_workgroup_size_and_used_bindings() {
        let fill = reflect(FILL, "fill").unwrap();
        assert_eq!(fill.workgroup_size, [64, 1, 1]);
        assert_eq!(fill.bindings, vec![0, 1]);

        let clear = reflect(FILL, "clear").unwrap();
        assert_eq!(clear.workgroup_size, [8, 8, 1]);
        assert_eq!(clear.bindings, vec![0]);
    }

    #[test]
    fn unknown_entry_point_is_reported_by_name() {
        match reflect(FILL, "missing") {
            Err(ComputeError::MissingEntryPoint(name)) => assert_eq!(name, "missing"),
            other => panic!("expected MissingEntryPoint, got {:?}", other.err()),
        }
    }

    #[test]
    fn syntax_errors_carry_a_rendered_diagnostic() {
        match reflect("@compute fn broken( {", "broken") {
            Err(ComputeError::ShaderCompile { reason, .. }) => assert!(!reason.is_empty()),
            other => panic!("expected ShaderCompile, got {:?}", other.err()),
        }
    }

    #[test]
    fn bindings_outside_group_zero_are_rejected() {
        let source = r"
@group(1) @binding(0) var<storage, read_write> out: array<u32>;
@compute @workgroup_size(1)
fn main() { out[0] = 1u; }
";
        assert!(matches!(
            reflect(source, "main"),
            Err(ComputeError::ShaderCompile { .. })
        ));
    }
}
