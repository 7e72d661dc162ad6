use pollster::block_on;
use tracing::{debug, info};
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    Adapter, Backend, Backends, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingType, BufferBindingType,
    BufferDescriptor, BufferUsages, CommandEncoderDescriptor, CompilationMessageType,
    ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor, DeviceDescriptor,
    DeviceType, ErrorFilter, Instance, InstanceDescriptor, Maintain, MapMode,
    PipelineCompilationOptions, PipelineLayoutDescriptor, ShaderModule, ShaderModuleDescriptor,
    ShaderSource, ShaderStages,
};

use super::api::{
    declares_entry, dispatch_size, BufferAccess, ComputeApi, ComputeContext, DeviceInfo, KernelArg,
};
use crate::{DeviceClass, Error, IndexSpace, KernelSignature, ParamRole, Result};

/// wgpu as a compute runtime. Each wgpu backend (Vulkan, Metal, DX12, GL)
/// that exposes at least one adapter counts as a platform.
pub struct WgpuApi {
    instance: Instance,
    backends: Backends,
}

impl WgpuApi {
    pub fn new(backends: Backends) -> Self {
        let instance = Instance::new(InstanceDescriptor {
            backends,
            ..Default::default()
        });
        Self { instance, backends }
    }
}

impl Default for WgpuApi {
    fn default() -> Self {
        Self::new(Backends::all())
    }
}

pub fn device_class(device_type: DeviceType) -> DeviceClass {
    match device_type {
        DeviceType::DiscreteGpu | DeviceType::IntegratedGpu | DeviceType::VirtualGpu => {
            DeviceClass::Gpu
        }
        DeviceType::Cpu => DeviceClass::Cpu,
        DeviceType::Other => DeviceClass::Accelerator,
    }
}

impl ComputeApi for WgpuApi {
    type Platform = Backend;
    type Device = Adapter;
    type Context = WgpuContext;

    fn platforms(&self) -> Result<Vec<Backend>> {
        let mut found = Vec::new();
        for adapter in self.instance.enumerate_adapters(self.backends) {
            let backend = adapter.get_info().backend;
            if !found.contains(&backend) {
                found.push(backend);
            }
        }
        Ok(found)
    }

    fn platform_name(&self, platform: &Backend) -> String {
        format!("{:?}", platform)
    }

    fn devices(&self, platform: &Backend, class: DeviceClass) -> Result<Vec<Adapter>> {
        Ok(self
            .instance
            .enumerate_adapters(Backends::from(*platform))
            .into_iter()
            .filter(|adapter| class.accepts(device_class(adapter.get_info().device_type)))
            .collect())
    }

    fn device_info(&self, device: &Adapter) -> DeviceInfo {
        let info = device.get_info();
        DeviceInfo { name: info.name, class: device_class(info.device_type) }
    }

    fn create_context(&self, adapter: Adapter) -> Result<WgpuContext> {
        let (device, queue) = block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("throughput"),
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| Error::ContextError(e.to_string()))?;
        let max_dim = device.limits().max_compute_workgroups_per_dimension;
        info!(adapter = %adapter.get_info().name, max_dim, "wgpu device created");
        Ok(WgpuContext { device, queue, max_dim, in_flight: Vec::new() })
    }
}

pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_dim: u32,
    /// Uniform buffers holding scalar arguments of submitted launches.
    in_flight: Vec<wgpu::Buffer>,
}

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
}

impl Drop for WgpuBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

pub struct WgpuProgram {
    module: ShaderModule,
    source: String,
}

pub struct WgpuKernel {
    pipeline: ComputePipeline,
    layout: BindGroupLayout,
    signature: KernelSignature,
    workgroup: [u32; 2],
}

impl WgpuContext {
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(ErrorFilter::Validation);
        let out = f();
        (out, block_on(self.device.pop_error_scope()))
    }
}

impl ComputeContext for WgpuContext {
    type Buffer = WgpuBuffer;
    type Program = WgpuProgram;
    type Kernel = WgpuKernel;

    fn build_program(&mut self, source: &str) -> Result<WgpuProgram> {
        let (module, scope_err) = self.scoped(|| {
            self.device.create_shader_module(ShaderModuleDescriptor {
                label: Some("kernels"),
                source: ShaderSource::Wgsl(source.into()),
            })
        });
        let info = block_on(module.get_compilation_info());
        let mut diagnostics: Vec<String> = info
            .messages
            .iter()
            .filter(|m| matches!(m.message_type, CompilationMessageType::Error))
            .map(|m| match &m.location {
                Some(loc) => format!("line {}:{}: {}", loc.line_number, loc.line_position, m.message),
                None => m.message.clone(),
            })
            .collect();
        if diagnostics.is_empty() {
            if let Some(err) = scope_err {
                diagnostics.push(err.to_string());
            }
        }
        if !diagnostics.is_empty() {
            return Err(Error::BuildError(diagnostics.join("\n")));
        }
        debug!(source_len = source.len(), "wgpu_program_built");
        Ok(WgpuProgram { module, source: source.to_string() })
    }

    fn create_kernel(
        &mut self,
        program: &WgpuProgram,
        signature: &KernelSignature,
        workgroup: [u32; 2],
    ) -> Result<WgpuKernel> {
        let entry = signature.entry_point.as_str();
        if !declares_entry(&program.source, entry) {
            return Err(Error::BuildError(format!("entry point `{}` not found in program", entry)));
        }
        let entries: Vec<BindGroupLayoutEntry> = signature
            .params
            .iter()
            .enumerate()
            .map(|(binding, param)| BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: ShaderStages::COMPUTE,
                ty: BindingType::Buffer {
                    ty: match param.role {
                        ParamRole::Input => BufferBindingType::Storage { read_only: true },
                        ParamRole::Output => BufferBindingType::Storage { read_only: false },
                        ParamRole::Scalar => BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let ((layout, pipeline), scope_err) = self.scoped(|| {
            let layout = self.device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some(entry),
                entries: &entries,
            });
            let pipeline_layout = self.device.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(entry),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = self.device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &program.module,
                entry_point: Some(entry),
                compilation_options: PipelineCompilationOptions::default(),
                cache: None,
            });
            (layout, pipeline)
        });
        if let Some(err) = scope_err {
            return Err(Error::KernelArgMismatch(format!(
                "`{}` rejects the declared bindings: {}",
                entry, err
            )));
        }
        Ok(WgpuKernel { pipeline, layout, signature: signature.clone(), workgroup })
    }

    fn create_buffer(&mut self, len_bytes: usize, access: BufferAccess) -> Result<WgpuBuffer> {
        // Zero-sized bindings are invalid; sizes stay 4-byte aligned.
        let size = (len_bytes.max(4) as u64 + 3) & !3;
        let usage = match access {
            BufferAccess::ReadOnly => BufferUsages::STORAGE | BufferUsages::COPY_DST,
            BufferAccess::WriteOnly => BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        };
        let (buffer, scope_err) = self.scoped(|| {
            self.device.create_buffer(&BufferDescriptor {
                label: None,
                size,
                usage,
                mapped_at_creation: false,
            })
        });
        if let Some(err) = scope_err {
            return Err(Error::TransferError(format!("allocating {} bytes: {}", size, err)));
        }
        Ok(WgpuBuffer { buffer })
    }

    fn write_buffer(&mut self, buffer: &WgpuBuffer, data: &[u8]) -> Result<()> {
        let ((), scope_err) = self.scoped(|| {
            self.queue.write_buffer(&buffer.buffer, 0, data);
            self.queue.submit(std::iter::empty());
        });
        self.device.poll(Maintain::Wait);
        match scope_err {
            Some(err) => Err(Error::TransferError(err.to_string())),
            None => Ok(()),
        }
    }

    fn enqueue_kernel(
        &mut self,
        kernel: &WgpuKernel,
        args: &[KernelArg<'_, WgpuBuffer>],
        space: IndexSpace,
    ) -> Result<()> {
        let params = &kernel.signature.params;
        if args.len() != params.len() {
            return Err(Error::KernelArgMismatch(format!(
                "`{}` takes {} arguments, got {}",
                kernel.signature.entry_point,
                params.len(),
                args.len()
            )));
        }
        let mut scalars = Vec::new();
        for (idx, (param, arg)) in params.iter().zip(args).enumerate() {
            match (param.role, arg) {
                (ParamRole::Scalar, KernelArg::U32(v)) => {
                    // Uniform scalars are padded to 16 bytes.
                    scalars.push(self.device.create_buffer_init(&BufferInitDescriptor {
                        label: Some(param.name.as_str()),
                        contents: bytemuck::cast_slice(&[*v, 0, 0, 0]),
                        usage: BufferUsages::UNIFORM,
                    }));
                }
                (ParamRole::Input | ParamRole::Output, KernelArg::Buffer(_)) => {}
                _ => {
                    return Err(Error::KernelArgMismatch(format!(
                        "argument {} does not fit parameter `{}` ({:?})",
                        idx, param.name, param.role
                    )))
                }
            }
        }

        let mut next_scalar = scalars.iter();
        let mut entries = Vec::with_capacity(args.len());
        for (binding, arg) in args.iter().enumerate() {
            let buffer = match arg {
                KernelArg::Buffer(buf) => &buf.buffer,
                KernelArg::U32(_) => next_scalar
                    .next()
                    .ok_or_else(|| Error::KernelArgMismatch("scalar argument lost".into()))?,
            };
            entries.push(BindGroupEntry { binding: binding as u32, resource: buffer.as_entire_binding() });
        }

        let (groups_x, groups_y, groups_z) = dispatch_size(space, kernel.workgroup, self.max_dim);
        let ((), scope_err) = self.scoped(|| {
            let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
                label: None,
                layout: &kernel.layout,
                entries: &entries,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&CommandEncoderDescriptor { label: Some("launch") });
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: None,
                    timestamp_writes: None,
                });
                pass.set_pipeline(&kernel.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, groups_z);
            }
            self.queue.submit(Some(encoder.finish()));
        });
        if let Some(err) = scope_err {
            return Err(Error::ExecutionError(err.to_string()));
        }
        debug!(groups_x, groups_y, groups_z, entry = %kernel.signature.entry_point, "wgpu_dispatch");
        self.in_flight.extend(scalars);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.device.poll(Maintain::Wait);
        self.in_flight.clear();
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &WgpuBuffer, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let size = out.len() as u64;
        let (staging, scope_err) = self.scoped(|| {
            let staging = self.device.create_buffer(&BufferDescriptor {
                label: Some("readback"),
                size,
                usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&CommandEncoderDescriptor { label: Some("readback") });
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
            staging
        });
        if let Some(err) = scope_err {
            return Err(Error::TransferError(err.to_string()));
        }

        let slice = staging.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(Error::TransferError(err.to_string())),
            Err(_) => return Err(Error::TransferError("map callback never ran".into())),
        }
        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();
        staging.destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_mapping() {
        assert_eq!(device_class(DeviceType::DiscreteGpu), DeviceClass::Gpu);
        assert_eq!(device_class(DeviceType::VirtualGpu), DeviceClass::Gpu);
        assert_eq!(device_class(DeviceType::Cpu), DeviceClass::Cpu);
        assert_eq!(device_class(DeviceType::Other), DeviceClass::Accelerator);
        assert!(DeviceClass::Accelerator.accepts(device_class(DeviceType::IntegratedGpu)));
    }
}
