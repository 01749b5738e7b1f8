//! GPU batch-norm inference kernels using WGPU.
//!
//! One compute shader, instantiated once per workgroup size in
//! [`WORKGROUP_SIZES`]. Each instance stages the bound host buffers into
//! GPU storage buffers (as `f32`), dispatches one invocation per
//! element, and copies the output back.
//!
//! The GPU context is created lazily on first use and shared by every
//! instance. When no adapter or device is available the instances simply
//! report themselves unsupported, so a registry built on a machine without a
//! GPU still tunes over the CPU kernels.
//!
//! Instances are only registered for `f32` problems. Support negotiation
//! also rejects problems the device limits cannot express: rank above
//! [`MAX_RANK`], more workgroups than one dispatch dimension allows, or
//! buffers larger than a storage binding.

use std::sync::mpsc;

use briny::prelude::*;
use wgpu::util::DeviceExt;

use super::{BatchNormInfer, NormalizeArgument};
use crate::backend::Backend;
use crate::element::Element;
use crate::error::TuneError;
use crate::op::{Bindings, Candidate};
use crate::problem::ProblemDescriptor;
use crate::stream::{StreamConfig, launch_and_time};

const BATCHNORM_INFER: &str = include_str!("shaders/batchnorm_infer.wgsl");
const WORKGROUP_SIZE_SLOT: &str = "{{WORKGROUP_SIZE}}";

/// Workgroup sizes registered for [`WgpuNormalize`], in order.
pub const WORKGROUP_SIZES: &[u32] = &[64, 256];

/// Highest rank the shader's dims table can describe.
pub const MAX_RANK: usize = 8;

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device + queue.
    ///
    /// Uses `pollster::block_on` to wait for the async WGPU calls.
    pub fn new() -> Result<Self, TuneError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| TuneError::Gpu(format!("adapter: {e}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_tune"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| TuneError::Gpu(format!("device: {e}")))?;

        log::info!("wgpu adapter: {}", adapter.get_info().name);
        Ok(Self { device, queue })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            log::warn!("wgpu instances unavailable: {e}");
            None
        }
    };
}

/// Whether a GPU context could be created on this machine.
pub fn gpu_available() -> bool {
    GPU_CONTEXT.is_some()
}

/// WGSL source checked before it reaches the driver.
struct WgslSource<'a>(&'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        // unfilled template slots or source inclusion
        if src.contains("{{") || src.contains("#include") || src.contains("import") {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, TuneError> {
    WgslSource(source)
        .validate()
        .map_err(|_| TuneError::Gpu(format!("shader `{label}` failed validation")))?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

fn build_pipeline(ctx: &GpuContext, workgroup_size: u32) -> Result<wgpu::ComputePipeline, TuneError> {
    let label = format!("batchnorm_infer_wg{workgroup_size}");
    let source = BATCHNORM_INFER.replace(WORKGROUP_SIZE_SLOT, &workgroup_size.to_string());
    let module = load_shader(&ctx.device, &label, &source)?;

    Ok(ctx
        .device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }))
}

/// Compute-shader kernel with a fixed workgroup size.
pub struct WgpuNormalize {
    workgroup_size: u32,
    pipeline: Option<wgpu::ComputePipeline>,
}

impl WgpuNormalize {
    /// Compiles the shader for `workgroup_size` if a GPU is available.
    pub fn new(workgroup_size: u32) -> Self {
        let workgroup_size = workgroup_size.max(1);
        let pipeline = GPU_CONTEXT.as_ref().and_then(|ctx| {
            build_pipeline(ctx, workgroup_size)
                .inspect_err(|e| log::warn!("workgroup size {workgroup_size}: {e}"))
                .ok()
        });
        Self {
            workgroup_size,
            pipeline,
        }
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    fn fits<T: Element>(&self, ctx: &GpuContext, argument: &NormalizeArgument<'_, T>) -> bool {
        let limits = ctx.device.limits();
        let max_groups = limits.max_compute_workgroups_per_dimension as usize;
        let max_binding = limits.max_storage_buffer_binding_size as usize;
        let n = argument.num_elements();
        let words_fit = argument
            .lengths()
            .iter()
            .chain(argument.xy_strides())
            .chain(argument.param_strides())
            .chain([&n, &argument.xy_span()])
            .all(|&v| u32::try_from(v).is_ok());

        T::SHADER_NATIVE
            && argument.is_host_accessible()
            && argument.lengths().len() <= MAX_RANK
            && n > 0
            && words_fit
            && n.div_ceil(self.workgroup_size as usize) <= max_groups
            && argument.xy_span() * size_of::<f32>() <= max_binding
            && argument.param_span() * size_of::<f32>() <= max_binding
    }
}

impl<T: Element, const RANK: usize> Candidate<BatchNormInfer<T, RANK>> for WgpuNormalize {
    fn name(&self) -> String {
        format!("WgpuNormalize<WorkgroupSize_{}>", self.workgroup_size)
    }

    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn bind<'a>(
        &self,
        problem: &ProblemDescriptor,
        bindings: &Bindings<'a>,
    ) -> Result<NormalizeArgument<'a, T>, TuneError> {
        NormalizeArgument::bind(RANK, problem, bindings)
    }

    fn supports(&self, argument: &NormalizeArgument<'_, T>) -> bool {
        match (GPU_CONTEXT.as_ref(), &self.pipeline) {
            (Some(ctx), Some(_)) => self.fits(ctx, argument),
            _ => false,
        }
    }

    fn run(&self, argument: &NormalizeArgument<'_, T>, stream: &StreamConfig) -> Result<f64, TuneError> {
        let (Some(ctx), Some(pipeline)) = (GPU_CONTEXT.as_ref(), self.pipeline.as_ref()) else {
            return Err(TuneError::Gpu("no GPU context".into()));
        };
        if !self.fits(ctx, argument) {
            return Err(TuneError::Unsupported("argument exceeds device limits".into()));
        }
        // bound buffers outlive the argument and y is viewed only here
        let views = unsafe { argument.host_views() };
        let device = &ctx.device;

        let storage = |label: &str, contents: &[u8], usage: wgpu::BufferUsages| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE | usage,
            })
        };
        let empty = wgpu::BufferUsages::empty();
        let dims_buf = storage("dims", &dims_bytes(argument), empty);
        let x_buf = storage("x", &f32_bytes(views.x), empty);
        let mean_buf = storage("mean", &f32_bytes(views.mean), empty);
        let variance_buf = storage("variance", &f32_bytes(views.variance), empty);
        let scale_buf = storage("scale", &f32_bytes(views.scale), empty);
        let bias_buf = storage("bias", &f32_bytes(views.bias), empty);
        // seeded with the current output so strided gaps survive the copy back
        let y_buf = storage("y", &f32_bytes(views.y), wgpu::BufferUsages::COPY_SRC);

        let layout = pipeline.get_bind_group_layout(0);
        let resources = [
            &dims_buf,
            &x_buf,
            &mean_buf,
            &variance_buf,
            &scale_buf,
            &bias_buf,
            &y_buf,
        ];
        let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
            .iter()
            .enumerate()
            .map(|(binding, buf)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("batchnorm_infer_bind_group"),
            layout: &layout,
            entries: &entries,
        });

        let groups = (argument.num_elements() as u32).div_ceil(self.workgroup_size);
        let ave_time_ms = launch_and_time(stream, || {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("batchnorm_infer_encoder"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("batchnorm_infer_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups, 1, 1);
            }
            ctx.queue.submit(Some(encoder.finish()));
            device
                .poll(wgpu::PollType::Wait)
                .map_err(|e| TuneError::Gpu(e.to_string()))?;
            Ok(())
        })?;

        let output = read_back(ctx, &y_buf, views.y.len())?;
        for (out, v) in views.y.iter_mut().zip(output) {
            *out = T::from_f32(v);
        }
        Ok(ave_time_ms)
    }
}

fn dims_bytes<T: Element>(argument: &NormalizeArgument<'_, T>) -> Vec<u8> {
    let mut dims = vec![0u32; 3 + 3 * MAX_RANK];
    dims[0] = argument.lengths().len() as u32;
    dims[1] = argument.num_elements() as u32;
    dims[2] = argument.epsilon().to_f32().to_bits();
    let tables = [argument.lengths(), argument.xy_strides(), argument.param_strides()];
    for (t, table) in tables.iter().enumerate() {
        for (d, &v) in table.iter().enumerate() {
            dims[3 + t * MAX_RANK + d] = v as u32;
        }
    }
    dims.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn f32_bytes<T: Element>(data: &[T]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_f32().to_le_bytes()).collect()
}

fn read_back(ctx: &GpuContext, src: &wgpu::Buffer, len: usize) -> Result<Vec<f32>, TuneError> {
    let size = (len * size_of::<f32>()) as u64;
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("batchnorm_infer_readback"),
        });
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    ctx.device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| TuneError::Gpu(e.to_string()))?;
    rx.recv()
        .map_err(|e| TuneError::Gpu(e.to_string()))?
        .map_err(|e| TuneError::Gpu(e.to_string()))?;

    let data = slice.get_mapped_range();
    let values = data
        .chunks_exact(size_of::<f32>())
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    drop(data);
    staging.unmap();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::approx::{F32_TOLERANCE, all_close};
    use crate::memory::{DeviceMem, HostAllocator};
    use crate::problem::{RawProblem, packed_strides};

    type Norm4 = BatchNormInfer<f32, 4>;

    #[test]
    fn shader_template_needs_a_workgroup_size() {
        assert!(WgslSource(BATCHNORM_INFER).validate().is_err());
        let filled = BATCHNORM_INFER.replace(WORKGROUP_SIZE_SLOT, "64");
        assert!(WgslSource(&filled).validate().is_ok());
    }

    #[test]
    fn names_encode_workgroup_size() {
        let candidate = WgpuNormalize::new(256);
        assert_eq!(candidate.workgroup_size(), 256);
        assert_eq!(
            Candidate::<Norm4>::name(&candidate),
            "WgpuNormalize<WorkgroupSize_256>"
        );
        assert_eq!(Candidate::<Norm4>::backend(&candidate), Backend::Wgpu);
    }

    #[test]
    fn f64_problems_are_declined() {
        let lengths = vec![4, 64];
        let problem = ProblemDescriptor::new(RawProblem {
            strides: packed_strides(&lengths),
            lengths,
            reduce_dims: vec![0],
            invariant_dims: vec![1],
            param_lengths: vec![64],
            param_strides: vec![1],
            epsilon: 1e-5,
        })
        .unwrap();
        let alloc = Arc::new(HostAllocator::new());
        let mems: Vec<DeviceMem> = [256, 64, 64, 64, 64, 256]
            .iter()
            .map(|&n| DeviceMem::with_elements::<f64>(alloc.clone(), n).unwrap())
            .collect();
        let inputs = [&mems[0], &mems[1], &mems[2], &mems[3], &mems[4]];
        let outputs = [&mems[5]];
        let bindings = Bindings::new(&inputs, &outputs);

        let gpu = WgpuNormalize::new(64);
        let argument = Candidate::<BatchNormInfer<f64, 2>>::bind(&gpu, &problem, &bindings).unwrap();
        assert!(!Candidate::<BatchNormInfer<f64, 2>>::supports(&gpu, &argument));
    }

    #[test]
    fn matches_cpu_or_declines_without_gpu() {
        let lengths = vec![2, 3, 4, 8];
        let problem = ProblemDescriptor::new(RawProblem {
            strides: packed_strides(&lengths),
            lengths,
            reduce_dims: vec![0, 1, 2],
            invariant_dims: vec![3],
            param_lengths: vec![8],
            param_strides: vec![1],
            epsilon: 1e-5,
        })
        .unwrap();

        let alloc = Arc::new(HostAllocator::new());
        let buffer = |len: usize, f: fn(usize) -> f32| {
            let data: Vec<f32> = (0..len).map(f).collect();
            let mut mem = DeviceMem::with_elements::<f32>(alloc.clone(), len).unwrap();
            mem.copy_from_host(&data).unwrap();
            mem
        };
        let x = buffer(192, |i| (i % 17) as f32 * 0.25 - 2.0);
        let mean = buffer(8, |i| i as f32 * 0.1);
        let variance = buffer(8, |i| 0.5 + i as f32);
        let scale = buffer(8, |i| 1.0 - i as f32 * 0.05);
        let bias = buffer(8, |i| i as f32 * -0.3);
        let gpu_y = buffer(192, |_| 0.0);
        let cpu_y = buffer(192, |_| 0.0);

        let inputs = [&x, &mean, &variance, &scale, &bias];
        let stream = StreamConfig::default();

        let cpu_out = [&cpu_y];
        let cpu = super::super::cpu::NaiveNormalize;
        let bindings = Bindings::new(&inputs, &cpu_out);
        let argument = Candidate::<Norm4>::bind(&cpu, &problem, &bindings).unwrap();
        Candidate::<Norm4>::run(&cpu, &argument, &stream).unwrap();

        let gpu_out = [&gpu_y];
        let gpu = WgpuNormalize::new(64);
        let bindings = Bindings::new(&inputs, &gpu_out);
        let argument = Candidate::<Norm4>::bind(&gpu, &problem, &bindings).unwrap();
        if !gpu_available() {
            assert!(!Candidate::<Norm4>::supports(&gpu, &argument));
            return;
        }
        assert!(Candidate::<Norm4>::supports(&gpu, &argument));
        Candidate::<Norm4>::run(&gpu, &argument, &stream).unwrap();

        let expected = cpu_y.to_host_vec::<f32>().unwrap();
        let got = gpu_y.to_host_vec::<f32>().unwrap();
        assert!(all_close(&got, &expected, F32_TOLERANCE));
    }
}
