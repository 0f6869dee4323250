use std::{borrow::Cow, sync::Arc};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use wgpu::util::DeviceExt;

use super::{
    AllocError, Allocator, Argument, Backend, BackendError, Device, DeviceType, Grid, Kernel,
    PoolAllocator,
};
use crate::kernel::registry;

pub type Gpu = Device<GpuBackend>;

const BUFFER_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::COPY_SRC);

/// Storage buffer sizes must be multiples of 4 bytes.
#[inline]
fn padded(size: usize) -> u64 {
    (size as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

#[derive(Debug, Clone)]
pub struct GpuAllocator {
    device: wgpu::Device,
    limit: u64,
}

impl Allocator for GpuAllocator {
    type Memory = wgpu::Buffer;

    fn alloc(&self, size: usize) -> Result<Self::Memory, AllocError> {
        if size == 0 {
            return Err(AllocError::Empty);
        }
        let padded = padded(size);
        if padded > self.limit {
            return Err(AllocError::Limit {
                size,
                limit: self.limit as usize,
            });
        }
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: padded,
            usage: BUFFER_USAGES,
            mapped_at_creation: false,
        }))
    }

    fn free(&self, memory: Self::Memory, _size: usize) {
        memory.destroy();
    }
}

#[derive(Debug, Clone)]
pub struct GpuKernel {
    name: String,
    pipeline: wgpu::ComputePipeline,
    workgroup_size: [u32; 3],
}

impl Kernel for GpuKernel {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn max_threads_per_group(&self) -> u32 {
        self.workgroup_size.iter().product()
    }
}

/// Pushes a validation error scope on creation and pops it on every exit path.
struct ErrorScope<'a> {
    device: &'a wgpu::Device,
    popped: bool,
}

impl<'a> ErrorScope<'a> {
    fn new(device: &'a wgpu::Device) -> Self {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        Self {
            device,
            popped: false,
        }
    }

    fn finish(mut self) -> Result<(), BackendError> {
        self.popped = true;
        match futures::executor::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(BackendError::Validation(err.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for ErrorScope<'_> {
    fn drop(&mut self) {
        if !self.popped {
            _ = futures::executor::block_on(self.device.pop_error_scope());
        }
    }
}

/// Backend over a WebGPU device, running compute shaders from a user-supplied WGSL library.
#[derive(Debug)]
pub struct GpuBackend {
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Pipelines keyed by kernel name.
    kernels: HashMap<String, GpuKernel>,
    vector_width: u32,
}

impl GpuBackend {
    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Names of all registered kernels.
    pub fn kernels(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    fn wait(&self) -> Result<(), BackendError> {
        self.device.poll(wgpu::PollType::Wait)?;
        Ok(())
    }
}

impl Backend for GpuBackend {
    type Memory = wgpu::Buffer;
    type Kernel = GpuKernel;

    #[inline]
    fn vector_width(&self) -> u32 {
        self.vector_width
    }

    fn resolve(&self, name: &str) -> Result<&Self::Kernel, BackendError> {
        self.kernels
            .get(name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_owned()))
    }

    /// Binds buffers and scalars to consecutive bindings of group 0. Scratch slots bind
    /// nothing; shaders declare their workgroup memory statically.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn dispatch(
        &self,
        kernel: &Self::Kernel,
        args: &[Argument<'_, Self::Memory>],
        grid: Grid,
    ) -> Result<(), BackendError> {
        let scope = ErrorScope::new(&self.device);

        let scalars: Vec<_> = args
            .iter()
            .map(|arg| match arg {
                Argument::Scalar(bytes) => {
                    let mut contents = bytes.clone();
                    contents.resize(padded(bytes.len().max(1)) as usize, 0);
                    Some(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: None,
                        contents: &contents,
                        usage: wgpu::BufferUsages::STORAGE,
                    }))
                }
                _ => None,
            })
            .collect();
        let entries: Vec<_> = args
            .iter()
            .zip(&scalars)
            .filter_map(|(arg, scalar)| match (arg, scalar) {
                (Argument::Buffer(buffer), _) => Some(buffer.as_entire_binding()),
                (Argument::Scalar(_), Some(buffer)) => Some(buffer.as_entire_binding()),
                _ => None,
            })
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            })
            .collect();

        let layout = kernel.pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&kernel.name),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = Grid {
                group: kernel.workgroup_size,
                ..grid
            }
            .groups();
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        self.wait()?;
        scope.finish()
    }

    fn write(&self, memory: &Self::Memory, data: &[u8]) -> Result<(), BackendError> {
        let size = memory.size() as usize;
        if padded(data.len()) as usize > size {
            return Err(BackendError::Overflow {
                size,
                len: data.len(),
            });
        }
        let mut contents = data.to_vec();
        contents.resize(padded(data.len()) as usize, 0);
        self.queue.write_buffer(memory, 0, &contents);
        self.queue.submit(None);
        self.wait()
    }

    fn read(&self, memory: &Self::Memory) -> Result<Vec<u8>, BackendError> {
        let (sender, receiver) = flume::bounded(1);
        wgpu::util::DownloadBuffer::read_buffer(
            &self.device,
            &self.queue,
            &memory.slice(..),
            move |data| {
                _ = sender.send(data.map(|data| data.to_vec()));
            },
        );
        self.wait()?;
        Ok(receiver.recv()??)
    }
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
    #[error("failed to parse kernel library: {0}")]
    Parse(String),
    #[error("failed to create kernel {name}: {reason}")]
    Pipeline { name: String, reason: String },
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    /// WGSL source whose entry points are the kernels, named by the kernel naming scheme.
    pub library: Cow<'static, str>,
    pub index: usize,
    pub vector_width: u32,
    /// Recycle freed buffers through a [`PoolAllocator`].
    pub pool: bool,
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        Self {
            adapter,
            features: wgpu::Features::empty(),
            limits: Default::default(),
            library: Cow::Borrowed(""),
            index: 0,
            vector_width: 32,
            pool: true,
        }
    }

    /// Requests the default adapter of a fresh instance.
    pub async fn request() -> Result<Self, GpuBuildError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;
        Ok(Self::new(adapter))
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }

    pub fn library(mut self, library: impl Into<Cow<'static, str>>) -> Self {
        self.library = library.into();
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn vector_width(mut self, vector_width: u32) -> Self {
        self.vector_width = vector_width;
        self
    }

    pub fn pool(mut self, pool: bool) -> Self {
        self.pool = pool;
        self
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
            library,
            index,
            vector_width,
            pool,
        } = self;

        let module = naga::front::wgsl::parse_str(&library)
            .map_err(|err| GpuBuildError::Parse(err.emit_to_string(&library)))?;
        let entries: HashMap<_, _> = module
            .entry_points
            .iter()
            .filter(|entry| entry.stage == naga::ShaderStage::Compute)
            .map(|entry| (entry.name.clone(), entry.workgroup_size))
            .collect();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("library"),
            source: wgpu::ShaderSource::Wgsl(library.clone()),
        });

        let mut kernels = HashMap::default();
        for name in registry().iter().map(ToString::to_string) {
            let Some(&workgroup_size) = entries.get(&name) else {
                continue;
            };
            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&name),
                layout: None,
                module: &shader,
                entry_point: Some(&name),
                compilation_options: Default::default(),
                cache: None,
            });
            if let Some(err) = device.pop_error_scope().await {
                return Err(GpuBuildError::Pipeline {
                    name,
                    reason: err.to_string(),
                });
            }
            log::debug!("gpu:{index} compiled {name} with workgroup size {workgroup_size:?}");
            let kernel = GpuKernel {
                name: name.clone(),
                pipeline,
                workgroup_size,
            };
            kernels.insert(name, kernel);
        }
        for name in entries.keys().filter(|name| !kernels.contains_key(*name)) {
            log::warn!("gpu:{index} ignores entry point {name}: not a kernel name");
        }

        let limit = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
        let inner = GpuAllocator {
            device: device.clone(),
            limit,
        };
        let allocator: Arc<dyn Allocator<Memory = wgpu::Buffer>> = match pool {
            true => Arc::new(PoolAllocator::new(inner)),
            false => Arc::new(inner),
        };
        let backend = GpuBackend {
            device,
            queue,
            kernels,
            vector_width,
        };
        Ok(Device::new(DeviceType::Gpu, index, allocator, Arc::new(backend)))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{GpuBuildError, GpuBuilder};
    use crate::{
        array::{Array, ArrayError},
        device::BackendError,
        num::DataType,
    };

    const LIBRARY: &str = r#"
@group(0) @binding(0) var<storage, read> full_value: array<f32>;
@group(0) @binding(1) var<storage, read_write> full_output: array<f32>;

@compute @workgroup_size(64, 1, 1)
fn full_vv_f32(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < arrayLength(&full_output) {
        full_output[id.x] = full_value[0];
    }
}

@group(0) @binding(0) var<storage, read> add_lhs_offset: array<u32>;
@group(0) @binding(1) var<storage, read> add_rhs_offset: array<u32>;
@group(0) @binding(2) var<storage, read> add_output_offset: array<u32>;
@group(0) @binding(3) var<storage, read> add_lhs: array<f32>;
@group(0) @binding(4) var<storage, read> add_rhs: array<f32>;
@group(0) @binding(5) var<storage, read_write> add_output: array<f32>;

@compute @workgroup_size(64, 1, 1)
fn add_vv_f32(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = add_output_offset[0] + id.x;
    if index < arrayLength(&add_output) {
        add_output[index] = add_lhs[add_lhs_offset[0] + id.x] + add_rhs[add_rhs_offset[0] + id.x];
    }
}

@compute @workgroup_size(64, 1, 1)
fn helper(@builtin(global_invocation_id) id: vec3<u32>) {}
"#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_gpu_add() -> Result<(), Box<dyn Error>> {
        let Ok(builder) = GpuBuilder::request().await else {
            log::warn!("no adapter available, skipped");
            return Ok(());
        };
        let gpu = match builder.library(LIBRARY).build().await {
            Ok(gpu) => gpu,
            Err(GpuBuildError::RequestDeviceError(err)) => {
                log::warn!("no device available, skipped: {err}");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        assert_eq!(gpu.context().kernels().count(), 2);

        let x = Array::full(&gpu, [4], 1.5, DataType::F32)?;
        let y = Array::full(&gpu, [4], 2.0, DataType::F32)?;
        let z = x.try_add(&y)?;
        assert_eq!(z.read::<f32>()?, vec![3.5; 4]);

        let w = x.exp()?;
        assert!(matches!(
            w.read::<f32>(),
            Err(ArrayError::Backend(BackendError::KernelNotFound(_)))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_parse_error() -> Result<(), Box<dyn Error>> {
        let Ok(builder) = GpuBuilder::request().await else {
            return Ok(());
        };
        let result = builder.library("fn broken(").build().await;
        assert!(matches!(result, Err(GpuBuildError::Parse(_))));
        Ok(())
    }
}
