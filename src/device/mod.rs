use std::sync::Arc;

use derive_more::Display;
use thiserror::Error;

pub use allocator::{AllocError, Allocator, Buffer, PoolAllocator};
pub use cpu::{Cpu, CpuBackend, CpuBuilder};
pub use gpu::{Gpu, GpuBackend, GpuBuildError, GpuBuilder};

pub mod allocator;
pub mod cpu;
pub mod gpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeviceType {
    #[display("cpu")]
    Cpu,
    #[display("gpu")]
    Gpu,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("kernel not found: {0}")]
    KernelNotFound(String),
    #[error("kernel {name} argument error: {reason}")]
    Argument { name: String, reason: String },
    #[error("value {0} does not fit in a 32-bit kernel argument")]
    Limit(i64),
    #[error("buffer of {size} bytes cannot hold {len} bytes")]
    Overflow { size: usize, len: usize },
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("device validation error: {0}")]
    Validation(String),
    #[error("failed to poll device")]
    Poll(#[from] wgpu::PollError),
    #[error("failed to map buffer")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("failed to receive mapped buffer")]
    Recv(#[from] flume::RecvError),
}

/// A compiled kernel resolved from a backend's registry.
pub trait Kernel {
    /// The canonical name the kernel was registered under.
    fn name(&self) -> &str;
    /// Upper bound on threads per group the kernel can be launched with.
    fn max_threads_per_group(&self) -> u32;
}

/// One argument slot of a kernel launch.
#[derive(Debug)]
pub enum Argument<'a, M> {
    /// A device buffer.
    Buffer(&'a M),
    /// A small scalar (or scalar array) buffer, in native byte order.
    Scalar(Vec<u8>),
    /// Group-local scratch memory of the given byte size.
    Scratch(usize),
}

impl<M> Argument<'_, M> {
    #[inline]
    pub fn u32(value: u32) -> Self {
        Self::Scalar(value.to_ne_bytes().to_vec())
    }

    #[inline]
    pub fn u32s(values: &[u32]) -> Self {
        Self::Scalar(bytemuck::cast_slice(values).to_vec())
    }

    #[inline]
    pub fn i32s(values: &[i32]) -> Self {
        Self::Scalar(bytemuck::cast_slice(values).to_vec())
    }
}

/// Logical work size and thread-group size of a launch, both in threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Grid {
    pub work: [u32; 3],
    pub group: [u32; 3],
}

impl Grid {
    /// Number of groups along each axis needed to cover the work.
    #[inline]
    pub fn groups(&self) -> [u32; 3] {
        let [x, y, z] = self.work;
        let [gx, gy, gz] = self.group.map(|g| g.max(1));
        [x.div_ceil(gx), y.div_ceil(gy), z.div_ceil(gz)]
    }
}

/// A compute backend: a kernel registry plus a blocking encode-and-dispatch primitive.
///
/// Every call returns only after the device has finished the work it was given.
pub trait Backend: Send + Sync + 'static {
    type Memory: Send + Sync + 'static;
    type Kernel: Kernel;

    /// Native vector (SIMD) width of the device, in threads.
    fn vector_width(&self) -> u32;

    /// Looks up a compiled kernel by its canonical name.
    fn resolve(&self, name: &str) -> Result<&Self::Kernel, BackendError>;

    /// Encodes the arguments in slot order, launches the kernel over the grid and blocks until
    /// the device signals completion.
    fn dispatch(
        &self,
        kernel: &Self::Kernel,
        args: &[Argument<'_, Self::Memory>],
        grid: Grid,
    ) -> Result<(), BackendError>;

    /// Copies host bytes into the front of device memory.
    fn write(&self, memory: &Self::Memory, data: &[u8]) -> Result<(), BackendError>;

    /// Reads the whole device memory back to the host.
    fn read(&self, memory: &Self::Memory) -> Result<Vec<u8>, BackendError>;
}

/// A handle to a compute device: its type and index, the allocator serving it, and the backend
/// context that runs its kernels.
pub struct Device<B: Backend> {
    kind: DeviceType,
    index: usize,
    allocator: Arc<dyn Allocator<Memory = B::Memory>>,
    context: Arc<B>,
}

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            index: self.index,
            allocator: self.allocator.clone(),
            context: self.context.clone(),
        }
    }
}

impl<B: Backend> PartialEq for Device<B> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.index == other.index
    }
}

impl<B: Backend> Eq for Device<B> {}

impl<B: Backend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .finish()
    }
}

impl<B: Backend> std::fmt::Display for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

impl<B: Backend> Device<B> {
    pub fn new(
        kind: DeviceType,
        index: usize,
        allocator: Arc<dyn Allocator<Memory = B::Memory>>,
        context: Arc<B>,
    ) -> Self {
        Self {
            kind,
            index,
            allocator,
            context,
        }
    }

    #[inline]
    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn context(&self) -> &B {
        &self.context
    }

    /// Allocates a root buffer of `size` bytes.
    #[inline]
    pub fn alloc(&self, size: usize) -> Result<Buffer<B::Memory>, AllocError> {
        let memory = self.allocator.alloc(size)?;
        Ok(Buffer::root(memory, size, self.allocator.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Argument, CpuBuilder, Grid};

    #[test]
    fn test_device_eq() {
        let x = CpuBuilder::new().build();
        let y = CpuBuilder::new().build();
        let z = CpuBuilder::new().index(1).build();
        assert_eq!(x, y);
        assert_ne!(x, z);
        assert_eq!(z.to_string(), "cpu:1");
    }

    #[test]
    fn test_grid_groups() {
        let grid = Grid {
            work: [100, 3, 1],
            group: [32, 2, 1],
        };
        assert_eq!(grid.groups(), [4, 2, 1]);
    }

    #[test]
    fn test_argument_scalars() {
        let x: Argument<'_, ()> = Argument::u32s(&[1, 2]);
        match x {
            Argument::Scalar(bytes) => assert_eq!(bytes.len(), 8),
            _ => unreachable!(),
        }
    }
}
