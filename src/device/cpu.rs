use std::sync::{Arc, RwLock};

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use super::{
    AllocError, Allocator, Argument, Backend, BackendError, Device, DeviceType, Grid, Kernel,
    PoolAllocator,
};
use crate::{
    kernel::{KernelName, KernelOp, SubMode, registry},
    num::DataType,
    ops::{BinaryOp, ReduceOp, UnaryOp},
    shape::Shape,
};

pub type Cpu = Device<CpuBackend>;

/// Host memory guarded for concurrent kernel access.
#[derive(Debug)]
pub struct CpuMemory(RwLock<Box<[u8]>>);

impl CpuMemory {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.read().expect("failed to lock").len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl Allocator for HostAllocator {
    type Memory = CpuMemory;

    fn alloc(&self, size: usize) -> Result<Self::Memory, AllocError> {
        if size == 0 {
            return Err(AllocError::Empty);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AllocError::OutOfMemory(size))?;
        data.resize(size, 0);
        Ok(CpuMemory(RwLock::new(data.into_boxed_slice())))
    }

    fn free(&self, _memory: Self::Memory, _size: usize) {}
}

#[derive(Debug, Clone)]
pub struct CpuKernel {
    label: String,
    name: KernelName,
    threads: u32,
}

impl Kernel for CpuKernel {
    #[inline]
    fn name(&self) -> &str {
        &self.label
    }

    #[inline]
    fn max_threads_per_group(&self) -> u32 {
        self.threads
    }
}

/// Reference backend that interprets the kernel contract on the host.
#[derive(Debug)]
pub struct CpuBackend {
    kernels: HashMap<String, CpuKernel>,
    vector_width: u32,
}

impl CpuBackend {
    /// Names of all registered kernels.
    pub fn kernels(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }
}

impl Backend for CpuBackend {
    type Memory = CpuMemory;
    type Kernel = CpuKernel;

    #[inline]
    fn vector_width(&self) -> u32 {
        self.vector_width
    }

    fn resolve(&self, name: &str) -> Result<&Self::Kernel, BackendError> {
        self.kernels
            .get(name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_owned()))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn dispatch(
        &self,
        kernel: &Self::Kernel,
        args: &[Argument<'_, Self::Memory>],
        grid: Grid,
    ) -> Result<(), BackendError> {
        let mut cursor = Cursor::new(&kernel.label, args);
        let name = kernel.name;
        let len = grid.work[0] as usize;
        match name.op {
            KernelOp::Full => full(&mut cursor, name.r#type, len)?,
            KernelOp::Arange => arange(&mut cursor, name.r#type, len)?,
            KernelOp::Copy => map(&mut cursor, name, len, |x| x)?,
            KernelOp::Unary(op) => {
                map(&mut cursor, name, len, |x| unary(op, name.r#type, x))?
            }
            KernelOp::Binary(BinaryOp::Matmul) => matmul(&mut cursor, name)?,
            KernelOp::Binary(op) => zip(&mut cursor, name, op, len)?,
            KernelOp::Reduce(op) => reduce(&mut cursor, name, op)?,
        }
        cursor.finish()
    }

    fn write(&self, memory: &Self::Memory, data: &[u8]) -> Result<(), BackendError> {
        let mut memory = memory.0.write().expect("failed to lock");
        let size = memory.len();
        match memory.get_mut(..data.len()) {
            Some(dst) => dst.copy_from_slice(data),
            None => return Err(BackendError::Overflow { size, len: data.len() }),
        }
        Ok(())
    }

    fn read(&self, memory: &Self::Memory) -> Result<Vec<u8>, BackendError> {
        Ok(memory.0.read().expect("failed to lock").to_vec())
    }
}

/// Where the `i`-th logical element of an operand lives.
enum Locator {
    Dense(usize),
    Strided(Shape),
}

impl Locator {
    #[inline]
    fn locate(&self, index: usize) -> usize {
        match self {
            Locator::Dense(offset) => offset + index,
            Locator::Strided(shape) => shape.physical(index),
        }
    }

    /// One past the largest element index touched by the first `len` logical elements.
    #[inline]
    fn span(&self, len: usize) -> usize {
        match self {
            Locator::Dense(offset) => offset + len,
            Locator::Strided(shape) => shape.span(),
        }
    }

    fn check(&self, len: usize, r#type: DataType, data: &[u8]) -> Result<(), BackendError> {
        let size = self.span(len) * r#type.size();
        match size <= data.len() {
            true => Ok(()),
            false => Err(BackendError::Overflow {
                size: data.len(),
                len: size,
            }),
        }
    }
}

/// Reads argument slots front to back.
struct Cursor<'a, 'b> {
    kernel: &'b str,
    args: &'b [Argument<'a, CpuMemory>],
    index: usize,
}

impl<'a, 'b> Cursor<'a, 'b> {
    fn new(kernel: &'b str, args: &'b [Argument<'a, CpuMemory>]) -> Self {
        Self {
            kernel,
            args,
            index: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> BackendError {
        BackendError::Argument {
            name: self.kernel.to_owned(),
            reason: reason.into(),
        }
    }

    fn next(&mut self) -> Result<&'b Argument<'a, CpuMemory>, BackendError> {
        let arg = self
            .args
            .get(self.index)
            .ok_or_else(|| self.error(format!("missing slot {}", self.index)))?;
        self.index += 1;
        Ok(arg)
    }

    fn scalar(&mut self) -> Result<&'b [u8], BackendError> {
        match self.next()? {
            Argument::Scalar(bytes) => Ok(bytes),
            _ => Err(self.error(format!("slot {} is not a scalar", self.index - 1))),
        }
    }

    fn value(&mut self, r#type: DataType) -> Result<f64, BackendError> {
        let bytes = self.scalar()?;
        match bytes.len() >= r#type.size() {
            true => Ok(r#type.decode(bytes)),
            false => Err(self.error(format!("slot {} is too short", self.index - 1))),
        }
    }

    fn u32s(&mut self) -> Result<Vec<u32>, BackendError> {
        let bytes = self.scalar()?;
        match bytes.len() % 4 {
            0 => Ok(bytemuck::pod_collect_to_vec(bytes)),
            _ => Err(self.error(format!("slot {} is not a u32 array", self.index - 1))),
        }
    }

    fn i32s(&mut self) -> Result<Vec<i32>, BackendError> {
        let bytes = self.scalar()?;
        match bytes.len() % 4 {
            0 => Ok(bytemuck::pod_collect_to_vec(bytes)),
            _ => Err(self.error(format!("slot {} is not an i32 array", self.index - 1))),
        }
    }

    fn u32(&mut self) -> Result<usize, BackendError> {
        match self.u32s()?[..] {
            [x] => Ok(x as usize),
            _ => Err(self.error(format!("slot {} is not a u32", self.index - 1))),
        }
    }

    fn buffer(&mut self) -> Result<&'a CpuMemory, BackendError> {
        match self.next()? {
            Argument::Buffer(memory) => Ok(*memory),
            _ => Err(self.error(format!("slot {} is not a buffer", self.index - 1))),
        }
    }

    fn scratch(&mut self) -> Result<usize, BackendError> {
        match self.next()? {
            Argument::Scratch(size) => Ok(*size),
            _ => Err(self.error(format!("slot {} is not scratch", self.index - 1))),
        }
    }

    /// Reads a `(ndim, view, stride)` triple.
    fn strided(&mut self, offset: usize) -> Result<Locator, BackendError> {
        let ndim = self.u32()?;
        let view = self.i32s()?;
        let stride = self.i32s()?;
        if view.len() != ndim || stride.len() != ndim {
            return Err(self.error(format!("layout rank mismatch at slot {}", self.index - 1)));
        }
        let view: Vec<usize> = view.into_iter().map(|v| v.max(0) as usize).collect();
        let stride: Vec<isize> = stride.into_iter().map(|s| s as isize).collect();
        let shape = Shape::from_parts(offset, view, stride).map_err(|err| self.error(err.to_string()))?;
        Ok(Locator::Strided(shape))
    }

    fn locator(&mut self, offset: usize, strided: bool) -> Result<Locator, BackendError> {
        match strided {
            true => self.strided(offset),
            false => Ok(Locator::Dense(offset)),
        }
    }

    fn finish(&self) -> Result<(), BackendError> {
        match self.index == self.args.len() {
            true => Ok(()),
            false => Err(self.error(format!(
                "expected {} slots, got {}",
                self.index,
                self.args.len()
            ))),
        }
    }
}

fn evaluate<F>(len: usize, f: F) -> Vec<f64>
where
    F: Fn(usize) -> f64 + Send + Sync,
{
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        (0..len).into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        (0..len).map(f).collect()
    }
}

#[inline]
fn load(data: &[u8], r#type: DataType, index: usize) -> f64 {
    let size = r#type.size();
    r#type.decode(&data[index * size..(index + 1) * size])
}

fn store(
    memory: &CpuMemory,
    r#type: DataType,
    locator: &Locator,
    values: &[f64],
) -> Result<(), BackendError> {
    let mut data = memory.0.write().expect("failed to lock");
    locator.check(values.len(), r#type, &data)?;
    let size = r#type.size();
    for (index, &value) in values.iter().enumerate() {
        let position = locator.locate(index) * size;
        data[position..position + size].copy_from_slice(&r#type.encode(value));
    }
    Ok(())
}

/// Runs `f` over the contents of two memories that may be the same.
fn read_pair<R>(x: &CpuMemory, y: &CpuMemory, f: impl FnOnce(&[u8], &[u8]) -> R) -> R {
    let data = x.0.read().expect("failed to lock");
    match std::ptr::eq(x, y) {
        true => f(&data, &data),
        false => f(&data, &y.0.read().expect("failed to lock")),
    }
}

fn unary(op: UnaryOp, r#type: DataType, x: f64) -> f64 {
    match op {
        UnaryOp::Neg if r#type.is_integer() => r#type.wrap(-(x as i128)),
        UnaryOp::Square if r#type.is_integer() => r#type.wrap(x as i128 * x as i128),
        UnaryOp::Identity => x,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Neg => -x,
        UnaryOp::Reciprocal => x.recip(),
        UnaryOp::Square => x * x,
        UnaryOp::SquareRoot => x.sqrt(),
    }
}

/// Integer arithmetic is exact and wraps into the element type; division truncates and
/// yields 0 on a zero divisor.
fn integer(op: BinaryOp, r#type: DataType, x: i128, y: i128) -> Option<f64> {
    let value = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x.checked_div(y).unwrap_or(0),
        _ => return None,
    };
    Some(r#type.wrap(value))
}

fn binary(op: BinaryOp, r#type: DataType, x: f64, y: f64) -> f64 {
    if r#type.is_integer() {
        if let Some(value) = integer(op, r#type, x as i128, y as i128) {
            return value;
        }
    }
    let truth = |b: bool| b as u8 as f64;
    match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::Eq => truth(x == y),
        BinaryOp::Neq => truth(x != y),
        BinaryOp::Lt => truth(x < y),
        BinaryOp::Gt => truth(x > y),
        BinaryOp::Leq => truth(x <= y),
        BinaryOp::Geq => truth(x >= y),
        BinaryOp::Matmul => unreachable!(),
    }
}

fn full(cursor: &mut Cursor, r#type: DataType, len: usize) -> Result<(), BackendError> {
    let value = cursor.value(r#type)?;
    let output = cursor.buffer()?;
    store(output, r#type, &Locator::Dense(0), &vec![value; len])
}

fn arange(cursor: &mut Cursor, r#type: DataType, len: usize) -> Result<(), BackendError> {
    let start = cursor.value(r#type)?;
    let step = cursor.value(r#type)?;
    let output = cursor.buffer()?;
    let values = evaluate(len, |index| start + index as f64 * step);
    store(output, r#type, &Locator::Dense(0), &values)
}

fn map(
    cursor: &mut Cursor,
    name: KernelName,
    len: usize,
    f: impl Fn(f64) -> f64 + Send + Sync,
) -> Result<(), BackendError> {
    let r#type = name.r#type;
    let output_type = match name.op {
        KernelOp::Unary(op) => op.output_type(r#type),
        _ => r#type,
    };
    let input_offset = cursor.u32()?;
    let output_offset = cursor.u32()?;
    let input = cursor.locator(input_offset, name.mode.1.is_strided())?;
    let output = cursor.locator(output_offset, name.sparse)?;
    let src = cursor.buffer()?;
    let dst = cursor.buffer()?;

    let values = {
        let data = src.0.read().expect("failed to lock");
        input.check(len, r#type, &data)?;
        evaluate(len, |index| f(load(&data, r#type, input.locate(index))))
    };
    store(dst, output_type, &output, &values)
}

fn zip(
    cursor: &mut Cursor,
    name: KernelName,
    op: BinaryOp,
    len: usize,
) -> Result<(), BackendError> {
    let r#type = name.r#type;
    let offsets = [cursor.u32()?, cursor.u32()?, cursor.u32()?];
    let lhs = cursor.locator(offsets[0], name.mode.0.is_strided())?;
    let rhs = cursor.locator(offsets[1], name.mode.1.is_strided())?;
    let output = cursor.locator(offsets[2], name.sparse)?;
    let (x, y, dst) = (cursor.buffer()?, cursor.buffer()?, cursor.buffer()?);

    let values = read_pair(x, y, |x, y| -> Result<_, BackendError> {
        lhs.check(len, r#type, x)?;
        rhs.check(len, r#type, y)?;
        Ok(evaluate(len, |index| {
            let x = load(x, r#type, lhs.locate(index));
            let y = load(y, r#type, rhs.locate(index));
            binary(op, r#type, x, y)
        }))
    })?;
    store(dst, op.output_type(r#type), &output, &values)
}

fn matmul(cursor: &mut Cursor, name: KernelName) -> Result<(), BackendError> {
    let r#type = name.r#type;
    let offsets = [cursor.u32()?, cursor.u32()?, cursor.u32()?];
    let lhs = cursor.locator(offsets[0], name.mode.0.is_strided())?;
    let rhs = cursor.locator(offsets[1], name.mode.1.is_strided())?;
    let [batch, m, k, n] = match cursor.u32s()?[..] {
        [b, m, k, n] => [b, m, k, n].map(|x| x as usize),
        _ => return Err(cursor.error("matmul dims must be [batch, m, k, n]")),
    };
    let (x, y, dst) = (cursor.buffer()?, cursor.buffer()?, cursor.buffer()?);

    let values = read_pair(x, y, |x, y| -> Result<_, BackendError> {
        lhs.check(batch * m * k, r#type, x)?;
        rhs.check(batch * k * n, r#type, y)?;
        Ok(evaluate(batch * m * n, |index| {
            let (b, i, j) = (index / (m * n), index / n % m, index % n);
            let pairs = (0..k).map(|p| {
                let x = load(x, r#type, lhs.locate((b * m + i) * k + p));
                let y = load(y, r#type, rhs.locate((b * k + p) * n + j));
                (x, y)
            });
            match r#type.is_integer() {
                true => r#type.wrap(pairs.map(|(x, y)| x as i128 * y as i128).sum()),
                false => pairs.map(|(x, y)| x * y).sum(),
            }
        }))
    })?;
    store(dst, r#type, &Locator::Dense(offsets[2]), &values)
}

fn reduce(cursor: &mut Cursor, name: KernelName, op: ReduceOp) -> Result<(), BackendError> {
    let r#type = name.r#type;
    let offset = cursor.u32()?;
    let input = cursor.locator(offset, name.mode.1.is_strided())?;
    let (rows, cols) = match name.sub {
        Some(SubMode::All) => (1, cursor.u32()?),
        Some(SubMode::Col) => (cursor.u32()?, cursor.u32()?),
        None => return Err(cursor.error("reduction without a sub-mode")),
    };
    let (src, dst) = (cursor.buffer()?, cursor.buffer()?);
    cursor.scratch()?;

    let fold = |x: f64, y: f64| match op {
        ReduceOp::Sum => x + y,
        ReduceOp::Max => x.max(y),
        ReduceOp::Min => x.min(y),
    };
    let values = {
        let data = src.0.read().expect("failed to lock");
        input.check(rows * cols, r#type, &data)?;
        evaluate(rows, |row| {
            let values = (0..cols).map(|col| load(&data, r#type, input.locate(row * cols + col)));
            match (op, r#type.is_integer()) {
                (ReduceOp::Sum, true) => r#type.wrap(values.map(|x| x as i128).sum()),
                _ => values.reduce(&fold).unwrap_or_default(),
            }
        })
    };
    store(dst, r#type, &Locator::Dense(0), &values)
}

#[derive(Debug, Clone)]
pub struct CpuBuilder {
    /// Index of the device, used to tell devices apart.
    pub index: usize,
    /// Threads per group every kernel reports.
    pub max_threads: u32,
    pub vector_width: u32,
    /// Recycle freed buffers through a [`PoolAllocator`].
    pub pool: bool,
    /// Kernels left out of the registry.
    pub exclude: HashSet<String>,
}

impl Default for CpuBuilder {
    fn default() -> Self {
        Self {
            index: 0,
            max_threads: 256,
            vector_width: 8,
            pool: true,
            exclude: Default::default(),
        }
    }
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn max_threads(mut self, max_threads: u32) -> Self {
        self.max_threads = max_threads;
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

    pub fn exclude(mut self, name: impl ToString) -> Self {
        self.exclude.insert(name.to_string());
        self
    }

    pub fn build(self) -> Cpu {
        let kernels: HashMap<_, _> = registry()
            .into_iter()
            .map(|name| (name.to_string(), name))
            .filter(|(label, _)| !self.exclude.contains(label))
            .map(|(label, name)| {
                let threads = self.max_threads;
                let kernel = CpuKernel {
                    label: label.clone(),
                    name,
                    threads,
                };
                (label, kernel)
            })
            .collect();
        log::debug!("cpu:{} registered {} kernels", self.index, kernels.len());

        let allocator: Arc<dyn Allocator<Memory = CpuMemory>> = match self.pool {
            true => Arc::new(PoolAllocator::new(HostAllocator)),
            false => Arc::new(HostAllocator),
        };
        let backend = CpuBackend {
            kernels,
            vector_width: self.vector_width,
        };
        Device::new(DeviceType::Cpu, self.index, allocator, Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::CpuBuilder;
    use crate::{
        device::{Argument, Backend, BackendError, Grid, Kernel},
        kernel::registry,
    };

    #[test]
    fn test_registry() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let context = cpu.context();
        assert_eq!(context.kernels().count(), registry().len());
        for name in registry() {
            let kernel = context.resolve(&name.to_string())?;
            assert_eq!(kernel.name(), name.to_string());
            assert_eq!(kernel.max_threads_per_group(), 256);
        }
        Ok(())
    }

    #[test]
    fn test_kernel_not_found() {
        let cpu = CpuBuilder::new().exclude("add_vv_f32").build();
        match cpu.context().resolve("add_vv_f32") {
            Err(BackendError::KernelNotFound(name)) => assert_eq!(name, "add_vv_f32"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(cpu.context().resolve("add_vv_f64").is_err());
        assert!(cpu.context().resolve("sub_vv_f32").is_ok());
    }

    #[test]
    fn test_dispatch() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let context = cpu.context();

        let x = cpu.alloc(16)?;
        let y = cpu.alloc(16)?;
        let z = cpu.alloc(16)?;
        context.write(x.memory(), bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]))?;
        context.write(y.memory(), bytemuck::cast_slice(&[0.5f32, 0.5, 0.5, 0.5]))?;

        let kernel = context.resolve("add_vv_f32")?;
        let grid = Grid {
            work: [4, 1, 1],
            group: [4, 1, 1],
        };
        let args = [
            Argument::u32(0),
            Argument::u32(0),
            Argument::u32(0),
            Argument::Buffer(x.memory()),
            Argument::Buffer(y.memory()),
            Argument::Buffer(z.memory()),
        ];
        context.dispatch(kernel, &args, grid)?;

        let output: Vec<f32> = bytemuck::pod_collect_to_vec(&context.read(z.memory())?);
        assert_eq!(output, vec![1.5, 2.5, 3.5, 4.5]);

        // a missing slot is reported rather than read out of bounds
        let result = context.dispatch(kernel, &args[..5], grid);
        assert!(matches!(result, Err(BackendError::Argument { .. })));
        Ok(())
    }

    #[test]
    fn test_write_overflow() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().pool(false).build();
        let x = cpu.alloc(4)?;
        let result = cpu.context().write(x.memory(), &[0; 8]);
        assert!(matches!(result, Err(BackendError::Overflow { size: 4, len: 8 })));
        Ok(())
    }
}
