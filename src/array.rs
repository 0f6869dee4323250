use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use derive_more::{Deref, DerefMut, Display};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    device::{AllocError, Backend, BackendError, Buffer, Device},
    graph::Graph,
    num::{DataType, Scalar},
    ops::{BinaryOp, Initializer, MoveOp, Op, ReduceOp, TransformOp, UnaryOp},
    shape::{Shape, ShapeError, broadcast_view},
    slice::Slice,
};

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("array type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("array type error: op {0} does not support data type {1}")]
    Unsupported(String, DataType),
    #[error("array device error: device {0} mismatches {1}")]
    Device(String, String),
    #[error("array in-place error: op {0} cannot write {1} into an array of {2}")]
    InPlace(String, DataType, DataType),
    #[error("array mutation error: array {0} is constant")]
    Constant(ArrayId),
    #[error("array creation error: shape {0} needs {1} bytes, got {2}")]
    Create(Shape, usize, usize),
    #[error("array gradient error: op {0} is not differentiable")]
    NotDifferentiable(String),
    #[error("array execution error: array {0} has no data")]
    Unmaterialized(ArrayId),
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct ArrayId(uid::Id<ArrayId>);

/// One node of the op graph. Its layout, type and op are fixed at creation; its buffer is set
/// once, when the node is executed.
pub struct ArrayNode<B: Backend> {
    id: ArrayId,
    shape: Shape,
    r#type: DataType,
    device: Device<B>,
    op: Op<B>,
    buffer: OnceLock<Buffer<B::Memory>>,
    grad: Mutex<Option<Array<B>>>,
    constant: AtomicBool,
}

/// A lazily evaluated n-dimensional array. Cloning is cheap and shares the node.
pub struct Array<B: Backend>(Arc<ArrayNode<B>>);

impl<B: Backend> Clone for Array<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: Backend> PartialEq for Array<B> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<B: Backend> Eq for Array<B> {}

impl<B: Backend> std::fmt::Debug for Array<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("id", &self.id())
            .field("op", self.op())
            .field("shape", self.shape())
            .field("type", &self.data_type())
            .field("device", self.device())
            .finish()
    }
}

impl<B: Backend> Array<B> {
    pub(crate) fn from_op(device: Device<B>, shape: Shape, r#type: DataType, op: Op<B>) -> Self {
        let node = ArrayNode {
            id: ArrayId(uid::Id::new()),
            shape,
            r#type,
            device,
            op,
            buffer: OnceLock::new(),
            grad: Mutex::new(None),
            constant: AtomicBool::new(false),
        };
        Self(Arc::new(node))
    }

    #[inline]
    pub fn id(&self) -> ArrayId {
        self.0.id
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.0.shape
    }

    #[inline]
    pub fn view(&self) -> &[usize] {
        self.0.shape.view()
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.0.r#type
    }

    #[inline]
    pub fn device(&self) -> &Device<B> {
        &self.0.device
    }

    #[inline]
    pub fn op(&self) -> &Op<B> {
        &self.0.op
    }

    #[inline]
    pub fn buffer(&self) -> Option<&Buffer<B::Memory>> {
        self.0.buffer.get()
    }

    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.0.buffer.get().is_some()
    }

    pub(crate) fn materialize(&self, buffer: Buffer<B::Memory>) {
        if self.0.buffer.set(buffer).is_err() {
            log::warn!("array {} is already materialized", self.id());
        }
    }

    /// The accumulated gradient, if a backward pass has reached this array.
    #[inline]
    pub fn grad(&self) -> Option<Array<B>> {
        self.grad_lock().clone()
    }

    #[inline]
    pub(crate) fn grad_lock(&self) -> MutexGuard<'_, Option<Array<B>>> {
        self.0.grad.lock().expect("failed to lock")
    }

    /// Clears the accumulated gradient.
    #[inline]
    pub fn zero_grad(&self) {
        self.grad_lock().take();
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.0.constant.load(Ordering::Acquire)
    }

    /// Marks the array as constant: it rejects in-place writes and receives no gradient.
    #[inline]
    pub fn set_constant(&self, constant: bool) {
        self.0.constant.store(constant, Ordering::Release);
    }

    /// Checks that an in-place op may write into this array: no array whose buffer it shares
    /// is constant, and no two of its elements share storage.
    pub(crate) fn check_writable(&self) -> Result<(), ArrayError> {
        if self.shape().is_overlapping() {
            return Err(ShapeError::Overlap(self.shape().clone()).into());
        }
        let mut array = self;
        loop {
            if array.is_constant() {
                return Err(ArrayError::Constant(array.id()));
            }
            array = match array.op() {
                Op::Transform { op, input } if op.is_alias() => input,
                Op::Unary {
                    input,
                    in_place: true,
                    ..
                } => input,
                Op::Binary {
                    lhs,
                    in_place: true,
                    ..
                } => lhs,
                _ => return Ok(()),
            };
        }
    }

    /// Executes every pending node this array depends on.
    pub fn eval(&self) -> Result<(), ArrayError> {
        Graph::new(self).forward()
    }

    /// Runs a backward pass seeded with ones at this array.
    pub fn backward(&self) -> Result<(), ArrayError> {
        Graph::new(self).backward()
    }

    /// Evaluates the array and reads its elements back in logical row-major order.
    pub fn read_bytes(&self) -> Result<Vec<u8>, ArrayError> {
        self.eval()?;
        let buffer = self.buffer().ok_or(ArrayError::Unmaterialized(self.id()))?;
        let data = self.device().context().read(buffer.memory())?;
        let size = self.data_type().size();
        let shape = self.shape();
        let span = shape.span() * size;
        if span > data.len() {
            return Err(BackendError::Overflow {
                size: data.len(),
                len: span,
            }
            .into());
        }
        Ok(shape
            .indices()
            .flat_map(|index| &data[index * size..(index + 1) * size])
            .copied()
            .collect())
    }

    pub fn read<T: Scalar>(&self) -> Result<Vec<T>, ArrayError> {
        if T::DATA_TYPE != self.data_type() {
            return Err(ArrayError::Type(T::DATA_TYPE, self.data_type()));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.read_bytes()?))
    }
}

impl<B: Backend> Array<B> {
    fn initializer(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        r#type: DataType,
        op: Initializer,
    ) -> Result<Self, ArrayError> {
        let shape = Shape::new(view)?;
        Ok(Self::from_op(device.clone(), shape, r#type, Op::Initializer(op)))
    }

    /// An array of `view` with every element set to `value`.
    pub fn full(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        value: f64,
        r#type: DataType,
    ) -> Result<Self, ArrayError> {
        Self::initializer(device, view, r#type, Initializer::Full { value })
    }

    pub fn zeros(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        r#type: DataType,
    ) -> Result<Self, ArrayError> {
        Self::full(device, view, 0.0, r#type)
    }

    pub fn ones(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        r#type: DataType,
    ) -> Result<Self, ArrayError> {
        Self::full(device, view, 1.0, r#type)
    }

    /// An array whose `i`-th element in row-major order is `start + i * step`.
    pub fn arange(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        start: f64,
        step: f64,
        r#type: DataType,
    ) -> Result<Self, ArrayError> {
        Self::initializer(device, view, r#type, Initializer::Arange { start, step })
    }

    pub fn full_like(&self, value: f64) -> Result<Self, ArrayError> {
        Self::full(self.device(), self.view(), value, self.data_type())
    }

    pub fn zeros_like(&self) -> Result<Self, ArrayError> {
        self.full_like(0.0)
    }

    pub fn ones_like(&self) -> Result<Self, ArrayError> {
        self.full_like(1.0)
    }

    /// Uploads host bytes into a new materialized array.
    pub fn from_bytes(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        r#type: DataType,
        data: &[u8],
    ) -> Result<Self, ArrayError> {
        let shape = Shape::new(view)?;
        let size = shape.size() * r#type.size();
        if data.len() != size {
            return Err(ArrayError::Create(shape, size, data.len()));
        }
        let buffer = device.alloc(size)?;
        device.context().write(buffer.memory(), data)?;
        let op = Op::Initializer(Initializer::External);
        let array = Self::from_op(device.clone(), shape, r#type, op);
        array.materialize(buffer);
        Ok(array)
    }

    pub fn from_slice<T: Scalar>(
        device: &Device<B>,
        view: impl Into<Vec<usize>>,
        data: &[T],
    ) -> Result<Self, ArrayError> {
        Self::from_bytes(device, view, T::DATA_TYPE, bytemuck::cast_slice(data))
    }
}

impl<B: Backend> Array<B> {
    pub fn unary(&self, op: UnaryOp) -> Result<Self, ArrayError> {
        let (shape, r#type) = op.check(self, false)?;
        let input = self.clone();
        let op = Op::Unary {
            op,
            input,
            in_place: false,
        };
        Ok(Self::from_op(self.device().clone(), shape, r#type, op))
    }

    /// Applies `op` in place. The result shares this array's buffer.
    pub fn unary_assign(&self, op: UnaryOp) -> Result<Self, ArrayError> {
        let (shape, r#type) = op.check(self, true)?;
        let input = self.clone();
        let op = Op::Unary {
            op,
            input,
            in_place: true,
        };
        Ok(Self::from_op(self.device().clone(), shape, r#type, op))
    }

    #[inline]
    pub fn identity(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::Identity)
    }

    #[inline]
    pub fn exp(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::Exp)
    }

    #[inline]
    pub fn log(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::Log)
    }

    #[inline]
    pub fn try_neg(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::Neg)
    }

    #[inline]
    pub fn reciprocal(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::Reciprocal)
    }

    #[inline]
    pub fn square(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::Square)
    }

    #[inline]
    pub fn sqrt(&self) -> Result<Self, ArrayError> {
        self.unary(UnaryOp::SquareRoot)
    }
}

impl<B: Backend> Array<B> {
    /// Elementwise op with mutual broadcasting. Matmul is forwarded to [`Array::matmul`].
    pub fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self, ArrayError> {
        if op == BinaryOp::Matmul {
            return self.matmul(rhs);
        }
        let (shape, r#type) = op.check(self, rhs, false)?;
        let op = Op::Binary {
            op,
            lhs: self.clone(),
            rhs: rhs.clone(),
            in_place: false,
        };
        Ok(Self::from_op(self.device().clone(), shape, r#type, op))
    }

    /// Elementwise op written into this array; `rhs` is broadcast to this array's view.
    pub fn binary_assign(&self, op: BinaryOp, rhs: &Self) -> Result<Self, ArrayError> {
        let (shape, r#type) = op.check(self, rhs, true)?;
        let op = Op::Binary {
            op,
            lhs: self.clone(),
            rhs: rhs.clone(),
            in_place: true,
        };
        Ok(Self::from_op(self.device().clone(), shape, r#type, op))
    }

    #[inline]
    pub fn try_add(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Add, rhs)
    }

    #[inline]
    pub fn try_sub(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Sub, rhs)
    }

    #[inline]
    pub fn try_mul(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Mul, rhs)
    }

    #[inline]
    pub fn try_div(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Div, rhs)
    }

    #[inline]
    pub fn equal(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Eq, rhs)
    }

    #[inline]
    pub fn not_equal(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Neq, rhs)
    }

    #[inline]
    pub fn less(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Lt, rhs)
    }

    #[inline]
    pub fn greater(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Gt, rhs)
    }

    #[inline]
    pub fn less_equal(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Leq, rhs)
    }

    #[inline]
    pub fn greater_equal(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary(BinaryOp::Geq, rhs)
    }

    #[inline]
    pub fn add_assign(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary_assign(BinaryOp::Add, rhs)
    }

    #[inline]
    pub fn sub_assign(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary_assign(BinaryOp::Sub, rhs)
    }

    #[inline]
    pub fn mul_assign(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary_assign(BinaryOp::Mul, rhs)
    }

    #[inline]
    pub fn div_assign(&self, rhs: &Self) -> Result<Self, ArrayError> {
        self.binary_assign(BinaryOp::Div, rhs)
    }

    /// Batched matrix product with broadcast batch dimensions.
    ///
    /// Operands are brought to a canonical 3-D `[batch, m, k] @ [batch, k, n]` form. A 3-D
    /// operand whose batch is broadcast is used as a strided view; other operands are reshaped,
    /// which copies only when they are not contiguous. The product is reshaped back to the
    /// broadcast batch dimensions followed by `[m, n]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self, ArrayError> {
        let r#type = BinaryOp::check_matmul(self, rhs)?;
        let (x, y) = (self.view(), rhs.view());
        let (m, k, n) = (x[x.len() - 2], x[x.len() - 1], y[y.len() - 1]);
        let batch_view = broadcast_view(&x[..x.len() - 2], &y[..y.len() - 2])
            .ok_or_else(|| ShapeError::Matmul(self.shape().clone(), rhs.shape().clone()))?;
        let batch: usize = batch_view.iter().product();

        let lhs = self.canonical(&batch_view, [m, k])?;
        let rhs = rhs.canonical(&batch_view, [k, n])?;
        let shape = Shape::new([batch, m, n])?;
        let op = Op::Binary {
            op: BinaryOp::Matmul,
            lhs,
            rhs,
            in_place: false,
        };
        let output = Self::from_op(self.device().clone(), shape, r#type, op);

        let view = [batch_view, vec![m, n]].concat();
        match output.view() == view.as_slice() {
            true => Ok(output),
            false => output.reshape(view),
        }
    }

    fn canonical(&self, batch_view: &[usize], tail: [usize; 2]) -> Result<Self, ArrayError> {
        let view = [batch_view, &tail].concat();
        let x = match self.view() == view.as_slice() {
            true => self.clone(),
            false => self.broadcast_to(&view)?,
        };
        match x.shape().len() {
            3 => Ok(x),
            _ => x.reshape([batch_view.iter().product(), tail[0], tail[1]]),
        }
    }
}

impl<B: Backend> Array<B> {
    fn transform(&self, op: TransformOp, shape: Shape) -> Self {
        let input = self.clone();
        let op = Op::Transform { op, input };
        Self::from_op(self.device().clone(), shape, self.data_type(), op)
    }

    /// Reinterprets the array under a new view of the same size. Contiguous arrays are
    /// aliased; others are copied into a fresh contiguous buffer.
    pub fn reshape(&self, view: impl Into<Vec<usize>>) -> Result<Self, ArrayError> {
        let view = view.into();
        match self.shape().reshape(view.clone()) {
            Ok(shape) => Ok(self.transform(TransformOp::Reshape { materialize: false }, shape)),
            Err(ShapeError::NonContiguous(_)) => {
                let shape = Shape::new(view)?;
                Ok(self.transform(TransformOp::Reshape { materialize: true }, shape))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn permute(&self, order: &[usize]) -> Result<Self, ArrayError> {
        let shape = self.shape().permute(order)?;
        Ok(self.transform(TransformOp::Permute(order.to_vec()), shape))
    }

    pub fn transpose(&self, x: usize, y: usize) -> Result<Self, ArrayError> {
        let rank = self.shape().len();
        if let Some(&dim) = [x, y].iter().find(|&&dim| dim >= rank) {
            return Err(ShapeError::Dim { dim, rank }.into());
        }
        let mut order = (0..rank).collect_vec();
        order.swap(x, y);
        self.permute(&order)
    }

    /// Stretches the array to `view` without copying.
    pub fn broadcast_to(&self, view: &[usize]) -> Result<Self, ArrayError> {
        let shape = self.shape().broadcast_to(view)?;
        Ok(self.transform(TransformOp::Broadcast, shape))
    }

    /// Selects a strided sub-range of every dimension without copying.
    pub fn slice(&self, slice: impl Into<Slice>) -> Result<Self, ArrayError> {
        let ranges = slice.into().resolve(self.view())?;
        let shape = self.shape().slice(&ranges)?;
        Ok(self.transform(TransformOp::Slice(ranges), shape))
    }

    /// The inverse of [`Array::slice`]: places this array into a zero-filled array of `view`
    /// at the positions `slice` selects.
    pub fn unslice(&self, view: &[usize], slice: impl Into<Slice>) -> Result<Self, ArrayError> {
        let shape = Shape::new(view)?;
        let ranges = slice.into().resolve(view)?;
        let sliced = shape.slice(&ranges)?;
        if sliced.view() != self.view() {
            return Err(ShapeError::Unslice {
                view: view.to_vec(),
                expected: sliced.view().to_vec(),
                got: self.view().to_vec(),
            }
            .into());
        }
        Ok(self.transform(TransformOp::Unslice(ranges), shape))
    }

    /// Copies the array into a fresh contiguous buffer.
    pub fn copy(&self) -> Result<Self, ArrayError> {
        let shape = Shape::new(self.view())?;
        let input = self.clone();
        let op = Op::Move {
            op: MoveOp::Copy,
            input,
        };
        Ok(Self::from_op(self.device().clone(), shape, self.data_type(), op))
    }
}

impl<B: Backend> Array<B> {
    /// Reduces over `dims`. The reduced dimensions are dropped; reducing every dimension
    /// yields a single-element array of view `[1]`.
    pub fn reduce(&self, op: ReduceOp, dims: &[usize]) -> Result<Self, ArrayError> {
        let (dims, shape) = op.check(self, dims)?;
        let input = self.clone();
        let op = Op::Reduce { op, input, dims };
        Ok(Self::from_op(self.device().clone(), shape, self.data_type(), op))
    }

    fn all_dims(&self) -> Vec<usize> {
        (0..self.shape().len()).collect()
    }

    #[inline]
    pub fn sum(&self, dims: &[usize]) -> Result<Self, ArrayError> {
        self.reduce(ReduceOp::Sum, dims)
    }

    #[inline]
    pub fn max(&self, dims: &[usize]) -> Result<Self, ArrayError> {
        self.reduce(ReduceOp::Max, dims)
    }

    #[inline]
    pub fn min(&self, dims: &[usize]) -> Result<Self, ArrayError> {
        self.reduce(ReduceOp::Min, dims)
    }

    #[inline]
    pub fn sum_all(&self) -> Result<Self, ArrayError> {
        self.sum(&self.all_dims())
    }

    #[inline]
    pub fn max_all(&self) -> Result<Self, ArrayError> {
        self.max(&self.all_dims())
    }

    #[inline]
    pub fn min_all(&self) -> Result<Self, ArrayError> {
        self.min(&self.all_dims())
    }
}

impl<B: Backend> std::ops::Add<&Array<B>> for &Array<B> {
    type Output = Array<B>;

    fn add(self, rhs: &Array<B>) -> Self::Output {
        self.try_add(rhs).expect("array views must broadcast")
    }
}

impl<B: Backend> std::ops::Sub<&Array<B>> for &Array<B> {
    type Output = Array<B>;

    fn sub(self, rhs: &Array<B>) -> Self::Output {
        self.try_sub(rhs).expect("array views must broadcast")
    }
}

impl<B: Backend> std::ops::Mul<&Array<B>> for &Array<B> {
    type Output = Array<B>;

    fn mul(self, rhs: &Array<B>) -> Self::Output {
        self.try_mul(rhs).expect("array views must broadcast")
    }
}

impl<B: Backend> std::ops::Div<&Array<B>> for &Array<B> {
    type Output = Array<B>;

    fn div(self, rhs: &Array<B>) -> Self::Output {
        self.try_div(rhs).expect("array views must broadcast")
    }
}

impl<B: Backend> std::ops::Neg for &Array<B> {
    type Output = Array<B>;

    fn neg(self) -> Self::Output {
        self.try_neg().expect("array type must support negation")
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Array, ArrayError};
    use crate::{
        device::{CpuBuilder, DeviceType},
        num::{Bool, DataType},
        ops::{BinaryOp, Op, TransformOp, UnaryOp},
        shape::ShapeError,
        slice::Range,
    };

    #[test]
    fn test_create() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();

        let x = Array::full(&cpu, [2, 3], 1.5, DataType::F32)?;
        assert_eq!(x.view(), &[2, 3]);
        assert!(!x.is_materialized());
        assert_eq!(x.read::<f32>()?, vec![1.5; 6]);
        assert!(x.is_materialized());

        let x = Array::arange(&cpu, [4], 2.0, 3.0, DataType::I32)?;
        assert_eq!(x.read::<i32>()?, vec![2, 5, 8, 11]);

        let x = Array::from_slice(&cpu, [2, 2], &[1u32, 2, 3, 4])?;
        assert!(x.is_materialized());
        assert_eq!(x.data_type(), DataType::U32);
        assert_eq!(x.read::<u32>()?, vec![1, 2, 3, 4]);
        assert!(matches!(x.read::<f32>(), Err(ArrayError::Type(..))));

        assert!(matches!(
            Array::from_slice(&cpu, [3], &[1.0f32, 2.0]),
            Err(ArrayError::Create(_, 12, 8))
        ));
        assert!(matches!(
            Array::zeros(&cpu, [2, 0], DataType::F32),
            Err(ArrayError::Shape(ShapeError::ZeroSized(_)))
        ));
        assert!(matches!(
            Array::zeros(&cpu, Vec::<usize>::new(), DataType::F32),
            Err(ArrayError::Shape(ShapeError::Empty))
        ));
        Ok(())
    }

    #[test]
    fn test_validation() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::zeros(&cpu, [2, 3], DataType::F32)?;
        let y = Array::zeros(&cpu, [4], DataType::F32)?;
        let z = Array::zeros(&cpu, [3], DataType::I32)?;

        assert!(matches!(
            x.try_add(&y),
            Err(ArrayError::Shape(ShapeError::Broadcast(..)))
        ));
        assert!(matches!(x.try_add(&z), Err(ArrayError::Type(..))));
        assert!(matches!(
            x.matmul(&y),
            Err(ArrayError::Shape(ShapeError::Matmul(..)))
        ));

        let other = CpuBuilder::new().index(1).build();
        assert_eq!(other.kind(), DeviceType::Cpu);
        let w = Array::zeros(&other, [2, 3], DataType::F32)?;
        assert!(matches!(x.try_add(&w), Err(ArrayError::Device(..))));

        let b = Array::zeros(&cpu, [3], DataType::Bool)?;
        assert!(matches!(b.try_add(&b), Err(ArrayError::Unsupported(..))));
        assert!(matches!(b.exp(), Err(ArrayError::Unsupported(..))));
        assert!(matches!(b.sum_all(), Err(ArrayError::Unsupported(..))));

        assert!(matches!(
            x.sum(&[2]),
            Err(ArrayError::Shape(ShapeError::Dim { dim: 2, rank: 2 }))
        ));
        assert!(matches!(
            x.reshape([4]),
            Err(ArrayError::Shape(ShapeError::Reshape(..)))
        ));
        assert!(matches!(
            x.slice((0usize..3, ..)),
            Err(ArrayError::Shape(ShapeError::Bounds { dim: 0, .. }))
        ));
        assert!(matches!(
            x.permute(&[0, 0]),
            Err(ArrayError::Shape(ShapeError::Permute(..)))
        ));
        Ok(())
    }

    #[test]
    fn test_output_types() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::arange(&cpu, [4], 1.0, 1.0, DataType::I32)?;
        let y = Array::full(&cpu, [4], 2.0, DataType::I32)?;

        let z = x.less(&y)?;
        assert_eq!(z.data_type(), DataType::Bool);
        let z: Vec<bool> = z.read::<Bool>()?.into_iter().map(Into::into).collect();
        assert_eq!(z, vec![true, false, false, false]);

        let z = x.sqrt()?;
        assert_eq!(z.data_type(), DataType::F32);
        assert_eq!(z.read::<f32>()?[3], 2.0);

        let z = x.exp()?;
        assert_eq!(z.data_type(), DataType::F32);
        assert!((z.read::<f32>()?[0] - std::f32::consts::E).abs() < 1e-6);
        assert!(matches!(x.unary_assign(UnaryOp::Exp), Err(ArrayError::InPlace(..))));

        let z = x.try_neg()?;
        assert_eq!(z.data_type(), DataType::I32);
        assert_eq!(z.read::<i32>()?, vec![-1, -2, -3, -4]);

        let z = x.try_div(&y)?;
        assert_eq!(z.read::<i32>()?, vec![0, 1, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_integer_overflow() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let max = Array::full(&cpu, [1], i32::MAX as f64, DataType::I32)?;
        let min = Array::full(&cpu, [1], i32::MIN as f64, DataType::I32)?;
        let one = Array::ones(&cpu, [1], DataType::I32)?;
        assert_eq!(max.try_add(&one)?.read::<i32>()?, vec![i32::MIN]);
        assert_eq!(min.try_sub(&one)?.read::<i32>()?, vec![i32::MAX]);
        assert_eq!(min.try_neg()?.read::<i32>()?, vec![i32::MIN]);
        assert_eq!(max.square()?.read::<i32>()?, vec![1]);

        let x = Array::from_slice(&cpu, [2], &[1u32, 65536])?;
        let two = Array::full(&cpu, [1], 2.0, DataType::U32)?;
        assert_eq!(x.try_sub(&two)?.read::<u32>()?, vec![u32::MAX, 65534]);
        assert_eq!(x.try_mul(&x)?.read::<u32>()?, vec![1, 0]);

        let y = Array::full(&cpu, [1, 1, 2], 65536.0, DataType::I32)?;
        assert_eq!(y.matmul(&y.transpose(1, 2)?)?.read::<i32>()?, vec![0]);
        let z = Array::full(&cpu, [2], i32::MAX as f64, DataType::I32)?;
        assert_eq!(z.sum_all()?.read::<i32>()?, vec![-2]);
        Ok(())
    }

    #[test]
    fn test_in_place() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::full(&cpu, [2, 2], 1.0, DataType::F32)?;
        let y = Array::arange(&cpu, [2], 1.0, 1.0, DataType::F32)?;
        x.eval()?;

        let z = x.add_assign(&y)?;
        assert_eq!(z.shape(), x.shape());
        assert_eq!(z.read::<f32>()?, vec![2.0, 3.0, 2.0, 3.0]);
        assert!(z.buffer().zip(x.buffer()).is_some_and(|(z, x)| z.same(x)));
        assert!(!z.buffer().is_some_and(|z| z.is_root()));
        assert_eq!(x.read::<f32>()?, vec![2.0, 3.0, 2.0, 3.0]);

        // writes through a strided receiver only touch the selected elements
        let w = Array::zeros(&cpu, [3, 3], DataType::F32)?;
        let column = w.slice((.., 1usize))?;
        let one = Array::ones(&cpu, [1], DataType::F32)?;
        column.add_assign(&one)?.eval()?;
        assert_eq!(
            w.read::<f32>()?,
            vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0]
        );

        let z = x.unary_assign(UnaryOp::Square)?;
        assert_eq!(z.read::<f32>()?, vec![4.0, 9.0, 4.0, 9.0]);

        assert!(matches!(x.binary_assign(BinaryOp::Lt, &y), Err(ArrayError::InPlace(..))));
        assert!(matches!(
            y.add_assign(&x),
            Err(ArrayError::Shape(ShapeError::BroadcastTo(..)))
        ));

        let i = Array::full(&cpu, [2], 4.0, DataType::I32)?;
        assert!(matches!(i.unary_assign(UnaryOp::SquareRoot), Err(ArrayError::InPlace(..))));

        x.set_constant(true);
        assert!(matches!(x.add_assign(&y), Err(ArrayError::Constant(id)) if id == x.id()));
        Ok(())
    }

    #[test]
    fn test_write_through_view() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::zeros(&cpu, [1, 3], DataType::F32)?;
        let y = Array::arange(&cpu, [2, 3], 0.0, 1.0, DataType::F32)?;

        // rows of a broadcast view share storage
        let b = x.broadcast_to(&[2, 3])?;
        assert!(matches!(
            b.add_assign(&y),
            Err(ArrayError::Shape(ShapeError::Overlap(_)))
        ));
        assert!(matches!(
            b.unary_assign(UnaryOp::Neg),
            Err(ArrayError::Shape(ShapeError::Overlap(_)))
        ));
        let z = b.try_add(&y)?;
        assert_eq!(z.read::<f32>()?, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(x.read::<f32>()?, vec![0.0; 3]);

        // a leading unit dimension does not alias anything
        let v = Array::zeros(&cpu, [3], DataType::F32)?;
        let row = Array::ones(&cpu, [3], DataType::F32)?;
        v.broadcast_to(&[1, 3])?.add_assign(&row)?.eval()?;
        assert_eq!(v.read::<f32>()?, vec![1.0; 3]);

        // views share the buffer of a constant array
        let c = Array::zeros(&cpu, [4], DataType::F32)?;
        let one = Array::ones(&cpu, [1], DataType::F32)?;
        c.set_constant(true);
        let views = [
            c.slice(0usize..3)?,
            c.reshape([2, 2])?.transpose(0, 1)?,
            c.slice(1usize..4)?.slice(0usize..2)?,
        ];
        for view in &views {
            assert!(matches!(view.add_assign(&one), Err(ArrayError::Constant(id)) if id == c.id()));
            assert!(matches!(
                view.unary_assign(UnaryOp::Square),
                Err(ArrayError::Constant(id)) if id == c.id()
            ));
        }
        // a copy owns its buffer
        c.copy()?.add_assign(&one)?.eval()?;
        assert_eq!(c.read::<f32>()?, vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_reshape() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::arange(&cpu, [2, 3], 0.0, 1.0, DataType::F32)?;

        let y = x.reshape([3, 2])?;
        assert!(matches!(
            y.op(),
            Op::Transform {
                op: TransformOp::Reshape { materialize: false },
                ..
            }
        ));
        assert_eq!(y.read::<f32>()?, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(y.buffer().zip(x.buffer()).is_some_and(|(y, x)| y.same(x)));

        let t = x.transpose(0, 1)?;
        assert_eq!(t.read::<f32>()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        let z = t.reshape([6])?;
        assert!(matches!(
            z.op(),
            Op::Transform {
                op: TransformOp::Reshape { materialize: true },
                ..
            }
        ));
        assert_eq!(z.read::<f32>()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(z.shape().is_contiguous());
        Ok(())
    }

    #[test]
    fn test_slice() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::arange(&cpu, [4, 4], 0.0, 1.0, DataType::F32)?;

        let slice = || (1usize..3, Range::new(3, -1, -2));
        let y = x.slice(slice())?;
        assert_eq!(y.view(), &[2, 2]);
        assert_eq!(y.read::<f32>()?, vec![7.0, 5.0, 11.0, 9.0]);

        let z = y.unslice(&[4, 4], slice())?;
        assert_eq!(z.view(), x.view());
        #[rustfmt::skip]
        assert_eq!(z.read::<f32>()?, vec![
            0.0, 0.0, 0.0, 0.0,
            0.0, 5.0, 0.0, 7.0,
            0.0, 9.0, 0.0, 11.0,
            0.0, 0.0, 0.0, 0.0,
        ]);

        assert!(matches!(
            y.unslice(&[4, 4], (0usize..3, ..)),
            Err(ArrayError::Shape(ShapeError::Unslice { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_operators() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build();
        let x = Array::full(&cpu, [3], 6.0, DataType::F32)?;
        let y = Array::full(&cpu, [1], 2.0, DataType::F32)?;
        assert_eq!((&x + &y).read::<f32>()?, vec![8.0; 3]);
        assert_eq!((&x - &y).read::<f32>()?, vec![4.0; 3]);
        assert_eq!((&x * &y).read::<f32>()?, vec![12.0; 3]);
        assert_eq!((&x / &y).read::<f32>()?, vec![3.0; 3]);
        assert_eq!((-&x).read::<f32>()?, vec![-6.0; 3]);
        Ok(())
    }
}
