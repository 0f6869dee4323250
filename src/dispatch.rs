//! Argument-slot encoding and launch geometry for each kernel family.
//!
//! Slots always come in this order: one offset per input, the output offset, a
//! `(ndim, view, stride)` triple per strided input, the output triple for sparse kernels,
//! family-specific scalars, the input buffers, the output buffer, and finally scratch memory.
use crate::{
    array::ArrayError,
    device::{Argument, Backend, BackendError, Buffer, Device, Grid, Kernel},
    kernel::{ExecMode, KernelName, KernelOp, Mode, SubMode},
    num::DataType,
    ops::{BinaryOp, ReduceOp},
    shape::Shape,
};

/// A shape paired with the buffer it addresses.
pub(crate) struct Operand<'a, M: Send + Sync + 'static> {
    pub shape: &'a Shape,
    pub buffer: &'a Buffer<M>,
}

impl<M: Send + Sync + 'static> Clone for Operand<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: Send + Sync + 'static> Copy for Operand<'_, M> {}

fn narrow<T: TryFrom<i64>>(value: impl Into<i64>) -> Result<T, BackendError> {
    let value = value.into();
    T::try_from(value).map_err(|_| BackendError::Limit(value))
}

fn size(value: usize) -> Result<u32, BackendError> {
    narrow(i64::try_from(value).map_err(|_| BackendError::Limit(i64::MAX))?)
}

fn offset<'a, M>(shape: &Shape) -> Result<Argument<'a, M>, BackendError> {
    Ok(Argument::u32(size(shape.offset())?))
}

fn layout<'a, M>(shape: &Shape) -> Result<[Argument<'a, M>; 3], BackendError> {
    let view = shape
        .view()
        .iter()
        .map(|&v| narrow(size(v)?))
        .collect::<Result<Vec<i32>, _>>()?;
    let stride = shape
        .stride()
        .iter()
        .map(|&s| narrow(s as i64))
        .collect::<Result<Vec<i32>, _>>()?;
    Ok([
        Argument::u32(size(shape.len())?),
        Argument::i32s(&view),
        Argument::i32s(&stride),
    ])
}

/// Rounds the thread budget down to a whole number of vectors.
#[inline]
pub fn round_threads(max_threads: u32, vector_width: u32) -> u32 {
    let vector_width = vector_width.max(1);
    match max_threads >= vector_width {
        true => max_threads / vector_width * vector_width,
        false => max_threads.max(1),
    }
}

/// One thread per element, grouped up to the kernel's thread limit.
pub fn linear_grid(work: usize, max_threads: u32) -> Result<Grid, BackendError> {
    let work = size(work)?;
    let group = max_threads.min(work).max(1);
    Ok(Grid {
        work: [work, 1, 1],
        group: [group, 1, 1],
    })
}

/// A single group that sweeps the whole input. Returns the grid and the scratch element count.
pub fn reduce_all_grid(max_threads: u32, vector_width: u32) -> (Grid, usize) {
    let threads = round_threads(max_threads, vector_width);
    let grid = Grid {
        work: [threads, 1, 1],
        group: [threads, 1, 1],
    };
    (grid, threads as usize)
}

/// Groups of `cols_per_group × rows_per_group` threads, one row of threads per matrix row.
/// Returns the grid and the scratch element count.
pub fn reduce_col_grid(
    rows: usize,
    cols: usize,
    max_threads: u32,
    vector_width: u32,
) -> Result<(Grid, usize), BackendError> {
    let threads = round_threads(max_threads, vector_width);
    let vector_width = vector_width.max(1);
    let cols_per_group = size(cols.next_power_of_two())?
        .next_multiple_of(vector_width)
        .min(threads);
    let rows = size(rows)?;
    let rows_per_group = (threads / cols_per_group).clamp(1, rows);
    let grid = Grid {
        work: [cols_per_group, rows, 1],
        group: [cols_per_group, rows_per_group, 1],
    };
    Ok((grid, threads as usize))
}

#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
fn launch<B: Backend>(
    device: &Device<B>,
    name: KernelName,
    args: &[Argument<'_, B::Memory>],
    grid: impl FnOnce(u32, u32) -> Result<Grid, BackendError>,
) -> Result<(), ArrayError> {
    let context = device.context();
    let name = name.to_string();
    let kernel = context.resolve(&name)?;
    let grid = grid(kernel.max_threads_per_group(), context.vector_width())?;
    log::trace!("dispatch {name} on {device}: {grid:?}");
    context.dispatch(kernel, args, grid)?;
    Ok(())
}

/// Fills `len` elements of `output` with `value`.
pub(crate) fn fill<B: Backend>(
    device: &Device<B>,
    r#type: DataType,
    output: &Buffer<B::Memory>,
    len: usize,
    value: f64,
) -> Result<(), ArrayError> {
    let name = KernelName::new(KernelOp::Full, ExecMode::DENSE, r#type);
    let args = [
        Argument::Scalar(r#type.encode(value)),
        Argument::Buffer(output.memory()),
    ];
    launch(device, name, &args, |threads, _| linear_grid(len, threads))
}

/// Writes `start + i * step` into the first `len` elements of `output`.
pub(crate) fn arange<B: Backend>(
    device: &Device<B>,
    r#type: DataType,
    output: &Buffer<B::Memory>,
    len: usize,
    start: f64,
    step: f64,
) -> Result<(), ArrayError> {
    let name = KernelName::new(KernelOp::Arange, ExecMode::DENSE, r#type);
    let args = [
        Argument::Scalar(r#type.encode(start)),
        Argument::Scalar(r#type.encode(step)),
        Argument::Buffer(output.memory()),
    ];
    launch(device, name, &args, |threads, _| linear_grid(len, threads))
}

/// Single-input elementwise kernels (unary ops and copies). `r#type` is the input type.
pub(crate) fn map<B: Backend>(
    device: &Device<B>,
    op: KernelOp,
    r#type: DataType,
    output: Operand<'_, B::Memory>,
    input: Operand<'_, B::Memory>,
) -> Result<(), ArrayError> {
    let mode = ExecMode(Mode::of(output.shape), Mode::of(input.shape));
    let name = KernelName::new(op, mode, r#type).sparse(mode.0.is_strided());

    let mut args = vec![offset(input.shape)?, offset(output.shape)?];
    if mode.1.is_strided() {
        args.extend(layout(input.shape)?);
    }
    if mode.0.is_strided() {
        args.extend(layout(output.shape)?);
    }
    args.push(Argument::Buffer(input.buffer.memory()));
    args.push(Argument::Buffer(output.buffer.memory()));

    let len = output.shape.size();
    launch(device, name, &args, |threads, _| linear_grid(len, threads))
}

/// Two-input elementwise kernels. Both inputs must already be broadcast to the output view.
pub(crate) fn zip<B: Backend>(
    device: &Device<B>,
    op: BinaryOp,
    r#type: DataType,
    output: Operand<'_, B::Memory>,
    lhs: Operand<'_, B::Memory>,
    rhs: Operand<'_, B::Memory>,
) -> Result<(), ArrayError> {
    let mode = ExecMode(Mode::of(lhs.shape), Mode::of(rhs.shape));
    let sparse = Mode::of(output.shape).is_strided();
    let name = KernelName::new(KernelOp::Binary(op), mode, r#type).sparse(sparse);

    let mut args = vec![
        offset(lhs.shape)?,
        offset(rhs.shape)?,
        offset(output.shape)?,
    ];
    for operand in [lhs, rhs].iter().filter(|x| Mode::of(x.shape).is_strided()) {
        args.extend(layout(operand.shape)?);
    }
    if sparse {
        args.extend(layout(output.shape)?);
    }
    args.push(Argument::Buffer(lhs.buffer.memory()));
    args.push(Argument::Buffer(rhs.buffer.memory()));
    args.push(Argument::Buffer(output.buffer.memory()));

    let len = output.shape.size();
    launch(device, name, &args, |threads, _| linear_grid(len, threads))
}

/// Batched matrix product over canonical 3-D operands. `dims` is `[batch, m, k, n]`.
pub(crate) fn matmul<B: Backend>(
    device: &Device<B>,
    r#type: DataType,
    output: Operand<'_, B::Memory>,
    lhs: Operand<'_, B::Memory>,
    rhs: Operand<'_, B::Memory>,
    dims: [usize; 4],
) -> Result<(), ArrayError> {
    let mode = ExecMode(Mode::of(lhs.shape), Mode::of(rhs.shape));
    let name = KernelName::new(KernelOp::Binary(BinaryOp::Matmul), mode, r#type);

    let mut args = vec![
        offset(lhs.shape)?,
        offset(rhs.shape)?,
        offset(output.shape)?,
    ];
    for operand in [lhs, rhs].iter().filter(|x| Mode::of(x.shape).is_strided()) {
        args.extend(layout(operand.shape)?);
    }
    let dims = dims.map(size).into_iter().collect::<Result<Vec<_>, _>>()?;
    args.push(Argument::u32s(&dims));
    args.push(Argument::Buffer(lhs.buffer.memory()));
    args.push(Argument::Buffer(rhs.buffer.memory()));
    args.push(Argument::Buffer(output.buffer.memory()));

    let [batch, m, _, n] = [dims[0], dims[1], dims[2], dims[3]];
    launch(device, name, &args, |threads, _| {
        Ok(Grid {
            work: [n, m, batch],
            group: [threads.min(n).max(1), 1, 1],
        })
    })
}

/// Reduces the trailing `cols` elements of each of `rows` rows of `input`, which must already
/// have its reduced dimensions permuted to the back. A single row goes through the `all`
/// kernel.
pub(crate) fn reduce<B: Backend>(
    device: &Device<B>,
    op: ReduceOp,
    r#type: DataType,
    output: &Buffer<B::Memory>,
    input: Operand<'_, B::Memory>,
    rows: usize,
    cols: usize,
) -> Result<(), ArrayError> {
    let mode = ExecMode(Mode::Dense, Mode::of(input.shape));
    let sub = match rows {
        1 => SubMode::All,
        _ => SubMode::Col,
    };
    let name = KernelName::new(KernelOp::Reduce(op), mode, r#type).sub(sub);

    let mut args = vec![offset(input.shape)?];
    if mode.1.is_strided() {
        args.extend(layout(input.shape)?);
    }
    match sub {
        SubMode::All => args.push(Argument::u32(size(cols)?)),
        SubMode::Col => {
            args.push(Argument::u32(size(rows)?));
            args.push(Argument::u32(size(cols)?));
        }
    }
    args.push(Argument::Buffer(input.buffer.memory()));
    args.push(Argument::Buffer(output.memory()));

    let context = device.context();
    let kernel = context.resolve(&name.to_string())?;
    let (threads, vector_width) = (kernel.max_threads_per_group(), context.vector_width());
    let (grid, scratch) = match sub {
        SubMode::All => reduce_all_grid(threads, vector_width),
        SubMode::Col => reduce_col_grid(rows, cols, threads, vector_width)?,
    };
    args.push(Argument::Scratch(scratch * r#type.size()));

    launch(device, name, &args, |_, _| Ok(grid))
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{linear_grid, reduce_all_grid, reduce_col_grid, round_threads};

    #[test]
    fn test_round_threads() {
        assert_eq!(round_threads(1024, 32), 1024);
        assert_eq!(round_threads(100, 32), 96);
        assert_eq!(round_threads(16, 32), 16);
        assert_eq!(round_threads(0, 32), 1);
    }

    #[test]
    fn test_linear_grid() -> Result<(), Box<dyn Error>> {
        let grid = linear_grid(10, 256)?;
        assert_eq!(grid.work, [10, 1, 1]);
        assert_eq!(grid.group, [10, 1, 1]);

        let grid = linear_grid(1000, 256)?;
        assert_eq!(grid.group, [256, 1, 1]);
        assert_eq!(grid.groups(), [4, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_reduce_grids() -> Result<(), Box<dyn Error>> {
        let (grid, scratch) = reduce_all_grid(1000, 32);
        assert_eq!(grid.group, [992, 1, 1]);
        assert_eq!(scratch, 992);

        let (grid, scratch) = reduce_col_grid(100, 3, 256, 32)?;
        assert_eq!(grid.group, [32, 8, 1]);
        assert_eq!(grid.work, [32, 100, 1]);
        assert_eq!(scratch, 256);

        let (grid, _) = reduce_col_grid(2, 5000, 256, 32)?;
        assert_eq!(grid.group, [256, 1, 1]);

        let (grid, _) = reduce_col_grid(2, 40, 256, 32)?;
        assert_eq!(grid.group, [64, 2, 1]);
        Ok(())
    }
}
