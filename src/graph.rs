//! Graph execution.
//!
//! Evaluating an array walks its pending dependencies in post-order and dispatches each node
//! exactly once. View transforms and in-place ops never allocate: their buffer is an alias of
//! the operand's.
use rustc_hash::FxHashSet as HashSet;

use crate::{
    array::{Array, ArrayError, ArrayId},
    autograd,
    device::{Backend, Buffer},
    dispatch::{self, Operand},
    kernel::KernelOp,
    ops::{BinaryOp, Initializer, MoveOp, Op, TransformOp},
};

pub struct Graph<B: Backend> {
    root: Array<B>,
    visited: HashSet<ArrayId>,
    executed: Vec<ArrayId>,
}

impl<B: Backend> Graph<B> {
    pub fn new(root: &Array<B>) -> Self {
        Self {
            root: root.clone(),
            visited: HashSet::default(),
            executed: vec![],
        }
    }

    #[inline]
    pub fn root(&self) -> &Array<B> {
        &self.root
    }

    /// Ids of the nodes dispatched so far, in execution order.
    #[inline]
    pub fn executed(&self) -> &[ArrayId] {
        &self.executed
    }

    /// Executes every node the root depends on that has no data yet.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn forward(&mut self) -> Result<(), ArrayError> {
        let root = self.root.clone();
        for node in self.visit(&root) {
            self.execute(&node)?;
        }
        Ok(())
    }

    /// Evaluates the root, then propagates gradients from it to every node it depends on.
    /// The root is seeded with ones.
    ///
    /// Gradients of leaves (initialized or uploaded arrays) accumulate across passes; those of
    /// intermediate nodes are reset at the start of each pass.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn backward(&mut self) -> Result<(), ArrayError> {
        self.forward()?;

        let root = self.root.clone();
        let nodes = order(&root);
        nodes
            .iter()
            .filter(|node| !matches!(node.op(), Op::Initializer(_)))
            .for_each(|node| node.zero_grad());
        autograd::accumulate(&root, &root.ones_like()?)?;

        for node in nodes.iter().rev() {
            let Some(grad) = node.grad() else {
                continue;
            };
            for (operand, contribution) in autograd::contributions(node, &grad)? {
                autograd::accumulate(&operand, &contribution)?;
            }
        }
        Ok(())
    }

    /// Pending nodes reachable from `root` in post-order. Materialized nodes are leaves.
    fn visit(&mut self, root: &Array<B>) -> Vec<Array<B>> {
        let mut nodes = vec![];
        let mut stack = vec![(root.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                nodes.push(node);
                continue;
            }
            if node.is_materialized() || !self.visited.insert(node.id()) {
                continue;
            }
            let operands = node
                .op()
                .operands()
                .into_iter()
                .rev()
                .filter(|x| !self.visited.contains(&x.id()))
                .cloned()
                .collect::<Vec<_>>();
            stack.push((node, true));
            stack.extend(operands.into_iter().map(|x| (x, false)));
        }
        nodes
    }

    fn execute(&mut self, node: &Array<B>) -> Result<(), ArrayError> {
        let device = node.device();
        let shape = node.shape();
        let r#type = node.data_type();
        let alloc = || device.alloc(shape.size() * r#type.size());

        let buffer = match node.op() {
            Op::Initializer(Initializer::External) => {
                return Err(ArrayError::Unmaterialized(node.id()));
            }
            Op::Initializer(Initializer::Full { value }) => {
                let output = alloc()?;
                dispatch::fill(device, r#type, &output, shape.size(), *value)?;
                output
            }
            Op::Initializer(Initializer::Arange { start, step }) => {
                let output = alloc()?;
                dispatch::arange(device, r#type, &output, shape.size(), *start, *step)?;
                output
            }
            Op::Unary {
                op,
                input,
                in_place,
            } => {
                let output = match in_place {
                    true => source(input)?.alias(),
                    false => alloc()?,
                };
                dispatch::map(
                    device,
                    KernelOp::Unary(*op),
                    input.data_type(),
                    Operand {
                        shape,
                        buffer: &output,
                    },
                    operand(input)?,
                )?;
                output
            }
            Op::Binary {
                op: BinaryOp::Matmul,
                lhs,
                rhs,
                ..
            } => {
                let output = alloc()?;
                let (view, k) = (shape.view(), lhs.view()[2]);
                let dims = [view[0], view[1], k, view[2]];
                let output_ = Operand {
                    shape,
                    buffer: &output,
                };
                let r#type = lhs.data_type();
                dispatch::matmul(device, r#type, output_, operand(lhs)?, operand(rhs)?, dims)?;
                output
            }
            Op::Binary {
                op,
                lhs,
                rhs,
                in_place,
            } => {
                let output = match in_place {
                    true => source(lhs)?.alias(),
                    false => alloc()?,
                };
                let view = shape.view();
                let (x, y) = (lhs.shape().broadcast_to(view)?, rhs.shape().broadcast_to(view)?);
                dispatch::zip(
                    device,
                    *op,
                    lhs.data_type(),
                    Operand {
                        shape,
                        buffer: &output,
                    },
                    Operand {
                        shape: &x,
                        buffer: source(lhs)?,
                    },
                    Operand {
                        shape: &y,
                        buffer: source(rhs)?,
                    },
                )?;
                output
            }
            Op::Transform {
                op: TransformOp::Reshape { materialize: true },
                input,
            } => {
                let output = alloc()?;
                let output_ = Operand {
                    shape,
                    buffer: &output,
                };
                dispatch::map(device, KernelOp::Copy, r#type, output_, operand(input)?)?;
                output
            }
            Op::Transform {
                op: TransformOp::Unslice(ranges),
                input,
            } => {
                let output = alloc()?;
                dispatch::fill(device, r#type, &output, shape.size(), 0.0)?;
                let target = shape.slice(ranges)?;
                let output_ = Operand {
                    shape: &target,
                    buffer: &output,
                };
                dispatch::map(device, KernelOp::Copy, r#type, output_, operand(input)?)?;
                output
            }
            Op::Transform { input, .. } => source(input)?.alias(),
            Op::Reduce { op, input, dims } => {
                let output = alloc()?;
                let view = input.view();
                let (kept, reduced): (Vec<_>, Vec<_>) =
                    (0..view.len()).partition(|dim| !dims.contains(dim));
                let rows = kept.iter().map(|&dim| view[dim]).product();
                let cols = reduced.iter().map(|&dim| view[dim]).product();
                let permuted = input.shape().permute(&[kept, reduced].concat())?;
                let input_ = Operand {
                    shape: &permuted,
                    buffer: source(input)?,
                };
                dispatch::reduce(device, *op, r#type, &output, input_, rows, cols)?;
                output
            }
            Op::Move {
                op: MoveOp::Copy,
                input,
            } => {
                let output = alloc()?;
                let output_ = Operand {
                    shape,
                    buffer: &output,
                };
                dispatch::map(device, KernelOp::Copy, r#type, output_, operand(input)?)?;
                output
            }
        };

        log::debug!("executed {} ({}) on {device}", node.id(), node.op());
        node.materialize(buffer);
        self.executed.push(node.id());
        Ok(())
    }
}

fn source<B: Backend>(array: &Array<B>) -> Result<&Buffer<B::Memory>, ArrayError> {
    array.buffer().ok_or(ArrayError::Unmaterialized(array.id()))
}

fn operand<B: Backend>(array: &Array<B>) -> Result<Operand<'_, B::Memory>, ArrayError> {
    Ok(Operand {
        shape: array.shape(),
        buffer: source(array)?,
    })
}

/// Every node reachable from `root`, each listed after all of its operands.
pub(crate) fn order<B: Backend>(root: &Array<B>) -> Vec<Array<B>> {
    let mut visited = HashSet::default();
    let mut nodes = vec![];
    let mut stack = vec![(root.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            nodes.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        let operands = node
            .op()
            .operands()
            .into_iter()
            .rev()
            .filter(|x| !visited.contains(&x.id()))
            .cloned()
            .collect::<Vec<_>>();
        stack.push((node, true));
        stack.extend(operands.into_iter().map(|x| (x, false)));
    }
    nodes
}
