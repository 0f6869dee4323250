//! Reverse-mode gradient rules.
//!
//! Gradients are arrays themselves: every rule builds new lazy nodes from the forward graph,
//! and every accumulation is executed before it is stored, so a stored gradient is always
//! materialized.
use itertools::Itertools;

use crate::{
    array::{Array, ArrayError},
    device::Backend,
    graph::Graph,
    ops::{BinaryOp, MoveOp, Op, ReduceOp, TransformOp, UnaryOp},
    shape::{ShapeError, invert_permutation},
};

/// Reduces `array` by summation until its view is `target`. `target` must broadcast to the
/// view of `array`.
pub fn sum_to<B: Backend>(array: &Array<B>, target: &[usize]) -> Result<Array<B>, ArrayError> {
    let view = array.view();
    if view == target {
        return Ok(array.clone());
    }
    let broadcastable = target.len() <= view.len()
        && target
            .iter()
            .rev()
            .zip(view.iter().rev())
            .all(|(&t, &v)| t == v || t == 1);
    if !broadcastable {
        return Err(ShapeError::BroadcastTo(array.shape().clone(), target.to_vec()).into());
    }

    let pad = view.len() - target.len();
    let dims = (0..view.len())
        .filter(|&dim| dim < pad || (target[dim - pad] == 1 && view[dim] != 1))
        .collect_vec();
    let reduced = match dims.is_empty() {
        true => array.clone(),
        false => array.sum(&dims)?,
    };
    reduced.reshape(target)
}

/// Adds `contribution` into the gradient of `array`, summing away broadcast dimensions first.
/// The stored gradient keeps its identity and buffer across calls. Constant arrays are skipped.
pub(crate) fn accumulate<B: Backend>(
    array: &Array<B>,
    contribution: &Array<B>,
) -> Result<(), ArrayError> {
    if array.is_constant() {
        return Ok(());
    }
    let contribution = sum_to(contribution, array.view())?;
    let current = match array.grad() {
        Some(grad) => grad,
        None => array.zeros_like()?,
    };
    Graph::new(&current.add_assign(&contribution)?).forward()?;
    // the sum now lives in the buffer of `current`
    *array.grad_lock() = Some(current);
    Ok(())
}

/// The gradient each operand of `node` receives, given the gradient `grad` of `node`.
pub(crate) fn contributions<B: Backend>(
    node: &Array<B>,
    grad: &Array<B>,
) -> Result<Vec<(Array<B>, Array<B>)>, ArrayError> {
    let not_differentiable = || ArrayError::NotDifferentiable(node.op().to_string());

    let contributions = match node.op() {
        Op::Initializer(_) => vec![],
        Op::Unary {
            op,
            input,
            in_place,
        } => {
            // an in-place node has overwritten its input
            if *in_place && !matches!(op, UnaryOp::Identity | UnaryOp::Neg) {
                return Err(not_differentiable());
            }
            if op.is_float_producing() && !input.data_type().is_float() {
                return Err(not_differentiable());
            }
            let grad = match op {
                UnaryOp::Identity => grad.clone(),
                UnaryOp::Neg => grad.try_neg()?,
                UnaryOp::Exp => grad.try_mul(node)?,
                UnaryOp::Log => grad.try_div(input)?,
                UnaryOp::Reciprocal => grad.try_mul(&node.square()?)?.try_neg()?,
                UnaryOp::Square => grad.try_mul(&input.try_add(input)?)?,
                UnaryOp::SquareRoot => grad.try_div(&node.try_add(node)?)?,
            };
            vec![(input.clone(), grad)]
        }
        Op::Binary {
            op,
            lhs,
            rhs,
            in_place,
        } => match (op, in_place) {
            (BinaryOp::Add, _) => vec![(lhs.clone(), grad.clone()), (rhs.clone(), grad.clone())],
            (BinaryOp::Sub, _) => vec![(lhs.clone(), grad.clone()), (rhs.clone(), grad.try_neg()?)],
            (BinaryOp::Mul, false) => vec![
                (lhs.clone(), grad.try_mul(rhs)?),
                (rhs.clone(), grad.try_mul(lhs)?),
            ],
            (BinaryOp::Div, false) => {
                let rhs_grad = grad.try_mul(lhs)?.try_div(&rhs.try_mul(rhs)?)?.try_neg()?;
                vec![(lhs.clone(), grad.try_div(rhs)?), (rhs.clone(), rhs_grad)]
            }
            (BinaryOp::Matmul, _) => {
                let lhs_grad = grad.matmul(&rhs.transpose(1, 2)?)?;
                let rhs_grad = lhs.transpose(1, 2)?.matmul(grad)?;
                vec![(lhs.clone(), lhs_grad), (rhs.clone(), rhs_grad)]
            }
            _ => return Err(not_differentiable()),
        },
        Op::Transform { op, input } => {
            let grad = match op {
                TransformOp::Reshape { .. } => grad.reshape(input.view())?,
                TransformOp::Permute(order) => grad.permute(&invert_permutation(order))?,
                TransformOp::Broadcast => grad.clone(),
                TransformOp::Slice(ranges) => grad.unslice(input.view(), ranges.clone())?,
                TransformOp::Unslice(ranges) => grad.slice(ranges.clone())?,
            };
            vec![(input.clone(), grad)]
        }
        Op::Reduce {
            op: ReduceOp::Sum,
            input,
            dims,
        } => {
            let view = input
                .view()
                .iter()
                .enumerate()
                .map(|(dim, &v)| match dims.contains(&dim) {
                    true => 1,
                    false => v,
                })
                .collect_vec();
            let grad = grad.reshape(view)?.broadcast_to(input.view())?;
            vec![(input.clone(), grad)]
        }
        Op::Reduce { .. } => return Err(not_differentiable()),
        Op::Move {
            op: MoveOp::Copy,
            input,
        } => vec![(input.clone(), grad.clone())],
    };
    Ok(contributions)
}
