use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    array::{Array, ArrayError},
    device::Backend,
    num::DataType,
    shape::{Shape, ShapeError, broadcast_view},
    slice::Range,
};

#[derive(Debug, Clone, Copy, PartialEq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Initializer {
    #[display("arange")]
    Arange { start: f64, step: f64 },
    #[display("full")]
    Full { value: f64 },
    /// Data uploaded from the host.
    #[display("external")]
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnaryOp {
    #[display("identity")]
    Identity,
    #[display("exp")]
    Exp,
    #[display("log")]
    Log,
    #[display("neg")]
    Neg,
    #[display("reciprocal")]
    Reciprocal,
    #[display("square")]
    Square,
    #[display("sqrt")]
    SquareRoot,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 7] = [
        UnaryOp::Identity,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Neg,
        UnaryOp::Reciprocal,
        UnaryOp::Square,
        UnaryOp::SquareRoot,
    ];

    /// Ops whose result is fractional even for integer input.
    #[inline]
    pub const fn is_float_producing(self) -> bool {
        matches!(
            self,
            UnaryOp::Exp | UnaryOp::Log | UnaryOp::Reciprocal | UnaryOp::SquareRoot
        )
    }

    /// Integer inputs of float-producing ops are promoted to `f32`.
    #[inline]
    pub const fn output_type(self, input: DataType) -> DataType {
        match self.is_float_producing() && !input.is_float() {
            true => DataType::F32,
            false => input,
        }
    }

    pub(crate) fn check<B: Backend>(
        self,
        input: &Array<B>,
        in_place: bool,
    ) -> Result<(Shape, DataType), ArrayError> {
        let r#type = input.data_type();
        if !DataType::UNARY.contains(&r#type) {
            return Err(ArrayError::Unsupported(self.to_string(), r#type));
        }
        let output = self.output_type(r#type);
        match in_place {
            true if output != r#type => Err(ArrayError::InPlace(self.to_string(), output, r#type)),
            true => {
                input.check_writable()?;
                Ok((input.shape().clone(), r#type))
            }
            false => Ok((Shape::new(input.shape().view())?, output)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinaryOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("eq")]
    Eq,
    #[display("neq")]
    Neq,
    #[display("lt")]
    Lt,
    #[display("gt")]
    Gt,
    #[display("leq")]
    Leq,
    #[display("geq")]
    Geq,
    #[display("matmul")]
    Matmul,
}

impl BinaryOp {
    pub const ARITHMETIC: [BinaryOp; 4] = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div];

    pub const COMPARISON: [BinaryOp; 6] = [
        BinaryOp::Eq,
        BinaryOp::Neq,
        BinaryOp::Lt,
        BinaryOp::Gt,
        BinaryOp::Leq,
        BinaryOp::Geq,
    ];

    #[inline]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Leq | BinaryOp::Geq
        )
    }

    /// Only arithmetic ops may write into their left operand.
    #[inline]
    pub const fn supports_in_place(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
    }

    #[inline]
    pub const fn output_type(self, input: DataType) -> DataType {
        match self.is_comparison() {
            true => DataType::Bool,
            false => input,
        }
    }

    /// Validates an elementwise op and returns the output layout and type.
    pub(crate) fn check<B: Backend>(
        self,
        lhs: &Array<B>,
        rhs: &Array<B>,
        in_place: bool,
    ) -> Result<(Shape, DataType), ArrayError> {
        let r#type = check_pair(self, lhs, rhs)?;
        match in_place {
            true if !self.supports_in_place() => {
                Err(ArrayError::InPlace(self.to_string(), self.output_type(r#type), r#type))
            }
            true => {
                lhs.check_writable()?;
                let shape = rhs.shape();
                let view = lhs.shape().view();
                match shape.broadcastable_to(view) {
                    true => Ok((lhs.shape().clone(), r#type)),
                    false => Err(ShapeError::BroadcastTo(shape.clone(), view.to_vec()).into()),
                }
            }
            false => {
                let (x, y) = (lhs.shape(), rhs.shape());
                let view = broadcast_view(x.view(), y.view())
                    .ok_or_else(|| ShapeError::Broadcast(x.clone(), y.clone()))?;
                Ok((Shape::new(view)?, self.output_type(r#type)))
            }
        }
    }

    /// Validates a matrix product.
    pub(crate) fn check_matmul<B: Backend>(
        lhs: &Array<B>,
        rhs: &Array<B>,
    ) -> Result<DataType, ArrayError> {
        let r#type = check_pair(BinaryOp::Matmul, lhs, rhs)?;
        let (x, y) = (lhs.shape(), rhs.shape());
        match x.matmul_broadcastable(y) {
            true => Ok(r#type),
            false => Err(ShapeError::Matmul(x.clone(), y.clone()).into()),
        }
    }
}

fn check_pair<B: Backend>(
    op: BinaryOp,
    lhs: &Array<B>,
    rhs: &Array<B>,
) -> Result<DataType, ArrayError> {
    if lhs.device() != rhs.device() {
        return Err(ArrayError::Device(
            lhs.device().to_string(),
            rhs.device().to_string(),
        ));
    }
    let r#type = lhs.data_type();
    if r#type != rhs.data_type() {
        return Err(ArrayError::Type(r#type, rhs.data_type()));
    }
    if !DataType::BINARY.contains(&r#type) {
        return Err(ArrayError::Unsupported(op.to_string(), r#type));
    }
    Ok(r#type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReduceOp {
    #[display("sum")]
    Sum,
    #[display("max")]
    Max,
    #[display("min")]
    Min,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 3] = [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min];

    /// Validates the reduced dimensions and returns the normalized dims plus the output layout.
    pub(crate) fn check<B: Backend>(
        self,
        input: &Array<B>,
        dims: &[usize],
    ) -> Result<(Vec<usize>, Shape), ArrayError> {
        let r#type = input.data_type();
        if !DataType::REDUCE.contains(&r#type) {
            return Err(ArrayError::Unsupported(self.to_string(), r#type));
        }
        let shape = input.shape();
        let rank = shape.len();
        let mut dims = dims.to_vec();
        dims.sort_unstable();
        dims.dedup();
        if let Some(&dim) = dims.iter().find(|&&dim| dim >= rank) {
            return Err(ShapeError::Dim { dim, rank }.into());
        }
        if dims.len() == rank {
            return Ok((dims, Shape::new([1])?));
        }
        let mut kept = shape.clone();
        for &dim in dims.iter().rev() {
            kept = kept.remove(dim)?;
        }
        Ok((dims, Shape::new(kept.view())?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransformOp {
    /// Reinterprets the view; `materialize` is set when the source is not contiguous and a
    /// copy is needed.
    #[display("reshape")]
    Reshape { materialize: bool },
    #[display("permute")]
    Permute(Vec<usize>),
    #[display("broadcast")]
    Broadcast,
    #[display("slice")]
    Slice(Vec<Range>),
    /// Scatters the input into a zero-filled array, at the positions a slice would select.
    #[display("unslice")]
    Unslice(Vec<Range>),
}

impl TransformOp {
    /// Returns `true` if the output shares the buffer of the input.
    #[inline]
    pub fn is_alias(&self) -> bool {
        match self {
            TransformOp::Reshape { materialize } => !materialize,
            TransformOp::Permute(_) | TransformOp::Broadcast | TransformOp::Slice(_) => true,
            TransformOp::Unslice(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MoveOp {
    #[display("copy")]
    Copy,
}

/// How a node computes its value from its operands.
pub enum Op<B: Backend> {
    Initializer(Initializer),
    Unary {
        op: UnaryOp,
        input: Array<B>,
        in_place: bool,
    },
    Binary {
        op: BinaryOp,
        lhs: Array<B>,
        rhs: Array<B>,
        in_place: bool,
    },
    Transform {
        op: TransformOp,
        input: Array<B>,
    },
    Reduce {
        op: ReduceOp,
        input: Array<B>,
        dims: Vec<usize>,
    },
    Move {
        op: MoveOp,
        input: Array<B>,
    },
}

impl<B: Backend> std::fmt::Display for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Initializer(op) => write!(f, "{op}"),
            Op::Unary { op, .. } => write!(f, "{op}"),
            Op::Binary { op, .. } => write!(f, "{op}"),
            Op::Transform { op, .. } => write!(f, "{op}"),
            Op::Reduce { op, .. } => write!(f, "{op}"),
            Op::Move { op, .. } => write!(f, "{op}"),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let operands = self.operands().into_iter().map(|x| x.id());
        write!(f, "{self}({})", itertools::Itertools::format(operands, ", "))
    }
}

impl<B: Backend> Op<B> {
    /// Operands in slot order.
    pub fn operands(&self) -> Vec<&Array<B>> {
        match self {
            Op::Initializer(_) => vec![],
            Op::Unary { input, .. } => vec![input],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Transform { input, .. } => vec![input],
            Op::Reduce { input, .. } => vec![input],
            Op::Move { input, .. } => vec![input],
        }
    }

    /// Returns `true` if the node writes into (and so shares the buffer of) its first operand.
    #[inline]
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            Op::Unary { in_place: true, .. } | Op::Binary { in_place: true, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{BinaryOp, UnaryOp};
    use crate::num::DataType;

    #[test]
    fn test_output_type() {
        assert_eq!(UnaryOp::Exp.output_type(DataType::I32), DataType::F32);
        assert_eq!(UnaryOp::SquareRoot.output_type(DataType::F16), DataType::F16);
        assert_eq!(UnaryOp::Neg.output_type(DataType::I32), DataType::I32);
        assert_eq!(BinaryOp::Lt.output_type(DataType::F32), DataType::Bool);
        assert_eq!(BinaryOp::Matmul.output_type(DataType::U32), DataType::U32);
    }

    #[test]
    fn test_names() {
        assert_eq!(UnaryOp::SquareRoot.to_string(), "sqrt");
        assert_eq!(BinaryOp::Geq.to_string(), "geq");
        assert!(BinaryOp::ARITHMETIC.iter().all(|op| op.supports_in_place()));
        assert!(!BinaryOp::COMPARISON.iter().any(|op| op.supports_in_place()));
    }
}
