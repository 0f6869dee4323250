//! Kernel naming.
//!
//! Every kernel a backend registers is named
//! `[sparse_]<op>[_all|_col]_<mode>_<type>`, where `<mode>` is two letters, `v` for a dense
//! operand and `s` for a strided one. Binary kernels read the letters as (lhs, rhs); every
//! other kernel reads them as (output, input). Initializers always use `vv`. The `sparse_`
//! prefix marks kernels whose output is written through a strided layout.
use std::str::FromStr;

use derive_more::Display;
use itertools::iproduct;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    num::DataType,
    ops::{BinaryOp, ReduceOp, UnaryOp},
    shape::Shape,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    /// Contiguous; addressed by an offset alone.
    #[display("v")]
    Dense,
    /// Addressed through a full view and stride descriptor.
    #[display("s")]
    Strided,
}

impl Mode {
    #[inline]
    pub fn of(shape: &Shape) -> Self {
        match shape.is_contiguous() {
            true => Mode::Dense,
            false => Mode::Strided,
        }
    }

    #[inline]
    pub fn is_strided(self) -> bool {
        matches!(self, Mode::Strided)
    }

    fn parse(c: char) -> Option<Self> {
        match c {
            'v' => Some(Mode::Dense),
            's' => Some(Mode::Strided),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0}{_1}")]
pub struct ExecMode(pub Mode, pub Mode);

impl ExecMode {
    pub const DENSE: ExecMode = ExecMode(Mode::Dense, Mode::Dense);

    pub const ALL: [ExecMode; 4] = [
        ExecMode(Mode::Dense, Mode::Dense),
        ExecMode(Mode::Dense, Mode::Strided),
        ExecMode(Mode::Strided, Mode::Dense),
        ExecMode(Mode::Strided, Mode::Strided),
    ];

    /// Modes with a dense first letter.
    pub const DENSE_FIRST: [ExecMode; 2] = [
        ExecMode(Mode::Dense, Mode::Dense),
        ExecMode(Mode::Dense, Mode::Strided),
    ];

    /// Modes with a strided first letter.
    pub const STRIDED_FIRST: [ExecMode; 2] = [
        ExecMode(Mode::Strided, Mode::Dense),
        ExecMode(Mode::Strided, Mode::Strided),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SubMode {
    /// Reduce every element into one.
    #[display("all")]
    All,
    /// Reduce the trailing (column) axis of a row-major matrix.
    #[display("col")]
    Col,
}

/// The operation part of a kernel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KernelOp {
    #[display("full")]
    Full,
    #[display("arange")]
    Arange,
    #[display("copy")]
    Copy,
    #[display("{_0}")]
    Unary(UnaryOp),
    #[display("{_0}")]
    Binary(BinaryOp),
    #[display("{_0}")]
    Reduce(ReduceOp),
}

impl KernelOp {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "full" => return Some(KernelOp::Full),
            "arange" => return Some(KernelOp::Arange),
            "copy" => return Some(KernelOp::Copy),
            _ => {}
        }
        let unary = UnaryOp::ALL.into_iter().map(KernelOp::Unary);
        let binary = [BinaryOp::ARITHMETIC.as_slice(), &BinaryOp::COMPARISON, &[BinaryOp::Matmul]]
            .concat()
            .into_iter()
            .map(KernelOp::Binary);
        let reduce = ReduceOp::ALL.into_iter().map(KernelOp::Reduce);
        unary
            .chain(binary)
            .chain(reduce)
            .find(|op| op.to_string() == name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid kernel name: {0}")]
pub struct KernelNameError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelName {
    pub sparse: bool,
    pub op: KernelOp,
    pub sub: Option<SubMode>,
    pub mode: ExecMode,
    pub r#type: DataType,
}

impl std::fmt::Display for KernelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sparse {
            write!(f, "sparse_")?;
        }
        write!(f, "{}", self.op)?;
        if let Some(sub) = self.sub {
            write!(f, "_{sub}")?;
        }
        write!(f, "_{}_{}", self.mode, self.r#type)
    }
}

impl FromStr for KernelName {
    type Err = KernelNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || KernelNameError(s.to_owned());
        let (sparse, rest) = match s.strip_prefix("sparse_") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (rest, r#type) = rest.rsplit_once('_').ok_or_else(error)?;
        let r#type = DataType::from_name(r#type).ok_or_else(error)?;
        let (rest, mode) = rest.rsplit_once('_').ok_or_else(error)?;
        let mode = match mode.chars().collect::<Vec<_>>()[..] {
            [x, y] => ExecMode(
                Mode::parse(x).ok_or_else(error)?,
                Mode::parse(y).ok_or_else(error)?,
            ),
            _ => return Err(error()),
        };
        let (op, sub) = match rest.rsplit_once('_') {
            Some((op, "all")) => (op, Some(SubMode::All)),
            Some((op, "col")) => (op, Some(SubMode::Col)),
            Some(_) => return Err(error()),
            None => (rest, None),
        };
        let op = KernelOp::from_name(op).ok_or_else(error)?;
        Ok(Self {
            sparse,
            op,
            sub,
            mode,
            r#type,
        })
    }
}

impl KernelName {
    #[inline]
    pub fn new(op: KernelOp, mode: ExecMode, r#type: DataType) -> Self {
        Self {
            sparse: false,
            op,
            sub: None,
            mode,
            r#type,
        }
    }

    #[inline]
    pub fn sparse(self, sparse: bool) -> Self {
        Self { sparse, ..self }
    }

    #[inline]
    pub fn sub(self, sub: SubMode) -> Self {
        Self {
            sub: Some(sub),
            ..self
        }
    }
}

/// Every kernel name a complete backend registers: the cross product of each operation with
/// the types and modes it accepts.
pub fn registry() -> Vec<KernelName> {
    let mut names = vec![];

    for (op, r#type) in iproduct!([KernelOp::Full, KernelOp::Arange], DataType::ALL) {
        names.push(KernelName::new(op, ExecMode::DENSE, r#type));
    }

    for (op, mode, r#type) in iproduct!(UnaryOp::ALL, ExecMode::ALL, DataType::UNARY) {
        let name = KernelName::new(KernelOp::Unary(op), mode, r#type);
        names.push(name.sparse(mode.0.is_strided()));
    }

    for (op, mode, r#type) in iproduct!(BinaryOp::ARITHMETIC, ExecMode::ALL, DataType::BINARY) {
        let name = KernelName::new(KernelOp::Binary(op), mode, r#type);
        names.push(name);
        names.push(name.sparse(true));
    }

    let ops = [BinaryOp::COMPARISON.as_slice(), &[BinaryOp::Matmul]].concat();
    for (&op, mode, r#type) in iproduct!(&ops, ExecMode::ALL, DataType::BINARY) {
        names.push(KernelName::new(KernelOp::Binary(op), mode, r#type));
    }

    let subs = [SubMode::All, SubMode::Col];
    for (op, sub, mode, r#type) in
        iproduct!(ReduceOp::ALL, subs, ExecMode::DENSE_FIRST, DataType::REDUCE)
    {
        names.push(KernelName::new(KernelOp::Reduce(op), mode, r#type).sub(sub));
    }

    for (mode, r#type) in iproduct!(ExecMode::ALL, DataType::ALL) {
        let name = KernelName::new(KernelOp::Copy, mode, r#type);
        names.push(name.sparse(mode.0.is_strided()));
    }

    names
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use rustc_hash::FxHashSet as HashSet;

    use super::{ExecMode, KernelName, KernelOp, Mode, SubMode, registry};
    use crate::{
        num::DataType,
        ops::{BinaryOp, ReduceOp, UnaryOp},
    };

    #[test]
    fn test_format() {
        let name = KernelName::new(
            KernelOp::Binary(BinaryOp::Add),
            ExecMode(Mode::Dense, Mode::Strided),
            DataType::F32,
        );
        assert_eq!(name.to_string(), "add_vs_f32");
        assert_eq!(name.sparse(true).to_string(), "sparse_add_vs_f32");

        let name = KernelName::new(
            KernelOp::Reduce(ReduceOp::Sum),
            ExecMode::DENSE,
            DataType::F16,
        );
        assert_eq!(name.sub(SubMode::Col).to_string(), "sum_col_vv_f16");
        assert_eq!(name.sub(SubMode::All).to_string(), "sum_all_vv_f16");
    }

    #[test]
    fn test_parse() -> Result<(), Box<dyn Error>> {
        for name in registry() {
            let parsed: KernelName = name.to_string().parse()?;
            assert_eq!(parsed, name);
        }

        let name: KernelName = "sparse_sqrt_sv_f32".parse()?;
        assert!(name.sparse);
        assert_eq!(name.op, KernelOp::Unary(UnaryOp::SquareRoot));
        assert_eq!(name.mode, ExecMode(Mode::Strided, Mode::Dense));

        assert!("add_vx_f32".parse::<KernelName>().is_err());
        assert!("add_vv_f64".parse::<KernelName>().is_err());
        assert!("pow_vv_f32".parse::<KernelName>().is_err());
        assert!("sum_row_vv_f32".parse::<KernelName>().is_err());
        assert!("f32".parse::<KernelName>().is_err());
        Ok(())
    }

    #[test]
    fn test_registry() {
        let names = registry();
        let set: HashSet<_> = names.iter().map(|name| name.to_string()).collect();
        assert_eq!(set.len(), names.len());

        for name in [
            "full_vv_bool",
            "arange_vv_u8",
            "exp_vs_i32",
            "sparse_neg_ss_f16",
            "sparse_add_ss_f32",
            "mul_sv_u32",
            "leq_vv_f32",
            "matmul_vs_f32",
            "max_col_vs_f16",
            "min_all_vv_i32",
            "copy_vv_bool",
            "sparse_copy_sv_f32",
        ] {
            assert!(set.contains(name), "{name} is not registered");
        }
        assert!(!set.contains("add_vv_bool"));
        assert!(!set.contains("sparse_eq_vv_f32"));
        assert!(!set.contains("sum_all_sv_f32"));
    }
}
