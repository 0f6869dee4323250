use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of an array. The universe is fixed; each variant has a short name used in
/// kernel names and a byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    #[display("bool")]
    Bool,
    #[display("u8")]
    U8,
    #[display("i32")]
    I32,
    #[display("u32")]
    U32,
    #[display("f16")]
    F16,
    #[display("f32")]
    F32,
}

impl DataType {
    /// Every data type, in registration order.
    pub const ALL: [DataType; 6] = [
        DataType::Bool,
        DataType::U8,
        DataType::I32,
        DataType::U32,
        DataType::F16,
        DataType::F32,
    ];

    /// Types accepted by arithmetic binary ops, comparisons and matmul.
    pub const BINARY: [DataType; 4] = [DataType::I32, DataType::U32, DataType::F16, DataType::F32];

    /// Types accepted by unary ops.
    pub const UNARY: [DataType; 4] = [DataType::I32, DataType::U32, DataType::F16, DataType::F32];

    /// Types accepted by reductions.
    pub const REDUCE: [DataType; 4] = [DataType::I32, DataType::U32, DataType::F16, DataType::F32];

    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::U8 => 1,
            DataType::I32 => 4,
            DataType::U32 => 4,
            DataType::F16 => 2,
            DataType::F32 => 4,
        }
    }

    /// The short name used in kernel names.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::U32 => "u32",
            DataType::F16 => "f16",
            DataType::F32 => "f32",
        }
    }

    #[inline]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::F32)
    }

    #[inline]
    pub const fn is_integer(self) -> bool {
        matches!(self, DataType::U8 | DataType::I32 | DataType::U32)
    }

    /// Reduces an exact integer into the range of this type, wrapping on overflow.
    pub fn wrap(self, value: i128) -> f64 {
        match self {
            DataType::Bool => (value != 0) as u8 as f64,
            DataType::U8 => value as u8 as f64,
            DataType::I32 => value as i32 as f64,
            DataType::U32 => value as u32 as f64,
            DataType::F16 | DataType::F32 => value as f64,
        }
    }

    /// Encodes a host value as one element of this type, in native byte order. Integers out
    /// of range wrap.
    pub fn encode(self, value: f64) -> Vec<u8> {
        match self {
            DataType::Bool => vec![(value != 0.0) as u8],
            DataType::U8 => vec![value as i64 as u8],
            DataType::I32 => (value as i64 as i32).to_ne_bytes().to_vec(),
            DataType::U32 => (value as i64 as u32).to_ne_bytes().to_vec(),
            DataType::F16 => f16::from_f64(value).to_ne_bytes().to_vec(),
            DataType::F32 => (value as f32).to_ne_bytes().to_vec(),
        }
    }

    /// Decodes one element of this type from the front of `bytes`.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than [`DataType::size`].
    pub fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            DataType::Bool => (bytes[0] != 0) as u8 as f64,
            DataType::U8 => bytes[0] as f64,
            DataType::I32 => i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            DataType::U32 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            DataType::F16 => f16::from_ne_bytes([bytes[0], bytes[1]]).to_f64(),
            DataType::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        }
    }
}

/// A boolean element, stored as one byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Bool(pub u8);

unsafe impl Zeroable for Bool {}

unsafe impl Pod for Bool {}

impl From<bool> for Bool {
    #[inline]
    fn from(value: bool) -> Self {
        Self(value as u8)
    }
}

impl From<Bool> for bool {
    #[inline]
    fn from(value: Bool) -> Self {
        value.0 != 0
    }
}

/// A host type that maps one-to-one onto a [`DataType`].
pub trait Scalar: Sized + Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;
}

impl Scalar for Bool {
    const DATA_TYPE: DataType = DataType::Bool;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

mod sealed {
    use half::f16;

    use super::Bool;

    pub trait Sealed {}

    impl Sealed for Bool {}
    impl Sealed for u8 {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
    impl Sealed for f16 {}
    impl Sealed for f32 {}
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::DataType;

    #[test]
    fn test_encode_decode() {
        for r#type in DataType::ALL {
            let bytes = r#type.encode(1.0);
            assert_eq!(bytes.len(), r#type.size());
            assert_eq!(r#type.decode(&bytes), 1.0);
        }
        assert_eq!(DataType::I32.decode(&DataType::I32.encode(-7.0)), -7.0);
        assert_eq!(DataType::Bool.decode(&DataType::Bool.encode(3.0)), 1.0);

        // integers wrap instead of saturating
        let wrapped = |r#type: DataType, value: f64| r#type.decode(&r#type.encode(value));
        assert_eq!(wrapped(DataType::I32, 2147483648.0), i32::MIN as f64);
        assert_eq!(wrapped(DataType::U32, -1.0), u32::MAX as f64);
        assert_eq!(wrapped(DataType::U8, 257.0), 1.0);
        assert_eq!(DataType::I32.wrap(i32::MAX as i128 + 1), i32::MIN as f64);
        assert_eq!(DataType::U32.wrap(1 << 32), 0.0);
        assert_eq!(DataType::F32.wrap(1 << 40), (1u64 << 40) as f64);
        assert_eq!(
            DataType::F16.encode(0.5),
            f16::from_f32(0.5).to_ne_bytes().to_vec()
        );
    }

    #[test]
    fn test_names() {
        for r#type in DataType::ALL {
            assert_eq!(DataType::from_name(r#type.name()), Some(r#type));
            assert_eq!(r#type.to_string(), r#type.name());
        }
        assert_eq!(DataType::from_name("f64"), None);
    }
}
