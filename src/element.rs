//! Scalar element types that cross the host/device boundary.

use std::fmt;

/// Scalar types understood by kernels and buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Float,
    Int,
    UInt,
}

impl ScalarType {
    /// Size in bytes of one element.
    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::Float => std::mem::size_of::<f32>(),
            ScalarType::Int => std::mem::size_of::<i32>(),
            ScalarType::UInt => std::mem::size_of::<u32>(),
        }
    }

    /// OpenCL C spelling of the type.
    pub fn cl_name(self) -> &'static str {
        match self {
            ScalarType::Float => "float",
            ScalarType::Int => "int",
            ScalarType::UInt => "uint",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cl_name())
    }
}

/// A by-value kernel argument or an evaluated scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Float(f32),
    Int(i32),
    UInt(u32),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::UInt(_) => ScalarType::UInt,
        }
    }

    pub fn to_ne_bytes(self) -> [u8; 4] {
        match self {
            ScalarValue::Float(v) => v.to_ne_bytes(),
            ScalarValue::Int(v) => v.to_ne_bytes(),
            ScalarValue::UInt(v) => v.to_ne_bytes(),
        }
    }

    /// Reads one element of type `ty` from the start of `bytes`.
    pub fn from_ne_bytes(ty: ScalarType, bytes: [u8; 4]) -> Self {
        match ty {
            ScalarType::Float => ScalarValue::Float(f32::from_ne_bytes(bytes)),
            ScalarType::Int => ScalarValue::Int(i32::from_ne_bytes(bytes)),
            ScalarType::UInt => ScalarValue::UInt(u32::from_ne_bytes(bytes)),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Float(v) => write!(f, "{v}f"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::UInt(v) => write!(f, "{v}u"),
        }
    }
}

impl From<f32> for ScalarValue {
    fn from(v: f32) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<u32> for ScalarValue {
    fn from(v: u32) -> Self {
        ScalarValue::UInt(v)
    }
}

/// Host element types with a fixed device representation.
pub trait Element: Copy + Send + Sync + 'static {
    const TYPE: ScalarType;

    fn to_value(self) -> ScalarValue;

    fn from_value(value: ScalarValue) -> Option<Self>;
}

impl Element for f32 {
    const TYPE: ScalarType = ScalarType::Float;

    fn to_value(self) -> ScalarValue {
        ScalarValue::Float(self)
    }

    fn from_value(value: ScalarValue) -> Option<Self> {
        match value {
            ScalarValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl Element for i32 {
    const TYPE: ScalarType = ScalarType::Int;

    fn to_value(self) -> ScalarValue {
        ScalarValue::Int(self)
    }

    fn from_value(value: ScalarValue) -> Option<Self> {
        match value {
            ScalarValue::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl Element for u32 {
    const TYPE: ScalarType = ScalarType::UInt;

    fn to_value(self) -> ScalarValue {
        ScalarValue::UInt(self)
    }

    fn from_value(value: ScalarValue) -> Option<Self> {
        match value {
            ScalarValue::UInt(v) => Some(v),
            _ => None,
        }
    }
}

/// Serializes a host slice into device byte order.
pub fn to_bytes<T: Element>(data: &[T]) -> Vec<u8> {
    data.iter()
        .flat_map(|v| v.to_value().to_ne_bytes())
        .collect()
}

/// Deserializes device bytes into host elements. Trailing bytes that do not
/// form a whole element are ignored.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::TYPE.size_bytes())
        .filter_map(|c| {
            let raw = [c[0], c[1], c[2], c[3]];
            T::from_value(ScalarValue::from_ne_bytes(T::TYPE, raw))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_preserve_values() {
        let data = [0.5f32, -1.25, 3.0];
        let bytes = to_bytes(&data);
        assert_eq!(bytes.len(), 12);
        assert_eq!(from_bytes::<f32>(&bytes), data);
    }

    #[test]
    fn test_from_bytes_ignores_partial_tail() {
        let mut bytes = to_bytes(&[7i32]);
        bytes.push(0xff);
        assert_eq!(from_bytes::<i32>(&bytes), vec![7]);
    }

    #[test]
    fn test_size_matches_rust_type() {
        assert_eq!(f32::TYPE.size_bytes(), std::mem::size_of::<f32>());
        assert_eq!(i32::TYPE.size_bytes(), std::mem::size_of::<i32>());
        assert_eq!(u32::TYPE.size_bytes(), std::mem::size_of::<u32>());
    }

    #[test]
    fn test_display_uses_cl_literals() {
        assert_eq!(ScalarValue::Float(1.5).to_string(), "1.5f");
        assert_eq!(ScalarValue::UInt(3).to_string(), "3u");
        assert_eq!(ScalarType::UInt.to_string(), "uint");
    }
}
