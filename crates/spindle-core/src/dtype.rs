use std::fmt;
use std::ops::{Add, AddAssign, Mul};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Plain-old-data value that may live in device memory.
pub trait DeviceValue: bytemuck::Pod + Send + Sync + 'static {}

impl<T: bytemuck::Pod + Send + Sync + 'static> DeviceValue for T {}

/// Numeric precision of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit IEEE 754 single precision
    #[default]
    F32,
    /// 64-bit IEEE 754 double precision
    F64,
}

impl Precision {
    /// Size in bytes of one value.
    pub fn size(&self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F64 => 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::F32 => write!(f, "f32"),
            Precision::F64 => write!(f, "f64"),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float" | "single" => Ok(Precision::F32),
            "f64" | "double" => Ok(Precision::F64),
            other => Err(format!("unknown precision '{other}' (expected f32 or f64)")),
        }
    }
}

/// Element type of weights and activations.
///
/// Implemented for `f32` and `f64` only.
pub trait Element:
    DeviceValue
    + PartialOrd
    + Add<Output = Self>
    + Mul<Output = Self>
    + AddAssign
    + Default
    + fmt::Debug
    + fmt::Display
{
    const PRECISION: Precision;
    const ZERO: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    /// Decode from the first `size_of::<Self>()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Append the little-endian encoding to `out`.
    fn extend_le(self, out: &mut Vec<u8>);
}

impl Element for f32 {
    const PRECISION: Precision = Precision::F32;
    const ZERO: Self = 0.0;

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(raw)
    }

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Element for f64 {
    const PRECISION: Precision = Precision::F64;
    const ZERO: Self = 0.0;

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(raw)
    }

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_sizes() {
        assert_eq!(Precision::F32.size(), std::mem::size_of::<f32>());
        assert_eq!(Precision::F64.size(), std::mem::size_of::<f64>());
        assert_eq!(<f64 as Element>::PRECISION, Precision::F64);
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("f32".parse::<Precision>().unwrap(), Precision::F32);
        assert_eq!("DOUBLE".parse::<Precision>().unwrap(), Precision::F64);
        assert!("f16".parse::<Precision>().is_err());
        assert_eq!(format!("{}", Precision::F64), "f64");
    }

    #[test]
    fn test_le_encoding() {
        let mut buf = Vec::new();
        (-0.3f32).extend_le(&mut buf);
        1.5f64.extend_le(&mut buf);
        assert_eq!(buf.len(), 12);
        assert_eq!(f32::from_le_slice(&buf[..4]), -0.3);
        assert_eq!(f64::from_le_slice(&buf[4..]), 1.5);
    }
}
