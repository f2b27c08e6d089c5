use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Numeric layout of a parameter inside a data block. All values are
/// big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    #[serde(alias = "float", alias = "real")]
    Float32,
    #[serde(alias = "double", alias = "lreal")]
    Float64,
}

impl ValueType {
    /// Byte width on the wire.
    pub fn width(self) -> usize {
        match self {
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "uint32" => Ok(Self::Uint32),
            "int32" => Ok(Self::Int32),
            "float32" | "float" | "real" => Ok(Self::Float32),
            "float64" | "double" | "lreal" => Ok(Self::Float64),
            other => Err(format!("unsupported value type '{other}'")),
        }
    }
}

/// A decoded parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// Nearest integer, used for cumulative counters.
    pub fn to_counter(self) -> i64 {
        match self {
            Self::Int(v) => v,
            Self::Float(v) => v.round() as i64,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Decode `bytes` as a big-endian scalar of type `ty`.
///
/// The byte count must equal the type width exactly. Floats are rounded
/// (4 decimals for float32, 6 for float64) to hide representation noise.
pub fn decode(bytes: &[u8], ty: ValueType) -> Result<Scalar, ProtocolError> {
    let mismatch = || ProtocolError::Decode {
        value_type: ty,
        expected: ty.width(),
        actual: bytes.len(),
    };

    let value = match ty {
        ValueType::Uint16 => Scalar::Int(i64::from(u16::from_be_bytes(bytes.try_into().map_err(|_| mismatch())?))),
        ValueType::Int16 => Scalar::Int(i64::from(i16::from_be_bytes(bytes.try_into().map_err(|_| mismatch())?))),
        ValueType::Uint32 => Scalar::Int(i64::from(u32::from_be_bytes(bytes.try_into().map_err(|_| mismatch())?))),
        ValueType::Int32 => Scalar::Int(i64::from(i32::from_be_bytes(bytes.try_into().map_err(|_| mismatch())?))),
        ValueType::Float32 => {
            let raw = f32::from_be_bytes(bytes.try_into().map_err(|_| mismatch())?);
            Scalar::Float(round_to(f64::from(raw), 4))
        }
        ValueType::Float64 => {
            let raw = f64::from_be_bytes(bytes.try_into().map_err(|_| mismatch())?);
            Scalar::Float(round_to(raw, 6))
        }
    };
    Ok(value)
}

/// Encode `value` as big-endian bytes of type `ty`.
///
/// Integer types take integral values within their range only; a float with
/// a fractional part is refused rather than truncated.
pub fn encode(value: Scalar, ty: ValueType) -> Result<Vec<u8>, ProtocolError> {
    let refused = || ProtocolError::Encode {
        value_type: ty,
        value: value.to_string(),
    };
    let integral = || match value {
        Scalar::Int(v) => Ok(v),
        Scalar::Float(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Ok(v as i64),
        Scalar::Float(_) => Err(refused()),
    };

    let bytes = match ty {
        ValueType::Uint16 => u16::try_from(integral()?).map_err(|_| refused())?.to_be_bytes().to_vec(),
        ValueType::Int16 => i16::try_from(integral()?).map_err(|_| refused())?.to_be_bytes().to_vec(),
        ValueType::Uint32 => u32::try_from(integral()?).map_err(|_| refused())?.to_be_bytes().to_vec(),
        ValueType::Int32 => i32::try_from(integral()?).map_err(|_| refused())?.to_be_bytes().to_vec(),
        ValueType::Float32 => (value.as_f64() as f32).to_be_bytes().to_vec(),
        ValueType::Float64 => value.as_f64().to_be_bytes().to_vec(),
    };
    Ok(bytes)
}
