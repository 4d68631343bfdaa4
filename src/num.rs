use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scalar type: {0}")]
pub struct ScalarTypeError(pub String);

/// Element type of a tensor; only its bit width matters to layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    F64,
    F32,
    Tf32,
    F16,
    Bf16,
    F8E4M3,
    F8E5M2,
    I64,
    I32,
    I16,
    I8,
    I1,
}

impl ScalarType {
    #[inline]
    pub const fn bit_width(self) -> u32 {
        match self {
            ScalarType::F64 | ScalarType::I64 => 64,
            ScalarType::F32 | ScalarType::Tf32 | ScalarType::I32 => 32,
            ScalarType::F16 | ScalarType::Bf16 | ScalarType::I16 => 16,
            ScalarType::F8E4M3 | ScalarType::F8E5M2 | ScalarType::I8 => 8,
            ScalarType::I1 => 1,
        }
    }

    /// Width in bytes, rounded up for sub-byte types.
    #[inline]
    pub const fn byte_width(self) -> u32 {
        self.bit_width().div_ceil(8)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ScalarType::F64 => "f64",
            ScalarType::F32 => "f32",
            ScalarType::Tf32 => "tf32",
            ScalarType::F16 => "f16",
            ScalarType::Bf16 => "bf16",
            ScalarType::F8E4M3 => "f8e4m3",
            ScalarType::F8E5M2 => "f8e5m2",
            ScalarType::I64 => "i64",
            ScalarType::I32 => "i32",
            ScalarType::I16 => "i16",
            ScalarType::I8 => "i8",
            ScalarType::I1 => "i1",
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScalarType {
    type Err = ScalarTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "f64" => ScalarType::F64,
            "f32" => ScalarType::F32,
            "tf32" => ScalarType::Tf32,
            "f16" => ScalarType::F16,
            "bf16" => ScalarType::Bf16,
            "f8e4m3" => ScalarType::F8E4M3,
            "f8e5m2" => ScalarType::F8E5M2,
            "i64" => ScalarType::I64,
            "i32" => ScalarType::I32,
            "i16" => ScalarType::I16,
            "i8" => ScalarType::I8,
            "i1" => ScalarType::I1,
            _ => return Err(ScalarTypeError(s.into())),
        };
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::ScalarType;

    #[test]
    fn test_bit_width() {
        assert_eq!(ScalarType::F16.bit_width(), 16);
        assert_eq!(ScalarType::I8.byte_width(), 1);
        assert_eq!(ScalarType::I1.byte_width(), 1);
        assert_eq!(ScalarType::F64.byte_width(), 8);
    }

    #[test]
    fn test_name() {
        for ty in [ScalarType::Bf16, ScalarType::F8E5M2, ScalarType::I32] {
            assert_eq!(ty.name().parse::<ScalarType>(), Ok(ty));
        }
        assert!("f128".parse::<ScalarType>().is_err());
    }
}
