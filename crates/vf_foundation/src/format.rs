// crates/vf_foundation/src/format.rs

//! 字段元素格式
//!
//! 引擎支持 8 种 32 位格式：1/2/3/4 分量的有符号整数与浮点。
//! 脚本层用字符串名（`"R32F"`、`"R32G32B32F"` 等）声明格式，
//! 着色器生成层取对应的 GLSL 类型名。

use crate::error::{FoundationError, FoundationResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 字段元素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldFormat {
    /// 单分量 f32
    R32F,
    /// 双分量 f32
    R32G32F,
    /// 三分量 f32
    R32G32B32F,
    /// 四分量 f32
    R32G32B32A32F,
    /// 单分量 i32
    R32I,
    /// 双分量 i32
    R32G32I,
    /// 三分量 i32
    R32G32B32I,
    /// 四分量 i32
    R32G32B32A32I,
}

impl FieldFormat {
    /// 分量数量
    #[inline]
    pub fn component_count(self) -> u32 {
        match self {
            Self::R32F | Self::R32I => 1,
            Self::R32G32F | Self::R32G32I => 2,
            Self::R32G32B32F | Self::R32G32B32I => 3,
            Self::R32G32B32A32F | Self::R32G32B32A32I => 4,
        }
    }

    /// 元素字节数
    #[inline]
    pub fn element_size(self) -> u32 {
        self.component_count() * 4
    }

    /// 是否为浮点格式
    #[inline]
    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::R32F | Self::R32G32F | Self::R32G32B32F | Self::R32G32B32A32F
        )
    }

    /// 对应的 GLSL 类型名
    pub fn glsl_type(self) -> &'static str {
        match self {
            Self::R32F => "float",
            Self::R32G32F => "vec2",
            Self::R32G32B32F => "vec3",
            Self::R32G32B32A32F => "vec4",
            Self::R32I => "int",
            Self::R32G32I => "ivec2",
            Self::R32G32B32I => "ivec3",
            Self::R32G32B32A32I => "ivec4",
        }
    }

    /// 脚本层格式名
    pub fn name(self) -> &'static str {
        match self {
            Self::R32F => "R32F",
            Self::R32G32F => "R32G32F",
            Self::R32G32B32F => "R32G32B32F",
            Self::R32G32B32A32F => "R32G32B32A32F",
            Self::R32I => "R32I",
            Self::R32G32I => "R32G32I",
            Self::R32G32B32I => "R32G32B32I",
            Self::R32G32B32A32I => "R32G32B32A32I",
        }
    }
}

impl FromStr for FieldFormat {
    type Err = FoundationError;

    fn from_str(s: &str) -> FoundationResult<Self> {
        match s {
            "R32F" => Ok(Self::R32F),
            "R32G32F" => Ok(Self::R32G32F),
            "R32G32B32F" => Ok(Self::R32G32B32F),
            "R32G32B32A32F" => Ok(Self::R32G32B32A32F),
            "R32I" => Ok(Self::R32I),
            "R32G32I" => Ok(Self::R32G32I),
            "R32G32B32I" => Ok(Self::R32G32B32I),
            "R32G32B32A32I" => Ok(Self::R32G32B32A32I),
            other => Err(FoundationError::UnknownFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for FieldFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FieldFormat; 8] = [
        FieldFormat::R32F,
        FieldFormat::R32G32F,
        FieldFormat::R32G32B32F,
        FieldFormat::R32G32B32A32F,
        FieldFormat::R32I,
        FieldFormat::R32G32I,
        FieldFormat::R32G32B32I,
        FieldFormat::R32G32B32A32I,
    ];

    #[test]
    fn test_element_size() {
        assert_eq!(FieldFormat::R32F.element_size(), 4);
        assert_eq!(FieldFormat::R32G32B32F.element_size(), 12);
        assert_eq!(FieldFormat::R32G32B32A32I.element_size(), 16);
    }

    #[test]
    fn test_name_roundtrip() {
        for fmt in ALL {
            assert_eq!(fmt.name().parse::<FieldFormat>().unwrap(), fmt);
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert!("R64F".parse::<FieldFormat>().is_err());
        assert!("".parse::<FieldFormat>().is_err());
    }

    #[test]
    fn test_glsl_type() {
        assert_eq!(FieldFormat::R32G32B32F.glsl_type(), "vec3");
        assert_eq!(FieldFormat::R32I.glsl_type(), "int");
    }
}
