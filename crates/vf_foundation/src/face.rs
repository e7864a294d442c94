// crates/vf_foundation/src/face.rs

//! 子域面编码
//!
//! 六个轴对齐面按 `0=-X, 1=+X, 2=-Y, 3=+Y, 4=-Z, 5=+Z` 编号，
//! 相对面恒为 `code ^ 1`。该约定贯穿光环缓冲、邻居链接与
//! 打包/解包内核。

use crate::error::{FoundationError, FoundationResult};
use crate::VoxelCoord;
use serde::{Deserialize, Serialize};

/// 轴对齐面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Face {
    /// -X 面
    NegX = 0,
    /// +X 面
    PosX = 1,
    /// -Y 面
    NegY = 2,
    /// +Y 面
    PosY = 3,
    /// -Z 面
    NegZ = 4,
    /// +Z 面
    PosZ = 5,
}

impl Face {
    /// 全部六个面，按编码升序
    pub const ALL: [Face; 6] = [
        Face::NegX,
        Face::PosX,
        Face::NegY,
        Face::PosY,
        Face::NegZ,
        Face::PosZ,
    ];

    /// 从编码构造
    #[inline]
    pub fn from_index(code: u32) -> FoundationResult<Face> {
        match code {
            0 => Ok(Face::NegX),
            1 => Ok(Face::PosX),
            2 => Ok(Face::NegY),
            3 => Ok(Face::PosY),
            4 => Ok(Face::NegZ),
            5 => Ok(Face::PosZ),
            other => Err(FoundationError::InvalidFace(other)),
        }
    }

    /// 面编码
    #[inline]
    pub fn index(self) -> u32 {
        self as u32
    }

    /// 相对面（`code ^ 1`）
    #[inline]
    pub fn opposite(self) -> Face {
        // 编码约定保证 xor 1 不会越界
        match self {
            Face::NegX => Face::PosX,
            Face::PosX => Face::NegX,
            Face::NegY => Face::PosY,
            Face::PosY => Face::NegY,
            Face::NegZ => Face::PosZ,
            Face::PosZ => Face::NegZ,
        }
    }

    /// 面所在轴（0=X, 1=Y, 2=Z）
    #[inline]
    pub fn axis(self) -> usize {
        (self.index() / 2) as usize
    }

    /// 是否为正方向面
    #[inline]
    pub fn is_positive(self) -> bool {
        self.index() & 1 == 1
    }

    /// 面的外法向
    #[inline]
    pub fn normal(self) -> VoxelCoord {
        let sign = if self.is_positive() { 1 } else { -1 };
        match self.axis() {
            0 => VoxelCoord::new(sign, 0, 0),
            1 => VoxelCoord::new(0, sign, 0),
            _ => VoxelCoord::new(0, 0, sign),
        }
    }
}

impl std::fmt::Display for Face {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Face::NegX => "-X",
            Face::PosX => "+X",
            Face::NegY => "-Y",
            Face::PosY => "+Y",
            Face::NegZ => "-Z",
            Face::PosZ => "+Z",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_is_xor_one() {
        for face in Face::ALL {
            assert_eq!(face.opposite().index(), face.index() ^ 1);
            assert_eq!(face.opposite().opposite(), face);
        }
    }

    #[test]
    fn test_from_index_roundtrip() {
        for face in Face::ALL {
            assert_eq!(Face::from_index(face.index()).unwrap(), face);
        }
        assert!(Face::from_index(6).is_err());
    }

    #[test]
    fn test_normal_matches_axis() {
        assert_eq!(Face::PosX.normal(), VoxelCoord::new(1, 0, 0));
        assert_eq!(Face::NegZ.normal(), VoxelCoord::new(0, 0, -1));
    }
}
