// crates/vf_foundation/src/bbox.rs

//! 包含式整数包围盒
//!
//! `min` 与 `max` 都是盒内坐标（NanoVDB 风格的 CoordBBox 约定）。
//! 子域划分与光环面判定都建立在该类型上。

use crate::face::Face;
use crate::VoxelCoord;
use glam::UVec3;
use serde::{Deserialize, Serialize};

/// 包含式坐标包围盒
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordBBox {
    /// 最小角（含）
    pub min: VoxelCoord,
    /// 最大角（含）
    pub max: VoxelCoord,
}

impl CoordBBox {
    /// 从两角构造
    #[inline]
    pub fn new(min: VoxelCoord, max: VoxelCoord) -> Self {
        Self { min, max }
    }

    /// 单点盒
    #[inline]
    pub fn from_point(p: VoxelCoord) -> Self {
        Self { min: p, max: p }
    }

    /// 扩张以纳入一个点
    #[inline]
    pub fn expand_point(&mut self, p: VoxelCoord) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// 与另一盒求并
    #[inline]
    pub fn union(&self, other: &CoordBBox) -> CoordBBox {
        CoordBBox {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// 是否包含坐标
    #[inline]
    pub fn contains(&self, p: VoxelCoord) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// 各轴尺寸（体素数）
    #[inline]
    pub fn dim(&self) -> UVec3 {
        (self.max - self.min + VoxelCoord::ONE).as_uvec3()
    }

    /// 体素总数
    #[inline]
    pub fn volume(&self) -> u64 {
        let d = self.dim();
        u64::from(d.x) * u64::from(d.y) * u64::from(d.z)
    }

    /// 两盒在闭区间意义下是否于某轴重叠
    #[inline]
    fn overlaps_on_axis(&self, other: &CoordBBox, axis: usize) -> bool {
        let (a_min, a_max) = (self.min[axis], self.max[axis]);
        let (b_min, b_max) = (other.min[axis], other.max[axis]);
        a_min <= b_max && b_min <= a_max
    }

    /// 判定 `other` 是否贴在 `self` 的某个面上
    ///
    /// 若 `other` 沿轴 `a` 紧邻（间距恰为 1 个体素）且其余两轴
    /// 区间重叠，返回 `self` 侧的面编码。
    pub fn adjacent_face(&self, other: &CoordBBox) -> Option<Face> {
        for axis in 0..3usize {
            let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
            if !self.overlaps_on_axis(other, u) || !self.overlaps_on_axis(other, v) {
                continue;
            }
            if self.max[axis] + 1 == other.min[axis] {
                // other 在正方向一侧
                return Face::from_index(axis as u32 * 2 + 1).ok();
            }
            if other.max[axis] + 1 == self.min[axis] {
                return Face::from_index(axis as u32 * 2).ok();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dim_and_volume() {
        let b = CoordBBox::new(VoxelCoord::ZERO, VoxelCoord::new(7, 7, 7));
        assert_eq!(b.dim(), UVec3::new(8, 8, 8));
        assert_eq!(b.volume(), 512);
    }

    #[test]
    fn test_contains_inclusive() {
        let b = CoordBBox::new(VoxelCoord::new(-2, 0, 0), VoxelCoord::new(3, 3, 3));
        assert!(b.contains(VoxelCoord::new(-2, 0, 0)));
        assert!(b.contains(VoxelCoord::new(3, 3, 3)));
        assert!(!b.contains(VoxelCoord::new(4, 0, 0)));
    }

    #[test]
    fn test_union_and_expand() {
        let mut b = CoordBBox::from_point(VoxelCoord::ZERO);
        b.expand_point(VoxelCoord::new(5, -1, 2));
        assert_eq!(b.min, VoxelCoord::new(0, -1, 0));
        assert_eq!(b.max, VoxelCoord::new(5, 0, 2));

        let c = CoordBBox::from_point(VoxelCoord::new(-3, 7, 0));
        let u = b.union(&c);
        assert_eq!(u.min, VoxelCoord::new(-3, -1, 0));
        assert_eq!(u.max, VoxelCoord::new(5, 7, 2));
    }

    #[test]
    fn test_adjacent_face_pos_x() {
        let a = CoordBBox::new(VoxelCoord::ZERO, VoxelCoord::new(7, 15, 15));
        let b = CoordBBox::new(VoxelCoord::new(8, 0, 0), VoxelCoord::new(15, 15, 15));
        assert_eq!(a.adjacent_face(&b), Some(Face::PosX));
        assert_eq!(b.adjacent_face(&a), Some(Face::NegX));
    }

    #[test]
    fn test_adjacent_face_requires_overlap() {
        let a = CoordBBox::new(VoxelCoord::ZERO, VoxelCoord::new(7, 7, 7));
        // 沿 X 紧邻但 Y 区间完全分离
        let b = CoordBBox::new(VoxelCoord::new(8, 100, 0), VoxelCoord::new(15, 107, 7));
        assert_eq!(a.adjacent_face(&b), None);
    }

    #[test]
    fn test_gap_not_adjacent() {
        let a = CoordBBox::new(VoxelCoord::ZERO, VoxelCoord::new(7, 7, 7));
        let b = CoordBBox::new(VoxelCoord::new(9, 0, 0), VoxelCoord::new(15, 7, 7));
        assert_eq!(a.adjacent_face(&b), None);
    }
}
