// crates/vf_foundation/src/morton.rs

//! Morton（Z 序）编码
//!
//! 将有符号三维体素坐标映射为 63 位 Morton 键，作为整个引擎的
//! 线性化顺序：坐标查找表、子域划分、拓扑重建都按此序排列。
//!
//! # 编码方式
//!
//! 每个分量占 21 位。有符号分量先加偏置 `2^20` 变为无符号，
//! 再按位交错，X 占最高位：
//!
//! ```text
//! key = interleave(x') << 2 | interleave(y') << 1 | interleave(z')
//! ```
//!
//! 偏置保证了分量逐位比较与数值比较一致，因此 Morton 序是
//! 坐标上的全序，且 `(-1, 0, 0)` 排在 `(0, 0, 0)` 之前的负象限。
//! X 在最高位意味着顺序扫描首先沿 X 轴切分空间，域分解的首个
//! 切面垂直于 X。
//!
//! # 可编码范围
//!
//! 每个分量取值 `[-2^20, 2^20)`。超出范围用 [`try_morton_encode`]
//! 显式检查；[`morton_encode`] 在热路径上只做 debug 断言。

use crate::error::{FoundationError, FoundationResult};
use crate::VoxelCoord;

/// 每个分量的编码位数
pub const MORTON_BITS: u32 = 21;

/// 有符号分量偏置
const BIAS: i32 = 1 << (MORTON_BITS - 1);

/// 分量合法区间（含下界，不含上界）
const COMPONENT_MIN: i32 = -BIAS;
const COMPONENT_MAX: i32 = BIAS;

/// 将低 21 位按 3 间隔展开到 63 位
#[inline]
fn split_by_3(v: u32) -> u64 {
    let mut x = u64::from(v) & 0x1f_ffff;
    x = (x | (x << 32)) & 0x1f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x1f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

/// split_by_3 的逆操作
#[inline]
fn compact_by_3(v: u64) -> u32 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x ^ (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x ^ (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x ^ (x >> 8)) & 0x1f_0000_ff00_00ff;
    x = (x ^ (x >> 16)) & 0x1f_0000_0000_ffff;
    x = (x ^ (x >> 32)) & 0x1f_ffff;
    x as u32
}

/// 计算坐标的 63 位 Morton 键
///
/// 分量必须落在 `[-2^20, 2^20)` 内；debug 构建下越界会 panic，
/// release 构建下按 21 位截断。
#[inline]
pub fn morton_encode(coord: VoxelCoord) -> u64 {
    debug_assert!(
        in_range(coord),
        "坐标超出 Morton 编码范围: {:?}",
        coord
    );
    let x = (coord.x.wrapping_add(BIAS)) as u32;
    let y = (coord.y.wrapping_add(BIAS)) as u32;
    let z = (coord.z.wrapping_add(BIAS)) as u32;
    (split_by_3(x) << 2) | (split_by_3(y) << 1) | split_by_3(z)
}

/// 带范围检查的 Morton 编码
#[inline]
pub fn try_morton_encode(coord: VoxelCoord) -> FoundationResult<u64> {
    if !in_range(coord) {
        return Err(FoundationError::CoordOutOfRange(coord.x, coord.y, coord.z));
    }
    Ok(morton_encode(coord))
}

/// 从 Morton 键还原坐标
#[inline]
pub fn morton_decode(key: u64) -> VoxelCoord {
    let x = compact_by_3(key >> 2) as i32 - BIAS;
    let y = compact_by_3(key >> 1) as i32 - BIAS;
    let z = compact_by_3(key) as i32 - BIAS;
    VoxelCoord::new(x, y, z)
}

/// 判断坐标是否可编码
#[inline]
pub fn in_range(coord: VoxelCoord) -> bool {
    let ok = |c: i32| (COMPONENT_MIN..COMPONENT_MAX).contains(&c);
    ok(coord.x) && ok(coord.y) && ok(coord.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_origin() {
        let c = VoxelCoord::new(0, 0, 0);
        assert_eq!(morton_decode(morton_encode(c)), c);
    }

    #[test]
    fn test_roundtrip_negative() {
        for c in [
            VoxelCoord::new(-1, -1, -1),
            VoxelCoord::new(-512, 3, 1000),
            VoxelCoord::new(COMPONENT_MIN, COMPONENT_MIN, COMPONENT_MIN),
            VoxelCoord::new(COMPONENT_MAX - 1, COMPONENT_MAX - 1, COMPONENT_MAX - 1),
        ] {
            assert_eq!(morton_decode(morton_encode(c)), c, "坐标 {:?}", c);
        }
    }

    #[test]
    fn test_order_is_total_within_octant() {
        // 同一 2x2x2 单元内按 (x, y, z) 位序递增，Z 变化最快
        let keys: Vec<u64> = [
            VoxelCoord::new(0, 0, 0),
            VoxelCoord::new(0, 0, 1),
            VoxelCoord::new(0, 1, 0),
            VoxelCoord::new(0, 1, 1),
            VoxelCoord::new(1, 0, 0),
            VoxelCoord::new(1, 0, 1),
            VoxelCoord::new(1, 1, 0),
            VoxelCoord::new(1, 1, 1),
        ]
        .iter()
        .map(|&c| morton_encode(c))
        .collect();

        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_negative_sorts_before_origin() {
        assert!(morton_encode(VoxelCoord::new(-1, -1, -1)) < morton_encode(VoxelCoord::ZERO));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let bad = VoxelCoord::new(COMPONENT_MAX, 0, 0);
        assert!(try_morton_encode(bad).is_err());
    }

    #[test]
    fn test_key_fits_63_bits() {
        let c = VoxelCoord::new(COMPONENT_MAX - 1, COMPONENT_MAX - 1, COMPONENT_MAX - 1);
        assert!(morton_encode(c) < (1u64 << 63));
    }
}
