// crates/vf_grid/src/rebuild.rs

//! 拓扑重建
//!
//! 依据逐体素动作掩码（0=保留, 1=细化, 2=粗化）重建坐标列表：
//!
//! - 细化体素展开为 8 个子体素，位置 `2c + {0,1}^3`，层级 +1
//! - 粗化体素仅当 8 个兄弟全部存在且全部请求粗化时合并为父体素
//!   `c >> 1`，层级 -1；不完整的兄弟组原样保留
//! - 未标记体素原样保留
//!
//! 结果排序、去重后，为每个新坐标确定旧 LUT 中的来源索引
//! （精确匹配、父子映射、Morton 窗口最近邻的顺序），值与层级
//! 由来源索引推导。GPU 侧的字段重映射内核使用同一张映射表。

use crate::error::{GridError, GridResult};
use std::collections::HashMap;
use vf_foundation::{morton_encode, VoxelCoord};

/// 动作：保留
pub const ACTION_KEEP: u8 = 0;
/// 动作：细化
pub const ACTION_REFINE: u8 = 1;
/// 动作：粗化
pub const ACTION_COARSEN: u8 = 2;

/// 最近邻搜索的 Morton 窗口半宽
const NEAREST_WINDOW: usize = 16;

/// 重建结果
#[derive(Debug, Clone)]
pub struct RebuildResult {
    /// 新坐标查找表（Morton 序，无重复）
    pub lut: Vec<VoxelCoord>,
    /// 新值数组（与 LUT 平行）
    pub values: Vec<f32>,
    /// 新层级数组（与 LUT 平行）
    pub levels: Vec<u8>,
    /// 每个新体素在旧 LUT 中的来源索引（重映射内核输入）
    pub mapping: Vec<u32>,
    /// 细化的体素数
    pub refined: u32,
    /// 完整粗化的兄弟组数
    pub coarsened_groups: u32,
}

impl RebuildResult {
    /// 拓扑是否发生变化
    pub fn topology_changed(&self, old_len: usize) -> bool {
        self.refined > 0 || self.coarsened_groups > 0 || self.lut.len() != old_len
    }
}

/// 拓扑重建器
pub struct TopologyRebuilder {
    min_level: u8,
    max_level: u8,
}

impl TopologyRebuilder {
    /// 以层级范围构造
    pub fn new(min_level: u8, max_level: u8) -> Self {
        Self {
            min_level,
            max_level,
        }
    }

    /// 执行重建
    pub fn rebuild(
        &self,
        old_lut: &[VoxelCoord],
        old_values: &[f32],
        old_levels: &[u8],
        mask: &[u8],
    ) -> GridResult<RebuildResult> {
        if old_lut.is_empty() {
            return Err(GridError::EmptyGrid);
        }
        GridError::check_size("values", old_lut.len(), old_values.len())?;
        GridError::check_size("levels", old_lut.len(), old_levels.len())?;
        GridError::check_size("mask", old_lut.len(), mask.len())?;

        // 第一遍：归并粗化请求的兄弟组（父坐标 -> 旧索引列表）
        let mut sibling_groups: HashMap<VoxelCoord, Vec<usize>> = HashMap::new();
        for (i, &action) in mask.iter().enumerate() {
            if action == ACTION_COARSEN {
                let parent = VoxelCoord::new(
                    old_lut[i].x >> 1,
                    old_lut[i].y >> 1,
                    old_lut[i].z >> 1,
                );
                sibling_groups.entry(parent).or_default().push(i);
            }
        }

        // (新坐标, 来源旧索引, 新层级)
        let mut emitted: Vec<(VoxelCoord, u32, u8)> = Vec::with_capacity(old_lut.len());
        let mut handled = vec![false; old_lut.len()];
        let mut refined = 0u32;
        let mut coarsened_groups = 0u32;

        // 8 个兄弟同坐标父体素只有一个来源；同一父坐标下标集恰为 8
        // 时才允许合并
        let mut group_keys: Vec<VoxelCoord> = sibling_groups.keys().copied().collect();
        group_keys.sort_by_key(|&c| morton_encode(c));
        for parent in group_keys {
            let Some(siblings) = sibling_groups.get(&parent) else {
                continue;
            };
            if siblings.len() == 8 {
                let first = siblings[0];
                let level = old_levels[first].saturating_sub(1).max(self.min_level);
                emitted.push((parent, first as u32, level));
                for &idx in siblings {
                    handled[idx] = true;
                }
                coarsened_groups += 1;
            } else {
                log::debug!(
                    "兄弟组不完整 ({}/8)，父体素 {:?} 不粗化",
                    siblings.len(),
                    parent
                );
                for &idx in siblings {
                    emitted.push((old_lut[idx], idx as u32, old_levels[idx]));
                    handled[idx] = true;
                }
            }
        }

        // 第二遍：细化与保留
        for (i, &action) in mask.iter().enumerate() {
            if handled[i] {
                continue;
            }
            match action {
                ACTION_REFINE if old_levels[i] < self.max_level => {
                    let base = old_lut[i] * 2;
                    let level = (old_levels[i] + 1).min(self.max_level);
                    for dx in 0..2 {
                        for dy in 0..2 {
                            for dz in 0..2 {
                                emitted.push((
                                    base + VoxelCoord::new(dx, dy, dz),
                                    i as u32,
                                    level,
                                ));
                            }
                        }
                    }
                    refined += 1;
                }
                _ => {
                    emitted.push((old_lut[i], i as u32, old_levels[i]));
                }
            }
        }

        // 排序去重（保留首个来源）
        emitted.sort_by_key(|(c, _, _)| morton_encode(*c));
        emitted.dedup_by_key(|(c, _, _)| *c);

        let mut lut = Vec::with_capacity(emitted.len());
        let mut mapping = Vec::with_capacity(emitted.len());
        let mut levels = Vec::with_capacity(emitted.len());
        for (coord, src, level) in emitted {
            lut.push(coord);
            mapping.push(src);
            levels.push(level.clamp(self.min_level, self.max_level));
        }
        let values = mapping.iter().map(|&i| old_values[i as usize]).collect();

        log::info!(
            "拓扑重建: {} -> {} 体素 (细化 {}, 粗化组 {})",
            old_lut.len(),
            lut.len(),
            refined,
            coarsened_groups
        );

        Ok(RebuildResult {
            lut,
            values,
            levels,
            mapping,
            refined,
            coarsened_groups,
        })
    }

    /// 在旧 LUT（Morton 序）中查找坐标的最近来源索引
    ///
    /// 顺序：精确匹配，父体素匹配（细化子体素），任一子体素匹配
    /// （粗化父体素），最后在 Morton 插入点附近的窗口内取欧氏
    /// 距离最近者。
    pub fn nearest_source(old_lut: &[VoxelCoord], target: VoxelCoord) -> Option<usize> {
        if old_lut.is_empty() {
            return None;
        }
        let key = morton_encode(target);
        if let Ok(idx) = old_lut.binary_search_by_key(&key, |&c| morton_encode(c)) {
            return Some(idx);
        }

        // 细化子体素：父体素在旧表中
        let parent = VoxelCoord::new(target.x >> 1, target.y >> 1, target.z >> 1);
        if let Ok(idx) =
            old_lut.binary_search_by_key(&morton_encode(parent), |&c| morton_encode(c))
        {
            return Some(idx);
        }

        // 粗化父体素：任一子体素在旧表中
        let base = target * 2;
        for dx in 0..2 {
            for dy in 0..2 {
                for dz in 0..2 {
                    let child = base + VoxelCoord::new(dx, dy, dz);
                    if let Ok(idx) = old_lut
                        .binary_search_by_key(&morton_encode(child), |&c| morton_encode(c))
                    {
                        return Some(idx);
                    }
                }
            }
        }

        // Morton 窗口最近邻
        let insert = old_lut
            .binary_search_by_key(&key, |&c| morton_encode(c))
            .unwrap_or_else(|i| i);
        let lo = insert.saturating_sub(NEAREST_WINDOW);
        let hi = (insert + NEAREST_WINDOW).min(old_lut.len());
        let mut best: Option<(usize, i64)> = None;
        for (i, &c) in old_lut[lo..hi].iter().enumerate() {
            let d = c - target;
            let dist = i64::from(d.x) * i64::from(d.x)
                + i64::from(d.y) * i64::from(d.y)
                + i64::from(d.z) * i64::from(d.z);
            match best {
                Some((_, best_dist)) if best_dist <= dist => {}
                _ => best = Some((lo + i, dist)),
            }
        }
        best.map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(list: &[(i32, i32, i32)]) -> Vec<VoxelCoord> {
        let mut v: Vec<VoxelCoord> = list
            .iter()
            .map(|&(x, y, z)| VoxelCoord::new(x, y, z))
            .collect();
        v.sort_by_key(|&c| morton_encode(c));
        v
    }

    #[test]
    fn test_refine_single_voxel() {
        let rebuilder = TopologyRebuilder::new(0, 3);
        let lut = coords(&[(0, 0, 0)]);
        let result = rebuilder
            .rebuild(&lut, &[5.0], &[0], &[ACTION_REFINE])
            .unwrap();

        assert_eq!(result.lut.len(), 8);
        assert_eq!(result.refined, 1);
        assert_eq!(result.coarsened_groups, 0);
        for (i, c) in result.lut.iter().enumerate() {
            assert!((0..2).contains(&c.x));
            assert!((0..2).contains(&c.y));
            assert!((0..2).contains(&c.z));
            assert_eq!(result.levels[i], 1);
            assert_eq!(result.values[i], 5.0);
        }
    }

    #[test]
    fn test_refine_at_max_level_is_kept() {
        let rebuilder = TopologyRebuilder::new(0, 1);
        let lut = coords(&[(0, 0, 0)]);
        let result = rebuilder
            .rebuild(&lut, &[5.0], &[1], &[ACTION_REFINE])
            .unwrap();
        assert_eq!(result.lut.len(), 1);
        assert_eq!(result.refined, 0);
    }

    #[test]
    fn test_coarsen_full_sibling_group() {
        let rebuilder = TopologyRebuilder::new(0, 3);
        let lut = coords(&[
            (0, 0, 0),
            (1, 0, 0),
            (0, 1, 0),
            (1, 1, 0),
            (0, 0, 1),
            (1, 0, 1),
            (0, 1, 1),
            (1, 1, 1),
        ]);
        let values = vec![2.0; 8];
        let levels = vec![1u8; 8];
        let mask = vec![ACTION_COARSEN; 8];
        let result = rebuilder.rebuild(&lut, &values, &levels, &mask).unwrap();

        assert_eq!(result.lut, vec![VoxelCoord::ZERO]);
        assert_eq!(result.levels, vec![0]);
        assert_eq!(result.values, vec![2.0]);
        assert_eq!(result.coarsened_groups, 1);
    }

    #[test]
    fn test_coarsen_partial_group_kept() {
        let rebuilder = TopologyRebuilder::new(0, 3);
        // 只有 7 个兄弟请求粗化
        let lut = coords(&[
            (0, 0, 0),
            (1, 0, 0),
            (0, 1, 0),
            (1, 1, 0),
            (0, 0, 1),
            (1, 0, 1),
            (0, 1, 1),
            (1, 1, 1),
        ]);
        let values = vec![2.0; 8];
        let levels = vec![1u8; 8];
        let mut mask = vec![ACTION_COARSEN; 8];
        mask[3] = ACTION_KEEP;
        let result = rebuilder.rebuild(&lut, &values, &levels, &mask).unwrap();

        assert_eq!(result.lut.len(), 8);
        assert_eq!(result.coarsened_groups, 0);
        assert_eq!(result.levels, vec![1; 8]);
    }

    #[test]
    fn test_voxel_count_arithmetic() {
        // |新| = |旧| + 7 * 细化数 - 7 * 完整粗化组数
        let rebuilder = TopologyRebuilder::new(0, 3);
        let lut = coords(&[
            (0, 0, 0),
            (1, 0, 0),
            (0, 1, 0),
            (1, 1, 0),
            (0, 0, 1),
            (1, 0, 1),
            (0, 1, 1),
            (1, 1, 1),
            (8, 0, 0),
        ]);
        let values = vec![1.0; 9];
        let levels = vec![1u8; 9];
        let mut mask = vec![ACTION_COARSEN; 9];
        mask[lut.iter().position(|&c| c == VoxelCoord::new(8, 0, 0)).unwrap()] =
            ACTION_REFINE;
        let result = rebuilder.rebuild(&lut, &values, &levels, &mask).unwrap();
        assert_eq!(result.lut.len(), 9 + 7 - 7);
        assert_eq!(result.refined, 1);
        assert_eq!(result.coarsened_groups, 1);
    }

    #[test]
    fn test_negative_coord_parent_uses_floor() {
        let rebuilder = TopologyRebuilder::new(0, 3);
        // (-2,-2,-2)..(-1,-1,-1) 的 8 个体素，父体素为 (-1,-1,-1)
        let lut = coords(&[
            (-2, -2, -2),
            (-1, -2, -2),
            (-2, -1, -2),
            (-1, -1, -2),
            (-2, -2, -1),
            (-1, -2, -1),
            (-2, -1, -1),
            (-1, -1, -1),
        ]);
        let values = vec![1.0; 8];
        let levels = vec![1u8; 8];
        let mask = vec![ACTION_COARSEN; 8];
        let result = rebuilder.rebuild(&lut, &values, &levels, &mask).unwrap();
        assert_eq!(result.lut, vec![VoxelCoord::new(-1, -1, -1)]);
    }

    #[test]
    fn test_result_sorted_and_unique() {
        let rebuilder = TopologyRebuilder::new(0, 3);
        let lut = coords(&[(0, 0, 0), (4, 4, 4), (9, 0, 0)]);
        let values = vec![1.0, 2.0, 3.0];
        let levels = vec![0u8; 3];
        let mask = vec![ACTION_REFINE, ACTION_KEEP, ACTION_KEEP];
        let result = rebuilder.rebuild(&lut, &values, &levels, &mask).unwrap();

        for w in result.lut.windows(2) {
            assert!(morton_encode(w[0]) < morton_encode(w[1]));
        }
    }

    #[test]
    fn test_nearest_source_exact_and_parent() {
        let lut = coords(&[(0, 0, 0), (3, 3, 3)]);
        assert_eq!(
            TopologyRebuilder::nearest_source(&lut, VoxelCoord::new(3, 3, 3)),
            Some(lut.iter().position(|&c| c == VoxelCoord::new(3, 3, 3)).unwrap())
        );
        // (1,1,0) 的父体素为 (0,0,0)
        let idx = TopologyRebuilder::nearest_source(&lut, VoxelCoord::new(1, 1, 0)).unwrap();
        assert_eq!(lut[idx], VoxelCoord::ZERO);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let rebuilder = TopologyRebuilder::new(0, 3);
        let lut = coords(&[(0, 0, 0)]);
        assert!(rebuilder.rebuild(&lut, &[1.0, 2.0], &[0], &[0]).is_err());
        assert!(rebuilder.rebuild(&[], &[], &[], &[]).is_err());
    }
}
