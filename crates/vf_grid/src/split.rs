// crates/vf_grid/src/split.rs

//! 域分解
//!
//! 将宿主网格按叶块划分到多个 GPU：叶块按其最小角的 Morton 键
//! 排序后顺序扫描，活跃体素累计量达到目标份额时切换到下一桶。
//! 叶块是 8 对齐的，因此每个子域是全局线性索引空间中的连续
//! 区间，`voxel_base` 记录区间起点。
//!
//! 分解结束后对每个有序子域对做六向面邻接检测，互逆链接
//! （A->B 面 f 与 B->A 面 f^1）成对出现。

use crate::error::{GridError, GridResult};
use crate::source::HostGrid;
use vf_foundation::{morton_encode, CoordBBox, Face};

/// 邻居链接
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborLink {
    /// 邻居子域的 GPU 索引
    pub gpu_index: u32,
    /// 本侧面编码
    pub face: Face,
}

/// 子域
#[derive(Debug, Clone)]
pub struct SubDomain {
    /// GPU 索引（0..k 连续）
    pub gpu_index: u32,
    /// 包围盒（所辖叶块包围盒之并）
    pub bounds: CoordBBox,
    /// 所辖叶块的包围盒列表
    pub leaves: Vec<CoordBBox>,
    /// 活跃体素数
    pub active_voxel_count: u32,
    /// 全局线性索引空间中的区间起点
    pub voxel_base: u32,
    /// 面邻居（至多 6 个）
    pub neighbors: Vec<NeighborLink>,
}

impl SubDomain {
    /// 估算该子域每字段占用的显存
    pub fn estimated_field_bytes(&self, element_size: u32) -> u64 {
        u64::from(self.active_voxel_count) * u64::from(element_size)
    }
}

/// 域分解配置
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// 目标 GPU 数
    pub gpu_count: u32,
    /// 光环厚度（体素）
    pub halo_thickness: u32,
    /// 是否按 Morton 序扫描叶块（关闭则按构建顺序）
    pub prefer_spatial_locality: bool,
    /// 负载不均衡告警容差
    pub load_tolerance: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            halo_thickness: 2,
            prefer_spatial_locality: true,
            load_tolerance: 0.1,
        }
    }
}

/// 负载均衡统计
#[derive(Debug, Clone, Default)]
pub struct LoadBalanceReport {
    /// 最小体素数
    pub min: u32,
    /// 最大体素数
    pub max: u32,
    /// 平均体素数
    pub mean: f64,
    /// 标准差
    pub stddev: f64,
    /// 不均衡系数 max/mean
    pub imbalance: f64,
}

/// 域分解器
#[derive(Debug, Clone)]
pub struct DomainSplitter {
    config: SplitConfig,
}

impl DomainSplitter {
    /// 以配置构造
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// 配置
    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// 执行域分解
    ///
    /// 返回的子域按 `gpu_index` 升序且 `voxel_base` 单调递增。
    /// 空桶被丢弃后索引重新连续编号。
    pub fn split(&self, grid: &HostGrid) -> GridResult<Vec<SubDomain>> {
        if self.config.gpu_count == 0 {
            return Err(GridError::InvalidSplit("gpu_count 不能为 0".into()));
        }
        if grid.active_voxel_count() == 0 {
            return Err(GridError::EmptyGrid);
        }

        // 收集叶块（包围盒、活跃数、Morton 键）
        let mut leaves: Vec<(CoordBBox, u32, u64)> = grid
            .leaves()
            .iter()
            .map(|leaf| {
                (
                    leaf.bbox(),
                    leaf.active_count(),
                    morton_encode(leaf.origin),
                )
            })
            .collect();
        if self.config.prefer_spatial_locality {
            leaves.sort_by_key(|l| l.2);
        }

        let total: u64 = leaves.iter().map(|l| u64::from(l.1)).sum();
        let target = (total / u64::from(self.config.gpu_count)).max(1);
        log::debug!(
            "域分解: {} 叶块, {} 体素, 每 GPU 目标 {}",
            leaves.len(),
            total,
            target
        );

        // 顺序扫描装桶
        let mut domains: Vec<SubDomain> = Vec::new();
        let mut current: Option<SubDomain> = None;
        let mut current_count = 0u64;

        for (bbox, count, _) in leaves {
            let domain = current.get_or_insert_with(|| SubDomain {
                gpu_index: domains.len() as u32,
                bounds: bbox,
                leaves: Vec::new(),
                active_voxel_count: 0,
                voxel_base: 0,
                neighbors: Vec::new(),
            });
            domain.bounds = domain.bounds.union(&bbox);
            domain.leaves.push(bbox);
            domain.active_voxel_count += count;
            current_count += u64::from(count);

            let is_last_bucket = domains.len() as u32 + 1 >= self.config.gpu_count;
            if current_count >= target && !is_last_bucket {
                domains.push(current.take().ok_or_else(|| {
                    GridError::InvalidSplit("内部状态: 当前桶缺失".into())
                })?);
                current_count = 0;
            }
        }
        if let Some(domain) = current.take() {
            if !domain.leaves.is_empty() {
                domains.push(domain);
            }
        }

        // 丢弃空桶并重编号，累计 voxel_base
        domains.retain(|d| d.active_voxel_count > 0);
        let mut base = 0u32;
        for (i, domain) in domains.iter_mut().enumerate() {
            domain.gpu_index = i as u32;
            domain.voxel_base = base;
            base += domain.active_voxel_count;
        }

        Self::compute_neighbors(&mut domains);

        let report = self.analyze(&domains);
        if report.imbalance > 1.0 + self.config.load_tolerance {
            // 仅告警，不中止
            log::warn!(
                "负载不均衡: min={}, max={}, mean={:.1}, imbalance={:.2}x",
                report.min,
                report.max,
                report.mean,
                report.imbalance
            );
        } else {
            log::info!(
                "负载均衡: min={}, max={}, mean={:.1}, imbalance={:.2}x",
                report.min,
                report.max,
                report.mean,
                report.imbalance
            );
        }

        Ok(domains)
    }

    /// 六向面邻接检测，建立互逆链接
    fn compute_neighbors(domains: &mut [SubDomain]) {
        for i in 0..domains.len() {
            for j in (i + 1)..domains.len() {
                let face = domains[i].bounds.adjacent_face(&domains[j].bounds);
                if let Some(face) = face {
                    let (gi, gj) = (domains[i].gpu_index, domains[j].gpu_index);
                    domains[i].neighbors.push(NeighborLink {
                        gpu_index: gj,
                        face,
                    });
                    domains[j].neighbors.push(NeighborLink {
                        gpu_index: gi,
                        face: face.opposite(),
                    });
                }
            }
        }
    }

    /// 负载均衡统计
    pub fn analyze(&self, domains: &[SubDomain]) -> LoadBalanceReport {
        if domains.is_empty() {
            return LoadBalanceReport::default();
        }
        let counts: Vec<u32> = domains.iter().map(|d| d.active_voxel_count).collect();
        let min = counts.iter().copied().min().unwrap_or(0);
        let max = counts.iter().copied().max().unwrap_or(0);
        let sum: u64 = counts.iter().map(|&c| u64::from(c)).sum();
        let mean = sum as f64 / counts.len() as f64;
        let variance = counts
            .iter()
            .map(|&c| {
                let d = f64::from(c) - mean;
                d * d
            })
            .sum::<f64>()
            / counts.len() as f64;
        let stddev = variance.sqrt();
        let imbalance = if mean > 0.0 {
            f64::from(max) / mean
        } else {
            1.0
        };
        LoadBalanceReport {
            min,
            max,
            mean,
            stddev,
            imbalance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vf_foundation::VoxelCoord;

    fn filled_cube(side: i32) -> HostGrid {
        HostGrid::dense_box(
            VoxelCoord::ZERO,
            VoxelCoord::splat(side - 1),
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_single_gpu_takes_everything() {
        let grid = filled_cube(16);
        let splitter = DomainSplitter::new(SplitConfig::default());
        let domains = splitter.split(&grid).unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].active_voxel_count, 4096);
        assert_eq!(domains[0].voxel_base, 0);
        assert!(domains[0].neighbors.is_empty());
    }

    #[test]
    fn test_two_gpu_split_covers_all() {
        let grid = filled_cube(16);
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: 2,
            ..Default::default()
        });
        let domains = splitter.split(&grid).unwrap();
        assert_eq!(domains.len(), 2);

        // 覆盖且不相交
        let total: u32 = domains.iter().map(|d| d.active_voxel_count).sum();
        assert_eq!(total, 4096);
        assert_eq!(domains[0].voxel_base, 0);
        assert_eq!(
            domains[1].voxel_base,
            domains[0].active_voxel_count
        );

        // 份额差不超过一个叶块
        let diff =
            domains[0].active_voxel_count.abs_diff(domains[1].active_voxel_count);
        assert!(diff <= 512, "diff = {}", diff);
    }

    #[test]
    fn test_two_gpu_neighbors_reciprocal() {
        let grid = filled_cube(16);
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: 2,
            ..Default::default()
        });
        let domains = splitter.split(&grid).unwrap();

        assert_eq!(domains[0].neighbors.len(), 1);
        assert_eq!(domains[1].neighbors.len(), 1);
        let a = domains[0].neighbors[0];
        let b = domains[1].neighbors[0];
        assert_eq!(a.gpu_index, 1);
        assert_eq!(b.gpu_index, 0);
        // X 在 Morton 最高位，半分切面垂直于 X
        assert_eq!(a.face, Face::PosX);
        assert_eq!(b.face, Face::NegX);
    }

    #[test]
    fn test_more_gpus_than_leaves() {
        // 单叶块网格请求 4 GPU：只会产生一个非空子域
        let grid = filled_cube(8);
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: 4,
            ..Default::default()
        });
        let domains = splitter.split(&grid).unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].gpu_index, 0);
    }

    #[test]
    fn test_zero_gpu_rejected() {
        let grid = filled_cube(8);
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: 0,
            ..Default::default()
        });
        assert!(splitter.split(&grid).is_err());
    }

    #[test]
    fn test_deterministic() {
        let grid = filled_cube(16);
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: 3,
            ..Default::default()
        });
        let a = splitter.split(&grid).unwrap();
        let b = splitter.split(&grid).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.bounds, y.bounds);
            assert_eq!(x.active_voxel_count, y.active_voxel_count);
            assert_eq!(x.voxel_base, y.voxel_base);
        }
    }

    #[test]
    fn test_analyze_report() {
        let grid = filled_cube(16);
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: 2,
            ..Default::default()
        });
        let domains = splitter.split(&grid).unwrap();
        let report = splitter.analyze(&domains);
        assert_eq!(report.min + report.max, 4096);
        assert!((report.mean - 2048.0).abs() < 1e-9);
        assert!(report.imbalance >= 1.0);
    }
}
