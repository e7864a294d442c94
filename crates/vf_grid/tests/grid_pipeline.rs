// crates/vf_grid/tests/grid_pipeline.rs

//! 网格管线集成测试
//!
//! 宿主侧可验证的端到端性质：线性化顺序、域分解的覆盖与
//! 互逆性、细化重建的体素计数律。

use vf_foundation::{morton_encode, Face, VoxelCoord};
use vf_grid::{
    linearize, DomainSplitter, GridBuilder, HostGrid, SplitConfig, TopologyRebuilder,
    ACTION_COARSEN, ACTION_KEEP, ACTION_REFINE,
};

/// 4x4x4 实心网格：线性化后 N = 64，LUT 按 Morton 严格递增，
/// 首项为最小角，值全部保持
#[test]
fn dense_4x4x4_linearizes_in_morton_order() {
    let grid = HostGrid::dense_box(VoxelCoord::ZERO, VoxelCoord::splat(3), 1.0).unwrap();
    let (lut, values) = linearize(&grid);

    assert_eq!(lut.len(), 64);
    assert_eq!(values.len(), 64);
    assert_eq!(lut[0], VoxelCoord::ZERO);
    for w in lut.windows(2) {
        assert!(morton_encode(w[0]) < morton_encode(w[1]));
    }
    assert!(values.iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
}

/// 16^3 实心立方体分到 2 个 GPU：份额差不超过半个叶层，
/// 邻居各恰有一个 +X/-X 面对
#[test]
fn cube_split_two_ways_balances_and_links() {
    let grid = HostGrid::dense_box(VoxelCoord::ZERO, VoxelCoord::splat(15), 1.0).unwrap();
    let splitter = DomainSplitter::new(SplitConfig {
        gpu_count: 2,
        ..Default::default()
    });
    let domains = splitter.split(&grid).unwrap();

    assert_eq!(domains.len(), 2);
    let total: u32 = domains.iter().map(|d| d.active_voxel_count).sum();
    assert_eq!(total, 4096);
    assert!(domains[0].active_voxel_count.abs_diff(domains[1].active_voxel_count) <= 512);

    assert_eq!(domains[0].neighbors.len(), 1);
    assert_eq!(domains[1].neighbors.len(), 1);
    assert_eq!(domains[0].neighbors[0].face, Face::PosX);
    assert_eq!(domains[1].neighbors[0].face, Face::NegX);
}

/// 子域活跃集两两不交且并为全集（借助连续 voxel_base 区间验证）
#[test]
fn split_partitions_are_disjoint_and_cover() {
    let mut builder = GridBuilder::new(0.0);
    // 不规则稀疏集合：三条分离的条带
    for x in 0..24 {
        for y in 0..4 {
            builder.set(VoxelCoord::new(x, y, 0), 1.0);
            builder.set(VoxelCoord::new(x, y, 40), 2.0);
        }
    }
    for z in 0..16 {
        builder.set(VoxelCoord::new(-20, 0, z), 3.0);
    }
    let grid = builder.build().unwrap();

    for gpu_count in [1u32, 2, 3, 4] {
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count,
            ..Default::default()
        });
        let domains = splitter.split(&grid).unwrap();

        let total: u32 = domains.iter().map(|d| d.active_voxel_count).sum();
        assert_eq!(total, grid.active_voxel_count(), "gpu_count={}", gpu_count);

        // voxel_base 区间首尾相接即两两不交且覆盖
        let mut expected_base = 0u32;
        for d in &domains {
            assert_eq!(d.voxel_base, expected_base);
            expected_base += d.active_voxel_count;
        }
    }
}

/// 面邻接链接成对互逆
#[test]
fn neighbor_links_are_reciprocal() {
    let grid = HostGrid::dense_box(VoxelCoord::ZERO, VoxelCoord::new(31, 15, 15), 1.0).unwrap();
    let splitter = DomainSplitter::new(SplitConfig {
        gpu_count: 4,
        ..Default::default()
    });
    let domains = splitter.split(&grid).unwrap();

    for d in &domains {
        for link in &d.neighbors {
            let peer = &domains[link.gpu_index as usize];
            let reciprocal = peer
                .neighbors
                .iter()
                .any(|l| l.gpu_index == d.gpu_index && l.face == link.face.opposite());
            assert!(
                reciprocal,
                "域 {} 面 {} 缺少来自域 {} 的互逆链接",
                d.gpu_index, link.face, peer.gpu_index
            );
        }
    }
}

/// 单体素细化：8 个子体素位于 (0..1)^3，层级全为 1，值承袭父体素
#[test]
fn refine_single_voxel_produces_eight_children() {
    let rebuilder = TopologyRebuilder::new(0, 3);
    let lut = vec![VoxelCoord::ZERO];
    let result = rebuilder
        .rebuild(&lut, &[7.5], &[0], &[ACTION_REFINE])
        .unwrap();

    assert_eq!(result.lut.len(), 8);
    for (i, c) in result.lut.iter().enumerate() {
        assert!((0..2).contains(&c.x) && (0..2).contains(&c.y) && (0..2).contains(&c.z));
        assert_eq!(result.levels[i], 1);
        assert!((result.values[i] - 7.5).abs() < f32::EPSILON);
    }
}

/// 体素计数律：|新| = |旧| + 7 * 细化数 - 7 * 完整粗化组数
#[test]
fn rebuild_voxel_count_law_holds() {
    let rebuilder = TopologyRebuilder::new(0, 3);

    // 一个完整兄弟组（粗化）+ 两个独立体素（一细化一保留）
    let mut coords = Vec::new();
    for dx in 0..2 {
        for dy in 0..2 {
            for dz in 0..2 {
                coords.push(VoxelCoord::new(dx, dy, dz));
            }
        }
    }
    coords.push(VoxelCoord::new(16, 0, 0));
    coords.push(VoxelCoord::new(24, 0, 0));
    coords.sort_by_key(|&c| morton_encode(c));

    let n = coords.len();
    let values = vec![1.0f32; n];
    let levels = vec![1u8; n];
    let mut mask = vec![ACTION_KEEP; n];
    for (i, &c) in coords.iter().enumerate() {
        if c.x < 2 {
            mask[i] = ACTION_COARSEN;
        } else if c == VoxelCoord::new(16, 0, 0) {
            mask[i] = ACTION_REFINE;
        }
    }

    let result = rebuilder.rebuild(&coords, &values, &levels, &mask).unwrap();
    assert_eq!(result.refined, 1);
    assert_eq!(result.coarsened_groups, 1);
    assert_eq!(result.lut.len(), n + 7 - 7);

    // 层级全部落在配置范围内
    assert!(result.levels.iter().all(|&l| l <= 3));
}
