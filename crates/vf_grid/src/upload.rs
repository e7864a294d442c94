// crates/vf_grid/src/upload.rs

//! 网格线性化与 GPU 上传
//!
//! 三个设备本地缓冲构成 GPU 侧网格：
//!
//! 1. 原始网格字节流（完整稀疏结构，供树遍历类内核使用）
//! 2. 坐标查找表 LUT（Morton 序活跃坐标，线性索引 -> 坐标）
//! 3. 线性值数组（与 LUT 平行）
//!
//! 三者都启用 shader device address，生成的内核经推送常量中的
//! 64 位地址访问。宿主侧保留 LUT 与值数组的镜像，细化与光环
//! 偏移计算需要它们。

use crate::error::{GridError, GridResult};
use crate::source::HostGrid;
use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use vf_foundation::{morton_encode, CoordBBox, VoxelCoord};
use vf_gpu::{vk, BufferResidency, DeviceAllocator, GpuBuffer};

/// LUT 中的坐标记录（GLSL 侧 scalar 布局的 ivec3）
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CoordRecord {
    /// X 分量
    pub x: i32,
    /// Y 分量
    pub y: i32,
    /// Z 分量
    pub z: i32,
}

impl From<VoxelCoord> for CoordRecord {
    #[inline]
    fn from(c: VoxelCoord) -> Self {
        Self {
            x: c.x,
            y: c.y,
            z: c.z,
        }
    }
}

/// GPU 侧网格头（GLSL scalar 布局的 GridHeader）
///
/// 推送常量里的 `grid_addr` 指向本结构，内核经它间接取得
/// 原始网格、LUT 与值数组的地址。字段顺序与 GLSL 声明一致，
/// scalar 布局下无隐式填充。
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GridHeaderRecord {
    /// 原始网格字节流地址
    pub raw_addr: u64,
    /// 坐标查找表地址
    pub lut_addr: u64,
    /// 线性值数组地址
    pub values_addr: u64,
    /// 活跃体素总数
    pub active_count: u32,
    /// 包围盒最小角
    pub bbox_min: [i32; 3],
    /// 包围盒最大角
    pub bbox_max: [i32; 3],
    /// 背景值
    pub background: f32,
}

/// 推送常量可用的网格地址组
#[derive(Debug, Clone, Copy)]
pub struct GridAddresses {
    /// 原始网格字节流地址
    pub raw_addr: u64,
    /// 坐标查找表地址
    pub lut_addr: u64,
    /// 线性值数组地址
    pub values_addr: u64,
    /// 活跃体素总数
    pub active_count: u32,
}

/// GPU 侧网格资源
pub struct GridResources {
    /// 原始网格字节流缓冲
    pub raw: GpuBuffer,
    /// 坐标查找表缓冲
    pub lut: GpuBuffer,
    /// 线性值缓冲
    pub values: GpuBuffer,
    /// 网格头缓冲（内核经 `grid_addr` 读取）
    pub header: GpuBuffer,
    /// 活跃体素总数
    pub active_count: u32,
    /// 活跃体素包围盒
    pub bbox: CoordBBox,
    /// 背景值
    pub background: f32,
    /// 宿主侧 LUT 镜像（Morton 序）
    pub host_lut: Vec<VoxelCoord>,
    /// 宿主侧值镜像（与 LUT 平行）
    pub host_values: Vec<f32>,
}

impl GridResources {
    /// 推送常量用的地址组
    pub fn addresses(&self) -> GridAddresses {
        GridAddresses {
            raw_addr: self.raw.device_address,
            lut_addr: self.lut.device_address,
            values_addr: self.values.device_address,
            active_count: self.active_count,
        }
    }

    /// 网格头缓冲的设备地址（推送常量 `grid_addr`）
    #[inline]
    pub fn header_addr(&self) -> u64 {
        self.header.device_address
    }

    /// 释放全部 GPU 缓冲（幂等）
    pub fn destroy(&mut self, alloc: &mut DeviceAllocator) {
        alloc.destroy_buffer(&mut self.raw);
        alloc.destroy_buffer(&mut self.lut);
        alloc.destroy_buffer(&mut self.values);
        alloc.destroy_buffer(&mut self.header);
    }
}

/// 将宿主网格线性化为 Morton 序的平行数组
///
/// 纯宿主计算，不触碰 GPU。返回的 LUT 在 Morton 键下严格递增。
pub fn linearize(grid: &HostGrid) -> (Vec<VoxelCoord>, Vec<f32>) {
    let mut entries: Vec<(u64, VoxelCoord, f32)> = grid
        .iter_active()
        .map(|(coord, value)| (morton_encode(coord), coord, value))
        .collect();

    entries.par_sort_unstable_by_key(|e| e.0);

    let mut lut = Vec::with_capacity(entries.len());
    let mut values = Vec::with_capacity(entries.len());
    for (_, coord, value) in entries {
        lut.push(coord);
        values.push(value);
    }
    (lut, values)
}

/// 网格上传器
pub struct GridUploader;

impl GridUploader {
    /// 上传宿主网格，返回 GPU 资源与宿主镜像
    pub fn upload(alloc: &mut DeviceAllocator, grid: &HostGrid) -> GridResult<GridResources> {
        if grid.active_voxel_count() == 0 {
            return Err(GridError::EmptyGrid);
        }

        let (host_lut, host_values) = linearize(grid);
        let active_count = host_lut.len() as u32;
        log::info!("网格线性化完成: {} 活跃体素", active_count);

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let raw_bytes = grid.to_bytes();
        let mut raw = alloc.create_buffer(
            raw_bytes.len() as u64,
            usage,
            BufferResidency::DeviceOnly,
            "grid_raw",
        )?;

        let records: Vec<CoordRecord> = host_lut.iter().map(|&c| c.into()).collect();
        let lut_bytes: &[u8] = bytemuck::cast_slice(&records);
        let mut lut = match alloc.create_buffer(
            lut_bytes.len() as u64,
            usage,
            BufferResidency::DeviceOnly,
            "grid_lut",
        ) {
            Ok(b) => b,
            Err(e) => {
                alloc.destroy_buffer(&mut raw);
                return Err(e.into());
            }
        };

        let value_bytes: &[u8] = bytemuck::cast_slice(&host_values);
        let mut values = match alloc.create_buffer(
            value_bytes.len() as u64,
            usage,
            BufferResidency::DeviceOnly,
            "grid_values",
        ) {
            Ok(b) => b,
            Err(e) => {
                alloc.destroy_buffer(&mut raw);
                alloc.destroy_buffer(&mut lut);
                return Err(e.into());
            }
        };

        let header_record = GridHeaderRecord {
            raw_addr: raw.device_address,
            lut_addr: lut.device_address,
            values_addr: values.device_address,
            active_count,
            bbox_min: grid.bbox().min.to_array(),
            bbox_max: grid.bbox().max.to_array(),
            background: grid.background(),
        };
        let mut header = match alloc.create_buffer(
            std::mem::size_of::<GridHeaderRecord>() as u64,
            usage,
            BufferResidency::DeviceOnly,
            "grid_header",
        ) {
            Ok(b) => b,
            Err(e) => {
                alloc.destroy_buffer(&mut raw);
                alloc.destroy_buffer(&mut lut);
                alloc.destroy_buffer(&mut values);
                return Err(e.into());
            }
        };

        let upload_all = (|| -> GridResult<()> {
            alloc.upload_sync(&raw, &raw_bytes, 0)?;
            alloc.upload_sync(&lut, lut_bytes, 0)?;
            alloc.upload_sync(&values, value_bytes, 0)?;
            alloc.upload_sync(&header, bytemuck::bytes_of(&header_record), 0)?;
            Ok(())
        })();
        if let Err(e) = upload_all {
            alloc.destroy_buffer(&mut raw);
            alloc.destroy_buffer(&mut lut);
            alloc.destroy_buffer(&mut values);
            alloc.destroy_buffer(&mut header);
            return Err(e);
        }

        log::info!(
            "网格上传完成: 原始 {} 字节, LUT {} 字节, 值 {} 字节",
            raw_bytes.len(),
            lut_bytes.len(),
            value_bytes.len()
        );

        Ok(GridResources {
            raw,
            lut,
            values,
            header,
            active_count,
            bbox: grid.bbox(),
            background: grid.background(),
            host_lut,
            host_values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{GridBuilder, HostGrid};

    #[test]
    fn test_linearize_sorted_by_morton() {
        let grid =
            HostGrid::dense_box(VoxelCoord::ZERO, VoxelCoord::new(3, 3, 3), 1.0).unwrap();
        let (lut, values) = linearize(&grid);
        assert_eq!(lut.len(), 64);
        assert_eq!(values.len(), 64);
        for w in lut.windows(2) {
            assert!(morton_encode(w[0]) < morton_encode(w[1]));
        }
        // 最小角按 Morton 序排在首位
        assert_eq!(lut[0], VoxelCoord::ZERO);
        assert!(values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_linearize_values_follow_coords() {
        let mut b = GridBuilder::new(0.0);
        b.set(VoxelCoord::new(1, 0, 0), 10.0);
        b.set(VoxelCoord::new(0, 0, 0), 20.0);
        b.set(VoxelCoord::new(-4, 2, 9), 30.0);
        let grid = b.build().unwrap();
        let (lut, values) = linearize(&grid);
        for (i, &coord) in lut.iter().enumerate() {
            let expected = match (coord.x, coord.y, coord.z) {
                (1, 0, 0) => 10.0,
                (0, 0, 0) => 20.0,
                (-4, 2, 9) => 30.0,
                other => panic!("意外坐标 {:?}", other),
            };
            assert_eq!(values[i], expected);
        }
    }

    #[test]
    fn test_coord_record_is_12_bytes() {
        assert_eq!(std::mem::size_of::<CoordRecord>(), 12);
    }

    #[test]
    fn test_grid_header_matches_scalar_layout() {
        // GLSL scalar 布局下 GridHeader 共 56 字节，无隐式填充
        assert_eq!(std::mem::size_of::<GridHeaderRecord>(), 56);
    }
}
