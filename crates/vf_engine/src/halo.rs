// crates/vf_engine/src/halo.rs

//! 光环缓冲管理
//!
//! 每个 (字段, 子域) 组合在六个面上各持有一对缓冲：
//!
//! - `remote[f]`: 本子域打包内核写入的出站暂存，传输阶段拷贝
//!   给面 f 的邻居
//! - `local[f]`: 邻居传输写入的入站暂存，解包内核消费
//!
//! 面尺寸三元组 (厚度, 宽, 高) 由子域包围盒推出。每个有序
//! GPU 对 (src != dst) 一条时间线信号量，src 用单调递增的序号
//! 宣布一次向 dst 的光环写入完成。

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Arc;
use vf_foundation::Face;
use vf_gpu::{vk, BufferResidency, DeviceAllocator, GpuBuffer, GpuContext};
use vf_grid::SubDomain;

/// 面尺寸三元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaceDims {
    /// 光环厚度
    pub thickness: u32,
    /// 面宽
    pub width: u32,
    /// 面高
    pub height: u32,
}

impl FaceDims {
    /// 该面的光环体素数
    #[inline]
    pub fn voxel_count(&self) -> u32 {
        self.thickness * self.width * self.height
    }
}

/// 单字段单子域的光环缓冲组
pub struct HaloBufferSet {
    /// 入站暂存（按面编码索引，长度 6）
    pub local: Vec<GpuBuffer>,
    /// 出站暂存（按面编码索引，长度 6）
    pub remote: Vec<GpuBuffer>,
    /// 面尺寸
    pub dims: [FaceDims; 6],
    /// 每面体素数
    pub counts: [u32; 6],
    /// 生产序号（打包侧）
    pub produced: [u64; 6],
    /// 消费序号（解包侧）
    pub consumed: [u64; 6],
}

/// 光环管理器
pub struct HaloManager {
    ctx: Arc<GpuContext>,
    domains: Vec<SubDomain>,
    thickness: u32,
    // 字段名 -> 每子域的缓冲组（按需分配）
    sets: HashMap<String, Vec<Option<HaloBufferSet>>>,
    // 有序对 (src, dst) -> 时间线信号量，src * gpu_count + dst
    semaphores: Vec<vk::Semaphore>,
}

impl HaloManager {
    /// 以域分解结果构造
    pub fn new(ctx: Arc<GpuContext>, domains: &[SubDomain], thickness: u32) -> Self {
        log::info!(
            "光环管理器: {} 个子域, 厚度 {}",
            domains.len(),
            thickness
        );
        Self {
            ctx,
            domains: domains.to_vec(),
            thickness,
            sets: HashMap::new(),
            semaphores: Vec::new(),
        }
    }

    /// 子域数
    #[inline]
    pub fn gpu_count(&self) -> u32 {
        self.domains.len() as u32
    }

    /// 光环厚度
    #[inline]
    pub fn thickness(&self) -> u32 {
        self.thickness
    }

    /// 子域列表
    pub fn domains(&self) -> &[SubDomain] {
        &self.domains
    }

    /// 计算某子域某面的尺寸三元组
    ///
    /// X 面取 (厚, dimY, dimZ)，Y 面取 (厚, dimX, dimZ)，
    /// Z 面取 (厚, dimX, dimY)。
    pub fn face_dims(&self, domain: &SubDomain, face: Face) -> FaceDims {
        let d = domain.bounds.dim();
        let (width, height) = match face.axis() {
            0 => (d.y, d.z),
            1 => (d.x, d.z),
            _ => (d.x, d.y),
        };
        FaceDims {
            thickness: self.thickness,
            width,
            height,
        }
    }

    /// 打包区间在全局线性索引中的起点（体素）
    ///
    /// X 面的边界层在 Morton 序下恰为子域区间的首/尾连续段。
    // TODO: Y/Z 面的边界层在线性空间中不连续，需按面 gather 表
    // 寻址，当前先落在子域区间起点
    pub fn pack_offset(&self, domain: &SubDomain, face: Face, count: u32) -> u32 {
        let count = count.min(domain.active_voxel_count);
        match face {
            Face::NegX => domain.voxel_base,
            Face::PosX => domain.voxel_base + domain.active_voxel_count - count,
            _ => domain.voxel_base,
        }
    }

    /// 为单个字段在单个子域上分配六面缓冲
    pub fn allocate_field_halos(
        &mut self,
        alloc: &mut DeviceAllocator,
        field_name: &str,
        element_size: u32,
        gpu_index: u32,
    ) -> EngineResult<()> {
        let domain = self
            .domains
            .get(gpu_index as usize)
            .cloned()
            .ok_or_else(|| {
                EngineError::HaloAllocationFailure(format!("GPU 下标越界: {}", gpu_index))
            })?;

        let mut dims = [FaceDims::default(); 6];
        let mut counts = [0u32; 6];
        for face in Face::ALL {
            let fd = self.face_dims(&domain, face);
            dims[face.index() as usize] = fd;
            counts[face.index() as usize] = fd.voxel_count();
        }

        let domain_count = self.domains.len();
        let per_gpu = self
            .sets
            .entry(field_name.to_string())
            .or_insert_with(|| {
                let mut v = Vec::new();
                v.resize_with(domain_count, || None);
                v
            });
        if per_gpu[gpu_index as usize].is_some() {
            return Ok(());
        }

        let mut local = Vec::with_capacity(6);
        let mut remote = Vec::with_capacity(6);

        let cleanup = |alloc: &mut DeviceAllocator,
                       local: &mut Vec<GpuBuffer>,
                       remote: &mut Vec<GpuBuffer>| {
            for b in local.iter_mut() {
                alloc.destroy_buffer(b);
            }
            for b in remote.iter_mut() {
                alloc.destroy_buffer(b);
            }
        };

        for face in Face::ALL {
            let count = counts[face.index() as usize];
            // vkCreateBuffer 不接受零大小，厚度为 0 时留 4 字节占位
            let size = (u64::from(count) * u64::from(element_size)).max(4);

            let local_usage = vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
            let remote_usage = vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

            let label_local = format!("{}_halo_local_{}", field_name, face.index());
            match alloc.create_buffer(size, local_usage, BufferResidency::DeviceOnly, &label_local)
            {
                Ok(b) => local.push(b),
                Err(e) => {
                    cleanup(alloc, &mut local, &mut remote);
                    return Err(EngineError::HaloAllocationFailure(e.to_string()));
                }
            }

            let label_remote = format!("{}_halo_remote_{}", field_name, face.index());
            match alloc.create_buffer(
                size,
                remote_usage,
                BufferResidency::DeviceOnly,
                &label_remote,
            ) {
                Ok(b) => remote.push(b),
                Err(e) => {
                    cleanup(alloc, &mut local, &mut remote);
                    return Err(EngineError::HaloAllocationFailure(e.to_string()));
                }
            }
        }

        log::debug!(
            "字段 '{}' 在 GPU {} 的光环缓冲就绪 ({} 体素/X 面)",
            field_name,
            gpu_index,
            counts[0]
        );

        per_gpu[gpu_index as usize] = Some(HaloBufferSet {
            local,
            remote,
            dims,
            counts,
            produced: [0; 6],
            consumed: [0; 6],
        });
        Ok(())
    }

    /// 为 (src, dst) 有序对创建时间线信号量
    ///
    /// 共 `gpu_count * (gpu_count - 1)` 条；对角线保持空句柄。
    pub fn create_semaphores(&mut self) -> EngineResult<()> {
        let n = self.domains.len();
        self.semaphores = vec![vk::Semaphore::null(); n * n];
        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    continue;
                }
                match self.ctx.create_timeline_semaphore() {
                    Ok(sem) => self.semaphores[src * n + dst] = sem,
                    Err(e) => {
                        self.destroy_semaphores();
                        return Err(EngineError::HaloAllocationFailure(format!(
                            "信号量创建失败 ({} -> {}): {}",
                            src, dst, e
                        )));
                    }
                }
            }
        }
        log::info!("光环时间线信号量就绪 ({} 条)", n * (n - 1));
        Ok(())
    }

    /// 取 (src, dst) 的时间线信号量
    pub fn semaphore(&self, src: u32, dst: u32) -> EngineResult<vk::Semaphore> {
        let n = self.domains.len() as u32;
        if src >= n || dst >= n || src == dst {
            return Err(EngineError::HaloAllocationFailure(format!(
                "无效的信号量对 ({}, {})",
                src, dst
            )));
        }
        let sem = self.semaphores[(src * n + dst) as usize];
        if sem == vk::Semaphore::null() {
            return Err(EngineError::HaloAllocationFailure(format!(
                "信号量未创建 ({} -> {})",
                src, dst
            )));
        }
        Ok(sem)
    }

    /// 取缓冲组
    pub fn set(&self, field_name: &str, gpu_index: u32) -> EngineResult<&HaloBufferSet> {
        self.sets
            .get(field_name)
            .and_then(|v| v.get(gpu_index as usize))
            .and_then(|o| o.as_ref())
            .ok_or_else(|| {
                EngineError::HaloAllocationFailure(format!(
                    "字段 '{}' 在 GPU {} 上未分配光环",
                    field_name, gpu_index
                ))
            })
    }

    /// 取可变缓冲组（序号推进用）
    pub fn set_mut(
        &mut self,
        field_name: &str,
        gpu_index: u32,
    ) -> EngineResult<&mut HaloBufferSet> {
        self.sets
            .get_mut(field_name)
            .and_then(|v| v.get_mut(gpu_index as usize))
            .and_then(|o| o.as_mut())
            .ok_or_else(|| {
                EngineError::HaloAllocationFailure(format!(
                    "字段 '{}' 在 GPU {} 上未分配光环",
                    field_name, gpu_index
                ))
            })
    }

    fn destroy_semaphores(&mut self) {
        let device = self.ctx.device();
        for sem in self.semaphores.drain(..) {
            if sem != vk::Semaphore::null() {
                unsafe { device.destroy_semaphore(sem, None) };
            }
        }
    }

    /// 释放全部缓冲与信号量
    pub fn destroy(&mut self, alloc: &mut DeviceAllocator) {
        for (_, per_gpu) in self.sets.iter_mut() {
            for slot in per_gpu.iter_mut() {
                if let Some(set) = slot.as_mut() {
                    for b in set.local.iter_mut() {
                        alloc.destroy_buffer(b);
                    }
                    for b in set.remote.iter_mut() {
                        alloc.destroy_buffer(b);
                    }
                }
                *slot = None;
            }
        }
        self.sets.clear();
        self.destroy_semaphores();
        log::debug!("光环管理器已销毁");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vf_foundation::{CoordBBox, VoxelCoord};

    fn cube_domain(min: i32, max: i32) -> SubDomain {
        let dim = (max - min + 1) as u32;
        SubDomain {
            gpu_index: 0,
            bounds: CoordBBox::new(VoxelCoord::splat(min), VoxelCoord::splat(max)),
            leaves: Vec::new(),
            active_voxel_count: dim * dim * dim,
            voxel_base: 0,
            neighbors: Vec::new(),
        }
    }

    // face_dims 与 pack_offset 是纯计算，不需要设备即可验证；
    // 这里借助一个未初始化上下文不可行，改为直接测试公式。

    #[test]
    fn test_face_dims_formula() {
        // 0..7 的立方体，厚度 2：每面 2 x 8 x 8 = 128 体素
        let domain = cube_domain(0, 7);
        let d = domain.bounds.dim();
        for face in Face::ALL {
            let (width, height) = match face.axis() {
                0 => (d.y, d.z),
                1 => (d.x, d.z),
                _ => (d.x, d.y),
            };
            let dims = FaceDims {
                thickness: 2,
                width,
                height,
            };
            assert_eq!(dims.voxel_count(), 128, "面 {}", face);
        }
    }

    #[test]
    fn test_face_dims_anisotropic() {
        let domain = SubDomain {
            gpu_index: 0,
            bounds: CoordBBox::new(VoxelCoord::ZERO, VoxelCoord::new(15, 7, 3)),
            leaves: Vec::new(),
            active_voxel_count: 16 * 8 * 4,
            voxel_base: 0,
            neighbors: Vec::new(),
        };
        let d = domain.bounds.dim();
        assert_eq!((d.x, d.y, d.z), (16, 8, 4));
        // X 面: 8x4, Y 面: 16x4, Z 面: 16x8
        let x = FaceDims {
            thickness: 2,
            width: d.y,
            height: d.z,
        };
        let y = FaceDims {
            thickness: 2,
            width: d.x,
            height: d.z,
        };
        let z = FaceDims {
            thickness: 2,
            width: d.x,
            height: d.y,
        };
        assert_eq!(x.voxel_count(), 64);
        assert_eq!(y.voxel_count(), 128);
        assert_eq!(z.voxel_count(), 256);
    }
}
