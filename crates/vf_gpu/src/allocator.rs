// crates/vf_gpu/src/allocator.rs

//! 显存分配器
//!
//! 在 gpu-allocator 之上提供缓冲区级别的封装：创建时按用途
//! 捕获 64 位设备地址，宿主可见内存持久映射，销毁操作幂等。
//!
//! # 驻留类别
//!
//! - `DeviceOnly`: 仅设备本地，字段与查找表缓冲
//! - `HostUpload`: 宿主写入、顺序上传（持久映射）
//! - `HostDownload`: 宿主回读（细化掩码等）

use crate::context::GpuContext;
use crate::error::{GpuError, GpuResult};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// 缓冲区驻留类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferResidency {
    /// 仅设备本地
    DeviceOnly,
    /// 宿主上传（持久映射，顺序写）
    HostUpload,
    /// 宿主回读
    HostDownload,
}

impl BufferResidency {
    fn location(self) -> MemoryLocation {
        match self {
            Self::DeviceOnly => MemoryLocation::GpuOnly,
            Self::HostUpload => MemoryLocation::CpuToGpu,
            Self::HostDownload => MemoryLocation::GpuToCpu,
        }
    }
}

/// 已分配的 GPU 缓冲区
///
/// 单一所有者记录：由分配它的组件持有，销毁经由
/// [`DeviceAllocator::destroy_buffer`]。
pub struct GpuBuffer {
    /// Vulkan 缓冲区句柄
    pub handle: vk::Buffer,
    /// 底层分配（销毁后为 None）
    allocation: Option<Allocation>,
    /// 设备地址；用途未含 SHADER_DEVICE_ADDRESS 时为 0
    pub device_address: u64,
    /// 字节大小
    pub size: u64,
}

impl GpuBuffer {
    /// 持久映射指针（宿主可见内存才有）
    #[inline]
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast())
    }

    /// 映射内存的可变切片
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut().and_then(|a| a.mapped_slice_mut())
    }

    /// 映射内存的只读切片
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|a| a.mapped_slice())
    }

    /// 是否仍持有有效分配
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.allocation.is_some()
    }
}

/// 显存分配器
pub struct DeviceAllocator {
    allocator: ManuallyDrop<Allocator>,
    ctx: Arc<GpuContext>,
    transfer_pool: vk::CommandPool,
}

impl DeviceAllocator {
    /// 创建分配器
    ///
    /// 整个分配器启用 buffer device address，保证任何带
    /// SHADER_DEVICE_ADDRESS 用途的缓冲都能取地址。
    pub fn new(ctx: Arc<GpuContext>) -> GpuResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance().clone(),
            device: ctx.device().clone(),
            physical_device: ctx.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::Allocation(e.to_string()))?;

        let transfer_pool = ctx.create_command_pool(
            ctx.transfer_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            ctx,
            transfer_pool,
        })
    }

    /// 创建缓冲区
    ///
    /// 用途包含 `SHADER_DEVICE_ADDRESS` 时捕获设备地址，否则
    /// 地址为 0。宿主可见驻留类别返回持久映射。
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        residency: BufferResidency,
        label: &str,
    ) -> GpuResult<GpuBuffer> {
        let device = self.ctx.device();
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { device.create_buffer(&info, None) }.map_err(GpuError::from_vk)?;
        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };

        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name: label,
            requirements,
            location: residency.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(a) => a,
            Err(e) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(GpuError::Allocation(format!("{} ({})", e, label)));
            }
        };

        if let Err(e) = unsafe {
            device.bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            let _ = self.allocator.free(allocation);
            unsafe { device.destroy_buffer(handle, None) };
            return Err(GpuError::from_vk(e));
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            unsafe { device.get_buffer_device_address(&addr_info) }
        } else {
            0
        };

        log::debug!(
            "缓冲区分配: {} ({} 字节, 地址 0x{:x})",
            label,
            size,
            device_address
        );

        Ok(GpuBuffer {
            handle,
            allocation: Some(allocation),
            device_address,
            size,
        })
    }

    /// 销毁缓冲区（幂等）
    pub fn destroy_buffer(&mut self, buffer: &mut GpuBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            if let Err(e) = self.allocator.free(allocation) {
                log::warn!("分配释放失败: {}", e);
            }
            unsafe { self.ctx.device().destroy_buffer(buffer.handle, None) };
            buffer.handle = vk::Buffer::null();
            buffer.device_address = 0;
        }
    }

    /// 经暂存缓冲同步上传数据
    ///
    /// 分配临时 HostUpload 暂存缓冲，拷贝并提交单条传输命令，
    /// 等待完成。无论成败，暂存缓冲都会被释放。
    pub fn upload_sync(
        &mut self,
        dst: &GpuBuffer,
        bytes: &[u8],
        dst_offset: u64,
    ) -> GpuResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if dst_offset + bytes.len() as u64 > dst.size {
            return Err(GpuError::Upload(format!(
                "写入越界: 目标 {} 字节, 偏移 {} + 数据 {}",
                dst.size,
                dst_offset,
                bytes.len()
            )));
        }

        let mut staging = self.create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            BufferResidency::HostUpload,
            "staging_upload",
        )?;

        let result = (|| {
            let mapped = staging
                .mapped_slice_mut()
                .ok_or_else(|| GpuError::Upload("暂存缓冲未映射".into()))?;
            mapped[..bytes.len()].copy_from_slice(bytes);

            let ctx = self.ctx.clone();
            let cmd = ctx.begin_oneshot(self.transfer_pool)?;
            let region = vk::BufferCopy::default()
                .src_offset(0)
                .dst_offset(dst_offset)
                .size(bytes.len() as u64);
            unsafe {
                ctx.device()
                    .cmd_copy_buffer(cmd, staging.handle, dst.handle, &[region]);
            }
            ctx.end_oneshot(cmd, self.transfer_pool, ctx.transfer_queue())
        })();

        self.destroy_buffer(&mut staging);
        result
    }

    /// 上下文引用
    #[inline]
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        unsafe {
            self.ctx
                .device()
                .destroy_command_pool(self.transfer_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
        }
        log::debug!("显存分配器已销毁");
    }
}
