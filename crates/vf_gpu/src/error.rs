// crates/vf_gpu/src/error.rs

//! GPU 层错误类型

use thiserror::Error;

/// GPU 层结果类型别名
pub type GpuResult<T> = Result<T, GpuError>;

/// GPU 层错误
#[derive(Error, Debug)]
pub enum GpuError {
    /// 设备初始化失败（驱动缺失、实例/设备创建失败）
    #[error("设备初始化失败: {0}")]
    DeviceInit(String),

    /// 必需特性不可用
    #[error("设备缺少必需特性: {0}")]
    MissingFeature(&'static str),

    /// 显存分配失败
    #[error("显存分配失败: {0}")]
    Allocation(String),

    /// 同步上传失败
    #[error("缓冲区上传失败: {0}")]
    Upload(String),

    /// 设备丢失或等待超时
    #[error("设备丢失")]
    DeviceLost,

    /// 底层 Vulkan 调用失败
    #[error("Vulkan 调用失败: {0}")]
    Vk(#[from] ash::vk::Result),
}

impl GpuError {
    /// 将 vk::Result 区分为设备丢失与一般错误
    pub fn from_vk(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            other => GpuError::Vk(other),
        }
    }
}
