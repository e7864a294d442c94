// crates/vf_gpu/src/lib.rs

//! VoxFlow GPU 层
//!
//! 提供基于 Vulkan (ash) 的设备管理与显存分配。
//!
//! # 模块结构
//!
//! - `context` - 实例/设备初始化、队列与一次性命令辅助
//! - `capabilities` - 设备能力检测
//! - `allocator` - 带设备地址发布的缓冲区分配
//!
//! # 架构
//!
//! ```text
//! +------------------+
//! |   GpuContext     |  <- 设备、计算/传输队列、命令池
//! +------------------+
//!          |
//!          v
//! +------------------+
//! | DeviceAllocator  |  <- 缓冲区分配与同步上传
//! +------------------+
//!          |
//!          v
//! +------------------+
//! |    GpuBuffer     |  <- 句柄 + 设备地址 + 映射指针
//! +------------------+
//! ```
//!
//! 引擎的全部字段缓冲、光环缓冲与查找表都经由本层分配，
//! 并通过 64 位设备地址被生成的内核访问（bindless）。

#![warn(clippy::all)]

pub mod allocator;
pub mod capabilities;
pub mod context;
pub mod error;

pub use allocator::{BufferResidency, DeviceAllocator, GpuBuffer};
pub use capabilities::{DeviceCapabilities, DeviceType, GpuFeatures};
pub use context::GpuContext;
pub use error::{GpuError, GpuResult};

// 重导出底层 Vulkan 类型供上层 crate 使用
pub use ash::vk;
