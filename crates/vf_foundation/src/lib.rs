// crates/vf_foundation/src/lib.rs

//! VoxFlow Foundation Layer
//!
//! 基础层，提供稀疏体素网格引擎的基础抽象。
//!
//! # 模块概览
//!
//! - [`morton`]: 有符号坐标的 63 位 Morton（Z 序）编码
//! - [`bbox`]: 包含式整数包围盒与面相邻判定
//! - [`format`]: 字段元素格式（8 种 32 位标量/向量格式）
//! - [`face`]: 子域 6 个面的编码（0..5，相对面为 `f ^ 1`）
//! - [`error`]: 基础错误类型
//!
//! # 设计原则
//!
//! 1. **最小依赖**: 仅依赖 glam、bytemuck、serde 和 thiserror
//! 2. **无 GPU 概念**: 任何 Vulkan 类型禁止出现在本层
//! 3. **确定性**: Morton 序对相同输入完全可复现

#![warn(clippy::all)]

pub mod bbox;
pub mod error;
pub mod face;
pub mod format;
pub mod morton;

// 重导出常用类型
pub use bbox::CoordBBox;
pub use error::{FoundationError, FoundationResult};
pub use face::Face;
pub use format::FieldFormat;
pub use morton::{morton_decode, morton_encode, MORTON_BITS};

/// 体素坐标，分量为有符号整数
pub type VoxelCoord = glam::IVec3;
