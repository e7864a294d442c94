// crates/vf_engine/src/lib.rs

//! VoxFlow 引擎层
//!
//! 将脚本声明（字段 + 模板内核）翻译为正确排序的多子域计算
//! 调度：bindless 字段注册表、GLSL 生成与 SPIR-V 管线缓存、
//! 读写集推导的依赖图、光环交换与自适应细化控制循环。
//!
//! # 模块结构
//!
//! - `fields` - 字段注册表与 256 槽位地址表
//! - `shadergen` - 模板定义 -> GLSL 计算着色器（纯文本变换）
//! - `cache` - 按内容寻址的磁盘 SPIR-V 缓存
//! - `compiler` - 外部内核编译器接口（shaderc 后端可选）
//! - `stencil` - 模板注册表：校验、生成、编译、建管线
//! - `graph` - 依赖图与拓扑调度
//! - `halo` / `halo_sync` - 光环缓冲管理与打包/传输/解包程序
//! - `refine` - 标记/重建/重映射细化循环
//! - `engine` - 编排器：推进时间步
//!
//! # 数据流
//!
//! ```text
//! 脚本 -> Engine -> (FieldRegistry | StencilRegistry) -> DependencyGraph
//!              -> 每帧 { HaloSync -> 模板调度 -> 可选细化 }
//! ```

#![warn(clippy::all)]

pub mod cache;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod fields;
pub mod graph;
pub mod halo;
pub mod halo_sync;
pub mod refine;
pub mod shadergen;
pub mod stencil;

pub use cache::PipelineCache;
pub use compiler::{default_compiler, KernelCompiler};
pub use engine::{Engine, EngineConfig, GridSource};
pub use error::{EngineError, EngineResult};
pub use fields::{FieldDesc, FieldLayout, FieldRegistry, MAX_FIELDS};
pub use graph::DependencyGraph;
pub use halo::{FaceDims, HaloBufferSet, HaloManager};
pub use halo_sync::HaloSync;
pub use refine::{RefinementController, RefinementCriteria, RefinementStats};
pub use shadergen::ShaderGenerator;
pub use stencil::{CompiledStencil, StencilDefinition, StencilRegistry};
