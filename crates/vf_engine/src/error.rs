// crates/vf_engine/src/error.rs

//! 引擎层错误类型
//!
//! 核心的全部类型化错误。除 `CacheIo`（降级为告警后重编译）与
//! `DomainImbalance`（仅告警）外，任何一种都中止当前操作并以
//! 致命错误形式上浮到脚本层。`DeviceLost` 额外使引擎进入
//! 中毒状态，之后的调用一律返回 `PoisonedEngine`。

use thiserror::Error;
use vf_foundation::FoundationError;
use vf_gpu::GpuError;
use vf_grid::GridError;

/// 引擎层结果类型别名
pub type EngineResult<T> = Result<T, EngineError>;

/// 引擎层错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 设备初始化失败
    #[error("设备初始化失败: {0}")]
    DeviceInit(String),

    /// 注册表容量耗尽
    #[error("容量超限: {0}")]
    CapacityExceeded(String),

    /// 不支持的字段格式
    #[error("不支持的字段格式: {0}")]
    UnsupportedFormat(String),

    /// 字段重名
    #[error("字段已存在: {0}")]
    DuplicateField(String),

    /// 字段未注册
    #[error("字段未注册: {0}")]
    UnknownField(String),

    /// 模板重名
    #[error("模板已存在: {0}")]
    DuplicateStencil(String),

    /// 模板未注册
    #[error("模板未注册: {0}")]
    UnknownStencil(String),

    /// 邻域半径超过光环厚度
    #[error("模板 '{name}' 邻域半径 {radius} 超过光环厚度 {thickness}")]
    RadiusExceedsHalo {
        /// 模板名
        name: String,
        /// 声明的邻域半径
        radius: u32,
        /// 配置的光环厚度
        thickness: u32,
    },

    /// 外部编译器不可用或编译失败
    #[error("内核编译失败: {0}")]
    CompilerError(String),

    /// 磁盘缓存 IO 失败（调用方降级为告警并重编译）
    #[error("管线缓存 IO 失败: {0}")]
    CacheIo(String),

    /// 依赖图存在环
    #[error("模板依赖图存在环，涉及节点: {0}")]
    Cycle(String),

    /// 网格为空
    #[error("网格没有活跃体素")]
    EmptyGrid,

    /// 光环缓冲分配失败
    #[error("光环缓冲分配失败: {0}")]
    HaloAllocationFailure(String),

    /// 设备丢失（fence 等待超时）
    #[error("设备丢失，引擎已中毒")]
    DeviceLost,

    /// 引擎处于中毒状态，拒绝后续调用
    #[error("引擎处于中毒状态，拒绝调用")]
    PoisonedEngine,

    /// 基础层错误
    #[error(transparent)]
    Foundation(#[from] FoundationError),

    /// GPU 层错误
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// 网格层错误
    #[error(transparent)]
    Grid(#[from] GridError),
}

impl EngineError {
    /// 折叠网格/GPU 错误中的典型类别
    ///
    /// `GridError::EmptyGrid` 与 `GpuError::DeviceLost` 有专属的
    /// 引擎层类别，其余保持透明包装。
    pub fn normalize(self) -> Self {
        match self {
            EngineError::Grid(GridError::EmptyGrid) => EngineError::EmptyGrid,
            EngineError::Grid(GridError::Gpu(GpuError::DeviceLost)) => EngineError::DeviceLost,
            EngineError::Gpu(GpuError::DeviceLost) => EngineError::DeviceLost,
            other => other,
        }
    }
}
