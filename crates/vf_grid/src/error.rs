// crates/vf_grid/src/error.rs

//! 网格层错误类型

use thiserror::Error;
use vf_foundation::FoundationError;
use vf_gpu::GpuError;

/// 网格层结果类型别名
pub type GridResult<T> = Result<T, GridError>;

/// 网格层错误
#[derive(Error, Debug)]
pub enum GridError {
    /// 活跃体素集合为空
    #[error("网格没有活跃体素")]
    EmptyGrid,

    /// 序列化格式损坏或版本不符
    #[error("网格字节流无效: {0}")]
    MalformedBytes(String),

    /// 平行数组大小不匹配
    #[error("网格数据大小不匹配: {name} 期望 {expected}, 实际 {actual}")]
    SizeMismatch {
        /// 数据名称
        name: &'static str,
        /// 期望大小
        expected: usize,
        /// 实际大小
        actual: usize,
    },

    /// 域分解请求无效
    #[error("无效的域分解配置: {0}")]
    InvalidSplit(String),

    /// 基础层错误
    #[error(transparent)]
    Foundation(#[from] FoundationError),

    /// GPU 层错误
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

impl GridError {
    /// 验证两个数组大小一致
    #[inline]
    pub fn check_size(name: &'static str, expected: usize, actual: usize) -> GridResult<()> {
        if expected != actual {
            Err(Self::SizeMismatch {
                name,
                expected,
                actual,
            })
        } else {
            Ok(())
        }
    }
}
