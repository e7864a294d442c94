// crates/vf_foundation/src/error.rs

//! 基础错误类型
//!
//! 仅包含与坐标、格式等基础设施相关的错误。
//! 高层错误（GPU、网格、引擎）在各自 crate 中定义并向下转换。

use thiserror::Error;

/// 基础层结果类型别名
pub type FoundationResult<T> = Result<T, FoundationError>;

/// 基础层错误
#[derive(Error, Debug)]
pub enum FoundationError {
    /// 坐标超出 Morton 可编码范围
    #[error("坐标超出 Morton 编码范围: ({0}, {1}, {2})")]
    CoordOutOfRange(i32, i32, i32),

    /// 数组大小不匹配
    #[error("数组大小不匹配: {name} 期望 {expected}, 实际 {actual}")]
    SizeMismatch {
        /// 数据名称
        name: &'static str,
        /// 期望大小
        expected: usize,
        /// 实际大小
        actual: usize,
    },

    /// 无法识别的字段格式名
    #[error("不支持的字段格式: {0}")]
    UnknownFormat(String),

    /// 无效的面编码
    #[error("无效的面编码: {0}，合法范围 0..6")]
    InvalidFace(u32),
}

impl FoundationError {
    /// 验证两个数组大小一致
    #[inline]
    pub fn check_size(name: &'static str, expected: usize, actual: usize) -> FoundationResult<()> {
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
