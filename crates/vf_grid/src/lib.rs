// crates/vf_grid/src/lib.rs

//! VoxFlow 网格层
//!
//! 稀疏体素网格的宿主表示、GPU 线性化上传、多 GPU 域分解与
//! 自适应细化的拓扑重建。
//!
//! # 模块结构
//!
//! - `source` - 宿主稀疏网格（8x8x8 叶块 + 占用位掩码）与构建器
//! - `upload` - Morton 线性化与三缓冲上传（原始网格、LUT、值数组）
//! - `split` - Z 序叶块划分、面邻接与负载均衡统计
//! - `rebuild` - 细化/粗化掩码驱动的拓扑重建
//!
//! # 线性化约定
//!
//! 活跃体素按 63 位 Morton 键严格递增排序；坐标查找表（LUT）
//! 与值数组在该顺序下平行。叶块原点按 8 对齐，因此叶块的
//! Morton 序与体素的 Morton 序一致，子域恒为线性索引空间中的
//! 连续区间。

#![warn(clippy::all)]

pub mod error;
pub mod rebuild;
pub mod source;
pub mod split;
pub mod upload;

pub use error::{GridError, GridResult};
pub use rebuild::{RebuildResult, TopologyRebuilder, ACTION_COARSEN, ACTION_KEEP, ACTION_REFINE};
pub use source::{GridBuilder, HostGrid, Leaf, LEAF_DIM, LEAF_VOLUME};
pub use split::{DomainSplitter, LoadBalanceReport, NeighborLink, SplitConfig, SubDomain};
pub use upload::{
    linearize, CoordRecord, GridAddresses, GridHeaderRecord, GridResources, GridUploader,
};
