// apps/voxflow/src/script.rs

//! 声明式仿真脚本
//!
//! 嵌入式脚本运行时是外部协作者；本模块提供它的最小声明式
//! 替身：一个 JSON 文件，逐项对应引擎的脚本操作
//! （add_field / add_stencil / step）。
//!
//! # 示例
//!
//! ```json
//! {
//!   "gpu_count": 2,
//!   "grid": { "type": "dense_box", "min": [0, 0, 0], "max": [15, 15, 15], "value": 1.0 },
//!   "fields": [
//!     { "name": "density", "format": "R32F", "initial": [1.0] }
//!   ],
//!   "stencils": [
//!     {
//!       "name": "decay",
//!       "inputs": ["density"],
//!       "outputs": ["density"],
//!       "body": "float d = Read_density(idx);\nWrite_density(idx, d * (1.0 - pc.dt));"
//!     }
//!   ],
//!   "frames": 10,
//!   "dt": 0.016
//! }
//! ```

use serde::Deserialize;
use vf_engine::StencilDefinition;
use vf_engine::RefinementCriteria;

/// 网格来源声明
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GridDecl {
    /// 实心盒合成网格
    DenseBox {
        /// 最小角
        min: [i32; 3],
        /// 最大角
        max: [i32; 3],
        /// 统一体素值
        value: f32,
    },
    /// 序列化网格文件
    File {
        /// 文件路径
        path: String,
    },
}

/// 字段声明
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDecl {
    /// 字段名
    pub name: String,
    /// 格式名（R32F、R32G32B32F 等）
    pub format: String,
    /// 初值分量（缺省清零）
    #[serde(default)]
    pub initial: Option<Vec<f32>>,
}

impl FieldDecl {
    /// 初值补齐为 4 分量
    pub fn initial_components(&self) -> Option<[f32; 4]> {
        self.initial.as_ref().map(|v| {
            let mut out = [0.0f32; 4];
            for (i, &x) in v.iter().take(4).enumerate() {
                out[i] = x;
            }
            out
        })
    }
}

fn default_frames() -> u32 {
    1
}

fn default_dt() -> f32 {
    0.016
}

fn default_gpu_count() -> u32 {
    1
}

fn default_halo_thickness() -> u32 {
    2
}

/// 仿真脚本
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationScript {
    /// 目标 GPU 数
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    /// 光环厚度
    #[serde(default = "default_halo_thickness")]
    pub halo_thickness: u32,
    /// 活跃体素数上界（可选）
    #[serde(default)]
    pub estimated_voxels: Option<u32>,
    /// 网格来源
    pub grid: GridDecl,
    /// 字段声明
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    /// 模板声明
    #[serde(default)]
    pub stencils: Vec<StencilDefinition>,
    /// 细化配置
    #[serde(default)]
    pub refinement: Option<RefinementCriteria>,
    /// 推进帧数
    #[serde(default = "default_frames")]
    pub frames: u32,
    /// 时间步长
    #[serde(default = "default_dt")]
    pub dt: f32,
    /// 依赖图 DOT 输出路径（可选）
    #[serde(default)]
    pub export_dot: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_script_parses() {
        let script: SimulationScript = serde_json::from_str(
            r#"{
                "grid": { "type": "dense_box", "min": [0,0,0], "max": [3,3,3], "value": 1.0 },
                "fields": [{ "name": "density", "format": "R32F" }],
                "stencils": [{
                    "name": "decay",
                    "inputs": ["density"],
                    "outputs": ["density"],
                    "body": "Write_density(idx, Read_density(idx) * 0.99);"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(script.gpu_count, 1);
        assert_eq!(script.halo_thickness, 2);
        assert_eq!(script.frames, 1);
        assert!(script.refinement.is_none());
        assert_eq!(script.stencils[0].neighbour_radius, 0);
    }

    #[test]
    fn test_file_grid_decl() {
        let script: SimulationScript = serde_json::from_str(
            r#"{ "grid": { "type": "file", "path": "scene.vfg" } }"#,
        )
        .unwrap();
        assert!(matches!(script.grid, GridDecl::File { .. }));
        assert!(script.fields.is_empty());
    }

    #[test]
    fn test_initial_components_padded() {
        let decl = FieldDecl {
            name: "velocity".into(),
            format: "R32G32B32F".into(),
            initial: Some(vec![1.0, 2.0]),
        };
        assert_eq!(decl.initial_components(), Some([1.0, 2.0, 0.0, 0.0]));
    }
}
