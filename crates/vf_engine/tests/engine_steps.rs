// crates/vf_engine/tests/engine_steps.rs

//! 引擎时间步端到端测试
//!
//! 需要 Vulkan 驱动与 shaderc 后端（`--features shaderc`）。
//! 无设备时跳过。

#![cfg(feature = "shaderc")]

use vf_engine::{Engine, EngineConfig, EngineError, GridSource, StencilDefinition};
use vf_foundation::VoxelCoord;

fn config(gpu_count: u32) -> EngineConfig {
    EngineConfig {
        gpu_count,
        grid: GridSource::DenseBox {
            min: VoxelCoord::ZERO,
            max: VoxelCoord::splat(15),
            value: 1.0,
        },
        cache_dir: Some(std::env::temp_dir().join("voxflow-test-cache")),
        ..EngineConfig::default()
    }
}

fn try_engine(gpu_count: u32) -> Option<Engine> {
    match Engine::new(config(gpu_count)) {
        Ok(e) => Some(e),
        Err(EngineError::DeviceInit(reason)) => {
            eprintln!("跳过引擎测试（无可用设备）: {}", reason);
            None
        }
        Err(e) => panic!("引擎初始化意外失败: {}", e),
    }
}

fn decay_stencil() -> StencilDefinition {
    StencilDefinition {
        name: "decay".into(),
        inputs: vec!["density".into()],
        outputs: vec!["density".into()],
        body: "float d = Read_density(idx);\nWrite_density(idx, d * (1.0 - pc.dt));".into(),
        neighbour_radius: 0,
    }
}

fn diffuse_stencil() -> StencilDefinition {
    StencilDefinition {
        name: "diffuse".into(),
        inputs: vec!["density".into()],
        outputs: vec!["smoothed".into()],
        body: concat!(
            "float c = Read_density(idx);\n",
            "float xp = ReadNeighbor_density(idx, ivec3(1, 0, 0));\n",
            "float xm = ReadNeighbor_density(idx, ivec3(-1, 0, 0));\n",
            "Write_smoothed(idx, (c + xp + xm) / 3.0);"
        )
        .into(),
        neighbour_radius: 1,
    }
}

#[test]
fn single_domain_steps_advance() {
    let Some(mut engine) = try_engine(1) else { return };
    engine
        .add_field_by_name("density", "R32F", Some([1.0, 0.0, 0.0, 0.0]))
        .unwrap();
    engine.add_stencil(decay_stencil()).unwrap();

    assert_eq!(engine.schedule().unwrap(), vec!["decay"]);
    engine.run_frames(3, 0.016).unwrap();
    assert_eq!(engine.frame(), 3);
    assert_eq!(engine.domains().len(), 1);
}

#[test]
fn two_domains_exchange_halos_and_step() {
    let Some(mut engine) = try_engine(2) else { return };
    engine
        .add_field_by_name("density", "R32F", Some([1.0, 0.0, 0.0, 0.0]))
        .unwrap();
    engine.add_field_by_name("smoothed", "R32F", None).unwrap();
    engine.add_stencil(diffuse_stencil()).unwrap();

    engine.run_frames(2, 0.016).unwrap();
    assert_eq!(engine.domains().len(), 2);

    // 子域互为 X 面邻居
    let d0 = &engine.domains()[0];
    assert_eq!(d0.neighbors.len(), 1);
}

#[test]
fn unsupported_format_is_rejected() {
    let Some(mut engine) = try_engine(1) else { return };
    assert!(matches!(
        engine.add_field_by_name("density", "R64F", None),
        Err(EngineError::UnsupportedFormat(_))
    ));
}

#[test]
fn dot_export_after_registration() {
    let Some(mut engine) = try_engine(1) else { return };
    engine.add_field_by_name("density", "R32F", None).unwrap();
    engine.add_field_by_name("smoothed", "R32F", None).unwrap();
    engine.add_stencil(diffuse_stencil()).unwrap();
    engine.add_stencil(decay_stencil()).unwrap();

    let dot = engine.export_graph_dot();
    assert!(dot.contains("\"diffuse\""));
    assert!(dot.contains("\"decay\""));
}
