// apps/voxflow/src/main.rs

//! VoxFlow 命令行驱动
//!
//! 约定：`voxflow <脚本路径>`。正常结束退出码 0；任何类型化
//! 核心错误退出码 1，并在标准错误流输出单行诊断。没有其它
//! 参数，不读环境变量（日志级别在代码里固定）。

mod script;

use anyhow::{bail, Context, Result};
use script::{GridDecl, SimulationScript};
use vf_engine::{Engine, EngineConfig, GridSource};
use vf_foundation::VoxelCoord;

fn main() {
    // 日志级别固定，不经环境变量
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().collect();
    match run(&args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("voxflow: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("用法: {} <脚本路径>", args.first().map(String::as_str).unwrap_or("voxflow"));
    }
    let script_path = &args[1];

    let text = std::fs::read_to_string(script_path)
        .with_context(|| format!("脚本读取失败: {}", script_path))?;
    let script: SimulationScript =
        serde_json::from_str(&text).with_context(|| format!("脚本解析失败: {}", script_path))?;

    log::info!(
        "脚本加载: {} ({} 字段, {} 模板, {} 帧)",
        script_path,
        script.fields.len(),
        script.stencils.len(),
        script.frames
    );

    let grid = match &script.grid {
        GridDecl::DenseBox { min, max, value } => GridSource::DenseBox {
            min: VoxelCoord::from_array(*min),
            max: VoxelCoord::from_array(*max),
            value: *value,
        },
        GridDecl::File { path } => GridSource::File(path.into()),
    };

    let mut config = EngineConfig {
        gpu_count: script.gpu_count,
        halo_thickness: script.halo_thickness,
        grid,
        refinement: script.refinement.clone(),
        ..EngineConfig::default()
    };
    if let Some(estimate) = script.estimated_voxels {
        config.estimated_voxels = estimate;
    }

    let mut engine = Engine::new(config).context("引擎初始化失败")?;

    for field in &script.fields {
        engine
            .add_field_by_name(&field.name, &field.format, field.initial_components())
            .with_context(|| format!("字段注册失败: {}", field.name))?;
    }
    for stencil in &script.stencils {
        let name = stencil.name.clone();
        engine
            .add_stencil(stencil.clone())
            .with_context(|| format!("模板注册失败: {}", name))?;
    }

    if let Some(dot_path) = &script.export_dot {
        std::fs::write(dot_path, engine.export_graph_dot())
            .with_context(|| format!("依赖图导出失败: {}", dot_path))?;
        log::info!("依赖图已导出: {}", dot_path);
    }

    let schedule = engine.schedule().context("调度生成失败")?;
    log::info!("执行调度: [{}]", schedule.join(", "));

    engine
        .run_frames(script.frames, script.dt)
        .context("仿真推进失败")?;

    log::info!("脚本执行完成");
    Ok(())
}
