// crates/vf_engine/src/stencil.rs

//! 模板注册表
//!
//! 把用户模板定义编译为计算管线：校验字段引用、生成 GLSL、
//! 查询磁盘缓存、调用外部编译器、在共享管线布局上建管线。
//! 布局全程只有一个：无描述符集，单个 256 字节推送常量区间，
//! 所有模板与内建内核（光环打包/解包、细化标记/重映射）共用
//! 这一形状。
//!
//! 模板注册后不可变。邻域半径超过光环厚度的模板在注册时
//! 即被拒绝，否则它会读到过期的内部值。

use crate::cache::PipelineCache;
use crate::compiler::KernelCompiler;
use crate::error::{EngineError, EngineResult};
use crate::fields::FieldRegistry;
use crate::shadergen::ShaderGenerator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use vf_gpu::{vk, GpuContext, GpuError};

/// 推送常量区间大小（字节）
pub const PUSH_CONSTANT_SIZE: u32 = 256;

/// 用户模板定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StencilDefinition {
    /// 模板名（运行内唯一）
    pub name: String,
    /// 输入字段名
    #[serde(default)]
    pub inputs: Vec<String>,
    /// 输出字段名
    #[serde(default)]
    pub outputs: Vec<String>,
    /// 用户内核代码片段
    pub body: String,
    /// 邻域半径（0 = 无邻域访问）
    #[serde(default)]
    pub neighbour_radius: u32,
}

impl StencilDefinition {
    /// 是否需要光环数据
    #[inline]
    pub fn requires_halos(&self) -> bool {
        self.neighbour_radius > 0
    }

    /// 引用的字段名（输入在前，输出在后，去重）
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for name in self.inputs.iter().chain(self.outputs.iter()) {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        seen
    }
}

/// 已编译模板
pub struct CompiledStencil {
    /// 原始定义
    pub definition: StencilDefinition,
    /// 计算管线
    pub pipeline: vk::Pipeline,
    /// 共享管线布局句柄
    pub layout: vk::PipelineLayout,
    /// SPIR-V 字词（不可变）
    pub spirv: Vec<u32>,
    /// 生成的 GLSL（缓存键与诊断用）
    pub source: String,
}

/// 模板注册表
pub struct StencilRegistry {
    ctx: Arc<GpuContext>,
    layout: vk::PipelineLayout,
    cache: PipelineCache,
    stencils: Vec<CompiledStencil>,
    by_name: HashMap<String, usize>,
    halo_thickness: u32,
}

impl StencilRegistry {
    /// 构造注册表并创建共享管线布局
    pub fn new(
        ctx: Arc<GpuContext>,
        cache: PipelineCache,
        halo_thickness: u32,
    ) -> EngineResult<Self> {
        let layout = Self::create_shared_layout(&ctx)?;
        log::info!("模板注册表就绪");
        Ok(Self {
            ctx,
            layout,
            cache,
            stencils: Vec::new(),
            by_name: HashMap::new(),
            halo_thickness,
        })
    }

    /// 磁盘管线缓存
    pub fn cache(&self) -> &PipelineCache {
        &self.cache
    }

    /// 共享布局：无描述符集，256 字节计算阶段推送常量
    fn create_shared_layout(ctx: &GpuContext) -> EngineResult<vk::PipelineLayout> {
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)];
        let info = vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&ranges);
        let layout = unsafe { ctx.device().create_pipeline_layout(&info, None) }
            .map_err(GpuError::from_vk)?;
        Ok(layout)
    }

    /// 校验模板定义
    fn validate(&self, def: &StencilDefinition, fields: &FieldRegistry) -> EngineResult<()> {
        if def.name.is_empty() {
            return Err(EngineError::UnknownStencil("模板名为空".into()));
        }
        if self.by_name.contains_key(&def.name) {
            return Err(EngineError::DuplicateStencil(def.name.clone()));
        }
        for name in def.inputs.iter().chain(def.outputs.iter()) {
            if !fields.has(name) {
                return Err(EngineError::UnknownField(name.clone()));
            }
        }
        if def.neighbour_radius > self.halo_thickness {
            return Err(EngineError::RadiusExceedsHalo {
                name: def.name.clone(),
                radius: def.neighbour_radius,
                thickness: self.halo_thickness,
            });
        }
        Ok(())
    }

    /// 注册并编译模板
    ///
    /// 缓存命中时不触碰编译器；未命中且编译器缺失时报
    /// [`EngineError::CompilerError`]。
    pub fn register(
        &mut self,
        def: StencilDefinition,
        fields: &FieldRegistry,
        compiler: Option<&dyn KernelCompiler>,
    ) -> EngineResult<&CompiledStencil> {
        log::info!("注册模板: '{}'", def.name);
        self.validate(&def, fields)?;

        let generator = ShaderGenerator::new(fields.layout());
        let source = generator.generate(&def)?;

        let spirv = match self.cache.lookup(&def.name, &source) {
            Some(words) => words,
            None => {
                let compiler = compiler.ok_or_else(|| {
                    EngineError::CompilerError("编译器后端不可用".into())
                })?;
                let words = compiler.compile(&source, "main")?;
                self.cache.store(&def.name, &source, &words);
                words
            }
        };

        let pipeline = self.create_compute_pipeline(&spirv)?;

        self.by_name.insert(def.name.clone(), self.stencils.len());
        self.stencils.push(CompiledStencil {
            definition: def,
            pipeline,
            layout: self.layout,
            spirv,
            source,
        });
        Ok(&self.stencils[self.stencils.len() - 1])
    }

    /// 从 SPIR-V 创建计算管线
    fn create_compute_pipeline(&self, spirv: &[u32]) -> EngineResult<vk::Pipeline> {
        let device = self.ctx.device();
        let module_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { device.create_shader_module(&module_info, None) }
            .map_err(GpuError::from_vk)?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.layout);

        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { device.destroy_shader_module(module, None) };

        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((_, e)) => Err(GpuError::from_vk(e).into()),
        }
    }

    /// 按名查模板
    pub fn get(&self, name: &str) -> EngineResult<&CompiledStencil> {
        self.by_name
            .get(name)
            .map(|&i| &self.stencils[i])
            .ok_or_else(|| EngineError::UnknownStencil(name.to_string()))
    }

    /// 模板是否存在
    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// 全部模板（注册顺序）
    pub fn stencils(&self) -> &[CompiledStencil] {
        &self.stencils
    }

    /// 模板数
    pub fn len(&self) -> usize {
        self.stencils.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.stencils.is_empty()
    }

    /// 共享管线布局
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// 调度列表中是否有模板需要光环
    pub fn any_requires_halos(&self, schedule: &[String]) -> bool {
        schedule.iter().any(|name| {
            self.by_name
                .get(name)
                .map(|&i| self.stencils[i].definition.requires_halos())
                .unwrap_or(false)
        })
    }

    /// 释放全部管线与布局
    pub fn destroy(&mut self) {
        let device = self.ctx.device();
        unsafe {
            for stencil in &self.stencils {
                device.destroy_pipeline(stencil.pipeline, None);
            }
            device.destroy_pipeline_layout(self.layout, None);
        }
        self.stencils.clear();
        self.by_name.clear();
        self.layout = vk::PipelineLayout::null();
        log::debug!("模板注册表已销毁");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, inputs: &[&str], outputs: &[&str], radius: u32) -> StencilDefinition {
        StencilDefinition {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            body: String::new(),
            neighbour_radius: radius,
        }
    }

    #[test]
    fn test_requires_halos() {
        assert!(!def("a", &[], &[], 0).requires_halos());
        assert!(def("a", &[], &[], 1).requires_halos());
    }

    #[test]
    fn test_referenced_fields_dedup_in_order() {
        let d = def("a", &["x", "y"], &["y", "z"], 0);
        assert_eq!(d.referenced_fields(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_definition_serde_roundtrip() {
        let d = def("advect", &["density"], &["density"], 1);
        let json = serde_json::to_string(&d).unwrap();
        let back: StencilDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "advect");
        assert_eq!(back.neighbour_radius, 1);
    }

    #[test]
    fn test_definition_serde_defaults() {
        let back: StencilDefinition =
            serde_json::from_str(r#"{"name": "init", "body": "Write_d(idx, 1.0);"}"#).unwrap();
        assert!(back.inputs.is_empty());
        assert!(back.outputs.is_empty());
        assert_eq!(back.neighbour_radius, 0);
    }
}
