// crates/vf_engine/src/refine.rs

//! 自适应细化控制
//!
//! 标记 - 回读 - 重建 - 重映射循环：
//!
//! 1. 标记内核按 |触发字段值| 与阈值写逐体素动作字
//!    （1=细化, 2=粗化, 0=不动），层级越界的动作被抑制
//! 2. 动作掩码拷回宿主并统计
//! 3. 宿主侧重建坐标表（vf_grid::TopologyRebuilder）
//! 4. 按新活跃数重分配全部字段缓冲，重映射内核按来源索引表
//!    搬运旧值（保留取自身、细化取父、粗化取首个子体素）
//! 5. 更新逐体素层级数组
//!
//! 切换是全有或全无的：新网格与新字段缓冲只在重映射完成后
//! 一并安装，任何失败都回收新资源并保持旧状态。

use crate::cache::PipelineCache;
use crate::compiler::KernelCompiler;
use crate::error::{EngineError, EngineResult};
use crate::fields::FieldRegistry;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vf_gpu::{vk, BufferResidency, DeviceAllocator, GpuBuffer, GpuContext, GpuError};
use vf_grid::{GridBuilder, GridResources, GridUploader, TopologyRebuilder};

/// 细化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementCriteria {
    /// 监控字段名
    pub trigger_field: String,
    /// 细化阈值（|值| 大于则细化）
    pub refine_threshold: f32,
    /// 粗化阈值（|值| 小于则粗化）
    pub coarsen_threshold: f32,
    /// 最小层级
    #[serde(default)]
    pub min_level: u8,
    /// 最大层级
    #[serde(default = "default_max_level")]
    pub max_level: u8,
    /// 每多少步运行一次
    #[serde(default = "default_interval")]
    pub interval: u32,
}

fn default_max_level() -> u8 {
    3
}

fn default_interval() -> u32 {
    1
}

impl Default for RefinementCriteria {
    fn default() -> Self {
        Self {
            trigger_field: "vorticity".into(),
            refine_threshold: 0.5,
            coarsen_threshold: 0.1,
            min_level: 0,
            max_level: 3,
            interval: 1,
        }
    }
}

/// 细化统计
#[derive(Debug, Clone, Copy, Default)]
pub struct RefinementStats {
    /// 细化的体素数
    pub refined: u32,
    /// 完整粗化的兄弟组数
    pub coarsened: u32,
    /// 重建后的活跃体素总数
    pub total_active: u32,
}

/// 标记内核源码
const MARK_SRC: &str = r#"#version 460
#extension GL_EXT_buffer_reference : require
#extension GL_EXT_scalar_block_layout : require
#extension GL_EXT_shader_explicit_arithmetic_types_int64 : require

layout(local_size_x = 256, local_size_y = 1, local_size_z = 1) in;

layout(buffer_reference, scalar) buffer FloatBuf { float data[]; };
layout(buffer_reference, scalar) buffer UintBuf { uint data[]; };

layout(push_constant, scalar) uniform PC {
    uint64_t fieldAddr;
    uint64_t maskAddr;
    uint64_t levelAddr;
    float refineThreshold;
    float coarsenThreshold;
    uint voxelCount;
    uint minLevel;
    uint maxLevel;
    uint _pad;
} pc;

void main() {
    uint idx = gl_GlobalInvocationID.x;
    if (idx >= pc.voxelCount) {
        return;
    }

    float v = abs(FloatBuf(pc.fieldAddr).data[idx]);
    uint level = UintBuf(pc.levelAddr).data[idx];
    uint action = 0u;
    if (v > pc.refineThreshold && level < pc.maxLevel) {
        action = 1u;
    } else if (v < pc.coarsenThreshold && level > pc.minLevel) {
        action = 2u;
    }
    UintBuf(pc.maskAddr).data[idx] = action;
}
"#;

/// 重映射内核源码
const REMAP_SRC: &str = r#"#version 460
#extension GL_EXT_buffer_reference : require
#extension GL_EXT_scalar_block_layout : require
#extension GL_EXT_shader_explicit_arithmetic_types_int64 : require

layout(local_size_x = 256, local_size_y = 1, local_size_z = 1) in;

layout(buffer_reference, scalar) buffer WordBuf { uint data[]; };

layout(push_constant, scalar) uniform PC {
    uint64_t srcAddr;
    uint64_t dstAddr;
    uint64_t mapAddr;
    uint wordsPerElement;
    uint count;
} pc;

void main() {
    uint idx = gl_GlobalInvocationID.x;
    if (idx >= pc.count) {
        return;
    }
    uint src = WordBuf(pc.mapAddr).data[idx];
    for (uint w = 0u; w < pc.wordsPerElement; w++) {
        WordBuf(pc.dstAddr).data[idx * pc.wordsPerElement + w] =
            WordBuf(pc.srcAddr).data[src * pc.wordsPerElement + w];
    }
}
"#;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MarkPush {
    field_addr: u64,
    mask_addr: u64,
    level_addr: u64,
    refine_threshold: f32,
    coarsen_threshold: f32,
    voxel_count: u32,
    min_level: u32,
    max_level: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RemapPush {
    src_addr: u64,
    dst_addr: u64,
    map_addr: u64,
    words_per_element: u32,
    count: u32,
}

/// 细化控制器
pub struct RefinementController {
    ctx: Arc<GpuContext>,
    criteria: RefinementCriteria,
    layout: vk::PipelineLayout,
    mark_pipeline: vk::Pipeline,
    remap_pipeline: vk::Pipeline,
    cmd_pool: vk::CommandPool,
    mask: Option<GpuBuffer>,
    readback: Option<GpuBuffer>,
    level_buf: Option<GpuBuffer>,
    host_levels: Vec<u8>,
}

impl RefinementController {
    /// 编译标记/重映射管线
    pub fn new(
        ctx: Arc<GpuContext>,
        cache: &PipelineCache,
        compiler: &dyn KernelCompiler,
        criteria: RefinementCriteria,
    ) -> EngineResult<Self> {
        log::info!(
            "细化控制器: 触发字段 '{}', 阈值 [{}, {}], 层级 [{}, {}]",
            criteria.trigger_field,
            criteria.coarsen_threshold,
            criteria.refine_threshold,
            criteria.min_level,
            criteria.max_level
        );

        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(crate::stencil::PUSH_CONSTANT_SIZE)];
        let layout_info = vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&ranges);
        let layout = unsafe { ctx.device().create_pipeline_layout(&layout_info, None) }
            .map_err(GpuError::from_vk)?;

        let mut created: Vec<vk::Pipeline> = Vec::new();
        let build = |name: &str, src: &str| -> EngineResult<vk::Pipeline> {
            let spirv = match cache.lookup(name, src) {
                Some(words) => words,
                None => {
                    let words = compiler.compile(src, "main")?;
                    cache.store(name, src, &words);
                    words
                }
            };
            let module_info = vk::ShaderModuleCreateInfo::default().code(&spirv);
            let module = unsafe { ctx.device().create_shader_module(&module_info, None) }
                .map_err(GpuError::from_vk)?;
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(c"main");
            let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
            let result = unsafe {
                ctx.device()
                    .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
            };
            unsafe { ctx.device().destroy_shader_module(module, None) };
            match result {
                Ok(p) => Ok(p[0]),
                Err((_, e)) => Err(EngineError::from(GpuError::from_vk(e))),
            }
        };

        let mark_pipeline = match build("refine_mark", MARK_SRC) {
            Ok(p) => {
                created.push(p);
                p
            }
            Err(e) => {
                unsafe { ctx.device().destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };
        let remap_pipeline = match build("refine_remap", REMAP_SRC) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    for p in created {
                        ctx.device().destroy_pipeline(p, None);
                    }
                    ctx.device().destroy_pipeline_layout(layout, None);
                }
                return Err(e);
            }
        };

        let cmd_pool = match ctx.create_command_pool(
            ctx.compute_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        ) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    ctx.device().destroy_pipeline(mark_pipeline, None);
                    ctx.device().destroy_pipeline(remap_pipeline, None);
                    ctx.device().destroy_pipeline_layout(layout, None);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            ctx,
            criteria,
            layout,
            mark_pipeline,
            remap_pipeline,
            cmd_pool,
            mask: None,
            readback: None,
            level_buf: None,
            host_levels: Vec::new(),
        })
    }

    /// 配置
    pub fn criteria(&self) -> &RefinementCriteria {
        &self.criteria
    }

    /// 当前逐体素层级
    pub fn levels(&self) -> &[u8] {
        &self.host_levels
    }

    /// 本步是否应运行（step 从 1 计）
    pub fn due(&self, step: u64) -> bool {
        let interval = u64::from(self.criteria.interval.max(1));
        step % interval == 0
    }

    /// 按体素数（重新）准备掩码/回读/层级缓冲
    fn ensure_buffers(
        &mut self,
        alloc: &mut DeviceAllocator,
        count: u32,
        levels: Option<&[u8]>,
    ) -> EngineResult<()> {
        let byte_len = u64::from(count) * 4;
        let need_realloc = self
            .mask
            .as_ref()
            .map(|b| b.size != byte_len)
            .unwrap_or(true);

        if need_realloc {
            self.release_buffers(alloc);
            let mask = alloc.create_buffer(
                byte_len,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                BufferResidency::DeviceOnly,
                "refine_mask",
            )?;
            let readback = alloc.create_buffer(
                byte_len,
                vk::BufferUsageFlags::TRANSFER_DST,
                BufferResidency::HostDownload,
                "refine_mask_readback",
            )?;
            let level_buf = alloc.create_buffer(
                byte_len,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                BufferResidency::DeviceOnly,
                "refine_levels",
            )?;
            self.mask = Some(mask);
            self.readback = Some(readback);
            self.level_buf = Some(level_buf);
            self.host_levels.resize(count as usize, 0);
        }

        if let Some(levels) = levels {
            self.host_levels.clear();
            self.host_levels.extend_from_slice(levels);
        }

        // 层级以 32 位字存放在 GPU 侧
        let words: Vec<u32> = self.host_levels.iter().map(|&l| u32::from(l)).collect();
        if let Some(level_buf) = self.level_buf.as_ref() {
            alloc.upload_sync(level_buf, bytemuck::cast_slice(&words), 0)?;
        }
        Ok(())
    }

    fn release_buffers(&mut self, alloc: &mut DeviceAllocator) {
        for buf in [&mut self.mask, &mut self.readback, &mut self.level_buf] {
            if let Some(mut b) = buf.take() {
                alloc.destroy_buffer(&mut b);
            }
        }
    }

    /// 运行一轮标记 - 重建 - 重映射
    ///
    /// 拓扑未变化时返回 `Ok(None)`；变化时安装新网格与新字段
    /// 缓冲并返回统计。
    pub fn run(
        &mut self,
        alloc: &mut DeviceAllocator,
        grid: &mut GridResources,
        fields: &mut FieldRegistry,
    ) -> EngineResult<Option<RefinementStats>> {
        let count = grid.active_count;
        let trigger = fields.get(&self.criteria.trigger_field)?;
        if !trigger.format.is_float() || trigger.format.component_count() != 1 {
            return Err(EngineError::UnsupportedFormat(format!(
                "细化触发字段必须是 R32F，实际 {}",
                trigger.format
            )));
        }
        let trigger_addr = trigger.device_address;

        self.ensure_buffers(alloc, count, None)?;
        let mask_addr = self.mask.as_ref().map(|b| b.device_address).unwrap_or(0);
        let level_addr = self
            .level_buf
            .as_ref()
            .map(|b| b.device_address)
            .unwrap_or(0);

        // 标记 + 回读
        let mask = self.dispatch_mark(count, trigger_addr, mask_addr, level_addr)?;

        let refine_requests = mask.iter().filter(|&&a| a == 1).count() as u32;
        let coarsen_requests = mask.iter().filter(|&&a| a == 2).count() as u32;
        log::debug!(
            "细化标记: {} 细化请求, {} 粗化请求 / {} 体素",
            refine_requests,
            coarsen_requests,
            count
        );
        if refine_requests == 0 && coarsen_requests == 0 {
            return Ok(None);
        }

        // 宿主侧重建
        let rebuilder = TopologyRebuilder::new(self.criteria.min_level, self.criteria.max_level);
        let result = rebuilder.rebuild(
            &grid.host_lut,
            &grid.host_values,
            &self.host_levels,
            &mask,
        )?;
        if !result.topology_changed(grid.host_lut.len()) {
            return Ok(None);
        }
        let new_count = result.lut.len() as u32;

        // 新网格
        let mut builder = GridBuilder::new(grid.background);
        for (i, &coord) in result.lut.iter().enumerate() {
            builder.set(coord, result.values[i]);
        }
        let new_host = builder.build()?;
        let mut new_grid = GridUploader::upload(alloc, &new_host)?;

        // 来源索引表
        let mut map_buf = match alloc.create_buffer(
            u64::from(new_count) * 4,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            BufferResidency::DeviceOnly,
            "refine_remap_map",
        ) {
            Ok(b) => b,
            Err(e) => {
                new_grid.destroy(alloc);
                return Err(e.into());
            }
        };
        if let Err(e) = alloc.upload_sync(&map_buf, bytemuck::cast_slice(&result.mapping), 0) {
            alloc.destroy_buffer(&mut map_buf);
            new_grid.destroy(alloc);
            return Err(e.into());
        }

        // 重分配并重映射全部字段
        let new_buffers = match fields.begin_reallocation(alloc, new_count) {
            Ok(b) => b,
            Err(e) => {
                alloc.destroy_buffer(&mut map_buf);
                new_grid.destroy(alloc);
                return Err(e);
            }
        };
        if let Err(e) =
            self.dispatch_remap(fields, &new_buffers, map_buf.device_address, new_count)
        {
            fields.abort_reallocation(alloc, new_buffers);
            alloc.destroy_buffer(&mut map_buf);
            new_grid.destroy(alloc);
            return Err(e);
        }

        // 全有或全无的安装点
        fields.commit_reallocation(alloc, new_buffers, new_count)?;
        grid.destroy(alloc);
        *grid = new_grid;
        alloc.destroy_buffer(&mut map_buf);
        self.ensure_buffers(alloc, new_count, Some(&result.levels))?;

        let stats = RefinementStats {
            refined: result.refined,
            coarsened: result.coarsened_groups,
            total_active: new_count,
        };
        log::info!(
            "细化完成: 细化 {}, 粗化组 {}, 新活跃数 {}",
            stats.refined,
            stats.coarsened,
            stats.total_active
        );
        Ok(Some(stats))
    }

    /// 调度标记内核并回读动作掩码
    fn dispatch_mark(
        &self,
        count: u32,
        field_addr: u64,
        mask_addr: u64,
        level_addr: u64,
    ) -> EngineResult<Vec<u8>> {
        let push = MarkPush {
            field_addr,
            mask_addr,
            level_addr,
            refine_threshold: self.criteria.refine_threshold,
            coarsen_threshold: self.criteria.coarsen_threshold,
            voxel_count: count,
            min_level: u32::from(self.criteria.min_level),
            max_level: u32::from(self.criteria.max_level),
            _pad: 0,
        };

        let device = self.ctx.device();
        let readback = self
            .readback
            .as_ref()
            .ok_or_else(|| EngineError::DeviceInit("回读缓冲缺失".into()))?;
        let mask = self
            .mask
            .as_ref()
            .ok_or_else(|| EngineError::DeviceInit("掩码缓冲缺失".into()))?;

        let cmd = self.ctx.begin_oneshot(self.cmd_pool)?;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.mark_pipeline);
            device.cmd_push_constants(
                cmd,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, count.div_ceil(256).max(1), 1, 1);

            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
            let region = vk::BufferCopy::default().size(u64::from(count) * 4);
            device.cmd_copy_buffer(cmd, mask.handle, readback.handle, &[region]);
        }
        self.ctx
            .end_oneshot(cmd, self.cmd_pool, self.ctx.compute_queue())?;

        let slice = readback
            .mapped_slice()
            .ok_or_else(|| EngineError::DeviceInit("回读缓冲未映射".into()))?;
        let words: &[u32] = bytemuck::cast_slice(&slice[..count as usize * 4]);
        Ok(words.iter().map(|&w| w as u8).collect())
    }

    /// 对每个字段调度重映射内核
    fn dispatch_remap(
        &self,
        fields: &FieldRegistry,
        new_buffers: &[GpuBuffer],
        map_addr: u64,
        new_count: u32,
    ) -> EngineResult<()> {
        let device = self.ctx.device();
        let cmd = self.ctx.begin_oneshot(self.cmd_pool)?;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.remap_pipeline);
            for (field, new_buffer) in fields.fields().iter().zip(new_buffers) {
                let push = RemapPush {
                    src_addr: field.device_address,
                    dst_addr: new_buffer.device_address,
                    map_addr,
                    words_per_element: field.element_size / 4,
                    count: new_count,
                };
                device.cmd_push_constants(
                    cmd,
                    self.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push),
                );
                device.cmd_dispatch(cmd, new_count.div_ceil(256).max(1), 1, 1);
            }
        }
        self.ctx
            .end_oneshot(cmd, self.cmd_pool, self.ctx.compute_queue())
            .map_err(EngineError::from)
    }

    /// 释放全部资源
    pub fn destroy(&mut self, alloc: &mut DeviceAllocator) {
        self.release_buffers(alloc);
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline(self.mark_pipeline, None);
            device.destroy_pipeline(self.remap_pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_command_pool(self.cmd_pool, None);
        }
        self.mark_pipeline = vk::Pipeline::null();
        self.remap_pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
        self.cmd_pool = vk::CommandPool::null();
        log::debug!("细化控制器已销毁");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_defaults() {
        let c = RefinementCriteria::default();
        assert_eq!(c.trigger_field, "vorticity");
        assert!(c.refine_threshold > c.coarsen_threshold);
        assert_eq!(c.interval, 1);
    }

    #[test]
    fn test_criteria_serde_defaults() {
        let c: RefinementCriteria = serde_json::from_str(
            r#"{"trigger_field": "density", "refine_threshold": 1.0, "coarsen_threshold": 0.2}"#,
        )
        .unwrap();
        assert_eq!(c.min_level, 0);
        assert_eq!(c.max_level, 3);
        assert_eq!(c.interval, 1);
    }

    #[test]
    fn test_push_sizes() {
        assert_eq!(std::mem::size_of::<MarkPush>(), 48);
        assert_eq!(std::mem::size_of::<RemapPush>(), 32);
    }

    #[test]
    fn test_mark_kernel_source_shape() {
        assert!(MARK_SRC.contains("float refineThreshold;"));
        assert!(MARK_SRC.contains("action = 1u;"));
        assert!(MARK_SRC.contains("action = 2u;"));
        assert!(MARK_SRC.contains("level < pc.maxLevel"));
        assert!(MARK_SRC.contains("level > pc.minLevel"));
    }
}
