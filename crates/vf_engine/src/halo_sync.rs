// crates/vf_engine/src/halo_sync.rs

//! 光环打包/解包内核与屏障放置
//!
//! 两条计算管线共用一个布局，推送常量为
//! `{field_addr, halo_addr, offset, count}`。打包从
//! `field[offset + idx]` 读、写入 `halo[idx]`；解包做逆操作。
//! 偏移与数量以 32 位字为单位，多分量格式按字数折算。
//!
//! 一次完整交换的屏障序列（阶段覆盖逐级增大）：
//!
//! 1. 打包闸门：计算写 -> 计算读
//! 2. 打包调度
//! 3. 打包 -> 传输：计算写 -> 传输读
//! 4. 缓冲拷贝（出站 remote -> 对侧 local），时间线信号量 +1
//! 5. 传输 -> 解包：传输写 -> 计算读，等待对侧时间线
//! 6. 解包调度

use crate::cache::PipelineCache;
use crate::compiler::KernelCompiler;
use crate::error::{EngineError, EngineResult};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use vf_gpu::{vk, GpuContext, GpuError};

/// 打包/解包的每组线程数
pub const HALO_WORKGROUP_SIZE: u32 = 256;

/// 打包内核源码
const PACK_SRC: &str = r#"#version 460
#extension GL_EXT_buffer_reference : require
#extension GL_EXT_scalar_block_layout : require
#extension GL_EXT_shader_explicit_arithmetic_types_int64 : require

layout(local_size_x = 256, local_size_y = 1, local_size_z = 1) in;

layout(buffer_reference, scalar) buffer WordBuf { uint data[]; };

layout(push_constant, scalar) uniform PC {
    uint64_t fieldAddr;
    uint64_t haloAddr;
    uint offset;
    uint count;
} pc;

void main() {
    uint idx = gl_GlobalInvocationID.x;
    if (idx >= pc.count) {
        return;
    }
    WordBuf(pc.haloAddr).data[idx] = WordBuf(pc.fieldAddr).data[pc.offset + idx];
}
"#;

/// 解包内核源码
const UNPACK_SRC: &str = r#"#version 460
#extension GL_EXT_buffer_reference : require
#extension GL_EXT_scalar_block_layout : require
#extension GL_EXT_shader_explicit_arithmetic_types_int64 : require

layout(local_size_x = 256, local_size_y = 1, local_size_z = 1) in;

layout(buffer_reference, scalar) buffer WordBuf { uint data[]; };

layout(push_constant, scalar) uniform PC {
    uint64_t fieldAddr;
    uint64_t haloAddr;
    uint offset;
    uint count;
} pc;

void main() {
    uint idx = gl_GlobalInvocationID.x;
    if (idx >= pc.count) {
        return;
    }
    WordBuf(pc.fieldAddr).data[pc.offset + idx] = WordBuf(pc.haloAddr).data[idx];
}
"#;

/// 打包/解包推送常量
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HaloPush {
    /// 字段缓冲地址
    pub field_addr: u64,
    /// 光环暂存地址
    pub halo_addr: u64,
    /// 字段内偏移（32 位字）
    pub offset: u32,
    /// 元素数量（32 位字）
    pub count: u32,
}

/// 光环同步内核
pub struct HaloSync {
    ctx: Arc<GpuContext>,
    layout: vk::PipelineLayout,
    pack: vk::Pipeline,
    unpack: vk::Pipeline,
}

impl HaloSync {
    /// 编译打包/解包管线
    pub fn new(
        ctx: Arc<GpuContext>,
        cache: &PipelineCache,
        compiler: &dyn KernelCompiler,
    ) -> EngineResult<Self> {
        let layout = Self::create_layout(&ctx)?;

        let pack_spirv = Self::obtain_spirv(cache, compiler, "halo_pack", PACK_SRC)?;
        let pack = match Self::create_pipeline(&ctx, layout, &pack_spirv) {
            Ok(p) => p,
            Err(e) => {
                unsafe { ctx.device().destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        let unpack_spirv = Self::obtain_spirv(cache, compiler, "halo_unpack", UNPACK_SRC)?;
        let unpack = match Self::create_pipeline(&ctx, layout, &unpack_spirv) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    ctx.device().destroy_pipeline(pack, None);
                    ctx.device().destroy_pipeline_layout(layout, None);
                }
                return Err(e);
            }
        };

        log::debug!("光环打包/解包管线就绪");
        Ok(Self {
            ctx,
            layout,
            pack,
            unpack,
        })
    }

    fn obtain_spirv(
        cache: &PipelineCache,
        compiler: &dyn KernelCompiler,
        name: &str,
        source: &str,
    ) -> EngineResult<Vec<u32>> {
        if let Some(words) = cache.lookup(name, source) {
            return Ok(words);
        }
        let words = compiler.compile(source, "main")?;
        cache.store(name, source, &words);
        Ok(words)
    }

    fn create_layout(ctx: &GpuContext) -> EngineResult<vk::PipelineLayout> {
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(crate::stencil::PUSH_CONSTANT_SIZE)];
        let info = vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&ranges);
        unsafe { ctx.device().create_pipeline_layout(&info, None) }
            .map_err(|e| GpuError::from_vk(e).into())
    }

    fn create_pipeline(
        ctx: &GpuContext,
        layout: vk::PipelineLayout,
        spirv: &[u32],
    ) -> EngineResult<vk::Pipeline> {
        let device = ctx.device();
        let module_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { device.create_shader_module(&module_info, None) }
            .map_err(GpuError::from_vk)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { device.destroy_shader_module(module, None) };
        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((_, e)) => Err(EngineError::from(GpuError::from_vk(e))),
        }
    }

    /// 录制打包调度
    pub fn record_pack(&self, cmd: vk::CommandBuffer, push: &HaloPush) {
        self.record_dispatch(cmd, self.pack, push);
    }

    /// 录制解包调度
    pub fn record_unpack(&self, cmd: vk::CommandBuffer, push: &HaloPush) {
        self.record_dispatch(cmd, self.unpack, push);
    }

    fn record_dispatch(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline, push: &HaloPush) {
        let device = self.ctx.device();
        let groups = push.count.div_ceil(HALO_WORKGROUP_SIZE).max(1);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            device.cmd_push_constants(
                cmd,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(push),
            );
            device.cmd_dispatch(cmd, groups, 1, 1);
        }
    }

    /// 打包闸门：此前的计算写对计算读可见
    pub fn cmd_pack_gate(&self, cmd: vk::CommandBuffer) {
        self.memory_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        );
    }

    /// 打包 -> 传输：计算写对传输读可见
    pub fn cmd_pack_to_transfer(&self, cmd: vk::CommandBuffer) {
        self.memory_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        );
    }

    /// 传输 -> 解包：传输写对计算读可见
    pub fn cmd_transfer_to_compute(&self, cmd: vk::CommandBuffer) {
        self.memory_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
    }

    /// 计算 -> 计算的全量屏障（模板间）
    pub fn cmd_compute_barrier(&self, cmd: vk::CommandBuffer) {
        self.memory_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
    }

    fn memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.ctx.device().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// 释放管线与布局
    pub fn destroy(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline(self.pack, None);
            device.destroy_pipeline(self.unpack, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
        self.pack = vk::Pipeline::null();
        self.unpack = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_layout_is_24_bytes() {
        assert_eq!(std::mem::size_of::<HaloPush>(), 24);
    }

    #[test]
    fn test_kernel_sources_shape() {
        for src in [PACK_SRC, UNPACK_SRC] {
            assert!(src.starts_with("#version 460"));
            assert!(src.contains("local_size_x = 256"));
            assert!(src.contains("uint64_t fieldAddr;"));
            assert!(src.contains("uint64_t haloAddr;"));
        }
        // 打包读字段写暂存，解包反之
        assert!(PACK_SRC.contains("WordBuf(pc.haloAddr).data[idx] = WordBuf(pc.fieldAddr).data[pc.offset + idx];"));
        assert!(UNPACK_SRC.contains("WordBuf(pc.fieldAddr).data[pc.offset + idx] = WordBuf(pc.haloAddr).data[idx];"));
    }
}
