// crates/vf_engine/src/engine.rs

//! 引擎编排器
//!
//! 串联全部子系统并推进时间步。脚本面向的五个操作
//! （add_field / add_stencil / build_graph / get_schedule / step）
//! 都落在本类型上。
//!
//! 首次 `step` 触发惰性初始化：网格上传、域分解、光环分配与
//! 信号量创建。此后每帧：
//!
//! 1. 取调度（自动拓扑序或调用方覆盖的顺序）
//! 2. 若有模板需要光环且子域多于一个，先提交各子域的
//!    打包 + 传输批（对每个邻居在出站时间线信号量上签名）
//! 3. 逐子域提交解包 + 模板调度批（等待入站时间线信号量），
//!    连续模板间插入计算屏障，fence 同步等待
//! 4. 到期则运行细化；拓扑变化后重新分解域并重建光环
//!
//! fence 等待超时视为设备丢失：引擎进入中毒状态，此后一切
//! 调用被拒绝。

use crate::cache::PipelineCache;
use crate::compiler::{default_compiler, KernelCompiler};
use crate::error::{EngineError, EngineResult};
use crate::fields::FieldRegistry;
use crate::graph::DependencyGraph;
use crate::halo::HaloManager;
use crate::halo_sync::{HaloPush, HaloSync};
use crate::refine::{RefinementController, RefinementCriteria, RefinementStats};
use crate::shadergen::WORKGROUP_SIZE;
use crate::stencil::{StencilDefinition, StencilRegistry};
use bytemuck::{Pod, Zeroable};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use vf_foundation::{Face, FieldFormat, VoxelCoord};
use vf_gpu::{vk, DeviceAllocator, GpuContext, GpuError};
use vf_grid::{
    DomainSplitter, GridBuilder, GridResources, GridUploader, HostGrid, SplitConfig, SubDomain,
};

/// fence 等待上限（纳秒）
const FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// 网格来源
#[derive(Debug, Clone)]
pub enum GridSource {
    /// 已就绪的宿主网格
    Host(HostGrid),
    /// 序列化网格文件
    File(PathBuf),
    /// 合成实心盒
    DenseBox {
        /// 最小角
        min: VoxelCoord,
        /// 最大角
        max: VoxelCoord,
        /// 统一体素值
        value: f32,
    },
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 目标 GPU（子域）数
    pub gpu_count: u32,
    /// 光环厚度
    pub halo_thickness: u32,
    /// 活跃体素数上界（字段缓冲按此预分配）
    pub estimated_voxels: u32,
    /// 网格来源
    pub grid: GridSource,
    /// 管线缓存目录（缺省取用户缓存目录）
    pub cache_dir: Option<PathBuf>,
    /// 负载不均衡告警容差
    pub load_tolerance: f64,
    /// 细化配置（可选）
    pub refinement: Option<RefinementCriteria>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            halo_thickness: 2,
            estimated_voxels: 1 << 20,
            grid: GridSource::DenseBox {
                min: VoxelCoord::ZERO,
                max: VoxelCoord::splat(15),
                value: 0.0,
            },
            cache_dir: None,
            load_tolerance: 0.1,
            refinement: None,
        }
    }
}

/// 模板调度推送常量（GLSL 侧 PC 块的宿主镜像）
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct StencilPush {
    grid_addr: u64,
    table_addr: u64,
    active_voxel_count: u32,
    voxel_base: u32,
    neighbour_radius: u32,
    dt: f32,
}

/// 仿真引擎
pub struct Engine {
    config: EngineConfig,
    alloc: DeviceAllocator,
    ctx: Arc<GpuContext>,
    fields: FieldRegistry,
    stencils: StencilRegistry,
    graph: DependencyGraph,
    compiler: Option<Box<dyn KernelCompiler>>,
    grid: Option<GridResources>,
    domains: Vec<SubDomain>,
    halos: Option<HaloManager>,
    halo_sync: Option<HaloSync>,
    refine: Option<RefinementController>,
    custom_order: Option<Vec<String>>,
    cmd_pool: vk::CommandPool,
    frame: u64,
    poisoned: bool,
    prepared: bool,
}

impl Engine {
    /// 以默认编译器后端构造
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let compiler = match default_compiler() {
            Ok(c) => Some(c),
            Err(e) => {
                log::debug!("默认编译器不可用: {}", e);
                None
            }
        };
        Self::build(config, compiler)
    }

    /// 以注入的编译器后端构造
    pub fn with_compiler(
        config: EngineConfig,
        compiler: Box<dyn KernelCompiler>,
    ) -> EngineResult<Self> {
        Self::build(config, Some(compiler))
    }

    fn build(
        config: EngineConfig,
        compiler: Option<Box<dyn KernelCompiler>>,
    ) -> EngineResult<Self> {
        log::info!(
            "初始化引擎 (GPU 数 {}, 光环厚度 {})",
            config.gpu_count,
            config.halo_thickness
        );

        let ctx = Arc::new(
            GpuContext::new().map_err(|e| EngineError::DeviceInit(e.to_string()))?,
        );
        let mut alloc = DeviceAllocator::new(ctx.clone())?;
        let fields = FieldRegistry::new(ctx.clone(), &mut alloc, config.estimated_voxels)?;

        let cache_dir = config
            .cache_dir
            .clone()
            .unwrap_or_else(PipelineCache::default_dir);
        let stencils = StencilRegistry::new(
            ctx.clone(),
            PipelineCache::new(cache_dir),
            config.halo_thickness,
        )?;

        let cmd_pool = ctx.create_command_pool(
            ctx.compute_family(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        Ok(Self {
            config,
            alloc,
            ctx,
            fields,
            stencils,
            graph: DependencyGraph::new(),
            compiler,
            grid: None,
            domains: Vec::new(),
            halos: None,
            halo_sync: None,
            refine: None,
            custom_order: None,
            cmd_pool,
            frame: 0,
            poisoned: false,
            prepared: false,
        })
    }

    fn check_poisoned(&self) -> EngineResult<()> {
        if self.poisoned {
            Err(EngineError::PoisonedEngine)
        } else {
            Ok(())
        }
    }

    /// GPU 上下文
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// 字段注册表（只读）
    pub fn field_registry(&self) -> &FieldRegistry {
        &self.fields
    }

    /// 模板注册表（只读）
    pub fn stencil_registry(&self) -> &StencilRegistry {
        &self.stencils
    }

    /// 当前子域（首次 step 之后非空）
    pub fn domains(&self) -> &[SubDomain] {
        &self.domains
    }

    /// 已推进的帧数
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// 注册字段
    ///
    /// 首次 step 之后注册的字段会立即补齐各子域的光环缓冲。
    pub fn add_field(
        &mut self,
        name: &str,
        format: FieldFormat,
        initial: Option<[f32; 4]>,
    ) -> EngineResult<()> {
        self.check_poisoned()?;
        self.fields
            .register_field(&mut self.alloc, name, format, initial)?;
        if let Some(halos) = self.halos.as_mut() {
            let element_size = format.element_size();
            for gpu in 0..self.domains.len() as u32 {
                halos.allocate_field_halos(&mut self.alloc, name, element_size, gpu)?;
            }
        }
        Ok(())
    }

    /// 注册字段（脚本层的格式字符串形式）
    pub fn add_field_by_name(
        &mut self,
        name: &str,
        format: &str,
        initial: Option<[f32; 4]>,
    ) -> EngineResult<()> {
        let format = FieldFormat::from_str(format)
            .map_err(|_| EngineError::UnsupportedFormat(format.to_string()))?;
        self.add_field(name, format, initial)
    }

    /// 注册模板并在依赖图中建节点
    pub fn add_stencil(&mut self, def: StencilDefinition) -> EngineResult<()> {
        self.check_poisoned()?;
        let reads = def.inputs.clone();
        let writes = def.outputs.clone();
        let name = def.name.clone();
        self.stencils
            .register(def, &self.fields, self.compiler.as_deref())?;
        self.graph.add_node(&name, reads, writes)?;
        Ok(())
    }

    /// 从模板注册表重建依赖图
    pub fn build_graph(&mut self) -> EngineResult<()> {
        self.check_poisoned()?;
        self.graph.clear();
        for stencil in self.stencils.stencils() {
            self.graph.add_node(
                &stencil.definition.name,
                stencil.definition.inputs.clone(),
                stencil.definition.outputs.clone(),
            )?;
        }
        log::info!("依赖图重建: {} 个节点", self.graph.node_count());
        Ok(())
    }

    /// 当前执行调度
    pub fn schedule(&self) -> EngineResult<Vec<String>> {
        if let Some(order) = &self.custom_order {
            return Ok(order.clone());
        }
        self.graph.schedule()
    }

    /// 导出依赖图 DOT 文本
    pub fn export_graph_dot(&self) -> String {
        self.graph.to_dot()
    }

    /// 覆盖执行顺序（高级用法）
    ///
    /// 执行器仍会在读写集相交的相邻模板间插入全量计算屏障。
    pub fn set_execution_order(&mut self, order: Vec<String>) -> EngineResult<()> {
        self.check_poisoned()?;
        for name in &order {
            if !self.stencils.has(name) {
                return Err(EngineError::UnknownStencil(name.clone()));
            }
        }
        log::info!("采用调用方指定的执行顺序 ({} 个模板)", order.len());
        self.custom_order = Some(order);
        Ok(())
    }

    /// 解析网格来源为宿主网格
    fn resolve_grid(&self) -> EngineResult<HostGrid> {
        match &self.config.grid {
            GridSource::Host(grid) => Ok(grid.clone()),
            GridSource::File(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    EngineError::Grid(vf_grid::GridError::MalformedBytes(format!(
                        "{}: {}",
                        path.display(),
                        e
                    )))
                })?;
                Ok(HostGrid::from_bytes(&bytes)?)
            }
            GridSource::DenseBox { min, max, value } => {
                Ok(HostGrid::dense_box(*min, *max, *value)?)
            }
        }
    }

    /// 惰性初始化：上传网格、域分解、光环分配
    fn prepare(&mut self) -> EngineResult<()> {
        if self.prepared {
            return Ok(());
        }
        let host = self.resolve_grid()?;
        if host.active_voxel_count() > self.config.estimated_voxels {
            return Err(EngineError::CapacityExceeded(format!(
                "活跃体素数 {} 超出预估上界 {}",
                host.active_voxel_count(),
                self.config.estimated_voxels
            )));
        }

        let grid = GridUploader::upload(&mut self.alloc, &host).map_err(|e| {
            EngineError::from(e).normalize()
        })?;
        log::info!("网格就绪: {} 活跃体素", grid.active_count);
        self.grid = Some(grid);

        self.split_and_allocate_halos(&host)?;

        if let Some(criteria) = self.config.refinement.clone() {
            let compiler = self.compiler.as_deref().ok_or_else(|| {
                EngineError::CompilerError("细化内核需要编译器后端".into())
            })?;
            let controller = RefinementController::new(
                self.ctx.clone(),
                self.stencils.cache(),
                compiler,
                criteria,
            )?;
            self.refine = Some(controller);
        }

        self.prepared = true;
        Ok(())
    }

    /// 域分解并（重）建光环管理器
    fn split_and_allocate_halos(&mut self, host: &HostGrid) -> EngineResult<()> {
        let splitter = DomainSplitter::new(SplitConfig {
            gpu_count: self.config.gpu_count,
            halo_thickness: self.config.halo_thickness,
            prefer_spatial_locality: true,
            load_tolerance: self.config.load_tolerance,
        });
        self.domains = splitter.split(host)?;
        log::info!("域分解: {} 个子域", self.domains.len());

        if let Some(mut old) = self.halos.take() {
            old.destroy(&mut self.alloc);
        }
        let mut halos = HaloManager::new(
            self.ctx.clone(),
            &self.domains,
            self.config.halo_thickness,
        );

        let field_sizes: Vec<(String, u32)> = self
            .fields
            .fields()
            .iter()
            .map(|f| (f.name.clone(), f.element_size))
            .collect();
        for (name, element_size) in &field_sizes {
            for gpu in 0..self.domains.len() as u32 {
                halos.allocate_field_halos(&mut self.alloc, name, *element_size, gpu)?;
            }
        }
        halos.create_semaphores()?;
        self.halos = Some(halos);
        Ok(())
    }

    /// 确保光环打包/解包管线就绪
    fn ensure_halo_sync(&mut self) -> EngineResult<()> {
        if self.halo_sync.is_some() {
            return Ok(());
        }
        let compiler = self.compiler.as_deref().ok_or_else(|| {
            EngineError::CompilerError("光环内核需要编译器后端".into())
        })?;
        self.halo_sync = Some(HaloSync::new(
            self.ctx.clone(),
            self.stencils.cache(),
            compiler,
        )?);
        Ok(())
    }

    /// 推进一个时间步
    pub fn step(&mut self, dt: f32) -> EngineResult<()> {
        self.check_poisoned()?;
        let result = self.step_inner(dt);
        if let Err(ref e) = result {
            if matches!(e, EngineError::DeviceLost) {
                log::error!("设备丢失，引擎进入中毒状态");
                self.poisoned = true;
            }
        }
        result
    }

    fn step_inner(&mut self, dt: f32) -> EngineResult<()> {
        self.prepare()?;
        let schedule = self.schedule()?;
        if schedule.is_empty() {
            log::warn!("调度为空，跳过时间步");
            return Ok(());
        }

        let exchange = self.stencils.any_requires_halos(&schedule) && self.domains.len() > 1;
        if exchange {
            self.ensure_halo_sync()?;
        }

        self.frame += 1;
        log::debug!(
            "推进时间步 {} (dt={}, {} 模板, {} 子域, 光环交换 {})",
            self.frame,
            dt,
            schedule.len(),
            self.domains.len(),
            exchange
        );

        if exchange {
            let domains = self.domains.clone();
            for domain in &domains {
                self.submit_pack_phase(domain)?;
            }
        }

        let domains = self.domains.clone();
        for domain in &domains {
            self.submit_compute_phase(domain, &schedule, dt, exchange)?;
        }

        // 到期运行细化；拓扑变化后域分解与光环需要重建
        if let Some(due) = self.refine.as_ref().map(|r| r.due(self.frame)) {
            if due {
                if let Some(stats) = self.run_refinement()? {
                    log::info!(
                        "第 {} 步细化: +{} 体素 / -{} 组",
                        self.frame,
                        stats.refined,
                        stats.coarsened
                    );
                }
            }
        }
        Ok(())
    }

    /// 提交打包 + 传输批（对每个邻居签名出站时间线）
    fn submit_pack_phase(&mut self, domain: &SubDomain) -> EngineResult<()> {
        let halos = self
            .halos
            .as_ref()
            .ok_or_else(|| EngineError::HaloAllocationFailure("光环未初始化".into()))?;
        let halo_sync = self
            .halo_sync
            .as_ref()
            .ok_or_else(|| EngineError::HaloAllocationFailure("光环内核未初始化".into()))?;
        let background = self.grid.as_ref().map(|g| g.background).unwrap_or(0.0);

        let cmd = self.allocate_cmd()?;
        let device = self.ctx.device();

        let record = (|| -> EngineResult<()> {
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin) }.map_err(GpuError::from_vk)?;

            // 打包闸门：等待上一帧的模板写完成
            halo_sync.cmd_pack_gate(cmd);

            // 字段按注册顺序交换，保证可复现
            for field in self.fields.fields() {
                let set = halos.set(&field.name, domain.gpu_index)?;
                let wpe = field.element_size / 4;

                for link in &domain.neighbors {
                    let face = link.face.index() as usize;
                    let voxels = set.counts[face].min(domain.active_voxel_count);
                    let offset = halos.pack_offset(domain, link.face, voxels);
                    let push = HaloPush {
                        field_addr: field.device_address,
                        halo_addr: set.remote[face].device_address,
                        offset: offset * wpe,
                        count: voxels * wpe,
                    };
                    halo_sync.record_pack(cmd, &push);
                }

                // 无邻居的面以背景值填充入站暂存
                let pattern = if field.format.is_float() {
                    background.to_bits()
                } else {
                    0
                };
                for face in Face::ALL {
                    let has_neighbor =
                        domain.neighbors.iter().any(|l| l.face == face);
                    if !has_neighbor {
                        unsafe {
                            device.cmd_fill_buffer(
                                cmd,
                                set.local[face.index() as usize].handle,
                                0,
                                vk::WHOLE_SIZE,
                                pattern,
                            );
                        }
                    }
                }
            }

            // 打包写对传输可见
            halo_sync.cmd_pack_to_transfer(cmd);

            // 出站 remote -> 对侧 local
            for field in self.fields.fields() {
                let set = halos.set(&field.name, domain.gpu_index)?;
                for link in &domain.neighbors {
                    let face = link.face.index() as usize;
                    let peer = halos.set(&field.name, link.gpu_index)?;
                    let dst_face = link.face.opposite().index() as usize;
                    let src = &set.remote[face];
                    let dst = &peer.local[dst_face];
                    let region = vk::BufferCopy::default().size(src.size.min(dst.size));
                    unsafe {
                        device.cmd_copy_buffer(cmd, src.handle, dst.handle, &[region]);
                    }
                }
            }

            unsafe { device.end_command_buffer(cmd) }.map_err(GpuError::from_vk)?;
            Ok(())
        })();
        if let Err(e) = record {
            self.free_cmd(cmd);
            return Err(e);
        }

        // 对每个邻居在 (self -> neighbor) 时间线上签名本帧序号
        let mut signal_sems = Vec::new();
        for link in &domain.neighbors {
            signal_sems.push(halos.semaphore(domain.gpu_index, link.gpu_index)?);
        }
        let signal_values = vec![self.frame; signal_sems.len()];

        let result = self.submit_and_wait(cmd, &[], &[], &signal_sems, &signal_values);
        self.free_cmd(cmd);
        result?;

        // 推进生产序号
        if let Some(halos) = self.halos.as_mut() {
            let names: Vec<String> = self.fields.field_names();
            for name in names {
                if let Ok(set) = halos.set_mut(&name, domain.gpu_index) {
                    for link in &domain.neighbors {
                        set.produced[link.face.index() as usize] = self.frame;
                    }
                }
            }
        }
        Ok(())
    }

    /// 提交解包 + 模板调度批
    fn submit_compute_phase(
        &mut self,
        domain: &SubDomain,
        schedule: &[String],
        dt: f32,
        exchange: bool,
    ) -> EngineResult<()> {
        let grid = self
            .grid
            .as_ref()
            .ok_or(EngineError::EmptyGrid)?;
        let grid_addr = grid.header_addr();
        let table_addr = self.fields.table_addr();

        let cmd = self.allocate_cmd()?;
        let device = self.ctx.device();

        let record = (|| -> EngineResult<()> {
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin) }.map_err(GpuError::from_vk)?;

            if exchange {
                let halos = self.halos.as_ref().ok_or_else(|| {
                    EngineError::HaloAllocationFailure("光环未初始化".into())
                })?;
                let halo_sync = self.halo_sync.as_ref().ok_or_else(|| {
                    EngineError::HaloAllocationFailure("光环内核未初始化".into())
                })?;

                // 传输写对计算可见后再解包
                halo_sync.cmd_transfer_to_compute(cmd);

                for field in self.fields.fields() {
                    let set = halos.set(&field.name, domain.gpu_index)?;
                    let wpe = field.element_size / 4;
                    for link in &domain.neighbors {
                        let face = link.face.index() as usize;
                        let Some(peer) = self
                            .domains
                            .iter()
                            .find(|d| d.gpu_index == link.gpu_index)
                        else {
                            continue;
                        };
                        // 数据来自邻居 face^1 侧的边界层，写回同一区间
                        let peer_set = halos.set(&field.name, link.gpu_index)?;
                        let peer_face = link.face.opposite();
                        let voxels = peer_set.counts[peer_face.index() as usize]
                            .min(peer.active_voxel_count)
                            .min(set.counts[face]);
                        let offset = halos.pack_offset(peer, peer_face, voxels);
                        let push = HaloPush {
                            field_addr: field.device_address,
                            halo_addr: set.local[face].device_address,
                            offset: offset * wpe,
                            count: voxels * wpe,
                        };
                        halo_sync.record_unpack(cmd, &push);
                    }
                }

                // 解包写对后续模板可见
                halo_sync.cmd_compute_barrier(cmd);
            }

            // 模板按调度序执行，间隔全量计算屏障
            for (i, name) in schedule.iter().enumerate() {
                let stencil = self.stencils.get(name)?;
                let push = StencilPush {
                    grid_addr,
                    table_addr,
                    active_voxel_count: domain.active_voxel_count,
                    voxel_base: domain.voxel_base,
                    neighbour_radius: stencil.definition.neighbour_radius,
                    dt,
                };
                let groups = domain
                    .active_voxel_count
                    .div_ceil(WORKGROUP_SIZE)
                    .max(1);
                unsafe {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        stencil.pipeline,
                    );
                    device.cmd_push_constants(
                        cmd,
                        stencil.layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::bytes_of(&push),
                    );
                    device.cmd_dispatch(cmd, groups, 1, 1);
                }

                if i + 1 < schedule.len() {
                    self.record_inter_stencil_barrier(cmd);
                }
            }

            unsafe { device.end_command_buffer(cmd) }.map_err(GpuError::from_vk)?;
            Ok(())
        })();
        if let Err(e) = record {
            self.free_cmd(cmd);
            return Err(e);
        }

        // 等待每个邻居本帧的入站时间线
        let mut wait_sems = Vec::new();
        let mut wait_values = Vec::new();
        if exchange {
            let halos = self
                .halos
                .as_ref()
                .ok_or_else(|| EngineError::HaloAllocationFailure("光环未初始化".into()))?;
            for link in &domain.neighbors {
                wait_sems.push(halos.semaphore(link.gpu_index, domain.gpu_index)?);
                wait_values.push(self.frame);
            }
        }

        let result = self.submit_and_wait(cmd, &wait_sems, &wait_values, &[], &[]);
        self.free_cmd(cmd);
        result?;

        // 推进消费序号
        if exchange {
            if let Some(halos) = self.halos.as_mut() {
                let names: Vec<String> = self.fields.field_names();
                for name in names {
                    if let Ok(set) = halos.set_mut(&name, domain.gpu_index) {
                        for link in &domain.neighbors {
                            set.consumed[link.face.index() as usize] = self.frame;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 连续模板间的全量内存屏障
    fn record_inter_stencil_barrier(&self, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
        unsafe {
            self.ctx.device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn allocate_cmd(&self) -> EngineResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmds = unsafe { self.ctx.device().allocate_command_buffers(&info) }
            .map_err(GpuError::from_vk)?;
        Ok(cmds[0])
    }

    fn free_cmd(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.ctx
                .device()
                .free_command_buffers(self.cmd_pool, &[cmd]);
        }
    }

    /// 提交并以 fence 同步等待；超时视为设备丢失
    fn submit_and_wait(
        &self,
        cmd: vk::CommandBuffer,
        wait_sems: &[vk::Semaphore],
        wait_values: &[u64],
        signal_sems: &[vk::Semaphore],
        signal_values: &[u64],
    ) -> EngineResult<()> {
        let device = self.ctx.device();
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(GpuError::from_vk)?;

        let result = (|| -> EngineResult<()> {
            let cmds = [cmd];
            let wait_stages =
                vec![vk::PipelineStageFlags::COMPUTE_SHADER; wait_sems.len()];
            let mut timeline = vk::TimelineSemaphoreSubmitInfo::default()
                .wait_semaphore_values(wait_values)
                .signal_semaphore_values(signal_values);
            let mut submit = vk::SubmitInfo::default()
                .command_buffers(&cmds)
                .wait_semaphores(wait_sems)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(signal_sems);
            if !wait_sems.is_empty() || !signal_sems.is_empty() {
                submit = submit.push_next(&mut timeline);
            }

            unsafe { device.queue_submit(self.ctx.compute_queue(), &[submit], fence) }
                .map_err(GpuError::from_vk)?;

            match unsafe { device.wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS) } {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => Err(EngineError::DeviceLost),
                Err(e) => Err(EngineError::from(GpuError::from_vk(e)).normalize()),
            }
        })();

        unsafe { device.destroy_fence(fence, None) };
        result
    }

    /// 运行细化并在拓扑变化后重建域分解与光环
    fn run_refinement(&mut self) -> EngineResult<Option<RefinementStats>> {
        let Some(mut controller) = self.refine.take() else {
            return Ok(None);
        };
        let Some(mut grid) = self.grid.take() else {
            self.refine = Some(controller);
            return Ok(None);
        };

        let outcome = controller.run(&mut self.alloc, &mut grid, &mut self.fields);

        let changed = matches!(outcome, Ok(Some(_)));
        let rebuild_result = if changed {
            // 由新 LUT 还原宿主网格，重新分解域并重建光环
            let mut builder = GridBuilder::new(grid.background);
            for (i, &coord) in grid.host_lut.iter().enumerate() {
                builder.set(coord, grid.host_values[i]);
            }
            builder
                .build()
                .map_err(EngineError::from)
                .and_then(|host| self.split_and_allocate_halos(&host))
        } else {
            Ok(())
        };

        self.grid = Some(grid);
        self.refine = Some(controller);
        rebuild_result?;
        outcome
    }

    /// 连续推进多帧
    pub fn run_frames(&mut self, count: u32, dt: f32) -> EngineResult<()> {
        log::info!("连续推进 {} 帧 (dt={})", count, dt);
        for i in 0..count {
            log::debug!("帧 {}/{}", i + 1, count);
            self.step(dt)?;
        }
        log::info!("推进完成");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.device().device_wait_idle();
        }
        if let Some(mut controller) = self.refine.take() {
            controller.destroy(&mut self.alloc);
        }
        if let Some(mut halo_sync) = self.halo_sync.take() {
            halo_sync.destroy();
        }
        if let Some(mut halos) = self.halos.take() {
            halos.destroy(&mut self.alloc);
        }
        self.stencils.destroy();
        self.fields.destroy(&mut self.alloc);
        if let Some(mut grid) = self.grid.take() {
            grid.destroy(&mut self.alloc);
        }
        unsafe {
            self.ctx.device().destroy_command_pool(self.cmd_pool, None);
        }
        log::debug!("引擎已销毁");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.gpu_count, 1);
        assert_eq!(config.halo_thickness, 2);
        assert_eq!(config.estimated_voxels, 1 << 20);
        assert!(config.refinement.is_none());
    }

    #[test]
    fn test_stencil_push_is_32_bytes() {
        assert_eq!(std::mem::size_of::<StencilPush>(), 32);
    }
}
