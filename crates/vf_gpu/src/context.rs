// crates/vf_gpu/src/context.rs

//! Vulkan 上下文
//!
//! 持有实例、物理设备、逻辑设备与计算/传输队列，提供命令池
//! 创建与一次性命令提交辅助。初始化失败（驱动缺失、必需特性
//! 不可用）是致命错误。
//!
//! 宿主侧不创建任何后台线程；所有等待点都是显式的
//! （fence 等待、时间线信号量等待、queue_wait_idle）。

use crate::capabilities::{DeviceCapabilities, DeviceType, GpuFeatures};
use crate::error::{GpuError, GpuResult};
use ash::vk;
use std::ffi::CString;

/// 必需的 Vulkan API 版本
const REQUIRED_API_VERSION: u32 = vk::API_VERSION_1_3;

/// Vulkan 上下文
pub struct GpuContext {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    compute_queue: vk::Queue,
    compute_family: u32,
    transfer_queue: vk::Queue,
    transfer_family: u32,
    capabilities: DeviceCapabilities,
}

impl GpuContext {
    /// 初始化 Vulkan 1.3 上下文
    ///
    /// 选择评分最高的物理设备（优先独立显卡），启用引擎必需的
    /// 特性：bufferDeviceAddress、timelineSemaphore、
    /// synchronization2、descriptorIndexing、shaderInt64。
    /// shaderFloat64 在设备支持时一并启用。
    pub fn new() -> GpuResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::DeviceInit(format!("Vulkan 驱动加载失败: {}", e)))?;

        let app_name = CString::new("voxflow").map_err(|e| GpuError::DeviceInit(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 3, 0))
            .engine_name(&app_name)
            .api_version(REQUIRED_API_VERSION);

        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| GpuError::DeviceInit(format!("实例创建失败: {}", e)))?;

        let result = Self::init_device(entry, instance);
        if let Err(ref e) = result {
            log::error!("GPU 上下文初始化失败: {}", e);
        }
        result
    }

    fn init_device(entry: ash::Entry, instance: ash::Instance) -> GpuResult<Self> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| GpuError::DeviceInit(format!("物理设备枚举失败: {}", e)))?;
        if physical_devices.is_empty() {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::DeviceInit("没有可用的 Vulkan 物理设备".into()));
        }

        // 按设备类型评分选择
        let mut best: Option<(vk::PhysicalDevice, vk::PhysicalDeviceProperties, u32)> = None;
        for pdev in physical_devices {
            let props = unsafe { instance.get_physical_device_properties(pdev) };
            if props.api_version < REQUIRED_API_VERSION {
                continue;
            }
            let Some(compute_family) = Self::find_queue_family(
                &instance,
                pdev,
                vk::QueueFlags::COMPUTE,
                vk::QueueFlags::empty(),
            ) else {
                continue;
            };
            let rank = DeviceType::from_vk(props.device_type).selection_rank();
            match best {
                Some((_, ref best_props, _))
                    if DeviceType::from_vk(best_props.device_type).selection_rank() <= rank => {}
                _ => best = Some((pdev, props, compute_family)),
            }
        }

        let Some((physical_device, props, compute_family)) = best else {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::DeviceInit(
                "没有支持 Vulkan 1.3 计算队列的设备".into(),
            ));
        };

        // 查询特性支持
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut feats2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vk12)
            .push_next(&mut vk13);
        unsafe { instance.get_physical_device_features2(physical_device, &mut feats2) };
        let base_features = feats2.features;

        let features = GpuFeatures {
            buffer_device_address: vk12.buffer_device_address == vk::TRUE,
            timeline_semaphore: vk12.timeline_semaphore == vk::TRUE,
            synchronization2: vk13.synchronization2 == vk::TRUE,
            descriptor_indexing: vk12.descriptor_indexing == vk::TRUE,
            shader_int64: base_features.shader_int64 == vk::TRUE,
            shader_float64: base_features.shader_float64 == vk::TRUE,
        };

        let missing = Self::check_required(&features);
        if let Some(name) = missing {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::MissingFeature(name));
        }

        // 传输队列族：优先独立传输族，缺省退回计算族
        let transfer_family = Self::find_queue_family(
            &instance,
            physical_device,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS,
        )
        .unwrap_or(compute_family);

        // 启用特性并创建逻辑设备
        let priorities = [1.0f32];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_family)
            .queue_priorities(&priorities)];
        if transfer_family != compute_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(transfer_family)
                    .queue_priorities(&priorities),
            );
        }

        let enabled_base = vk::PhysicalDeviceFeatures::default()
            .shader_int64(true)
            .shader_float64(features.shader_float64);
        let mut enabled_vk12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true);
        let mut enabled_vk13 =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_features(&enabled_base)
            .push_next(&mut enabled_vk12)
            .push_next(&mut enabled_vk13);

        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(d) => d,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(GpuError::DeviceInit(format!("逻辑设备创建失败: {}", e)));
            }
        };

        let compute_queue = unsafe { device.get_device_queue(compute_family, 0) };
        let transfer_queue = unsafe { device.get_device_queue(transfer_family, 0) };

        let capabilities = DeviceCapabilities::from_vk(&props, features);
        log::info!(
            "GPU 上下文就绪: {} ({}), 计算队列族 {}, 传输队列族 {}",
            capabilities.name,
            capabilities.device_type,
            compute_family,
            transfer_family
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            compute_queue,
            compute_family,
            transfer_queue,
            transfer_family,
            capabilities,
        })
    }

    /// 检查必需特性，返回第一个缺失项
    fn check_required(features: &GpuFeatures) -> Option<&'static str> {
        if !features.buffer_device_address {
            return Some("bufferDeviceAddress");
        }
        if !features.timeline_semaphore {
            return Some("timelineSemaphore");
        }
        if !features.synchronization2 {
            return Some("synchronization2");
        }
        if !features.descriptor_indexing {
            return Some("descriptorIndexing");
        }
        if !features.shader_int64 {
            return Some("shaderInt64");
        }
        None
    }

    /// 查找满足 `required` 且不含 `excluded` 的队列族
    fn find_queue_family(
        instance: &ash::Instance,
        pdev: vk::PhysicalDevice,
        required: vk::QueueFlags,
        excluded: vk::QueueFlags,
    ) -> Option<u32> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(pdev) };
        families.iter().enumerate().find_map(|(i, f)| {
            let flags = f.queue_flags;
            if flags.contains(required) && !flags.intersects(excluded) {
                Some(i as u32)
            } else {
                None
            }
        })
    }

    /// 逻辑设备
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Vulkan 实例
    #[inline]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// 物理设备
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// 计算队列
    #[inline]
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// 计算队列族索引
    #[inline]
    pub fn compute_family(&self) -> u32 {
        self.compute_family
    }

    /// 传输队列（无独立传输族时与计算队列相同）
    #[inline]
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// 传输队列族索引
    #[inline]
    pub fn transfer_family(&self) -> u32 {
        self.transfer_family
    }

    /// 设备能力
    #[inline]
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// 按能力字符串查询特性支持
    pub fn supports(&self, feature: &str) -> bool {
        self.capabilities.features.supports(feature)
    }

    /// 创建命令池
    pub fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> GpuResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        unsafe { self.device.create_command_pool(&info, None) }.map_err(GpuError::from_vk)
    }

    /// 开始录制一次性命令缓冲
    pub fn begin_oneshot(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(GpuError::from_vk)?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { self.device.free_command_buffers(pool, &[cmd]) };
            return Err(GpuError::from_vk(e));
        }
        Ok(cmd)
    }

    /// 结束、提交并等待一次性命令缓冲
    ///
    /// 不论提交是否成功，命令缓冲都会被释放。
    pub fn end_oneshot(
        &self,
        cmd: vk::CommandBuffer,
        pool: vk::CommandPool,
        queue: vk::Queue,
    ) -> GpuResult<()> {
        let result = (|| {
            unsafe { self.device.end_command_buffer(cmd) }.map_err(GpuError::from_vk)?;
            let cmds = [cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            unsafe { self.device.queue_submit(queue, &[submit], vk::Fence::null()) }
                .map_err(GpuError::from_vk)?;
            unsafe { self.device.queue_wait_idle(queue) }.map_err(GpuError::from_vk)
        })();
        unsafe { self.device.free_command_buffers(pool, &[cmd]) };
        result
    }

    /// 创建初值为 0 的时间线信号量
    pub fn create_timeline_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        unsafe { self.device.create_semaphore(&info, None) }.map_err(GpuError::from_vk)
    }

    /// 宿主侧等待时间线信号量达到指定值
    pub fn wait_timeline(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> GpuResult<()> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) }.map_err(GpuError::from_vk)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        log::debug!("GPU 上下文已销毁");
    }
}
