// crates/vf_gpu/src/capabilities.rs

//! 设备能力描述
//!
//! 描述所选物理设备的类型、限制与特性开关。
//! 六个特性开关与脚本层可查询的能力字符串一一对应。

use ash::vk;

/// 设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// 独立显卡
    DiscreteGpu,
    /// 集成显卡
    IntegratedGpu,
    /// 虚拟 GPU
    VirtualGpu,
    /// CPU 软件实现
    Cpu,
    /// 未知类型
    Other,
}

impl DeviceType {
    /// 从 Vulkan 物理设备类型转换
    pub fn from_vk(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::DiscreteGpu,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::IntegratedGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::VirtualGpu,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Other,
        }
    }

    /// 选择设备时的优先级（越小越优先）
    pub fn selection_rank(self) -> u32 {
        match self {
            Self::DiscreteGpu => 0,
            Self::IntegratedGpu => 1,
            Self::VirtualGpu => 2,
            Self::Cpu => 3,
            Self::Other => 4,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DiscreteGpu => "Discrete GPU",
            Self::IntegratedGpu => "Integrated GPU",
            Self::VirtualGpu => "Virtual GPU",
            Self::Cpu => "CPU",
            Self::Other => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// 引擎依赖的特性开关
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuFeatures {
    /// 缓冲区设备地址（bindless 的前提）
    pub buffer_device_address: bool,
    /// 时间线信号量
    pub timeline_semaphore: bool,
    /// synchronization2 扩展语义
    pub synchronization2: bool,
    /// 描述符索引
    pub descriptor_indexing: bool,
    /// 着色器 64 位整数
    pub shader_int64: bool,
    /// 着色器 64 位浮点
    pub shader_float64: bool,
}

impl GpuFeatures {
    /// 按能力字符串查询
    ///
    /// 识别的名称: `bufferDeviceAddress`、`timelineSemaphore`、
    /// `synchronization2`、`descriptorIndexing`、`shaderInt64`、
    /// `shaderFloat64`。未知名称返回 false。
    pub fn supports(&self, name: &str) -> bool {
        match name {
            "bufferDeviceAddress" => self.buffer_device_address,
            "timelineSemaphore" => self.timeline_semaphore,
            "synchronization2" => self.synchronization2,
            "descriptorIndexing" => self.descriptor_indexing,
            "shaderInt64" => self.shader_int64,
            "shaderFloat64" => self.shader_float64,
            _ => false,
        }
    }
}

/// 设备能力
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// 设备名称
    pub name: String,
    /// 厂商 ID
    pub vendor_id: u32,
    /// 设备类型
    pub device_type: DeviceType,
    /// Vulkan API 版本
    pub api_version: u32,
    /// 推送常量上限（字节）
    pub max_push_constants_size: u32,
    /// 单工作组最大调用数
    pub max_workgroup_invocations: u32,
    /// 特性开关
    pub features: GpuFeatures,
}

impl DeviceCapabilities {
    /// 从物理设备属性与特性查询结果构造
    pub fn from_vk(props: &vk::PhysicalDeviceProperties, features: GpuFeatures) -> Self {
        // device_name 是以 NUL 结尾的定长 c_char 数组
        let name = unsafe { std::ffi::CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Self {
            name,
            vendor_id: props.vendor_id,
            device_type: DeviceType::from_vk(props.device_type),
            api_version: props.api_version,
            max_push_constants_size: props.limits.max_push_constants_size,
            max_workgroup_invocations: props.limits.max_compute_work_group_invocations,
            features,
        }
    }
}
