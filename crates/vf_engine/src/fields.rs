// crates/vf_engine/src/fields.rs

//! 字段注册表
//!
//! 变宽 SoA：每个字段是一块独立的原始 GPU 缓冲，长度恰为
//! `活跃体素数 x 元素大小`。注册表维护一张 256 槽位的地址表
//! （每槽一个 64 位设备地址，按描述符下标索引），表本身常驻
//! GPU 并持久映射，生成的内核经表取字段指针。
//!
//! 注册表只增不减；字段与注册表同生命周期。描述符下标按注册
//! 顺序分配且不复用。细化换网格时经
//! [`FieldRegistry::begin_reallocation`] /
//! [`FieldRegistry::commit_reallocation`] 原子切换底层缓冲。

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Arc;
use vf_foundation::FieldFormat;
use vf_gpu::{vk, BufferResidency, DeviceAllocator, GpuBuffer, GpuContext};

/// 注册表容量上限
pub const MAX_FIELDS: usize = 256;

/// 字段布局槽位（无 GPU 资源的快照）
#[derive(Debug, Clone)]
pub struct FieldSlot {
    /// 字段名
    pub name: String,
    /// 元素格式
    pub format: FieldFormat,
    /// 描述符下标
    pub index: u32,
}

/// 字段布局快照
///
/// 着色器生成只依赖名字、格式与描述符下标，不需要 GPU 资源，
/// 用本类型与注册表解耦。
#[derive(Debug, Clone, Default)]
pub struct FieldLayout {
    slots: Vec<FieldSlot>,
}

impl FieldLayout {
    /// 空布局
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加槽位，返回描述符下标
    pub fn push(&mut self, name: &str, format: FieldFormat) -> u32 {
        let index = self.slots.len() as u32;
        self.slots.push(FieldSlot {
            name: name.to_string(),
            format,
            index,
        });
        index
    }

    /// 按名查槽位
    pub fn get(&self, name: &str) -> Option<&FieldSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// 全部槽位（注册顺序）
    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    /// 槽位数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 生成着色器前导
    ///
    /// 对每个字段发出带类型的 buffer_reference 声明与
    /// `READ_<name>` / `WRITE_<name>` 访问宏；宏经地址表按
    /// 描述符下标取字段指针，下标内联为常量。
    pub fn generate_prelude(&self) -> String {
        let mut out = String::new();

        out.push_str("// --- Field Buffer References ---\n");
        for slot in &self.slots {
            out.push_str(&format!(
                "layout(buffer_reference, scalar) buffer {}_Buffer {{ {} data[]; }};\n",
                slot.name,
                slot.format.glsl_type()
            ));
        }
        out.push_str(
            "layout(buffer_reference, scalar) buffer FieldAddressTable { uint64_t slots[]; };\n",
        );

        out.push_str("\n// --- Field Accessor Macros ---\n");
        for slot in &self.slots {
            out.push_str(&format!("#define FIELD_SLOT_{} {}\n", slot.name, slot.index));
            out.push_str(&format!(
                "#define READ_{n}(i) ({n}_Buffer(FieldAddressTable(pc.tableAddr).slots[{idx}]).data[i])\n",
                n = slot.name,
                idx = slot.index
            ));
            out.push_str(&format!(
                "#define WRITE_{n}(i, v) ({n}_Buffer(FieldAddressTable(pc.tableAddr).slots[{idx}]).data[i] = (v))\n",
                n = slot.name,
                idx = slot.index
            ));
        }
        out.push('\n');
        out
    }
}

/// 字段描述符
pub struct FieldDesc {
    /// 字段名
    pub name: String,
    /// 元素格式
    pub format: FieldFormat,
    /// 元素字节数
    pub element_size: u32,
    /// GPU 缓冲
    pub buffer: GpuBuffer,
    /// 设备地址
    pub device_address: u64,
    /// 描述符下标（注册顺序分配，不复用）
    pub descriptor_index: u32,
}

/// 字段注册表
pub struct FieldRegistry {
    ctx: Arc<GpuContext>,
    active_count: u32,
    table: GpuBuffer,
    fields: Vec<FieldDesc>,
    by_name: HashMap<String, usize>,
    cmd_pool: vk::CommandPool,
}

impl FieldRegistry {
    /// 以预期活跃体素数构造
    pub fn new(
        ctx: Arc<GpuContext>,
        alloc: &mut DeviceAllocator,
        active_count: u32,
    ) -> EngineResult<Self> {
        let mut table = alloc.create_buffer(
            (MAX_FIELDS * 8) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            BufferResidency::HostUpload,
            "field_address_table",
        )?;

        match table.mapped_slice_mut() {
            Some(slice) => slice.fill(0),
            None => {
                alloc.destroy_buffer(&mut table);
                return Err(EngineError::DeviceInit("地址表缓冲未映射".into()));
            }
        }

        let cmd_pool = match ctx.create_command_pool(
            ctx.compute_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        ) {
            Ok(p) => p,
            Err(e) => {
                alloc.destroy_buffer(&mut table);
                return Err(e.into());
            }
        };

        log::info!(
            "字段注册表就绪: {} 活跃体素, 地址表 0x{:x}",
            active_count,
            table.device_address
        );

        Ok(Self {
            ctx,
            active_count,
            table,
            fields: Vec::new(),
            by_name: HashMap::new(),
            cmd_pool,
        })
    }

    /// 注册字段
    ///
    /// 给定初值时按元素模式整体填充，否则清零。返回的描述符
    /// 引用与注册表同生命周期。
    pub fn register_field(
        &mut self,
        alloc: &mut DeviceAllocator,
        name: &str,
        format: FieldFormat,
        initial: Option<[f32; 4]>,
    ) -> EngineResult<&FieldDesc> {
        if self.by_name.contains_key(name) {
            return Err(EngineError::DuplicateField(name.to_string()));
        }
        if self.fields.len() >= MAX_FIELDS {
            return Err(EngineError::CapacityExceeded(format!(
                "字段数已达上限 {}",
                MAX_FIELDS
            )));
        }

        let element_size = format.element_size();
        let size = u64::from(self.active_count) * u64::from(element_size);
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;

        let mut buffer =
            alloc.create_buffer(size, usage, BufferResidency::DeviceOnly, name)?;

        let init_result = match initial {
            Some(value) => self.splat_fill(alloc, &buffer, format, value),
            None => self.zero_fill(&buffer),
        };
        if let Err(e) = init_result {
            alloc.destroy_buffer(&mut buffer);
            return Err(e);
        }

        let descriptor_index = self.fields.len() as u32;
        let device_address = buffer.device_address;
        self.write_table_slot(descriptor_index, device_address)?;

        log::info!(
            "字段注册: '{}' (格式 {}, {} 字节, 描述符 {})",
            name,
            format,
            size,
            descriptor_index
        );

        self.by_name.insert(name.to_string(), self.fields.len());
        self.fields.push(FieldDesc {
            name: name.to_string(),
            format,
            element_size,
            buffer,
            device_address,
            descriptor_index,
        });
        Ok(&self.fields[self.fields.len() - 1])
    }

    /// 写地址表槽位
    fn write_table_slot(&mut self, index: u32, address: u64) -> EngineResult<()> {
        let slice = self
            .table
            .mapped_slice_mut()
            .ok_or_else(|| EngineError::DeviceInit("地址表缓冲未映射".into()))?;
        let offset = index as usize * 8;
        slice[offset..offset + 8].copy_from_slice(&address.to_le_bytes());
        Ok(())
    }

    /// 传输填零
    fn zero_fill(&self, buffer: &GpuBuffer) -> EngineResult<()> {
        let cmd = self.ctx.begin_oneshot(self.cmd_pool)?;
        unsafe {
            self.ctx
                .device()
                .cmd_fill_buffer(cmd, buffer.handle, 0, vk::WHOLE_SIZE, 0);
        }
        self.ctx
            .end_oneshot(cmd, self.cmd_pool, self.ctx.compute_queue())?;
        Ok(())
    }

    /// 按元素模式整体填充初值
    ///
    /// 浮点格式取分量原值，整型格式按分量截断为 i32。
    fn splat_fill(
        &self,
        alloc: &mut DeviceAllocator,
        buffer: &GpuBuffer,
        format: FieldFormat,
        value: [f32; 4],
    ) -> EngineResult<()> {
        let comps = format.component_count() as usize;
        let mut pattern = Vec::with_capacity(comps * 4);
        for &v in value.iter().take(comps) {
            if format.is_float() {
                pattern.extend_from_slice(&v.to_le_bytes());
            } else {
                pattern.extend_from_slice(&(v as i32).to_le_bytes());
            }
        }
        let mut bytes = Vec::with_capacity(self.active_count as usize * pattern.len());
        for _ in 0..self.active_count {
            bytes.extend_from_slice(&pattern);
        }
        alloc.upload_sync(buffer, &bytes, 0)?;
        Ok(())
    }

    /// 按名查字段
    pub fn get(&self, name: &str) -> EngineResult<&FieldDesc> {
        self.by_name
            .get(name)
            .map(|&i| &self.fields[i])
            .ok_or_else(|| EngineError::UnknownField(name.to_string()))
    }

    /// 按描述符下标查字段
    pub fn get_by_index(&self, index: u32) -> EngineResult<&FieldDesc> {
        self.fields
            .get(index as usize)
            .ok_or_else(|| EngineError::UnknownField(format!("描述符 {}", index)))
    }

    /// 字段是否存在
    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// 字段数
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 全部字段（注册顺序）
    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    /// 注册顺序的字段名
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// 地址表的设备地址（推送常量 `table_addr`）
    pub fn table_addr(&self) -> u64 {
        self.table.device_address
    }

    /// 地址表快照（诊断与不变量校验用）
    ///
    /// 槽位按描述符下标排列，未使用的槽位为 0。
    pub fn table_snapshot(&self) -> Vec<u64> {
        let Some(slice) = self.table.mapped_slice() else {
            return Vec::new();
        };
        slice
            .chunks_exact(8)
            .map(|c| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(c);
                u64::from_le_bytes(arr)
            })
            .collect()
    }

    /// 配置的活跃体素数
    pub fn active_voxel_count(&self) -> u32 {
        self.active_count
    }

    /// 布局快照
    pub fn layout(&self) -> FieldLayout {
        let mut layout = FieldLayout::new();
        for f in &self.fields {
            layout.push(&f.name, f.format);
        }
        layout
    }

    /// 生成着色器前导
    pub fn generate_shader_prelude(&self) -> String {
        self.layout().generate_prelude()
    }

    /// 为新的活跃体素数分配替换缓冲（不改动现状）
    ///
    /// 返回的缓冲与字段一一对应（注册顺序）。调用方完成重映射
    /// 后经 [`Self::commit_reallocation`] 切换，或经
    /// [`Self::abort_reallocation`] 放弃。
    pub fn begin_reallocation(
        &self,
        alloc: &mut DeviceAllocator,
        new_count: u32,
    ) -> EngineResult<Vec<GpuBuffer>> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let mut buffers = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let size = u64::from(new_count) * u64::from(field.element_size);
            match alloc.create_buffer(size, usage, BufferResidency::DeviceOnly, &field.name) {
                Ok(b) => buffers.push(b),
                Err(e) => {
                    for mut b in buffers {
                        alloc.destroy_buffer(&mut b);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(buffers)
    }

    /// 提交重分配：切换缓冲、改写地址表、更新活跃体素数
    pub fn commit_reallocation(
        &mut self,
        alloc: &mut DeviceAllocator,
        new_buffers: Vec<GpuBuffer>,
        new_count: u32,
    ) -> EngineResult<()> {
        if new_buffers.len() != self.fields.len() {
            return Err(EngineError::CapacityExceeded(
                "重分配缓冲数量与字段数不符".into(),
            ));
        }
        for (i, new_buffer) in new_buffers.into_iter().enumerate() {
            let address = new_buffer.device_address;
            let mut old = std::mem::replace(&mut self.fields[i].buffer, new_buffer);
            alloc.destroy_buffer(&mut old);
            self.fields[i].device_address = address;
            let index = self.fields[i].descriptor_index;
            self.write_table_slot(index, address)?;
        }
        self.active_count = new_count;
        log::info!("字段缓冲已切换到新网格: {} 活跃体素", new_count);
        Ok(())
    }

    /// 放弃重分配，释放新缓冲
    pub fn abort_reallocation(
        &self,
        alloc: &mut DeviceAllocator,
        new_buffers: Vec<GpuBuffer>,
    ) {
        for mut b in new_buffers {
            alloc.destroy_buffer(&mut b);
        }
    }

    /// 释放全部 GPU 资源
    pub fn destroy(&mut self, alloc: &mut DeviceAllocator) {
        for field in &mut self.fields {
            alloc.destroy_buffer(&mut field.buffer);
        }
        alloc.destroy_buffer(&mut self.table);
        unsafe {
            self.ctx.device().destroy_command_pool(self.cmd_pool, None);
        }
        self.cmd_pool = vk::CommandPool::null();
        log::debug!("字段注册表已销毁");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_indices_in_registration_order() {
        let mut layout = FieldLayout::new();
        assert_eq!(layout.push("density", FieldFormat::R32F), 0);
        assert_eq!(layout.push("velocity", FieldFormat::R32G32B32F), 1);
        assert_eq!(layout.push("flags", FieldFormat::R32I), 2);
        assert_eq!(layout.get("velocity").unwrap().index, 1);
        assert!(layout.get("missing").is_none());
    }

    #[test]
    fn test_prelude_declares_buffers_and_macros() {
        let mut layout = FieldLayout::new();
        layout.push("density", FieldFormat::R32F);
        layout.push("velocity", FieldFormat::R32G32B32F);
        let prelude = layout.generate_prelude();

        assert!(prelude
            .contains("layout(buffer_reference, scalar) buffer density_Buffer { float data[]; };"));
        assert!(prelude
            .contains("layout(buffer_reference, scalar) buffer velocity_Buffer { vec3 data[]; };"));
        assert!(prelude.contains("buffer FieldAddressTable { uint64_t slots[]; };"));
        assert!(prelude.contains("#define FIELD_SLOT_density 0"));
        assert!(prelude.contains("#define FIELD_SLOT_velocity 1"));
        assert!(prelude.contains(
            "#define READ_density(i) (density_Buffer(FieldAddressTable(pc.tableAddr).slots[0]).data[i])"
        ));
        assert!(prelude.contains("#define WRITE_velocity(i, v)"));
    }

    #[test]
    fn test_prelude_empty_layout() {
        let layout = FieldLayout::new();
        let prelude = layout.generate_prelude();
        assert!(prelude.contains("FieldAddressTable"));
        assert!(!prelude.contains("#define READ_"));
    }
}
