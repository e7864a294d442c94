// crates/vf_engine/src/shadergen.rs

//! GLSL 计算着色器生成
//!
//! 纯文本变换：`(字段布局快照, 模板定义) -> GLSL 460 源码`。
//! 不做编译，无副作用。
//!
//! 生成的内核通过推送常量中的两个 64 位地址访问一切数据：
//! `gridAddr` 指向网格头（原始网格、LUT、值数组的地址与包围盒），
//! `tableAddr` 指向字段地址表。字段指针一律经地址表按描述符
//! 下标解引用，下标在生成期内联为常量。
//!
//! 用户代码里的 `Read_<field>(i)` / `Write_<field>(i, v)` /
//! `ReadNeighbor_<field>(i, delta)`（也接受 ReadNeighbour 拼写）
//! 被改写为访问宏与邻域辅助函数调用。邻域读取越过活跃集时
//! 返回背景值。

use crate::error::{EngineError, EngineResult};
use crate::fields::FieldLayout;
use crate::stencil::StencilDefinition;
use regex::Regex;
use vf_foundation::FieldFormat;

/// 工作组大小（每组线程数）
pub const WORKGROUP_SIZE: u32 = 128;

/// 着色器生成器
pub struct ShaderGenerator {
    layout: FieldLayout,
}

impl ShaderGenerator {
    /// 以字段布局快照构造
    pub fn new(layout: FieldLayout) -> Self {
        Self { layout }
    }

    /// 生成完整计算着色器源码
    pub fn generate(&self, stencil: &StencilDefinition) -> EngineResult<String> {
        log::info!("为模板 '{}' 生成计算着色器", stencil.name);

        let mut out = String::new();
        out.push_str(Self::header());
        out.push_str(&self.layout.generate_prelude());
        out.push_str(Self::grid_references());
        out.push_str(Self::push_constants());
        out.push_str(Self::helper_functions());
        out.push_str(&self.neighbor_helpers(stencil)?);
        out.push_str(&self.main_function(stencil)?);

        log::debug!("着色器生成完成 ({} 字节)", out.len());
        Ok(out)
    }

    /// 版本与扩展前导、工作组大小
    fn header() -> &'static str {
        r#"#version 460
#extension GL_EXT_buffer_reference : require
#extension GL_EXT_buffer_reference2 : require
#extension GL_EXT_scalar_block_layout : require
#extension GL_EXT_shader_explicit_arithmetic_types_int64 : require

layout(local_size_x = 128, local_size_y = 1, local_size_z = 1) in;

"#
    }

    /// 网格头与查找表的缓冲引用声明
    fn grid_references() -> &'static str {
        r#"// --- Grid References ---
layout(buffer_reference, scalar) buffer GridHeader {
    uint64_t rawAddr;
    uint64_t lutAddr;
    uint64_t valuesAddr;
    uint activeCount;
    ivec3 bboxMin;
    ivec3 bboxMax;
    float background;
};

layout(buffer_reference, scalar) buffer CoordLut {
    ivec3 coords[];
};

"#
    }

    /// 推送常量块
    fn push_constants() -> &'static str {
        r#"// --- Push Constants ---
layout(push_constant, scalar) uniform PC {
    uint64_t gridAddr;
    uint64_t tableAddr;
    uint activeVoxelCount;
    uint voxelBase;
    uint neighborRadius;
    float dt;
} pc;

"#
    }

    /// 坐标/索引辅助函数
    ///
    /// `index_of` 在 Morton 序 LUT 上做二分查找，未命中返回
    /// `INVALID_INDEX`。Morton 位操作与宿主侧实现一致。
    fn helper_functions() -> &'static str {
        r#"// --- Sparse Grid Helpers ---
const uint INVALID_INDEX = 0xffffffffu;
const int MORTON_BIAS = 1 << 20;

uint64_t splitBy3(uint v) {
    uint64_t x = uint64_t(v) & 0x1fffffUL;
    x = (x | (x << 32)) & 0x1f00000000ffffUL;
    x = (x | (x << 16)) & 0x1f0000ff0000ffUL;
    x = (x | (x << 8))  & 0x100f00f00f00f00fUL;
    x = (x | (x << 4))  & 0x10c30c30c30c30c3UL;
    x = (x | (x << 2))  & 0x1249249249249249UL;
    return x;
}

uint64_t mortonKey(ivec3 c) {
    uint x = uint(c.x + MORTON_BIAS);
    uint y = uint(c.y + MORTON_BIAS);
    uint z = uint(c.z + MORTON_BIAS);
    return (splitBy3(x) << 2) | (splitBy3(y) << 1) | splitBy3(z);
}

ivec3 coord_of(uint i) {
    return CoordLut(GridHeader(pc.gridAddr).lutAddr).coords[i];
}

uint index_of(ivec3 c) {
    GridHeader grid = GridHeader(pc.gridAddr);
    if (any(lessThan(c, grid.bboxMin)) || any(greaterThan(c, grid.bboxMax))) {
        return INVALID_INDEX;
    }
    uint64_t key = mortonKey(c);
    CoordLut lut = CoordLut(grid.lutAddr);
    uint lo = 0u;
    uint hi = grid.activeCount;
    while (lo < hi) {
        uint mid = (lo + hi) / 2u;
        if (mortonKey(lut.coords[mid]) < key) {
            lo = mid + 1u;
        } else {
            hi = mid;
        }
    }
    if (lo < grid.activeCount && lut.coords[lo] == c) {
        return lo;
    }
    return INVALID_INDEX;
}

"#
    }

    /// 邻域越界时的回退表达式
    fn background_expr(format: FieldFormat) -> String {
        let bg = "GridHeader(pc.gridAddr).background";
        match format {
            FieldFormat::R32F => bg.to_string(),
            FieldFormat::R32G32F => format!("vec2({})", bg),
            FieldFormat::R32G32B32F => format!("vec3({})", bg),
            FieldFormat::R32G32B32A32F => format!("vec4({})", bg),
            FieldFormat::R32I => "0".to_string(),
            FieldFormat::R32G32I => "ivec2(0)".to_string(),
            FieldFormat::R32G32B32I => "ivec3(0)".to_string(),
            FieldFormat::R32G32B32A32I => "ivec4(0)".to_string(),
        }
    }

    /// 为模板引用的每个字段生成邻域读取函数
    fn neighbor_helpers(&self, stencil: &StencilDefinition) -> EngineResult<String> {
        let mut out = String::from("// --- Neighbor Access ---\n");
        for name in stencil.referenced_fields() {
            let slot = self
                .layout
                .get(&name)
                .ok_or_else(|| EngineError::UnknownField(name.clone()))?;
            out.push_str(&format!(
                r#"{ty} read_neighbor_{name}(uint i, ivec3 delta) {{
    uint n = index_of(coord_of(i) + delta);
    if (n == INVALID_INDEX) {{
        return {fallback};
    }}
    return READ_{name}(n);
}}

"#,
                ty = slot.format.glsl_type(),
                name = name,
                fallback = Self::background_expr(slot.format),
            ));
        }
        Ok(out)
    }

    /// 改写用户代码中的字段访问记号
    fn rewrite_body(body: &str) -> EngineResult<String> {
        let neighbor = Regex::new(r"\bReadNeighbou?r_(\w+)\s*\(")
            .map_err(|e| EngineError::CompilerError(e.to_string()))?;
        let read = Regex::new(r"\bRead_(\w+)\s*\(")
            .map_err(|e| EngineError::CompilerError(e.to_string()))?;
        let write = Regex::new(r"\bWrite_(\w+)\s*\(")
            .map_err(|e| EngineError::CompilerError(e.to_string()))?;

        let step1 = neighbor.replace_all(body, "read_neighbor_$1(");
        let step2 = read.replace_all(&step1, "READ_$1(");
        let step3 = write.replace_all(&step2, "WRITE_$1(");
        Ok(step3.into_owned())
    }

    /// main 函数：越界保护 + 用户代码注入
    fn main_function(&self, stencil: &StencilDefinition) -> EngineResult<String> {
        let body = Self::rewrite_body(&stencil.body)?;
        let indented: String = body
            .lines()
            .map(|l| {
                if l.is_empty() {
                    String::from("\n")
                } else {
                    format!("    {}\n", l)
                }
            })
            .collect();

        Ok(format!(
            r#"// --- Main Computation ---
void main() {{
    uint local = gl_GlobalInvocationID.x;
    if (local >= pc.activeVoxelCount) {{
        return;
    }}
    uint idx = pc.voxelBase + local;

    // --- User Stencil Code ---
{indented}    // --- End User Code ---
}}
"#,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vf_foundation::FieldFormat;

    fn layout() -> FieldLayout {
        let mut layout = FieldLayout::new();
        layout.push("density", FieldFormat::R32F);
        layout.push("velocity", FieldFormat::R32G32B32F);
        layout
    }

    fn stencil(body: &str) -> StencilDefinition {
        StencilDefinition {
            name: "advect".into(),
            inputs: vec!["density".into(), "velocity".into()],
            outputs: vec!["density".into()],
            body: body.into(),
            neighbour_radius: 1,
        }
    }

    #[test]
    fn test_header_and_extensions() {
        let generator = ShaderGenerator::new(layout());
        let src = generator.generate(&stencil("float d = Read_density(idx);")).unwrap();
        assert!(src.starts_with("#version 460"));
        assert!(src.contains("GL_EXT_buffer_reference"));
        assert!(src.contains("GL_EXT_scalar_block_layout"));
        assert!(src.contains("GL_EXT_shader_explicit_arithmetic_types_int64"));
        assert!(src.contains("layout(local_size_x = 128"));
    }

    #[test]
    fn test_read_write_rewritten() {
        let generator = ShaderGenerator::new(layout());
        let src = generator
            .generate(&stencil(
                "float d = Read_density(idx);\nWrite_density(idx, d * pc.dt);",
            ))
            .unwrap();
        assert!(src.contains("READ_density(idx)"));
        assert!(src.contains("WRITE_density(idx, d * pc.dt)"));
        // 用户记号在 main 中不应残留
        let main_part = &src[src.find("void main").unwrap()..];
        assert!(!main_part.contains("Read_density("));
        assert!(!main_part.contains("Write_density("));
    }

    #[test]
    fn test_neighbor_rewritten_both_spellings() {
        let generator = ShaderGenerator::new(layout());
        let src = generator
            .generate(&stencil(
                "float a = ReadNeighbor_density(idx, ivec3(1, 0, 0));\nfloat b = ReadNeighbour_density(idx, ivec3(-1, 0, 0));",
            ))
            .unwrap();
        assert!(src.contains("read_neighbor_density(idx, ivec3(1, 0, 0))"));
        assert!(src.contains("read_neighbor_density(idx, ivec3(-1, 0, 0))"));
        assert!(src.contains("float read_neighbor_density(uint i, ivec3 delta)"));
    }

    #[test]
    fn test_vec_field_fallback_uses_background() {
        let generator = ShaderGenerator::new(layout());
        let src = generator
            .generate(&stencil("vec3 v = ReadNeighbor_velocity(idx, ivec3(0, 1, 0));"))
            .unwrap();
        assert!(src.contains("vec3 read_neighbor_velocity(uint i, ivec3 delta)"));
        assert!(src.contains("return vec3(GridHeader(pc.gridAddr).background);"));
    }

    #[test]
    fn test_bounds_guard_present() {
        let generator = ShaderGenerator::new(layout());
        let src = generator.generate(&stencil("Write_density(idx, 0.0);")).unwrap();
        assert!(src.contains("if (local >= pc.activeVoxelCount)"));
        assert!(src.contains("uint idx = pc.voxelBase + local;"));
    }

    #[test]
    fn test_push_constants_block() {
        let generator = ShaderGenerator::new(layout());
        let src = generator.generate(&stencil("")).unwrap();
        assert!(src.contains("layout(push_constant, scalar) uniform PC"));
        assert!(src.contains("uint64_t gridAddr;"));
        assert!(src.contains("uint64_t tableAddr;"));
        assert!(src.contains("uint neighborRadius;"));
        assert!(src.contains("float dt;"));
    }

    #[test]
    fn test_unknown_referenced_field_fails() {
        let generator = ShaderGenerator::new(layout());
        let mut bad = stencil("");
        bad.inputs.push("pressure".into());
        assert!(matches!(
            generator.generate(&bad),
            Err(EngineError::UnknownField(_))
        ));
    }

    #[test]
    fn test_binary_search_helper_present() {
        let generator = ShaderGenerator::new(layout());
        let src = generator.generate(&stencil("")).unwrap();
        assert!(src.contains("uint index_of(ivec3 c)"));
        assert!(src.contains("ivec3 coord_of(uint i)"));
        assert!(src.contains("INVALID_INDEX"));
        assert!(src.contains("mortonKey"));
    }

    #[test]
    fn test_generation_is_pure() {
        let generator = ShaderGenerator::new(layout());
        let s = stencil("Write_density(idx, 1.0);");
        let a = generator.generate(&s).unwrap();
        let b = generator.generate(&s).unwrap();
        assert_eq!(a, b);
    }
}
