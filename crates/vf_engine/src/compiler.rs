// crates/vf_engine/src/compiler.rs

//! 内核源码编译器接口
//!
//! GLSL -> SPIR-V 编译是外部协作者：核心只依赖本 trait，把
//! 编译产物当作不透明字节。`shaderc` cargo 特性启用内置的
//! shaderc 后端；未启用时 [`default_compiler`] 返回
//! `CompilerError`，由调用方上浮。

use crate::error::{EngineError, EngineResult};

/// 内核源码编译器
///
/// 输入源码文本与入口符号，输出 SPIR-V 字词。实现方对产物
/// 内容不做任何承诺，核心仅透传给管线创建。
pub trait KernelCompiler: Send {
    /// 编译计算内核
    fn compile(&self, source: &str, entry_point: &str) -> EngineResult<Vec<u32>>;

    /// 后端名称（诊断用）
    fn name(&self) -> &'static str;
}

/// 构造默认编译器后端
///
/// 启用 `shaderc` 特性时返回 shaderc 后端；否则报告
/// [`EngineError::CompilerError`]。
pub fn default_compiler() -> EngineResult<Box<dyn KernelCompiler>> {
    #[cfg(feature = "shaderc")]
    {
        Ok(Box::new(shaderc_backend::ShadercCompiler::new()?))
    }
    #[cfg(not(feature = "shaderc"))]
    {
        Err(EngineError::CompilerError(
            "编译器后端不可用（构建未启用 shaderc 特性）".into(),
        ))
    }
}

#[cfg(feature = "shaderc")]
mod shaderc_backend {
    use super::*;

    /// shaderc 后端
    pub struct ShadercCompiler {
        compiler: shaderc::Compiler,
    }

    impl ShadercCompiler {
        /// 初始化 shaderc，库不可用时返回 `CompilerError`
        pub fn new() -> EngineResult<Self> {
            let compiler = shaderc::Compiler::new()
                .ok_or_else(|| EngineError::CompilerError("shaderc 初始化失败".into()))?;
            Ok(Self { compiler })
        }
    }

    impl KernelCompiler for ShadercCompiler {
        fn compile(&self, source: &str, entry_point: &str) -> EngineResult<Vec<u32>> {
            let mut options = shaderc::CompileOptions::new()
                .ok_or_else(|| EngineError::CompilerError("shaderc 选项创建失败".into()))?;
            options.set_target_env(
                shaderc::TargetEnv::Vulkan,
                shaderc::EnvVersion::Vulkan1_2 as u32,
            );
            options.set_optimization_level(shaderc::OptimizationLevel::Performance);

            let artifact = self
                .compiler
                .compile_into_spirv(
                    source,
                    shaderc::ShaderKind::Compute,
                    "stencil.comp",
                    entry_point,
                    Some(&options),
                )
                .map_err(|e| EngineError::CompilerError(e.to_string()))?;
            Ok(artifact.as_binary().to_vec())
        }

        fn name(&self) -> &'static str {
            "shaderc"
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// 测试用桩编译器：返回固定字词并记录请求
    pub struct StubCompiler {
        pub output: Vec<u32>,
        pub calls: std::cell::RefCell<Vec<String>>,
    }

    impl StubCompiler {
        pub fn new(output: Vec<u32>) -> Self {
            Self {
                output,
                calls: std::cell::RefCell::new(Vec::new()),
            }
        }
    }

    impl KernelCompiler for StubCompiler {
        fn compile(&self, source: &str, _entry_point: &str) -> EngineResult<Vec<u32>> {
            self.calls.borrow_mut().push(source.to_string());
            Ok(self.output.clone())
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "shaderc"))]
    fn test_default_compiler_unavailable_reports_error() {
        assert!(matches!(
            default_compiler(),
            Err(EngineError::CompilerError(_))
        ));
    }

    #[test]
    fn test_stub_compiler_records_calls() {
        use testing::StubCompiler;
        let stub = StubCompiler::new(vec![1, 2, 3]);
        let out = stub.compile("void main(){}", "main").unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(stub.calls.borrow().len(), 1);
    }
}
