// crates/vf_engine/src/cache.rs

//! 磁盘 SPIR-V 管线缓存
//!
//! 按内容寻址：键为生成的 GLSL 源码的 SHA-256。文件名取
//! `<模板名>_<哈希前 8 位十六进制>.spv`，文件头内保存完整的
//! 256 位哈希，命中时复核以排除短哈希碰撞。
//!
//! 多进程可共享同一缓存目录：写入走临时文件加原子改名，读取
//! 容忍截断或损坏的文件（按未命中处理）。所有 IO 失败都降级为
//! 告警，调用方回退到重新编译。
//!
//! # 文件布局
//!
//! ```text
//! [magic u32][version u32][sha256 32B][word_count u32][payload 4*word_count B]
//! ```

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// 文件魔数 "VFSC"
const CACHE_MAGIC: u32 = 0x5646_5343;

/// 文件格式版本
const CACHE_VERSION: u32 = 1;

/// 缓存文件扩展名
const CACHE_EXT: &str = "spv";

/// 磁盘管线缓存
pub struct PipelineCache {
    dir: PathBuf,
}

impl PipelineCache {
    /// 打开（必要时创建）缓存目录
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if !dir.exists() {
            if let Err(e) = fs::create_dir_all(&dir) {
                log::warn!("缓存目录创建失败 {}: {}", dir.display(), e);
            } else {
                log::info!("创建着色器缓存目录: {}", dir.display());
            }
        } else {
            log::debug!("使用着色器缓存目录: {}", dir.display());
        }
        Self { dir }
    }

    /// 默认缓存目录 `<用户缓存>/fluid-engine-cache/`
    ///
    /// 平台缓存根不可用时退回当前目录下的同名子目录。
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fluid-engine-cache")
    }

    /// 缓存目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 源码的 SHA-256
    fn source_hash(source: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.finalize().into()
    }

    /// 缓存文件路径 `<name>_<8 hex>.spv`
    fn cache_path(&self, name: &str, hash: &[u8; 32]) -> PathBuf {
        let short: String = hash[..4].iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}_{}.{}", name, short, CACHE_EXT))
    }

    /// 查询缓存
    ///
    /// 命中返回 SPIR-V 字词；文件缺失、截断、损坏或完整哈希
    /// 不符时返回 `None`（损坏情形记录告警）。
    pub fn lookup(&self, name: &str, source: &str) -> Option<Vec<u32>> {
        let hash = Self::source_hash(source);
        let path = self.cache_path(name, &hash);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => {
                log::debug!("缓存未命中: '{}'", name);
                return None;
            }
        };

        match Self::parse_file(&bytes, &hash) {
            Some(words) => {
                log::info!("缓存命中: '{}' ({} 字节)", name, words.len() * 4);
                Some(words)
            }
            None => {
                log::warn!("缓存文件无效，按未命中处理: {}", path.display());
                None
            }
        }
    }

    /// 解析并校验缓存文件
    fn parse_file(bytes: &[u8], expected_hash: &[u8; 32]) -> Option<Vec<u32>> {
        const HEADER: usize = 4 + 4 + 32 + 4;
        if bytes.len() < HEADER {
            return None;
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let version = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        if magic != CACHE_MAGIC || version != CACHE_VERSION {
            return None;
        }
        if &bytes[8..40] != expected_hash {
            // 短哈希碰撞或内容被替换
            return None;
        }
        let word_count = u32::from_le_bytes(bytes[40..44].try_into().ok()?) as usize;
        let payload = &bytes[HEADER..];
        if payload.len() != word_count * 4 {
            return None;
        }
        let mut words = Vec::with_capacity(word_count);
        for chunk in payload.chunks_exact(4) {
            words.push(u32::from_le_bytes(chunk.try_into().ok()?));
        }
        Some(words)
    }

    /// 写入缓存
    ///
    /// 写临时文件后原子改名。失败仅记录告警，不影响调用方。
    pub fn store(&self, name: &str, source: &str, spirv: &[u32]) {
        let hash = Self::source_hash(source);
        let path = self.cache_path(name, &hash);

        let result = (|| -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(&CACHE_MAGIC.to_le_bytes())?;
            tmp.write_all(&CACHE_VERSION.to_le_bytes())?;
            tmp.write_all(&hash)?;
            tmp.write_all(&(spirv.len() as u32).to_le_bytes())?;
            for word in spirv {
                tmp.write_all(&word.to_le_bytes())?;
            }
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })();

        match result {
            Ok(()) => log::debug!(
                "SPIR-V 已写入缓存: {} ({} 字节)",
                path.display(),
                spirv.len() * 4
            ),
            Err(e) => log::warn!("缓存写入失败 {}: {}", path.display(), e),
        }
    }

    /// 清空缓存目录中的 SPIR-V 工件
    pub fn clear(&self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("缓存目录读取失败 {}: {}", self.dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CACHE_EXT) {
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("缓存文件删除失败 {}: {}", path.display(), e);
                }
            }
        }
        log::info!("着色器缓存已清空: {}", self.dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0300, 0, 1, 0];

    #[test]
    fn test_store_then_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = PipelineCache::new(dir.path());

        assert!(cache.lookup("advect", "void main(){}").is_none());
        cache.store("advect", "void main(){}", &SPIRV);
        assert_eq!(cache.lookup("advect", "void main(){}").unwrap(), SPIRV);
    }

    #[test]
    fn test_source_change_misses() {
        let dir = TempDir::new().unwrap();
        let cache = PipelineCache::new(dir.path());
        cache.store("advect", "void main(){}", &SPIRV);
        assert!(cache.lookup("advect", "void main(){ }").is_none());
    }

    #[test]
    fn test_truncated_file_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = PipelineCache::new(dir.path());
        cache.store("advect", "src", &SPIRV);

        // 截断缓存文件
        let entry = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .find(|e| e.path().extension().is_some())
            .unwrap();
        let bytes = fs::read(entry.path()).unwrap();
        fs::write(entry.path(), &bytes[..bytes.len() - 5]).unwrap();

        assert!(cache.lookup("advect", "src").is_none());
    }

    #[test]
    fn test_hash_mismatch_in_header_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = PipelineCache::new(dir.path());
        cache.store("advect", "src", &SPIRV);

        let entry = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .find(|e| e.path().extension().is_some())
            .unwrap();
        let mut bytes = fs::read(entry.path()).unwrap();
        bytes[10] ^= 0xff; // 破坏文件头中的完整哈希
        fs::write(entry.path(), &bytes).unwrap();

        assert!(cache.lookup("advect", "src").is_none());
    }

    #[test]
    fn test_clear_removes_artifacts() {
        let dir = TempDir::new().unwrap();
        let cache = PipelineCache::new(dir.path());
        cache.store("a", "s1", &SPIRV);
        cache.store("b", "s2", &SPIRV);
        cache.clear();
        assert!(cache.lookup("a", "s1").is_none());
        assert!(cache.lookup("b", "s2").is_none());
    }

    #[test]
    fn test_filename_shape() {
        let dir = TempDir::new().unwrap();
        let cache = PipelineCache::new(dir.path());
        cache.store("diffuse", "source text", &SPIRV);
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("diffuse_"));
        assert!(names[0].ends_with(".spv"));
        // diffuse_ + 8 hex + .spv
        assert_eq!(names[0].len(), "diffuse_".len() + 8 + 4);
    }
}
