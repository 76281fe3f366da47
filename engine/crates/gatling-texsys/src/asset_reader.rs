use std::path::{Path, PathBuf};

use anyhow::Context;

/// 按路径读取资源文件的全部字节
pub trait AssetReader {
    fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>>;
}

/// 从文件系统读取，相对路径基于 root 解析
#[derive(Debug, Default, Clone)]
pub struct FsAssetReader {
    root: Option<PathBuf>,
}

impl FsAssetReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl AssetReader for FsAssetReader {
    fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        let full_path = self.resolve(path);
        std::fs::read(&full_path).with_context(|| format!("failed to read asset {}", full_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_uses_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"gatling").unwrap();

        let reader = FsAssetReader::with_root(dir.path());
        assert_eq!(reader.read(Path::new("a.bin")).unwrap(), b"gatling");
        assert!(reader.read(Path::new("missing.bin")).is_err());

        let absolute = dir.path().join("a.bin");
        assert_eq!(FsAssetReader::new().read(&absolute).unwrap(), b"gatling");
    }
}
