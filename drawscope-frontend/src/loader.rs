//! 图纸索引的加载与复用。
//!
//! 同一路径的索引在文件大小与修改时间不变时直接复用；内容摘要（SHA-256）作为
//! 渲染缓存的源文件标识，内容变化后旧的缓存条目随之失效。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use drawscope_core::index::DrawingIndex;
use drawscope_io::DxfFacade;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::ServiceError;

/// 已加载的图纸：索引本体加上内容摘要。
#[derive(Debug, Clone)]
pub struct LoadedDrawing {
    pub path: PathBuf,
    pub identity: String,
    pub index: Arc<DrawingIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn read(path: &Path) -> Result<Self, ServiceError> {
        let metadata = fs::metadata(path).map_err(|_| ServiceError::SourceNotFound(path.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(ServiceError::SourceNotFound(path.to_path_buf()));
        }
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

#[derive(Debug)]
struct StoredDrawing {
    stamp: FileStamp,
    drawing: LoadedDrawing,
}

/// 加载结果以及（若内容变化）被替换掉的旧标识。
#[derive(Debug)]
pub struct LoadOutcome {
    pub drawing: LoadedDrawing,
    pub replaced: Option<String>,
}

#[derive(Debug, Default)]
pub struct IndexStore {
    entries: Mutex<HashMap<PathBuf, StoredDrawing>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: &Path) -> Result<LoadOutcome, ServiceError> {
        let stamp = FileStamp::read(path)?;
        if let Some(stored) = self.lock().get(path) {
            if stored.stamp == stamp {
                debug!(path = %path.display(), "复用已加载的图纸索引");
                return Ok(LoadOutcome {
                    drawing: stored.drawing.clone(),
                    replaced: None,
                });
            }
        }

        // 解析在锁外进行，不同文件的加载互不阻塞
        let bytes = fs::read(path).map_err(|source| ServiceError::Load {
            path: path.to_path_buf(),
            source: drawscope_io::IoError::ReadError {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let identity = content_identity(&bytes);
        let document = DxfFacade::new()
            .parse_str(&String::from_utf8_lossy(&bytes))
            .map_err(|source| ServiceError::Load {
                path: path.to_path_buf(),
                source,
            })?;
        let index = Arc::new(DrawingIndex::build(document));
        info!(
            path = %path.display(),
            entities = index.len(),
            unbounded = index.unbounded_count(),
            "图纸索引构建完成"
        );

        let drawing = LoadedDrawing {
            path: path.to_path_buf(),
            identity,
            index,
        };
        let previous = self.lock().insert(
            path.to_path_buf(),
            StoredDrawing {
                stamp,
                drawing: drawing.clone(),
            },
        );
        let replaced = previous
            .map(|stored| stored.drawing.identity)
            .filter(|old| *old != drawing.identity);
        Ok(LoadOutcome { drawing, replaced })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, StoredDrawing>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 文件内容的 SHA-256 十六进制摘要。
pub fn content_identity(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = "0\nSECTION\n2\nENTITIES\n0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n10\n21\n10\n0\nENDSEC\n0\nEOF\n";
    const LONGER: &str = "0\nSECTION\n2\nENTITIES\n0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n100\n21\n100\n0\nENDSEC\n0\nEOF\n";

    #[test]
    fn identity_is_sha256_hex() {
        assert_eq!(
            content_identity(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unchanged_file_reuses_index() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let path = dir.path().join("plan.dxf");
        fs::write(&path, SQUARE).expect("写入失败");
        let store = IndexStore::new();

        let first = store.load(&path).expect("加载失败");
        let second = store.load(&path).expect("加载失败");
        assert!(Arc::ptr_eq(&first.drawing.index, &second.drawing.index));
        assert_eq!(first.drawing.identity, second.drawing.identity);
        assert!(second.replaced.is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn changed_content_reports_replaced_identity() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let path = dir.path().join("plan.dxf");
        fs::write(&path, SQUARE).expect("写入失败");
        let store = IndexStore::new();
        let first = store.load(&path).expect("加载失败");

        // 长度不同，不依赖修改时间的精度
        fs::write(&path, LONGER).expect("写入失败");
        let second = store.load(&path).expect("加载失败");
        assert_eq!(second.replaced.as_deref(), Some(first.drawing.identity.as_str()));
        assert_ne!(first.drawing.identity, second.drawing.identity);
        let extent = second.drawing.index.bounds(&Default::default()).extent().expect("应有范围");
        assert!((extent.width() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn missing_file_is_source_not_found() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let err = IndexStore::new().load(&dir.path().join("absent.dxf")).unwrap_err();
        assert!(matches!(err, ServiceError::SourceNotFound(_)));
        let err = IndexStore::new().load(dir.path()).unwrap_err();
        assert!(matches!(err, ServiceError::SourceNotFound(_)));
    }
}
