use super::{RemoteEntry, RemoteStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use walkdir::WalkDir;

/// 写入中的临时文件后缀
const TEMP_SUFFIX: &str = ".sync.tmp";

/// 以本地目录作为远程副本（例如挂载的网盘目录）
pub struct LocalStore {
    base_path: PathBuf,
    name: String,
}

impl LocalStore {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path).map_err(|e| map_io_error(e, path))?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, key: &str) -> PathBuf {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(key)
        }
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    fn entry_for(key: String, metadata: &std::fs::Metadata) -> Option<RemoteEntry> {
        let modified = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some(RemoteEntry {
            revision: format!("{}-{}", modified.as_nanos(), metadata.len()),
            modified: modified.as_millis() as i64,
            size: metadata.len(),
            key,
        })
    }
}

fn map_io_error(e: io::Error, key: &str) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
        _ => StorageError::Backend(format!("{}: {}", key, e)),
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError> {
        let full_path = self.resolve_path(key);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_error(e, key))?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = temp_path_for(&full_path);
        fs::write(&temp_path, &data)
            .await
            .map_err(|e| map_io_error(e, key))?;
        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| map_io_error(e, key))?;

        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io_error(e, key))?;
        Self::entry_for(key.to_string(), &metadata)
            .map(|entry| entry.revision)
            .ok_or_else(|| StorageError::Backend(format!("无法读取修改时间: {}", key)))
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let data = fs::read(self.resolve_path(key))
            .await
            .map_err(|e| map_io_error(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let base = self.resolve_path(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }

        let base_path = self.base_path.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let entries = tokio::task::spawn_blocking(move || {
            WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let relative = entry.path().strip_prefix(&base_path).ok()?.to_str()?;
                    let key = Self::normalize_path(relative);
                    if key.ends_with(TEMP_SUFFIX) {
                        return None;
                    }
                    let metadata = entry.metadata().ok()?;
                    Self::entry_for(key, &metadata)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| StorageError::Backend(format!("列表任务失败: {}", e)))?;

        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.resolve_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) => Err(map_io_error(e, key)),
        }
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve_path(from);
        if !source.is_file() {
            return Err(StorageError::NotFound(from.to_string()));
        }
        let target = self.resolve_path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_error(e, to))?;
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| map_io_error(e, from))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}
