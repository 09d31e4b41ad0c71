//! 库目录内的本地文件读写

use crate::core::scanner::file_times;
use crate::error::SyncError;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Obsidian 自带的回收站目录
pub const TRASH_DIR: &str = ".trash";

/// 写入中的临时文件后缀（被默认忽略规则 `*.tmp` 排除）
const TEMP_SUFFIX: &str = ".sync.tmp";

/// 本地文件当前的 (mtime, size)，不存在时为 None
pub async fn local_state(path: &Path) -> Result<Option<(i64, i64)>, SyncError> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(Some(file_times(&metadata))),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// 读取整个文件，同时返回读取后的 (mtime, size)
pub async fn read_local(path: &Path) -> Result<(Bytes, i64, i64), SyncError> {
    let data = fs::read(path).await.map_err(|e| SyncError::io(path, e))?;
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| SyncError::io(path, e))?;
    let (mtime, size) = file_times(&metadata);
    Ok((Bytes::from(data), mtime, size))
}

/// 原子写入：先写临时文件再重命名，返回写入后的 (mtime, size)
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(i64, i64), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }

    // 任何一步失败都删除临时文件
    let temp_path = scopeguard::guard(temp_path_for(path), |temp| {
        let _ = std::fs::remove_file(temp);
    });
    fs::write(&*temp_path, data)
        .await
        .map_err(|e| SyncError::io(&*temp_path, e))?;
    fs::rename(&*temp_path, path)
        .await
        .map_err(|e| SyncError::io(path, e))?;
    scopeguard::ScopeGuard::into_inner(temp_path);

    let metadata = fs::metadata(path)
        .await
        .map_err(|e| SyncError::io(path, e))?;
    Ok(file_times(&metadata))
}

/// 把库内文件移入 `.trash/`，目标已存在时追加时间戳，返回库内相对路径
pub async fn move_to_trash(vault_root: &Path, local_path: &str) -> Result<Option<String>, SyncError> {
    let source = vault_root.join(local_path);
    if local_state(&source).await?.is_none() {
        return Ok(None);
    }

    let mut relative = format!("{}/{}", TRASH_DIR, local_path);
    if fs::try_exists(vault_root.join(&relative))
        .await
        .unwrap_or(false)
    {
        relative = format!("{}.{}", relative, chrono::Utc::now().timestamp_millis());
    }

    let target = vault_root.join(&relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }
    fs::rename(&source, &target)
        .await
        .map_err(|e| SyncError::io(&source, e))?;
    Ok(Some(relative))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}
