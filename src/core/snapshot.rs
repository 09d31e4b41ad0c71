//! 快照 - 把整个库打包为一个带时间戳的远程归档

use crate::core::conflict::{artifact_stamp, unique_tag};
use crate::core::scanner::{FileScanner, LocalFile};
use crate::core::transfer::RemoteTransfer;
use crate::error::SyncError;
use crate::storage::join_key;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SNAPSHOT_PREFIX: &str = "snapshot_";
pub const SNAPSHOT_SUFFIX: &str = ".tar.gz";

/// 快照文件名：`snapshot_<YYYYmmdd_HHMMSS_mmm>_<tag>.tar.gz`（UTC）
///
/// 时间在前，按名称排序即按时间排序；标签保证同一毫秒内的两次快照不会互相覆盖。
pub fn snapshot_name(at: chrono::DateTime<chrono::Utc>, tag: &str) -> String {
    format!(
        "{}{}_{}{}",
        SNAPSHOT_PREFIX,
        artifact_stamp(at),
        tag,
        SNAPSHOT_SUFFIX
    )
}

#[derive(Clone)]
pub struct SnapshotBuilder {
    scanner: FileScanner,
    transfer: RemoteTransfer,
    snapshot_root: String,
}

impl SnapshotBuilder {
    pub fn new(scanner: FileScanner, transfer: RemoteTransfer, snapshot_root: impl Into<String>) -> Self {
        Self {
            scanner,
            transfer,
            snapshot_root: snapshot_root.into(),
        }
    }

    /// 打包所有未被忽略的文件并一次性上传，返回远程 key
    ///
    /// 任何阶段失败都直接返回错误，远程不会留下不完整的归档。
    pub async fn build(&self) -> Result<String, SyncError> {
        let scan = self.scanner.scan("").await?;
        // 有读不到的目录时不生成残缺的归档
        if let Some(u) = scan.unreadable.first() {
            return Err(SyncError::io(
                self.scanner.absolute(&u.path),
                std::io::Error::other(u.reason.clone()),
            ));
        }
        let files: Vec<LocalFile> = scan.files.into_values().collect();
        let count = files.len();
        let root = self.scanner.root().to_path_buf();

        let archive = tokio::task::spawn_blocking(move || pack(&root, &files))
            .await
            .map_err(|e| SyncError::Backend(format!("打包任务失败: {}", e)))??;

        let key = join_key(&self.snapshot_root, &snapshot_name(chrono::Utc::now(), &unique_tag()));
        let size = archive.len();
        self.transfer.upload(&key, Bytes::from(archive)).await?;
        info!("快照已上传: {} ({} 个文件, {} 字节)", key, count, size);
        Ok(key)
    }
}

/// 按 key 顺序写入 tar 并 gzip 压缩
fn pack(root: &Path, files: &[LocalFile]) -> Result<Vec<u8>, SyncError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for file in files {
        let path: PathBuf = root.join(&file.local_path);
        builder
            .append_path_with_name(&path, &file.local_path)
            .map_err(|e| SyncError::io(&path, e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| SyncError::io(root, e))?;
    encoder.finish().map_err(|e| SyncError::io(root, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sanitizer::PathSanitizer;
    use crate::core::transfer::TransferConfig;
    use crate::storage::{MemoryStore, StorageError, StoreOp};
    use flate2::read::GzDecoder;
    use std::fs;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    fn builder(root: &Path, remote: Arc<MemoryStore>) -> SnapshotBuilder {
        let scanner = FileScanner::new(root, Arc::new(PathSanitizer::default()));
        let transfer = RemoteTransfer::new(
            remote,
            TransferConfig {
                max_retries: 1,
                retry_base_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        SnapshotBuilder::new(scanner, transfer, "vault_snapshots")
    }

    #[test]
    fn snapshot_names_are_utc_timestamps() {
        let at = chrono::DateTime::from_timestamp_millis(1_704_164_645_042).unwrap();
        assert_eq!(
            snapshot_name(at, "0a1b2c3d"),
            "snapshot_20240102_030405_042_0a1b2c3d.tar.gz"
        );
        let later = chrono::DateTime::from_timestamp_millis(1_704_164_645_043).unwrap();
        assert!(snapshot_name(at, "ffffffff") < snapshot_name(later, "00000000"));
    }

    #[tokio::test]
    async fn archive_holds_every_tracked_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/b.md"), "bee").unwrap();
        fs::write(dir.path().join("a.md"), "ay").unwrap();
        fs::write(dir.path().join("scratch.tmp"), "ignored").unwrap();

        let remote = Arc::new(MemoryStore::new());
        let key = builder(dir.path(), remote.clone()).build().await.unwrap();
        assert!(key.starts_with("vault_snapshots/snapshot_"));
        assert!(key.ends_with(".tar.gz"));

        let data = remote.get(&key).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(&data[..]));
        let mut entries = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            entries.push((name, content));
        }
        assert_eq!(
            entries,
            vec![
                ("a.md".to_string(), "ay".to_string()),
                ("notes/b.md".to_string(), "bee".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn back_to_back_snapshots_are_both_kept() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "first").unwrap();

        let remote = Arc::new(MemoryStore::new());
        let snapshots = builder(dir.path(), remote.clone());
        let first = snapshots.build().await.unwrap();
        fs::write(dir.path().join("a.md"), "second").unwrap();
        let second = snapshots.build().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(remote.keys().len(), 2);
    }

    #[tokio::test]
    async fn failed_upload_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "ay").unwrap();

        let remote = Arc::new(MemoryStore::new());
        remote.fail(StoreOp::Upload, None, StorageError::Backend("quota".into()));

        let result = builder(dir.path(), remote.clone()).build().await;
        assert!(matches!(result, Err(SyncError::Backend(_))));
        assert!(remote.keys().is_empty());
    }
}
