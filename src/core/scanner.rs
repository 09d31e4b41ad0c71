use crate::core::sanitizer::{PathSanitizer, Sanitized, SkipReason};
use crate::error::SyncError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 本地文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// 规范 key
    pub key: String,
    /// 相对于库根目录的路径（使用 /）
    pub local_path: String,
    pub mtime: i64,
    pub size: i64,
}

/// 被排除的路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedPath {
    pub path: String,
    pub reason: SkipReason,
}

/// 无法读取的本地路径（目录或文件）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadablePath {
    /// 相对于库根目录的路径，空字符串表示库根目录本身
    pub path: String,
    pub reason: String,
}

impl UnreadablePath {
    /// `local_path` 是否位于这个路径之下（或就是它）
    pub fn covers(&self, local_path: &str) -> bool {
        self.path.is_empty()
            || local_path == self.path
            || local_path
                .strip_prefix(self.path.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// 扫描结果
#[derive(Debug, Default)]
pub struct LocalScan {
    pub files: BTreeMap<String, LocalFile>,
    pub rejected: Vec<RejectedPath>,
    /// 读取失败的路径：其下的文件状态未知，不能当作已删除
    pub unreadable: Vec<UnreadablePath>,
}

/// 读取修改时间（毫秒）和大小
pub fn file_times(metadata: &Metadata) -> (i64, i64) {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64);
    (mtime, metadata.len() as i64)
}

/// 本地目录扫描器
#[derive(Clone)]
pub struct FileScanner {
    root: PathBuf,
    sanitizer: Arc<PathSanitizer>,
}

impl FileScanner {
    pub fn new(root: impl Into<PathBuf>, sanitizer: Arc<PathSanitizer>) -> Self {
        Self {
            root: root.into(),
            sanitizer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sanitizer(&self) -> &PathSanitizer {
        &self.sanitizer
    }

    /// 本地相对路径对应的绝对路径
    pub fn absolute(&self, local_path: &str) -> PathBuf {
        self.root.join(local_path)
    }

    /// 扫描整个库（scope 为空）或其中一个子路径
    pub async fn scan(&self, scope: &str) -> Result<LocalScan, SyncError> {
        let root = self.root.clone();
        if !root.is_dir() {
            return Err(SyncError::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "库目录不存在"),
            ));
        }

        let base = if scope.is_empty() {
            root.clone()
        } else {
            root.join(scope)
        };
        if !base.exists() {
            debug!("扫描范围不存在: {:?}", base);
            return Ok(LocalScan::default());
        }

        let sanitizer = self.sanitizer.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let scan = tokio::task::spawn_blocking(move || walk_tree(&root, &base, &sanitizer))
            .await
            .map_err(|e| SyncError::Backend(format!("扫描任务失败: {}", e)))?;

        info!(
            "扫描完成: {} 个文件, {} 个被排除 (范围: {:?})",
            scan.files.len(),
            scan.rejected.len(),
            if scope.is_empty() { "/" } else { scope }
        );
        Ok(scan)
    }
}

/// 相对于库根目录的路径（使用 /）；不是合法 UTF-8 时为 None
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .and_then(|p| p.to_str())
        .map(|p| p.replace('\\', "/"))
}

fn walk_tree(root: &Path, base: &Path, sanitizer: &PathSanitizer) -> LocalScan {
    let mut scan = LocalScan::default();

    let walker = WalkDir::new(base)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let failed = e.path().unwrap_or(base);
                let path = relative_path(root, failed).unwrap_or_default();
                warn!("遍历目录出错，其下文件本轮不参与删除检测: {:?} - {}", failed, e);
                scan.unreadable.push(UnreadablePath {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(relative) = relative_path(root, entry.path()) else {
            warn!("路径不是合法 UTF-8，跳过: {:?}", entry.path());
            continue;
        };

        let key = match sanitizer.sanitize(&relative) {
            Sanitized::Key(key) => key,
            Sanitized::Skip(reason) => {
                debug!("排除文件: {} ({})", relative, reason);
                scan.rejected.push(RejectedPath {
                    path: relative,
                    reason,
                });
                continue;
            }
        };

        if scan.files.contains_key(&key) {
            warn!("路径映射冲突，跳过: {} -> {}", relative, key);
            scan.rejected.push(RejectedPath {
                path: relative,
                reason: SkipReason::Collision { key },
            });
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("读取元数据失败，跳过: {} - {}", relative, e);
                scan.unreadable.push(UnreadablePath {
                    path: relative,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let (mtime, size) = file_times(&metadata);

        scan.files.insert(
            key.clone(),
            LocalFile {
                key,
                local_path: relative,
                mtime,
                size,
            },
        );
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scanner(root: &Path) -> FileScanner {
        FileScanner::new(root, Arc::new(PathSanitizer::default()))
    }

    #[tokio::test]
    async fn scans_files_and_rejects_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("notes/.obsidian")).unwrap();
        fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        fs::write(dir.path().join("notes/a.md"), "a").unwrap();
        fs::write(dir.path().join("b.md"), "bb").unwrap();
        fs::write(dir.path().join("draft.tmp"), "x").unwrap();
        fs::write(dir.path().join(".obsidian/workspace.json"), "{}").unwrap();
        fs::write(dir.path().join(".obsidian/app.json"), "{}").unwrap();

        let scan = scanner(dir.path()).scan("").await.unwrap();
        let keys: Vec<_> = scan.files.keys().cloned().collect();
        assert_eq!(keys, vec![".obsidian/app.json", "b.md", "notes/a.md"]);
        assert_eq!(scan.files["b.md"].size, 2);
        assert_eq!(scan.rejected.len(), 2);
    }

    #[tokio::test]
    async fn transliterated_paths_keep_local_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("what?.md"), "q").unwrap();

        let scan = scanner(dir.path()).scan("").await.unwrap();
        let file = &scan.files["what_.md"];
        assert_eq!(file.local_path, "what?.md");
    }

    #[tokio::test]
    async fn colliding_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a?.md"), "1").unwrap();
        fs::write(dir.path().join("a_.md"), "2").unwrap();

        let scan = scanner(dir.path()).scan("").await.unwrap();
        assert_eq!(scan.files.len(), 1);
        assert!(matches!(
            scan.rejected[0].reason,
            SkipReason::Collision { .. }
        ));
    }

    #[tokio::test]
    async fn scoped_scan_only_walks_subtree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/a.md"), "a").unwrap();
        fs::write(dir.path().join("b.md"), "b").unwrap();

        let s = scanner(dir.path());
        assert_eq!(s.scan("notes").await.unwrap().files.len(), 1);
        assert_eq!(s.scan("b.md").await.unwrap().files.len(), 1);
        assert!(s.scan("missing.md").await.unwrap().files.is_empty());
    }
}
