//! 变更检测 - 对比本地目录树、远程列表与状态存储

use crate::core::file_state::hash_file;
use crate::core::scanner::{FileScanner, LocalFile, RejectedPath, UnreadablePath};
use crate::db::models::{DeletionOrigin, FileRecord, FileStatus};
use crate::error::SyncError;
use crate::storage::RemoteEntry;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

/// 本地侧变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChange {
    pub key: String,
    pub local_path: String,
    pub mtime: i64,
    pub size: i64,
    /// 检测时已计算的指纹（新增文件不计算）
    pub fingerprint: Option<String>,
    pub previous: Option<FileRecord>,
}

impl LocalChange {
    pub(crate) fn from_file(file: &LocalFile, fingerprint: Option<String>, previous: Option<&FileRecord>) -> Self {
        Self {
            key: file.key.clone(),
            local_path: file.local_path.clone(),
            mtime: file.mtime,
            size: file.size,
            fingerprint,
            previous: previous.cloned(),
        }
    }
}

/// 远程侧变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub key: String,
    pub local_path: String,
    pub entry: RemoteEntry,
    pub previous: Option<FileRecord>,
    /// 写入前本地文件应处的状态：(mtime, size)，None 表示本地不应存在
    pub expect_local: Option<(i64, i64)>,
}

/// 两侧都有变化（或两侧都有文件但没有共同基线）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCandidate {
    pub local: LocalChange,
    pub remote: RemoteEntry,
    /// 记录中是否有远程基线版本
    pub base_known: bool,
}

/// 一轮同步的差异
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiff {
    pub added: BTreeMap<String, LocalChange>,
    pub modified: BTreeMap<String, LocalChange>,
    /// 只有元数据变化（内容指纹相同）
    pub touched: BTreeMap<String, LocalChange>,
    /// 待删除记录对应的文件重新出现在本地
    pub reappeared: BTreeMap<String, LocalChange>,
    pub removed_locally: BTreeMap<String, FileRecord>,
    pub remote_added: BTreeMap<String, RemoteChange>,
    pub remote_modified: BTreeMap<String, RemoteChange>,
    /// 远程来源的待删除记录对应的对象重新出现在远程
    pub remote_reappeared: BTreeMap<String, FileRecord>,
    pub removed_remotely: BTreeMap<String, FileRecord>,
    /// 从未同步到远程、远程也不存在的记录
    pub unsynced: BTreeMap<String, FileRecord>,
    pub conflicts: BTreeMap<String, ConflictCandidate>,
    pub rejected: Vec<RejectedPath>,
    /// 本轮无法读取的本地路径
    pub unreadable: Vec<UnreadablePath>,
    /// 本轮扫描到的本地文件
    #[serde(skip)]
    pub local_files: BTreeMap<String, LocalFile>,
}

impl SyncDiff {
    /// 是否没有任何需要处理的变化（被排除的路径不算）
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.touched.is_empty()
            && self.reappeared.is_empty()
            && self.removed_locally.is_empty()
            && self.remote_added.is_empty()
            && self.remote_modified.is_empty()
            && self.remote_reappeared.is_empty()
            && self.removed_remotely.is_empty()
            && self.unsynced.is_empty()
            && self.conflicts.is_empty()
    }
}

/// 变更检测器
#[derive(Clone)]
pub struct ChangeDetector {
    scanner: FileScanner,
}

impl ChangeDetector {
    pub fn new(scanner: FileScanner) -> Self {
        Self { scanner }
    }

    pub fn scanner(&self) -> &FileScanner {
        &self.scanner
    }

    /// 扫描本地目录（或其中一个子路径）并与记录对比
    ///
    /// `previous` 必须已经限定在同一范围内。先比较 (mtime, size)，不同才计算指纹，
    /// 只有指纹不同才算修改。
    pub async fn detect(
        &self,
        previous: &HashMap<String, FileRecord>,
        scope: &str,
    ) -> Result<SyncDiff, SyncError> {
        let scan = self.scanner.scan(scope).await?;
        let mut diff = SyncDiff {
            rejected: scan.rejected,
            ..Default::default()
        };

        for (key, file) in &scan.files {
            let record = match previous.get(key) {
                None => {
                    diff.added
                        .insert(key.clone(), LocalChange::from_file(file, None, None));
                    continue;
                }
                Some(record) if record.status == FileStatus::Deleted => {
                    diff.added.insert(
                        key.clone(),
                        LocalChange::from_file(file, None, Some(record)),
                    );
                    continue;
                }
                Some(record) => record,
            };

            let metadata_same =
                record.local_mtime == file.mtime && record.local_size == file.size;
            let fingerprint = if metadata_same {
                record.content_fingerprint.clone()
            } else {
                self.fingerprint(&file.local_path).await?
            };
            let content_same = fingerprint == record.content_fingerprint;
            let change = LocalChange::from_file(file, Some(fingerprint), Some(record));

            match record.status {
                FileStatus::Active => {
                    if metadata_same {
                        continue;
                    }
                    if content_same {
                        debug!("仅元数据变化: {}", key);
                        diff.touched.insert(key.clone(), change);
                    } else {
                        debug!("内容已修改: {}", key);
                        diff.modified.insert(key.clone(), change);
                    }
                }
                FileStatus::PendingDeletion => {
                    let origin = record.deletion_origin.unwrap_or(DeletionOrigin::Local);
                    if !content_same {
                        diff.modified.insert(key.clone(), change.clone());
                        diff.reappeared.insert(key.clone(), change);
                    } else if origin == DeletionOrigin::Local {
                        diff.reappeared.insert(key.clone(), change);
                    }
                }
                // 已在上面按新增处理
                FileStatus::Deleted => {}
            }
        }

        collect_removed(&mut diff, previous, &scan.files, &scan.unreadable);

        diff.unreadable = scan.unreadable;
        diff.local_files = scan.files;
        Ok(diff)
    }

    /// 把远程列表（key 已去掉远程根前缀）合并进差异
    pub fn diff_remote(
        &self,
        diff: &mut SyncDiff,
        previous: &HashMap<String, FileRecord>,
        remote: &BTreeMap<String, RemoteEntry>,
    ) {
        for (key, entry) in remote {
            match previous.get(key) {
                None => fold_untracked_remote(diff, key, entry, None),
                Some(record) if record.status == FileStatus::Deleted => {
                    fold_untracked_remote(diff, key, entry, Some(record))
                }
                Some(record) if record.status == FileStatus::PendingDeletion => {
                    if record.deletion_origin == Some(DeletionOrigin::Remote) {
                        diff.remote_reappeared.insert(key.clone(), record.clone());
                        if record.remote_revision.as_deref() != Some(entry.revision.as_str()) {
                            fold_remote_change(diff, key, entry, record, true);
                        }
                    }
                    // 本地删除意图优先：远程旧副本不会被下载
                }
                Some(record) => match record.remote_revision.as_deref() {
                    Some(revision) if revision == entry.revision => {}
                    Some(_) => fold_remote_change(diff, key, entry, record, true),
                    None => fold_remote_change(diff, key, entry, record, false),
                },
            }
        }

        for (key, record) in previous {
            if !record.is_active() || remote.contains_key(key) {
                continue;
            }
            let local_present = diff.local_files.contains_key(key);
            if !local_present || diff.modified.contains_key(key) {
                continue;
            }
            if record.remote_revision.is_some() {
                debug!("远程已消失: {}", key);
                diff.removed_remotely.insert(key.clone(), record.clone());
            } else {
                diff.unsynced.insert(key.clone(), record.clone());
            }
        }
    }

    async fn fingerprint(&self, local_path: &str) -> Result<String, SyncError> {
        let path: PathBuf = self.scanner.absolute(local_path);
        let target = path.clone();
        tokio::task::spawn_blocking(move || hash_file(&target))
            .await
            .map_err(|e| SyncError::Backend(format!("计算指纹任务失败: {}", e)))?
            .map_err(|e| SyncError::io(path, e))
    }
}

/// 记录里 active 但本轮没扫描到的文件；位于读取失败范围内的不算消失
fn collect_removed(
    diff: &mut SyncDiff,
    previous: &HashMap<String, FileRecord>,
    files: &BTreeMap<String, LocalFile>,
    unreadable: &[UnreadablePath],
) {
    for (key, record) in previous {
        if !record.is_active() || files.contains_key(key) {
            continue;
        }
        if unreadable.iter().any(|u| u.covers(&record.local_path)) {
            warn!("无法读取，不视为删除: {}", key);
            continue;
        }
        debug!("本地已消失: {}", key);
        diff.removed_locally.insert(key.clone(), record.clone());
    }
}

/// 远程存在、本地没有有效记录
fn fold_untracked_remote(
    diff: &mut SyncDiff,
    key: &str,
    entry: &RemoteEntry,
    previous: Option<&FileRecord>,
) {
    if let Some(local) = diff.added.remove(key) {
        diff.conflicts.insert(
            key.to_string(),
            ConflictCandidate {
                local,
                remote: entry.clone(),
                base_known: false,
            },
        );
        return;
    }
    diff.remote_added.insert(
        key.to_string(),
        RemoteChange {
            key: key.to_string(),
            local_path: previous.map_or_else(|| key.to_string(), |r| r.local_path.clone()),
            entry: entry.clone(),
            previous: previous.cloned(),
            expect_local: None,
        },
    );
}

/// 远程版本与记录不一致（或记录没有远程基线）
fn fold_remote_change(
    diff: &mut SyncDiff,
    key: &str,
    entry: &RemoteEntry,
    record: &FileRecord,
    base_known: bool,
) {
    if let Some(local) = diff.modified.remove(key) {
        diff.conflicts.insert(
            key.to_string(),
            ConflictCandidate {
                local,
                remote: entry.clone(),
                base_known,
            },
        );
        return;
    }

    // 远程修改优先于本地删除：下载远程版本，不丢数据
    if diff.removed_locally.remove(key).is_some() {
        diff.remote_modified.insert(
            key.to_string(),
            RemoteChange {
                key: key.to_string(),
                local_path: record.local_path.clone(),
                entry: entry.clone(),
                previous: Some(record.clone()),
                expect_local: None,
            },
        );
        return;
    }

    let Some(file) = diff.local_files.get(key) else {
        return;
    };

    if !base_known {
        // 两侧都有文件但没有共同基线，交给冲突处理（内容相同时只建立关联）
        let local = diff.touched.remove(key).unwrap_or_else(|| {
            LocalChange::from_file(
                file,
                Some(record.content_fingerprint.clone()),
                Some(record),
            )
        });
        diff.conflicts.insert(
            key.to_string(),
            ConflictCandidate {
                local,
                remote: entry.clone(),
                base_known: false,
            },
        );
        return;
    }

    diff.touched.remove(key);
    diff.remote_modified.insert(
        key.to_string(),
        RemoteChange {
            key: key.to_string(),
            local_path: record.local_path.clone(),
            entry: entry.clone(),
            previous: Some(record.clone()),
            expect_local: Some((file.mtime, file.size)),
        },
    );
}
