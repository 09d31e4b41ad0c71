use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 文件记录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Active,
    PendingDeletion,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Active => "active",
            FileStatus::PendingDeletion => "pending_deletion",
            FileStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(FileStatus::Active),
            "pending_deletion" => Some(FileStatus::PendingDeletion),
            "deleted" => Some(FileStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 删除来源：本地消失还是远程消失
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeletionOrigin {
    Local,
    Remote,
}

impl DeletionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionOrigin::Local => "local",
            DeletionOrigin::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(DeletionOrigin::Local),
            "remote" => Some(DeletionOrigin::Remote),
            _ => None,
        }
    }
}

/// 已跟踪文件的最后已知状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// 规范化路径（唯一键，同时是远程 key 的相对部分）
    pub path: String,
    /// 相对于库根目录的本地路径
    pub local_path: String,
    /// 本地修改时间（毫秒）
    pub local_mtime: i64,
    pub local_size: i64,
    /// BLAKE3 内容指纹
    pub content_fingerprint: String,
    /// 远程版本标识；从未上传/下载过时为 None
    pub remote_revision: Option<String>,
    pub status: FileStatus,
    pub deletion_origin: Option<DeletionOrigin>,
    pub status_changed_at: i64,
    pub last_synced_at: i64,
}

impl FileRecord {
    /// 内容版本是否一致（忽略状态字段）
    ///
    /// 对账前用它判断记录是否被并发的同步轮次修改过。
    pub fn same_version(&self, other: &FileRecord) -> bool {
        self.local_path == other.local_path
            && self.local_mtime == other.local_mtime
            && self.local_size == other.local_size
            && self.content_fingerprint == other.content_fingerprint
            && self.remote_revision == other.remote_revision
    }

    pub fn is_active(&self) -> bool {
        self.status == FileStatus::Active
    }
}

/// 等待确认的删除
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeletion {
    pub path: String,
    pub origin: DeletionOrigin,
    pub detected_at: i64,
    pub content_fingerprint: String,
    pub local_size: i64,
}

impl TryFrom<&FileRecord> for PendingDeletion {
    type Error = StoreError;

    fn try_from(record: &FileRecord) -> Result<Self, Self::Error> {
        let origin = record.deletion_origin.ok_or_else(|| StoreError::Corrupt {
            path: record.path.clone(),
            reason: "待删除记录缺少删除来源".to_string(),
        })?;
        Ok(PendingDeletion {
            path: record.path.clone(),
            origin,
            detected_at: record.status_changed_at,
            content_fingerprint: record.content_fingerprint.clone(),
            local_size: record.local_size,
        })
    }
}

/// 同步历史条目
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub id: i64,
    pub pass_id: String,
    pub at: i64,
    pub action: String,
    pub path: String,
    pub status: String,
    pub details: Option<String>,
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecordRow {
    pub path: String,
    pub local_path: String,
    pub local_mtime: i64,
    pub local_size: i64,
    pub content_fingerprint: String,
    pub remote_revision: Option<String>,
    pub status: String,
    pub deletion_origin: Option<String>,
    pub status_changed_at: i64,
    pub last_synced_at: i64,
}

impl TryFrom<FileRecordRow> for FileRecord {
    type Error = StoreError;

    fn try_from(row: FileRecordRow) -> Result<Self, Self::Error> {
        let status = FileStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
            path: row.path.clone(),
            reason: format!("未知状态: {}", row.status),
        })?;
        let deletion_origin = match row.deletion_origin.as_deref() {
            None => None,
            Some(value) => Some(DeletionOrigin::parse(value).ok_or_else(|| {
                StoreError::Corrupt {
                    path: row.path.clone(),
                    reason: format!("未知删除来源: {}", value),
                }
            })?),
        };

        Ok(FileRecord {
            path: row.path,
            local_path: row.local_path,
            local_mtime: row.local_mtime,
            local_size: row.local_size,
            content_fingerprint: row.content_fingerprint,
            remote_revision: row.remote_revision,
            status,
            deletion_origin,
            status_changed_at: row.status_changed_at,
            last_synced_at: row.last_synced_at,
        })
    }
}
