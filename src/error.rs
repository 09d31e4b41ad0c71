//! 错误类型定义

use crate::core::sanitizer::SkipReason;
use crate::db::models::FileStatus;
use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// 状态存储错误（对当前同步轮次是致命的）
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("记录数据损坏 ({path}): {reason}")]
    Corrupt { path: String, reason: String },
}

/// 同步错误分类
#[derive(Debug, Error)]
pub enum SyncError {
    /// 网络瞬时错误，可重试
    #[error("网络暂时不可用: {0}")]
    TransientNetwork(String),
    /// 授权过期，在重新授权前暂停所有网络操作
    #[error("远程授权已过期: {0}")]
    AuthExpired(String),
    /// 删除状态机的非法迁移
    #[error("{path} 当前状态为 {actual}，期望 {expected}")]
    InvalidState {
        path: String,
        expected: FileStatus,
        actual: FileStatus,
    },
    #[error("路径被拒绝: {path} ({reason})")]
    PathRejected { path: String, reason: SkipReason },
    #[error("内容冲突: {0}")]
    ContentConflict(String),
    #[error("远程文件不存在: {0}")]
    NotFound(String),
    #[error("存储后端错误: {0}")]
    Backend(String),
    #[error("未跟踪的路径: {0}")]
    UnknownPath(String),
    #[error("读写本地文件失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// 是否值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// 失败类型（用于报告）
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::TransientNetwork(_) => "transient_network",
            SyncError::AuthExpired(_) => "auth_expired",
            SyncError::InvalidState { .. } => "invalid_state",
            SyncError::PathRejected { .. } => "path_rejected",
            SyncError::ContentConflict(_) => "content_conflict",
            SyncError::NotFound(_) => "not_found",
            SyncError::Backend(_) => "backend",
            SyncError::UnknownPath(_) => "unknown_path",
            SyncError::Io { .. } => "io",
            SyncError::Store(_) => "store",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Store(StoreError::Database(e))
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unauthorized(msg) => SyncError::AuthExpired(msg),
            StorageError::NotFound(key) => SyncError::NotFound(key),
            StorageError::RateLimited(msg) => {
                SyncError::TransientNetwork(format!("请求过于频繁: {}", msg))
            }
            StorageError::Network(msg) => SyncError::TransientNetwork(msg),
            StorageError::Backend(msg) => SyncError::Backend(msg),
        }
    }
}
