//! 同步报告

use crate::core::conflict::ConflictSide;
use crate::db::models::PendingDeletion;
use crate::error::{StoreError, SyncError};
use serde::Serialize;

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    InitTracking,
    FullSync,
    PushLocal,
    PullRemote,
    SyncPath,
    CheckDeletions,
    ConfirmDeletion,
    RestoreDeletion,
    Snapshot,
}

/// 单个条目上执行的动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemAction {
    Tracked,
    Uploaded,
    Downloaded,
    /// 远程已有相同内容，只建立关联
    Linked,
    MetadataRefreshed,
    ConflictResolved { winner: ConflictSide, artifact: String },
    MarkedPending,
    Reactivated,
    DeletedRemote,
    /// 本地文件已移入回收站（本地已不存在时为 None）
    TrashedLocal { trash_path: Option<String> },
    Restored,
    SnapshotUploaded,
    /// 存在待删除记录，跳过下载
    SkippedSuperseded,
    /// 检测后记录或本地文件被并发修改，留给下一轮
    SkippedStale,
}

impl ItemAction {
    pub fn name(&self) -> &'static str {
        match self {
            ItemAction::Tracked => "tracked",
            ItemAction::Uploaded => "uploaded",
            ItemAction::Downloaded => "downloaded",
            ItemAction::Linked => "linked",
            ItemAction::MetadataRefreshed => "metadata_refreshed",
            ItemAction::ConflictResolved { .. } => "conflict_resolved",
            ItemAction::MarkedPending => "marked_pending",
            ItemAction::Reactivated => "reactivated",
            ItemAction::DeletedRemote => "deleted_remote",
            ItemAction::TrashedLocal { .. } => "trashed_local",
            ItemAction::Restored => "restored",
            ItemAction::SnapshotUploaded => "snapshot_uploaded",
            ItemAction::SkippedSuperseded => "skipped_superseded",
            ItemAction::SkippedStale => "skipped_stale",
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ItemAction::SkippedSuperseded | ItemAction::SkippedStale
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub path: String,
    pub action: ItemAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub path: String,
    pub kind: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(path: impl Into<String>, error: &SyncError) -> Self {
        Self {
            path: path.into(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

/// 同步报告（即使部分失败也总会返回）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub operation: Operation,
    pub pass_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub processed: Vec<ItemOutcome>,
    pub failed: Vec<ItemFailure>,
    /// 被规范化规则排除的路径数
    pub rejected: usize,
    pub pending_deletions: Vec<PendingDeletion>,
    /// 阻止本轮继续的条件（例如授权过期）
    pub blocked: Option<String>,
    /// 生成的远程产物（快照）
    pub artifact: Option<String>,
}

impl SyncReport {
    pub fn begin(operation: Operation) -> Self {
        Self {
            operation,
            pass_id: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
            finished_at: 0,
            processed: Vec::new(),
            failed: Vec::new(),
            rejected: 0,
            pending_deletions: Vec::new(),
            blocked: None,
            artifact: None,
        }
    }

    pub fn record(&mut self, path: impl Into<String>, action: ItemAction) {
        self.processed.push(ItemOutcome {
            path: path.into(),
            action,
        });
    }

    pub fn fail(&mut self, path: impl Into<String>, error: &SyncError) {
        if let SyncError::AuthExpired(msg) = error {
            self.block(msg.clone());
        }
        self.failed.push(ItemFailure::new(path, error));
    }

    /// 记录单个条目的结果；存储错误向上传递以中止本轮
    pub fn settle(
        &mut self,
        path: &str,
        result: Result<ItemAction, SyncError>,
    ) -> Result<(), StoreError> {
        match result {
            Ok(action) => self.record(path, action),
            Err(SyncError::Store(e)) => return Err(e),
            Err(e) => self.fail(path, &e),
        }
        Ok(())
    }

    /// 标记阻塞条件（只记录第一次）
    pub fn block(&mut self, reason: impl Into<String>) {
        if self.blocked.is_none() {
            self.blocked = Some(reason.into());
        }
    }

    /// 合并另一份报告的条目
    pub fn absorb(&mut self, other: SyncReport) {
        self.processed.extend(other.processed);
        self.failed.extend(other.failed);
        self.rejected += other.rejected;
        if let Some(reason) = other.blocked {
            self.block(reason);
        }
        if other.artifact.is_some() {
            self.artifact = other.artifact;
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = chrono::Utc::now().timestamp_millis();
        self
    }

    /// 某种动作的条目数
    pub fn count(&self, name: &str) -> usize {
        self.processed
            .iter()
            .filter(|o| o.action.name() == name)
            .count()
    }

    /// 是否有实际变更（跳过的条目不算）
    pub fn changed_anything(&self) -> bool {
        self.processed.iter().any(|o| !o.action.is_skip())
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_none()
    }
}
