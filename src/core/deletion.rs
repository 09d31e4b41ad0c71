//! 删除跟踪 - 把"消失"观察转换为待确认的删除队列
//!
//! 状态机：`active -> pending_deletion -> {deleted | active}`。任何删除都不会在
//! 检测时直接执行，只有确认（或全量同步时的自动确认）才会真正删除。

use crate::core::detector::SyncDiff;
use crate::core::file_state::{calculate_hash, PendingTransition, StateStore};
use crate::core::history::SyncHistory;
use crate::core::local_io::{local_state, move_to_trash, read_local, write_atomic};
use crate::core::report::{ItemAction, SyncReport};
use crate::core::scanner::FileScanner;
use crate::core::transfer::RemoteTransfer;
use crate::db::models::{DeletionOrigin, FileRecord, FileStatus, PendingDeletion};
use crate::error::SyncError;
use crate::storage::join_key;
use tracing::{info, warn};

#[derive(Clone)]
pub struct DeletionTracker {
    store: StateStore,
    transfer: RemoteTransfer,
    history: SyncHistory,
    scanner: FileScanner,
    remote_root: String,
}

impl DeletionTracker {
    pub fn new(
        store: StateStore,
        transfer: RemoteTransfer,
        history: SyncHistory,
        scanner: FileScanner,
        remote_root: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transfer,
            history,
            scanner,
            remote_root: remote_root.into(),
        }
    }

    /// 处理一轮差异中的消失与重新出现
    ///
    /// 存储错误会中止本轮，其它错误记录在报告里。
    pub async fn apply(
        &self,
        diff: &SyncDiff,
        auto_confirm: bool,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let pass_id = report.pass_id.clone();

        for (key, record) in &diff.removed_locally {
            let result = self
                .observe_absence(record, DeletionOrigin::Local, auto_confirm)
                .await;
            self.settle(&pass_id, report, key, result).await?;
        }

        for (key, record) in &diff.removed_remotely {
            let result = self
                .observe_absence(record, DeletionOrigin::Remote, auto_confirm)
                .await;
            self.settle(&pass_id, report, key, result).await?;
        }

        for (key, change) in &diff.reappeared {
            let content_changed = diff.modified.contains_key(key);
            let result = self
                .reactivate(key, change.previous.as_ref(), |current| {
                    // 内容变化时保留旧基线，由本轮对账上传新内容
                    if !content_changed {
                        current.local_mtime = change.mtime;
                        current.local_size = change.size;
                    }
                })
                .await;
            self.settle(&pass_id, report, key, result).await?;
        }

        for (key, record) in &diff.remote_reappeared {
            let result = self.reactivate(key, Some(record), |_| {}).await;
            self.settle(&pass_id, report, key, result).await?;
        }

        Ok(())
    }

    /// 当前待删除队列（按检测时间排序）
    pub async fn pending(&self) -> Result<Vec<PendingDeletion>, SyncError> {
        Ok(self.store.pending_deletions().await?)
    }

    /// 确认删除：pending_deletion -> deleted
    pub async fn confirm(&self, key: &str) -> Result<ItemAction, SyncError> {
        let _guard = self.store.lock(key).await;
        let record = self.expect_pending(key).await?;
        self.confirm_locked(&record).await
    }

    /// 撤销删除：pending_deletion -> active
    pub async fn restore(&self, key: &str) -> Result<ItemAction, SyncError> {
        let _guard = self.store.lock(key).await;
        let record = self.expect_pending(key).await?;
        let origin = record.deletion_origin.unwrap_or(DeletionOrigin::Local);
        let path = self.scanner.absolute(&record.local_path);
        let mut refreshed = record.clone();

        match origin {
            DeletionOrigin::Local => {
                let data = self.transfer.download(&self.remote_key(key)).await?;
                let fingerprint = calculate_hash(&data);
                if fingerprint != record.content_fingerprint {
                    warn!("恢复的内容与记录的指纹不一致，以实际内容为准: {}", key);
                }
                let (mtime, size) = write_atomic(&path, &data).await?;
                refreshed.local_mtime = mtime;
                refreshed.local_size = size;
                refreshed.content_fingerprint = fingerprint;
            }
            DeletionOrigin::Remote => {
                let (data, mtime, size) = read_local(&path).await?;
                refreshed.content_fingerprint = calculate_hash(&data);
                let revision = self.transfer.upload(&self.remote_key(key), data).await?;
                refreshed.local_mtime = mtime;
                refreshed.local_size = size;
                refreshed.remote_revision = Some(revision);
            }
        }

        refreshed.last_synced_at = chrono::Utc::now().timestamp_millis();
        self.store.mark_active(&refreshed).await?;
        info!("已恢复: {} (来源: {})", key, origin.as_str());
        Ok(ItemAction::Restored)
    }

    async fn expect_pending(&self, key: &str) -> Result<FileRecord, SyncError> {
        let record = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| SyncError::UnknownPath(key.to_string()))?;
        if record.status != FileStatus::PendingDeletion {
            return Err(SyncError::InvalidState {
                path: key.to_string(),
                expected: FileStatus::PendingDeletion,
                actual: record.status,
            });
        }
        Ok(record)
    }

    /// 调用方必须持有该 key 的锁
    async fn confirm_locked(&self, record: &FileRecord) -> Result<ItemAction, SyncError> {
        let key = &record.path;
        let action = match record.deletion_origin.unwrap_or(DeletionOrigin::Local) {
            DeletionOrigin::Local => {
                self.transfer.delete(&self.remote_key(key)).await?;
                ItemAction::DeletedRemote
            }
            DeletionOrigin::Remote => {
                let trash_path = move_to_trash(self.scanner.root(), &record.local_path).await?;
                ItemAction::TrashedLocal { trash_path }
            }
        };
        self.store.mark_deleted(key).await?;
        info!("删除已确认: {} ({})", key, action.name());
        Ok(action)
    }

    async fn observe_absence(
        &self,
        observed: &FileRecord,
        origin: DeletionOrigin,
        auto_confirm: bool,
    ) -> Result<Option<ItemAction>, SyncError> {
        let key = &observed.path;
        let _guard = self.store.lock(key).await;

        match self.store.get(key).await? {
            Some(current) if current.is_active() && current.same_version(observed) => {}
            Some(current) if current.status == FileStatus::PendingDeletion => {
                return Ok(None);
            }
            _ => return Ok(Some(ItemAction::SkippedStale)),
        }

        // 本地消失的文件又出现了，留给下一轮
        let local = local_state(&self.scanner.absolute(&observed.local_path)).await?;
        if origin == DeletionOrigin::Local && local.is_some() {
            return Ok(Some(ItemAction::SkippedStale));
        }

        if self.store.mark_pending_deletion(key, origin).await? == PendingTransition::AlreadyPending {
            return Ok(None);
        }
        info!("检测到删除，等待确认: {} (来源: {})", key, origin.as_str());

        if !auto_confirm {
            return Ok(Some(ItemAction::MarkedPending));
        }
        let pending = self.expect_pending(key).await?;
        self.confirm_locked(&pending).await.map(Some)
    }

    async fn reactivate<F>(
        &self,
        key: &str,
        observed: Option<&FileRecord>,
        refresh: F,
    ) -> Result<Option<ItemAction>, SyncError>
    where
        F: FnOnce(&mut FileRecord),
    {
        let _guard = self.store.lock(key).await;
        let Some(mut current) = self.store.get(key).await? else {
            return Ok(Some(ItemAction::SkippedStale));
        };
        if current.status != FileStatus::PendingDeletion
            || observed.is_some_and(|o| !o.same_version(&current))
        {
            return Ok(Some(ItemAction::SkippedStale));
        }

        refresh(&mut current);
        self.store.mark_active(&current).await?;
        info!("重新出现，取消待删除: {}", key);
        Ok(Some(ItemAction::Reactivated))
    }

    async fn settle(
        &self,
        pass_id: &str,
        report: &mut SyncReport,
        key: &str,
        result: Result<Option<ItemAction>, SyncError>,
    ) -> Result<(), SyncError> {
        let Some(result) = result.transpose() else {
            return Ok(());
        };
        match &result {
            Ok(action) => {
                let status = if action.is_skip() { "skipped" } else { "success" };
                self.history
                    .log(pass_id, action.name(), key, status, None)
                    .await;
            }
            Err(e) => {
                warn!("删除处理失败: {} - {}", key, e);
                self.history
                    .log(pass_id, "deletion", key, "failed", Some(&e.to_string()))
                    .await;
            }
        }
        report.settle(key, result)?;
        Ok(())
    }

    fn remote_key(&self, key: &str) -> String {
        join_key(&self.remote_root, key)
    }
}
