//! 同步引擎 - 对外的操作入口

use crate::config::{ConfigError, VaultConfig};
use crate::core::deletion::DeletionTracker;
use crate::core::detector::ChangeDetector;
use crate::core::file_state::{hash_file, SeedEntry, StateStore};
use crate::core::history::SyncHistory;
use crate::core::reconciler::{Direction, ReconcilePolicy, Reconciler};
use crate::core::report::{ItemAction, Operation, SyncReport};
use crate::core::sanitizer::{PathSanitizer, Sanitized};
use crate::core::scanner::{FileScanner, UnreadablePath};
use crate::core::snapshot::SnapshotBuilder;
use crate::core::transfer::{RemoteTransfer, TransferConfig};
use crate::core::watch::PathSync;
use crate::db::models::{PendingDeletion, SyncHistoryEntry};
use crate::error::SyncError;
use crate::storage::{join_key, strip_root, RemoteEntry, RemoteStore};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 同步引擎
///
/// 所有操作都返回 [`SyncReport`]；只有状态存储失败（以及删除确认/恢复时的非法状态）
/// 作为 `Err` 返回。
#[derive(Clone)]
pub struct SyncEngine {
    config: VaultConfig,
    store: StateStore,
    sanitizer: Arc<PathSanitizer>,
    scanner: FileScanner,
    detector: ChangeDetector,
    transfer: RemoteTransfer,
    tracker: DeletionTracker,
    reconciler: Reconciler,
    snapshots: SnapshotBuilder,
    history: SyncHistory,
}

impl SyncEngine {
    pub fn new(
        config: VaultConfig,
        db: SqlitePool,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, ConfigError> {
        let sanitizer = Arc::new(
            PathSanitizer::with_patterns(&config.ignore_patterns)
                .map_err(|e| ConfigError::Invalid(format!("忽略规则无效: {}", e)))?,
        );
        let store = StateStore::new(db.clone());
        let history = SyncHistory::new(db);
        let scanner = FileScanner::new(config.vault_root.clone(), sanitizer.clone());
        let transfer = RemoteTransfer::new(remote, TransferConfig::from(&config));

        let tracker = DeletionTracker::new(
            store.clone(),
            transfer.clone(),
            history.clone(),
            scanner.clone(),
            config.remote_root.clone(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            transfer.clone(),
            history.clone(),
            scanner.clone(),
            config.remote_root.clone(),
            config.conflict_root.clone(),
            config.max_concurrent_transfers,
        );
        let snapshots = SnapshotBuilder::new(
            scanner.clone(),
            transfer.clone(),
            config.snapshot_root.clone(),
        );

        info!(
            "同步引擎已创建: {:?} <-> {}/{}",
            config.vault_root,
            transfer.store_name(),
            config.remote_root
        );

        Ok(Self {
            config,
            store,
            sanitizer,
            detector: ChangeDetector::new(scanner.clone()),
            scanner,
            transfer,
            tracker,
            reconciler,
            snapshots,
            history,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// 用现有目录树初始化跟踪记录，不访问远程
    pub async fn init_tracking(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::begin(Operation::InitTracking);
        let scan = match self.scanner.scan("").await {
            Ok(scan) => scan,
            Err(e) => return self.abort(report, "", e).await,
        };
        report.rejected = scan.rejected.len();
        self.report_unreadable(&mut report, &scan.unreadable);

        let existing = self.store.all().await?;
        let root = self.scanner.root().to_path_buf();
        let fresh: Vec<_> = scan
            .files
            .into_values()
            .filter(|file| !existing.contains_key(&file.key))
            .collect();

        let hashed = tokio::task::spawn_blocking(move || {
            fresh
                .into_iter()
                .map(|file| {
                    let fingerprint = hash_file(&root.join(&file.local_path));
                    (file, fingerprint)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SyncError::Backend(format!("计算指纹任务失败: {}", e)))?;

        let mut seeds = Vec::with_capacity(hashed.len());
        for (file, fingerprint) in hashed {
            match fingerprint {
                Ok(content_fingerprint) => seeds.push(SeedEntry {
                    path: file.key,
                    local_path: file.local_path,
                    local_mtime: file.mtime,
                    local_size: file.size,
                    content_fingerprint,
                }),
                Err(e) => {
                    let err = SyncError::io(self.scanner.absolute(&file.local_path), e);
                    report.fail(file.key, &err);
                }
            }
        }

        self.store.initialize_from_existing_tree(&seeds).await?;
        for seed in &seeds {
            report.record(seed.path.clone(), ItemAction::Tracked);
        }
        self.history
            .log(
                &report.pass_id,
                "init_tracking",
                "",
                "success",
                Some(&format!("{} 个文件", seeds.len())),
            )
            .await;

        report.pending_deletions = self.store.pending_deletions().await?;
        Ok(report.finish())
    }

    /// 双向全量同步（允许自动确认删除）
    pub async fn full_sync(&self) -> Result<SyncReport, SyncError> {
        self.run_pass(
            Operation::FullSync,
            "",
            "",
            Direction::Both,
            self.config.auto_confirm_deletions,
        )
        .await
    }

    /// 只把本地变化推送到远程
    pub async fn push_local(&self) -> Result<SyncReport, SyncError> {
        self.run_pass(Operation::PushLocal, "", "", Direction::PushOnly, false)
            .await
    }

    /// 只把远程变化拉取到本地
    pub async fn pull_remote(&self) -> Result<SyncReport, SyncError> {
        self.run_pass(Operation::PullRemote, "", "", Direction::PullOnly, false)
            .await
    }

    /// 单个路径（文件或目录）的双向同步，由实时监听触发
    pub async fn sync_path(&self, relative: &str) -> Result<SyncReport, SyncError> {
        let scan_scope = relative.replace('\\', "/");
        let scan_scope = scan_scope.trim_matches('/');
        match self.sanitizer.sanitize(scan_scope) {
            Sanitized::Key(key) => {
                self.run_pass(Operation::SyncPath, scan_scope, &key, Direction::Both, false)
                    .await
            }
            Sanitized::Skip(reason) => {
                debug!(
                    "{}",
                    SyncError::PathRejected {
                        path: relative.to_string(),
                        reason,
                    }
                );
                let mut report = SyncReport::begin(Operation::SyncPath);
                report.rejected = 1;
                Ok(report.finish())
            }
        }
    }

    /// 只检查本地删除（不访问远程），返回待确认队列
    pub async fn check_deletions(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::begin(Operation::CheckDeletions);
        let previous = self.store.all().await?;
        let diff = match self.detector.detect(&previous, "").await {
            Ok(diff) => diff,
            Err(e) => return self.abort(report, "", e).await,
        };
        report.rejected = diff.rejected.len();
        self.report_unreadable(&mut report, &diff.unreadable);

        self.tracker.apply(&diff, false, &mut report).await?;
        report.pending_deletions = self.store.pending_deletions().await?;
        info!("删除检查完成: {} 个待确认", report.pending_deletions.len());
        Ok(report.finish())
    }

    /// 确认一个待删除条目
    pub async fn confirm_deletion(&self, path: &str) -> Result<SyncReport, SyncError> {
        let key = self.resolve_key(path)?;
        let mut report = SyncReport::begin(Operation::ConfirmDeletion);
        let result = self.tracker.confirm(&key).await;
        self.settle_explicit(&mut report, &key, "confirm_deletion", result)
            .await?;
        report.pending_deletions = self.store.pending_deletions().await?;
        Ok(report.finish())
    }

    /// 撤销一个待删除条目
    pub async fn restore_deletion(&self, path: &str) -> Result<SyncReport, SyncError> {
        let key = self.resolve_key(path)?;
        let mut report = SyncReport::begin(Operation::RestoreDeletion);
        let result = self.tracker.restore(&key).await;
        self.settle_explicit(&mut report, &key, "restore_deletion", result)
            .await?;
        report.pending_deletions = self.store.pending_deletions().await?;
        Ok(report.finish())
    }

    /// 打包整个库并上传快照
    pub async fn snapshot(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::begin(Operation::Snapshot);
        match self.snapshots.build().await {
            Ok(key) => {
                self.history
                    .log(&report.pass_id, "snapshot_uploaded", &key, "success", None)
                    .await;
                report.record(key.clone(), ItemAction::SnapshotUploaded);
                report.artifact = Some(key);
            }
            Err(SyncError::Store(e)) => return Err(SyncError::Store(e)),
            Err(e) => {
                error!("快照失败: {}", e);
                self.history
                    .log(&report.pass_id, "snapshot", "", "failed", Some(&e.to_string()))
                    .await;
                report.fail(self.config.snapshot_root.clone(), &e);
            }
        }
        report.pending_deletions = self.store.pending_deletions().await?;
        Ok(report.finish())
    }

    pub async fn pending_deletions(&self) -> Result<Vec<PendingDeletion>, SyncError> {
        self.tracker.pending().await
    }

    /// 最近的同步历史（新的在前）
    pub async fn history(&self, limit: u32) -> Result<Vec<SyncHistoryEntry>, SyncError> {
        Ok(self.history.recent(limit).await?)
    }

    /// 重新授权后恢复网络操作
    pub fn resume_network(&self) {
        if self.transfer.is_halted() {
            info!("恢复网络操作");
        }
        self.transfer.resume();
    }

    pub fn is_network_halted(&self) -> bool {
        self.transfer.is_halted()
    }

    /// 一轮同步：检测 -> 列出远程 -> 合并差异 -> 删除跟踪 -> 对账
    ///
    /// `scan_scope` 是磁盘上的相对路径，`key_scope` 是它的规范 key。
    async fn run_pass(
        &self,
        operation: Operation,
        scan_scope: &str,
        key_scope: &str,
        direction: Direction,
        auto_confirm: bool,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::begin(operation);
        info!(
            "开始同步: {:?} (范围: {:?}, pass: {})",
            operation,
            if key_scope.is_empty() { "/" } else { key_scope },
            report.pass_id
        );

        if self.transfer.is_halted() {
            report.block("远程授权已过期，等待重新授权");
            report.pending_deletions = self.store.pending_deletions().await?;
            warn!("授权已过期，跳过本轮同步");
            return Ok(report.finish());
        }

        let previous = self.store.in_scope(key_scope).await?;
        let mut diff = match self.detector.detect(&previous, scan_scope).await {
            Ok(diff) => diff,
            Err(e) => return self.abort(report, key_scope, e).await,
        };
        for rejected in &diff.rejected {
            debug!("路径被排除: {} ({})", rejected.path, rejected.reason);
        }
        report.rejected = diff.rejected.len();
        self.report_unreadable(&mut report, &diff.unreadable);

        let listing = match self.list_remote(key_scope, &mut report).await {
            Ok(listing) => listing,
            Err(e) => return self.abort(report, key_scope, e).await,
        };
        self.detector.diff_remote(&mut diff, &previous, &listing);

        self.tracker.apply(&diff, auto_confirm, &mut report).await?;

        let superseded = self.store.pending_keys().await?;
        let policy = ReconcilePolicy::new(direction).with_superseded(superseded);
        let reconciled = self
            .reconciler
            .reconcile(operation, &report.pass_id, &diff, &policy)
            .await?;
        report.absorb(reconciled);

        report.pending_deletions = self.store.pending_deletions().await?;
        let report = report.finish();
        info!(
            "同步完成: {} 个条目, {} 个失败, {} 个被排除, {} 个待确认删除",
            report.processed.len(),
            report.failed.len(),
            report.rejected,
            report.pending_deletions.len()
        );
        Ok(report)
    }

    /// 列出远程（去掉远程根前缀）；非规范的 key 计入排除数
    async fn list_remote(
        &self,
        key_scope: &str,
        report: &mut SyncReport,
    ) -> Result<BTreeMap<String, RemoteEntry>, SyncError> {
        let root = &self.config.remote_root;
        let entries = self.transfer.list(&join_key(root, key_scope)).await?;

        let mut listing = BTreeMap::new();
        for entry in entries {
            let Some(relative) = strip_root(root, &entry.key) else {
                continue;
            };
            match self.sanitizer.sanitize(relative) {
                Sanitized::Key(key) if key == relative => {
                    listing.insert(key, entry);
                }
                Sanitized::Key(canonical) => {
                    debug!("远程 key 不是规范形式，跳过: {} (规范: {})", relative, canonical);
                    report.rejected += 1;
                }
                Sanitized::Skip(reason) => {
                    debug!("远程 key 被排除: {} ({})", relative, reason);
                    report.rejected += 1;
                }
            }
        }
        Ok(listing)
    }

    /// 非存储错误：记入报告后结束本轮
    async fn abort(
        &self,
        mut report: SyncReport,
        scope: &str,
        err: SyncError,
    ) -> Result<SyncReport, SyncError> {
        if let SyncError::Store(e) = err {
            return Err(SyncError::Store(e));
        }
        error!("同步中止: {}", err);
        self.history
            .log(&report.pass_id, "pass", scope, "failed", Some(&err.to_string()))
            .await;
        report.fail(scope, &err);
        report.pending_deletions = self.store.pending_deletions().await?;
        Ok(report.finish())
    }

    /// 读取失败的本地路径记为失败条目；它们下面的记录本轮保持不变
    fn report_unreadable(&self, report: &mut SyncReport, unreadable: &[UnreadablePath]) {
        for u in unreadable {
            let err = SyncError::io(
                self.scanner.absolute(&u.path),
                std::io::Error::other(u.reason.clone()),
            );
            report.fail(u.path.clone(), &err);
        }
    }

    fn resolve_key(&self, path: &str) -> Result<String, SyncError> {
        match self.sanitizer.sanitize(path) {
            Sanitized::Key(key) => Ok(key),
            Sanitized::Skip(_) => Err(SyncError::UnknownPath(path.to_string())),
        }
    }

    /// 显式操作：状态机错误返回给调用方，网络和本地错误记入报告
    async fn settle_explicit(
        &self,
        report: &mut SyncReport,
        key: &str,
        action: &str,
        result: Result<ItemAction, SyncError>,
    ) -> Result<(), SyncError> {
        match result {
            Ok(item) => {
                self.history
                    .log(&report.pass_id, item.name(), key, "success", None)
                    .await;
                report.record(key, item);
                Ok(())
            }
            Err(e @ (SyncError::InvalidState { .. } | SyncError::UnknownPath(_) | SyncError::Store(_))) => {
                Err(e)
            }
            Err(e) => {
                warn!("{} 失败: {} - {}", action, key, e);
                self.history
                    .log(&report.pass_id, action, key, "failed", Some(&e.to_string()))
                    .await;
                report.fail(key, &e);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PathSync for SyncEngine {
    async fn sync_path(&self, relative: &str) -> Result<SyncReport, SyncError> {
        SyncEngine::sync_path(self, relative).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::db::models::{DeletionOrigin, FileStatus};
    use crate::db::open_memory_pool;
    use crate::storage::{MemoryStore, StorageError, StoreOp};
    use bytes::Bytes;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        remote: Arc<MemoryStore>,
        engine: SyncEngine,
    }

    async fn fixture_with(tune: impl FnOnce(&mut VaultConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::new());
        let mut config = VaultConfig::new(
            dir.path(),
            RemoteConfig::Local {
                path: "unused".into(),
            },
        );
        config.max_retries = 2;
        config.retry_base_delay_ms = 1;
        tune(&mut config);
        let engine = SyncEngine::new(config, open_memory_pool().await.unwrap(), remote.clone()).unwrap();
        Fixture { dir, remote, engine }
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    impl Fixture {
        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.root().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }

        async fn status(&self, key: &str) -> Option<FileStatus> {
            self.engine.store().get(key).await.unwrap().map(|r| r.status)
        }
    }

    #[tokio::test]
    async fn second_full_sync_is_a_no_op() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.write("notes/b.md", "beta");
        f.remote.put("vault/c.md", Bytes::from_static(b"gamma"), 1);

        let first = f.engine.full_sync().await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.count("uploaded"), 2);
        assert_eq!(first.count("downloaded"), 1);
        let records = f.engine.store().all().await.unwrap();

        let second = f.engine.full_sync().await.unwrap();
        assert!(second.processed.is_empty());
        assert!(second.failed.is_empty());
        assert_eq!(f.engine.store().all().await.unwrap(), records);
    }

    #[tokio::test]
    async fn local_delete_is_never_propagated_silently() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.engine.full_sync().await.unwrap();

        fs::remove_file(f.root().join("a.md")).unwrap();
        let report = f.engine.full_sync().await.unwrap();

        assert_eq!(f.status("a.md").await, Some(FileStatus::PendingDeletion));
        assert_eq!(report.pending_deletions.len(), 1);
        assert_eq!(report.pending_deletions[0].origin, DeletionOrigin::Local);
        assert!(f.remote.get("vault/a.md").is_some());
        assert_eq!(f.remote.calls(StoreOp::Delete), 0);
        assert!(!f.root().join("a.md").exists());

        // 待删除期间远程旧副本不会被下载回来
        let again = f.engine.full_sync().await.unwrap();
        assert!(!f.root().join("a.md").exists());
        assert!(again.processed.is_empty());
    }

    #[tokio::test]
    async fn restore_recreates_identical_content() {
        let f = fixture().await;
        f.write("notes/a.md", "precious");
        f.engine.full_sync().await.unwrap();
        let stored = f.engine.store().get("notes/a.md").await.unwrap().unwrap();

        fs::remove_file(f.root().join("notes/a.md")).unwrap();
        let checked = f.engine.check_deletions().await.unwrap();
        assert_eq!(checked.pending_deletions.len(), 1);

        let report = f.engine.restore_deletion("notes/a.md").await.unwrap();
        assert_eq!(report.count("restored"), 1);
        assert!(report.pending_deletions.is_empty());
        let restored = fs::read(f.root().join("notes/a.md")).unwrap();
        assert_eq!(
            crate::core::file_state::calculate_hash(&restored),
            stored.content_fingerprint
        );
        assert_eq!(f.status("notes/a.md").await, Some(FileStatus::Active));
    }

    #[tokio::test]
    async fn confirm_removes_remote_copy_once() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.engine.full_sync().await.unwrap();
        fs::remove_file(f.root().join("a.md")).unwrap();
        f.engine.check_deletions().await.unwrap();

        let report = f.engine.confirm_deletion("a.md").await.unwrap();
        assert_eq!(report.count("deleted_remote"), 1);
        assert!(f.remote.get("vault/a.md").is_none());
        assert_eq!(f.status("a.md").await, Some(FileStatus::Deleted));

        assert!(matches!(
            f.engine.confirm_deletion("a.md").await,
            Err(SyncError::InvalidState { .. })
        ));
        assert!(matches!(
            f.engine.restore_deletion("never.md").await,
            Err(SyncError::UnknownPath(_))
        ));
    }

    #[tokio::test]
    async fn auto_confirm_applies_during_full_sync() {
        let f = fixture_with(|c| c.auto_confirm_deletions = true).await;
        f.write("a.md", "alpha");
        f.engine.full_sync().await.unwrap();
        fs::remove_file(f.root().join("a.md")).unwrap();

        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.count("deleted_remote"), 1);
        assert!(f.remote.get("vault/a.md").is_none());
        assert!(report.pending_deletions.is_empty());
    }

    #[tokio::test]
    async fn remote_delete_is_mirrored_as_pending() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.engine.full_sync().await.unwrap();
        f.remote.remove("vault/a.md");

        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.pending_deletions.len(), 1);
        assert_eq!(report.pending_deletions[0].origin, DeletionOrigin::Remote);
        assert!(f.root().join("a.md").exists());

        let confirmed = f.engine.confirm_deletion("a.md").await.unwrap();
        assert_eq!(confirmed.count("trashed_local"), 1);
        assert!(!f.root().join("a.md").exists());
        assert!(f.root().join(".trash/a.md").exists());

        // 回收站里的文件不会被同步
        let after = f.engine.full_sync().await.unwrap();
        assert!(after.processed.is_empty());
    }

    #[tokio::test]
    async fn newer_side_wins_conflict_and_loser_is_archived() {
        let f = fixture().await;
        f.write("a.md", "base");
        f.engine.full_sync().await.unwrap();

        f.write("a.md", "local edit");
        let later = chrono::Utc::now().timestamp_millis() + 60_000;
        f.remote.put("vault/a.md", Bytes::from_static(b"remote edit"), later);

        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.count("conflict_resolved"), 1);
        assert_eq!(fs::read_to_string(f.root().join("a.md")).unwrap(), "remote edit");
        let archived: Vec<_> = f
            .remote
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("vault_conflicts/"))
            .collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(
            f.remote.get(&archived[0]).unwrap(),
            Bytes::from_static(b"local edit")
        );
    }

    #[tokio::test]
    async fn init_then_detect_uploads_without_transferring_twice() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.write("b.md", "beta");

        let init = f.engine.init_tracking().await.unwrap();
        assert_eq!(init.count("tracked"), 2);
        assert_eq!(f.remote.calls(StoreOp::List), 0);
        assert_eq!(f.remote.calls(StoreOp::Upload), 0);

        // 种子记录没有远程版本，首轮同步把它们上传
        let first = f.engine.full_sync().await.unwrap();
        assert_eq!(first.count("uploaded"), 2);
        let second = f.engine.full_sync().await.unwrap();
        assert!(second.processed.is_empty());

        let again = f.engine.init_tracking().await.unwrap();
        assert_eq!(again.count("tracked"), 0);
    }

    #[tokio::test]
    async fn init_then_check_deletions_reports_only_the_missing_file() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.write("b.md", "beta");
        f.engine.init_tracking().await.unwrap();

        fs::remove_file(f.root().join("b.md")).unwrap();
        let report = f.engine.check_deletions().await.unwrap();

        let pending: Vec<_> = report
            .pending_deletions
            .iter()
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(pending, vec!["b.md"]);
        assert_eq!(f.status("a.md").await, Some(FileStatus::Active));
        assert_eq!(f.status("b.md").await, Some(FileStatus::PendingDeletion));
        assert_eq!(f.remote.calls(StoreOp::List), 0);
    }

    #[tokio::test]
    async fn init_tracking_never_stores_overlong_names() {
        let f = fixture().await;
        // 单个文件名最多 255 字节，放在子目录下使整个 key 超过上限
        let long = format!("notes/{}.md", "a".repeat(251));
        f.write(&long, "too long");
        f.write("ok.md", "fine");

        let report = f.engine.init_tracking().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.count("tracked"), 1);
        assert!(report.failed.is_empty());

        let keys: Vec<_> = f.engine.store().all().await.unwrap().into_keys().collect();
        assert_eq!(keys, vec!["ok.md".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_directory_is_never_auto_deleted() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture_with(|c| c.auto_confirm_deletions = true).await;
        f.write("locked/x.md", "x");
        f.write("open.md", "o");
        f.engine.full_sync().await.unwrap();

        let locked = f.root().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        // root 不受目录权限限制，此时无法构造读取失败
        let enforced = fs::read_dir(&locked).is_err();
        let report = f.engine.full_sync().await;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        if !enforced {
            return;
        }

        let report = report.unwrap();
        assert_eq!(report.count("deleted_remote"), 0);
        assert!(report.failed.iter().any(|failure| failure.path == "locked"));
        assert!(f.remote.get("vault/locked/x.md").is_some());
        assert_eq!(f.status("locked/x.md").await, Some(FileStatus::Active));
    }

    #[tokio::test]
    async fn push_only_uploads_without_downloading() {
        let f = fixture().await;
        f.write("local.md", "mine");
        f.remote.put("vault/remote.md", Bytes::from_static(b"theirs"), 1);

        let report = f.engine.push_local().await.unwrap();
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(report.count("downloaded"), 0);
        assert_eq!(f.remote.calls(StoreOp::Download), 0);
        assert!(!f.root().join("remote.md").exists());

        let pulled = f.engine.pull_remote().await.unwrap();
        assert_eq!(pulled.count("downloaded"), 1);
        assert_eq!(pulled.count("uploaded"), 0);
    }

    #[tokio::test]
    async fn overlong_paths_are_rejected_not_failed() {
        let f = fixture().await;
        let long = format!("{}/{}/{}.md", "a".repeat(100), "b".repeat(100), "c".repeat(100));
        f.write(&long, "too long");
        f.write("ok.md", "fine");

        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(f.remote.keys(), vec!["vault/ok.md".to_string()]);
    }

    #[tokio::test]
    async fn one_failed_upload_does_not_abort_siblings() {
        let f = fixture().await;
        for name in ["a.md", "b.md", "c.md"] {
            f.write(name, name);
        }
        f.remote.fail(
            StoreOp::Upload,
            Some("vault/b.md"),
            StorageError::Backend("rejected".into()),
        );

        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.count("uploaded"), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, "backend");
        assert_eq!(f.status("b.md").await, None);

        f.remote.clear_faults();
        let retry = f.engine.full_sync().await.unwrap();
        assert_eq!(retry.count("uploaded"), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.remote.fail_times(
            StoreOp::Upload,
            None,
            2,
            StorageError::Network("connection reset".into()),
        );

        let report = f.engine.full_sync().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(f.remote.calls(StoreOp::Upload), 3);
    }

    #[tokio::test]
    async fn expired_auth_blocks_until_resumed() {
        let f = fixture().await;
        f.write("a.md", "alpha");
        f.remote.fail_times(
            StoreOp::List,
            None,
            1,
            StorageError::Unauthorized("token expired".into()),
        );

        let report = f.engine.full_sync().await.unwrap();
        assert!(report.blocked.is_some());
        assert!(f.engine.is_network_halted());

        let halted = f.engine.full_sync().await.unwrap();
        assert!(halted.blocked.is_some());
        assert_eq!(f.remote.calls(StoreOp::List), 1);

        f.engine.resume_network();
        let resumed = f.engine.full_sync().await.unwrap();
        assert!(resumed.is_success());
        assert_eq!(resumed.count("uploaded"), 1);
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let f = fixture_with(|c| {
            c.max_retries = 0;
            c.op_timeout_secs = 1;
        })
        .await;
        f.write("a.md", "alpha");
        f.remote.set_latency(Some(Duration::from_millis(1500)));

        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, "transient_network");
        assert_eq!(f.status("a.md").await, None);
    }

    #[tokio::test]
    async fn sync_path_touches_only_its_scope() {
        let f = fixture().await;
        f.write("notes/a.md", "alpha");
        f.write("other/b.md", "beta");

        let report = f.engine.sync_path("notes/a.md").await.unwrap();
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(f.remote.keys(), vec!["vault/notes/a.md".to_string()]);

        let ignored = f.engine.sync_path(".obsidian/workspace.json").await.unwrap();
        assert_eq!(ignored.rejected, 1);
        assert!(ignored.processed.is_empty());
    }

    #[tokio::test]
    async fn snapshot_reports_its_artifact() {
        let f = fixture().await;
        f.write("a.md", "alpha");

        let report = f.engine.snapshot().await.unwrap();
        let artifact = report.artifact.clone().unwrap();
        assert!(artifact.starts_with("vault_snapshots/snapshot_"));
        assert!(f.remote.get(&artifact).is_some());

        let history = f.engine.history(10).await.unwrap();
        assert_eq!(history[0].action, "snapshot_uploaded");
    }
}
