//! 对账执行 - 把差异转换为传输动作并逐条更新状态

use crate::core::conflict::{generate_conflict_name, unique_tag, ConflictResolution, ConflictSide};
use crate::core::detector::{ConflictCandidate, LocalChange, RemoteChange, SyncDiff};
use crate::core::file_state::{calculate_hash, StateStore};
use crate::core::history::SyncHistory;
use crate::core::local_io::{local_state, read_local, write_atomic};
use crate::core::report::{ItemAction, Operation, SyncReport};
use crate::core::scanner::FileScanner;
use crate::core::transfer::RemoteTransfer;
use crate::db::models::{FileRecord, FileStatus};
use crate::error::{StoreError, SyncError};
use crate::storage::join_key;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Both,
    PushOnly,
    PullOnly,
}

impl Direction {
    fn resolution(self) -> ConflictResolution {
        match self {
            Direction::Both => ConflictResolution::LastWriterWins,
            Direction::PushOnly => ConflictResolution::KeepLocal,
            Direction::PullOnly => ConflictResolution::KeepRemote,
        }
    }
}

/// 对账策略
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub direction: Direction,
    /// 存在待删除记录的 key：远程旧副本不会覆盖本地删除意图
    pub superseded: HashSet<String>,
}

impl ReconcilePolicy {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            superseded: HashSet::new(),
        }
    }

    pub fn with_superseded(mut self, superseded: HashSet<String>) -> Self {
        self.superseded = superseded;
        self
    }
}

/// 计划执行的动作
#[derive(Debug, Clone)]
pub enum PlannedAction {
    Upload(LocalChange),
    Download(RemoteChange),
    Resolve(ConflictCandidate, ConflictResolution),
    Refresh(LocalChange),
    Superseded(String),
}

impl PlannedAction {
    pub fn key(&self) -> &str {
        match self {
            PlannedAction::Upload(change) | PlannedAction::Refresh(change) => &change.key,
            PlannedAction::Download(change) => &change.key,
            PlannedAction::Resolve(conflict, _) => &conflict.local.key,
            PlannedAction::Superseded(key) => key,
        }
    }
}

/// 根据差异和策略生成动作列表（不做任何 IO）
pub fn plan(diff: &SyncDiff, policy: &ReconcilePolicy) -> Vec<PlannedAction> {
    let push = policy.direction != Direction::PullOnly;
    let pull = policy.direction != Direction::PushOnly;
    let mut actions = Vec::new();

    for change in diff.touched.values() {
        actions.push(PlannedAction::Refresh(change.clone()));
    }

    if push {
        for change in diff.added.values().chain(diff.modified.values()) {
            actions.push(PlannedAction::Upload(change.clone()));
        }
        for (key, record) in &diff.unsynced {
            if let Some(file) = diff.local_files.get(key) {
                actions.push(PlannedAction::Upload(LocalChange::from_file(
                    file,
                    Some(record.content_fingerprint.clone()),
                    Some(record),
                )));
            }
        }
    }

    if pull {
        for change in diff.remote_added.values().chain(diff.remote_modified.values()) {
            if policy.superseded.contains(&change.key) {
                actions.push(PlannedAction::Superseded(change.key.clone()));
            } else {
                actions.push(PlannedAction::Download(change.clone()));
            }
        }
    }

    let resolution = policy.direction.resolution();
    for conflict in diff.conflicts.values() {
        actions.push(PlannedAction::Resolve(conflict.clone(), resolution));
    }

    actions
}

/// 对账执行器
#[derive(Clone)]
pub struct Reconciler {
    store: StateStore,
    transfer: RemoteTransfer,
    history: SyncHistory,
    scanner: FileScanner,
    remote_root: String,
    conflict_root: String,
    max_concurrent: usize,
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        transfer: RemoteTransfer,
        history: SyncHistory,
        scanner: FileScanner,
        remote_root: impl Into<String>,
        conflict_root: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            transfer,
            history,
            scanner,
            remote_root: remote_root.into(),
            conflict_root: conflict_root.into(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 并发执行所有动作，单条失败不影响其它条目；存储错误中止本轮
    pub async fn reconcile(
        &self,
        operation: Operation,
        pass_id: &str,
        diff: &SyncDiff,
        policy: &ReconcilePolicy,
    ) -> Result<SyncReport, SyncError> {
        let actions = plan(diff, policy);
        let mut report = SyncReport::begin(operation);
        report.pass_id = pass_id.to_string();

        if actions.is_empty() {
            return Ok(report);
        }
        info!("开始对账: {} 个动作 (方向: {:?})", actions.len(), policy.direction);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let shared = Arc::new(Mutex::new(report));
        let mut handles = Vec::with_capacity(actions.len());

        for action in actions {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            let shared = shared.clone();
            let pass_id = pass_id.to_string();

            handles.push(tokio::spawn(async move {
                let key = action.key().to_string();
                let result = this.execute(&pass_id, action).await;
                this.log_outcome(&pass_id, &key, &result).await;
                let settled = shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .settle(&key, result);
                drop(permit);
                settled
            }));
        }

        let mut fatal: Option<StoreError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(e) => warn!("对账任务异常退出: {}", e),
            }
        }
        if let Some(e) = fatal {
            return Err(SyncError::Store(e));
        }

        let report = shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(report)
    }

    async fn execute(&self, pass_id: &str, action: PlannedAction) -> Result<ItemAction, SyncError> {
        match action {
            PlannedAction::Upload(change) => self.upload(change).await,
            PlannedAction::Download(change) => self.download(change).await,
            PlannedAction::Resolve(conflict, resolution) => {
                self.resolve(pass_id, conflict, resolution).await
            }
            PlannedAction::Refresh(change) => self.refresh(change).await,
            PlannedAction::Superseded(key) => {
                debug!("存在待删除记录，跳过下载: {}", key);
                Ok(ItemAction::SkippedSuperseded)
            }
        }
    }

    async fn log_outcome(&self, pass_id: &str, key: &str, result: &Result<ItemAction, SyncError>) {
        match result {
            Ok(action) => {
                let status = if action.is_skip() { "skipped" } else { "success" };
                let details = match action {
                    ItemAction::ConflictResolved { winner, artifact } => {
                        Some(format!("winner={} artifact={}", winner, artifact))
                    }
                    _ => None,
                };
                self.history
                    .log(pass_id, action.name(), key, status, details.as_deref())
                    .await;
            }
            Err(e) => {
                warn!("同步失败: {} - {}", key, e);
                self.history
                    .log(pass_id, "sync", key, "failed", Some(&e.to_string()))
                    .await;
            }
        }
    }

    /// 记录自检测以来是否被修改过
    async fn is_stale(&self, key: &str, previous: Option<&FileRecord>) -> Result<bool, SyncError> {
        let current = self.store.get(key).await?;
        Ok(match (current.as_ref(), previous) {
            (None, None) => false,
            (Some(current), Some(previous)) => !current.same_version(previous),
            _ => true,
        })
    }

    fn remote_key(&self, key: &str) -> String {
        join_key(&self.remote_root, key)
    }

    fn record_for(
        &self,
        change: &LocalChange,
        mtime: i64,
        size: i64,
        fingerprint: String,
        revision: Option<String>,
    ) -> FileRecord {
        let now = chrono::Utc::now().timestamp_millis();
        let status_changed_at = match &change.previous {
            Some(previous) if previous.is_active() => previous.status_changed_at,
            _ => now,
        };
        FileRecord {
            path: change.key.clone(),
            local_path: change.local_path.clone(),
            local_mtime: mtime,
            local_size: size,
            content_fingerprint: fingerprint,
            remote_revision: revision,
            status: FileStatus::Active,
            deletion_origin: None,
            status_changed_at,
            last_synced_at: now,
        }
    }

    /// 读取本地文件，要求它仍处于检测时的状态
    async fn read_unchanged(&self, change: &LocalChange) -> Result<Option<(Bytes, i64, i64)>, SyncError> {
        let path = self.scanner.absolute(&change.local_path);
        let (data, mtime, size) = match read_local(&path).await {
            Ok(read) => read,
            Err(SyncError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        if (mtime, size) != (change.mtime, change.size) {
            return Ok(None);
        }
        Ok(Some((data, mtime, size)))
    }

    async fn upload(&self, change: LocalChange) -> Result<ItemAction, SyncError> {
        let _guard = self.store.lock(&change.key).await;
        if self.is_stale(&change.key, change.previous.as_ref()).await? {
            return Ok(ItemAction::SkippedStale);
        }
        let Some((data, mtime, size)) = self.read_unchanged(&change).await? else {
            return Ok(ItemAction::SkippedStale);
        };

        let fingerprint = calculate_hash(&data);
        let revision = self.transfer.upload(&self.remote_key(&change.key), data).await?;
        info!("上传完成: {} ({} 字节)", change.key, size);

        let record = self.record_for(&change, mtime, size, fingerprint, Some(revision));
        self.store.upsert(&record).await?;
        Ok(ItemAction::Uploaded)
    }

    async fn download(&self, change: RemoteChange) -> Result<ItemAction, SyncError> {
        let _guard = self.store.lock(&change.key).await;
        if self.is_stale(&change.key, change.previous.as_ref()).await? {
            return Ok(ItemAction::SkippedStale);
        }
        let path = self.scanner.absolute(&change.local_path);
        if local_state(&path).await? != change.expect_local {
            debug!("本地文件在检测后发生变化，留给下一轮: {}", change.key);
            return Ok(ItemAction::SkippedStale);
        }

        let data = self.transfer.download(&change.entry.key).await?;
        let (mtime, size) = write_atomic(&path, &data).await?;
        info!("下载完成: {} ({} 字节)", change.key, size);

        let local = LocalChange {
            key: change.key.clone(),
            local_path: change.local_path.clone(),
            mtime,
            size,
            fingerprint: None,
            previous: change.previous.clone(),
        };
        let record = self.record_for(
            &local,
            mtime,
            size,
            calculate_hash(&data),
            Some(change.entry.revision.clone()),
        );
        self.store.upsert(&record).await?;
        Ok(ItemAction::Downloaded)
    }

    async fn refresh(&self, change: LocalChange) -> Result<ItemAction, SyncError> {
        let _guard = self.store.lock(&change.key).await;
        let Some(previous) = change.previous.as_ref() else {
            return Ok(ItemAction::SkippedStale);
        };
        if self.is_stale(&change.key, Some(previous)).await? {
            return Ok(ItemAction::SkippedStale);
        }

        let mut record = previous.clone();
        record.local_mtime = change.mtime;
        record.local_size = change.size;
        self.store.upsert(&record).await?;
        Ok(ItemAction::MetadataRefreshed)
    }

    async fn resolve(
        &self,
        pass_id: &str,
        conflict: ConflictCandidate,
        resolution: ConflictResolution,
    ) -> Result<ItemAction, SyncError> {
        let local = &conflict.local;
        let remote = &conflict.remote;
        let _guard = self.store.lock(&local.key).await;
        if self.is_stale(&local.key, local.previous.as_ref()).await? {
            return Ok(ItemAction::SkippedStale);
        }
        let Some((local_data, mtime, size)) = self.read_unchanged(local).await? else {
            return Ok(ItemAction::SkippedStale);
        };
        let local_fingerprint = calculate_hash(&local_data);

        // 没有共同基线且大小相同：先比较内容
        let mut remote_data = None;
        if !conflict.base_known && remote.size == size as u64 {
            let data = self.transfer.download(&remote.key).await?;
            if calculate_hash(&data) == local_fingerprint {
                debug!("两侧内容相同，只建立关联: {}", local.key);
                let record = self.record_for(
                    local,
                    mtime,
                    size,
                    local_fingerprint,
                    Some(remote.revision.clone()),
                );
                self.store.upsert(&record).await?;
                return Ok(ItemAction::Linked);
            }
            remote_data = Some(data);
        }

        let winner = resolution.winner(mtime, remote.modified);
        let loser = winner.other();
        let artifact = join_key(
            &self.conflict_root,
            &generate_conflict_name(&local.key, loser, chrono::Utc::now(), &unique_tag()),
        );
        warn!(
            "{}",
            SyncError::ContentConflict(format!(
                "{} (保留 {}，另一方归档到 {})",
                local.key, winner, artifact
            ))
        );

        let record = match winner {
            ConflictSide::Local => {
                self.transfer.move_object(&remote.key, &artifact).await?;
                let revision = self.transfer.upload(&remote.key, local_data).await?;
                self.record_for(local, mtime, size, local_fingerprint, Some(revision))
            }
            ConflictSide::Remote => {
                self.transfer.upload(&artifact, local_data).await?;
                let data = match remote_data {
                    Some(data) => data,
                    None => self.transfer.download(&remote.key).await?,
                };
                let path = self.scanner.absolute(&local.local_path);
                let (mtime, size) = write_atomic(&path, &data).await?;
                self.record_for(
                    local,
                    mtime,
                    size,
                    calculate_hash(&data),
                    Some(remote.revision.clone()),
                )
            }
        };
        self.store.upsert(&record).await?;
        self.history
            .log(pass_id, "conflict_artifact", &artifact, "success", Some(&local.key))
            .await;

        Ok(ItemAction::ConflictResolved { winner, artifact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::ChangeDetector;
    use crate::core::sanitizer::PathSanitizer;
    use crate::core::transfer::TransferConfig;
    use crate::db::open_memory_pool;
    use crate::storage::{MemoryStore, RemoteStore, StorageError, StoreOp};
    use std::collections::{BTreeMap, HashMap};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        remote: Arc<MemoryStore>,
        store: StateStore,
        reconciler: Reconciler,
        detector: ChangeDetector,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::new());
        let pool = open_memory_pool().await.unwrap();
        let store = StateStore::new(pool.clone());
        let scanner = FileScanner::new(dir.path(), Arc::new(PathSanitizer::default()));
        let transfer = RemoteTransfer::new(
            remote.clone(),
            TransferConfig {
                max_retries: 2,
                retry_base_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let reconciler = Reconciler::new(
            store.clone(),
            transfer,
            SyncHistory::new(pool),
            scanner.clone(),
            "vault",
            "vault_conflicts",
            4,
        );
        Fixture {
            dir,
            remote,
            store,
            reconciler,
            detector: ChangeDetector::new(scanner),
        }
    }

    impl Fixture {
        fn root(&self) -> &Path {
            self.dir.path()
        }

        async fn diff(&self) -> SyncDiff {
            let records: HashMap<_, _> = self.store.all().await.unwrap();
            let mut diff = self.detector.detect(&records, "").await.unwrap();
            let listing: BTreeMap<_, _> = self
                .remote
                .list("vault")
                .await
                .unwrap()
                .into_iter()
                .filter_map(|e| {
                    crate::storage::strip_root("vault", &e.key)
                        .map(|k| (k.to_string(), e.clone()))
                })
                .collect();
            self.detector.diff_remote(&mut diff, &records, &listing);
            diff
        }

        async fn run(&self, direction: Direction) -> SyncReport {
            let diff = self.diff().await;
            self.reconciler
                .reconcile(Operation::FullSync, "test", &diff, &ReconcilePolicy::new(direction))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn uploads_and_downloads_then_settles() {
        let f = fixture().await;
        fs::write(f.root().join("local.md"), "local").unwrap();
        f.remote.put("vault/remote.md", Bytes::from_static(b"remote"), 1);

        let report = f.run(Direction::Both).await;
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(report.count("downloaded"), 1);
        assert_eq!(fs::read_to_string(f.root().join("remote.md")).unwrap(), "remote");
        assert_eq!(f.remote.get("vault/local.md").unwrap(), Bytes::from_static(b"local"));

        let again = f.run(Direction::Both).await;
        assert!(again.processed.is_empty());
        assert!(f.diff().await.is_empty());
    }

    #[tokio::test]
    async fn push_only_never_downloads() {
        let f = fixture().await;
        fs::write(f.root().join("local.md"), "local").unwrap();
        f.remote.put("vault/remote.md", Bytes::from_static(b"remote"), 1);

        let report = f.run(Direction::PushOnly).await;
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(f.remote.calls(StoreOp::Download), 0);
        assert!(!f.root().join("remote.md").exists());
    }

    #[tokio::test]
    async fn superseded_keys_are_not_downloaded() {
        let f = fixture().await;
        f.remote.put("vault/gone.md", Bytes::from_static(b"old"), 1);
        let diff = f.diff().await;
        let policy = ReconcilePolicy::new(Direction::Both)
            .with_superseded(HashSet::from(["gone.md".to_string()]));

        let report = f
            .reconciler
            .reconcile(Operation::FullSync, "test", &diff, &policy)
            .await
            .unwrap();
        assert_eq!(report.count("skipped_superseded"), 1);
        assert!(!f.root().join("gone.md").exists());
    }

    #[tokio::test]
    async fn failed_upload_leaves_record_untouched() {
        let f = fixture().await;
        fs::write(f.root().join("bad.md"), "bad").unwrap();
        fs::write(f.root().join("good.md"), "good").unwrap();
        f.remote.fail(
            StoreOp::Upload,
            Some("vault/bad.md"),
            StorageError::Backend("disk full".into()),
        );

        let report = f.run(Direction::Both).await;
        assert_eq!(report.count("uploaded"), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "bad.md");
        assert!(f.store.get("bad.md").await.unwrap().is_none());
        assert!(f.store.get("good.md").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn newer_remote_wins_and_local_is_archived() {
        let f = fixture().await;
        fs::write(f.root().join("a.md"), "base").unwrap();
        f.run(Direction::Both).await;

        fs::write(f.root().join("a.md"), "local edit").unwrap();
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        f.remote.put("vault/a.md", Bytes::from_static(b"remote edit"), future);

        let report = f.run(Direction::Both).await;
        let action = &report.processed[0].action;
        let ItemAction::ConflictResolved { winner, artifact } = action else {
            panic!("unexpected action {:?}", action);
        };
        assert_eq!(*winner, ConflictSide::Remote);
        assert!(artifact.starts_with("vault_conflicts/a_conflict_local_"));
        assert_eq!(f.remote.get(artifact).unwrap(), Bytes::from_static(b"local edit"));
        assert_eq!(fs::read_to_string(f.root().join("a.md")).unwrap(), "remote edit");
        assert!(f.diff().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_conflicts_keep_every_archive() {
        let f = fixture().await;
        fs::write(f.root().join("a.md"), "base").unwrap();
        f.run(Direction::Both).await;

        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        let mut artifacts = Vec::new();
        for (round, (local, remote)) in [
            ("local edit one", "remote edit one"),
            ("local edit two", "remote edit two"),
        ]
        .into_iter()
        .enumerate()
        {
            fs::write(f.root().join("a.md"), local).unwrap();
            f.remote
                .put("vault/a.md", Bytes::from(remote.to_string()), future + round as i64);

            let report = f.run(Direction::Both).await;
            let ItemAction::ConflictResolved { artifact, .. } = &report.processed[0].action else {
                panic!("expected a resolved conflict in round {}", round);
            };
            artifacts.push(artifact.clone());
        }

        assert_ne!(artifacts[0], artifacts[1]);
        assert_eq!(
            f.remote.get(&artifacts[0]).unwrap(),
            Bytes::from_static(b"local edit one")
        );
        assert_eq!(
            f.remote.get(&artifacts[1]).unwrap(),
            Bytes::from_static(b"local edit two")
        );
        let archived = f
            .remote
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("vault_conflicts/"))
            .count();
        assert_eq!(archived, 2);
    }

    #[tokio::test]
    async fn newer_local_wins_and_remote_is_archived() {
        let f = fixture().await;
        fs::write(f.root().join("a.md"), "base").unwrap();
        f.run(Direction::Both).await;

        f.remote.put("vault/a.md", Bytes::from_static(b"remote edit"), 1);
        fs::write(f.root().join("a.md"), "local edit").unwrap();

        let report = f.run(Direction::Both).await;
        let ItemAction::ConflictResolved { winner, artifact } = &report.processed[0].action else {
            panic!("expected a resolved conflict");
        };
        assert_eq!(*winner, ConflictSide::Local);
        assert!(artifact.starts_with("vault_conflicts/a_conflict_remote_"));
        assert_eq!(f.remote.get(artifact).unwrap(), Bytes::from_static(b"remote edit"));
        assert_eq!(f.remote.get("vault/a.md").unwrap(), Bytes::from_static(b"local edit"));
    }

    #[tokio::test]
    async fn identical_content_without_base_is_linked() {
        let f = fixture().await;
        fs::write(f.root().join("a.md"), "same").unwrap();
        f.remote.put("vault/a.md", Bytes::from_static(b"same"), 1);

        let report = f.run(Direction::Both).await;
        assert_eq!(report.count("linked"), 1);
        assert_eq!(f.remote.calls(StoreOp::Upload), 0);
        assert!(f.store.get("a.md").await.unwrap().unwrap().remote_revision.is_some());
    }

    #[tokio::test]
    async fn concurrent_record_change_skips_item() {
        let f = fixture().await;
        fs::write(f.root().join("a.md"), "a").unwrap();
        let diff = f.diff().await;

        // 检测后另一轮已经写入了记录
        f.run(Direction::Both).await;
        let uploads = f.remote.calls(StoreOp::Upload);

        let report = f
            .reconciler
            .reconcile(Operation::FullSync, "test", &diff, &ReconcilePolicy::new(Direction::Both))
            .await
            .unwrap();
        assert_eq!(report.count("skipped_stale"), 1);
        assert_eq!(f.remote.calls(StoreOp::Upload), uploads);
    }
}
