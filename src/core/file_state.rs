//! 文件状态存储 - 规范路径到最后已知记录的持久映射

use crate::db::models::{DeletionOrigin, FileRecord, FileRecordRow, FileStatus, PendingDeletion};
use crate::error::{StoreError, SyncError};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// 初始化跟踪时的种子条目
#[derive(Debug, Clone)]
pub struct SeedEntry {
    pub path: String,
    pub local_path: String,
    pub local_mtime: i64,
    pub local_size: i64,
    pub content_fingerprint: String,
}

/// 标记待删除的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTransition {
    NewlyPending,
    AlreadyPending,
}

/// 按 key 加锁
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    map.insert(key.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }
}

/// 状态存储
///
/// 每次修改是一条 SQL 语句或一个事务，返回前已持久化。状态迁移使用条件更新，
/// 读-改-写序列由 [`StateStore::lock`] 提供的按 key 互斥保护。
#[derive(Clone)]
pub struct StateStore {
    db: SqlitePool,
    locks: Arc<KeyLocks>,
}

const SELECT_RECORD: &str = "SELECT path, local_path, local_mtime, local_size, content_fingerprint, \
     remote_revision, status, deletion_origin, status_changed_at, last_synced_at FROM file_records";

impl StateStore {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// 获取某个路径的独占锁
    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(path).await
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query_as::<_, FileRecordRow>(&format!("{} WHERE path = ?", SELECT_RECORD))
            .bind(path)
            .fetch_optional(&self.db)
            .await?;

        row.map(FileRecord::try_from).transpose()
    }

    /// 所有记录（返回 HashMap 以便快速查找）
    pub async fn all(&self) -> Result<HashMap<String, FileRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FileRecordRow>(SELECT_RECORD)
            .fetch_all(&self.db)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = FileRecord::try_from(row)?;
            map.insert(record.path.clone(), record);
        }
        Ok(map)
    }

    /// 某个前缀（目录）下的记录；空前缀等价于 [`StateStore::all`]
    pub async fn in_scope(&self, prefix: &str) -> Result<HashMap<String, FileRecord>, StoreError> {
        if prefix.is_empty() {
            return self.all().await;
        }
        let mut map = self.all().await?;
        map.retain(|path, _| key_in_scope(path, prefix));
        Ok(map)
    }

    pub async fn all_by_status(&self, status: FileStatus) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FileRecordRow>(&format!(
            "{} WHERE status = ? ORDER BY status_changed_at ASC, path ASC",
            SELECT_RECORD
        ))
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// 待删除队列（按检测时间排序）
    pub async fn pending_deletions(&self) -> Result<Vec<PendingDeletion>, StoreError> {
        self.all_by_status(FileStatus::PendingDeletion)
            .await?
            .iter()
            .map(PendingDeletion::try_from)
            .collect()
    }

    pub async fn pending_keys(&self) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM file_records WHERE status = 'pending_deletion'")
                .fetch_all(&self.db)
                .await?;
        Ok(keys.into_iter().map(|(path,)| path).collect())
    }

    /// 更新或插入记录
    pub async fn upsert(&self, record: &FileRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO file_records (path, local_path, local_mtime, local_size, content_fingerprint,
                   remote_revision, status, deletion_origin, status_changed_at, last_synced_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(path) DO UPDATE SET
                   local_path = excluded.local_path,
                   local_mtime = excluded.local_mtime,
                   local_size = excluded.local_size,
                   content_fingerprint = excluded.content_fingerprint,
                   remote_revision = excluded.remote_revision,
                   status = excluded.status,
                   deletion_origin = excluded.deletion_origin,
                   status_changed_at = excluded.status_changed_at,
                   last_synced_at = excluded.last_synced_at"#,
        )
        .bind(&record.path)
        .bind(&record.local_path)
        .bind(record.local_mtime)
        .bind(record.local_size)
        .bind(&record.content_fingerprint)
        .bind(&record.remote_revision)
        .bind(record.status.as_str())
        .bind(record.deletion_origin.map(|o| o.as_str()))
        .bind(record.status_changed_at)
        .bind(record.last_synced_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// active -> pending_deletion（已处于待删除时为幂等空操作）
    pub async fn mark_pending_deletion(
        &self,
        path: &str,
        origin: DeletionOrigin,
    ) -> Result<PendingTransition, SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE file_records SET status = 'pending_deletion', deletion_origin = ?, status_changed_at = ?
             WHERE path = ? AND status = 'active'",
        )
        .bind(origin.as_str())
        .bind(now)
        .bind(path)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 1 {
            debug!("标记待删除: {} (来源: {})", path, origin.as_str());
            return Ok(PendingTransition::NewlyPending);
        }

        match self.current_status(path).await? {
            FileStatus::PendingDeletion => Ok(PendingTransition::AlreadyPending),
            actual => Err(SyncError::InvalidState {
                path: path.to_string(),
                expected: FileStatus::Active,
                actual,
            }),
        }
    }

    /// pending_deletion -> deleted（记录保留用于审计）
    pub async fn mark_deleted(&self, path: &str) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE file_records SET status = 'deleted', status_changed_at = ?, last_synced_at = ?
             WHERE path = ? AND status = 'pending_deletion'",
        )
        .bind(now)
        .bind(now)
        .bind(path)
        .execute(&self.db)
        .await?;

        self.expect_transition(path, result.rows_affected(), FileStatus::PendingDeletion)
            .await
    }

    /// pending_deletion -> active，同时写入刷新后的记录内容
    pub async fn mark_active(&self, refreshed: &FileRecord) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE file_records SET local_path = ?, local_mtime = ?, local_size = ?, content_fingerprint = ?,
                 remote_revision = ?, status = 'active', deletion_origin = NULL,
                 status_changed_at = ?, last_synced_at = ?
             WHERE path = ? AND status = 'pending_deletion'",
        )
        .bind(&refreshed.local_path)
        .bind(refreshed.local_mtime)
        .bind(refreshed.local_size)
        .bind(&refreshed.content_fingerprint)
        .bind(&refreshed.remote_revision)
        .bind(now)
        .bind(refreshed.last_synced_at)
        .bind(&refreshed.path)
        .execute(&self.db)
        .await?;

        self.expect_transition(
            &refreshed.path,
            result.rows_affected(),
            FileStatus::PendingDeletion,
        )
        .await
    }

    /// 用现有目录树批量初始化记录（单个事务，不触碰已有记录和远程）
    ///
    /// 返回新插入的记录数。
    pub async fn initialize_from_existing_tree(
        &self,
        seeds: &[SeedEntry],
    ) -> Result<u64, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.db.begin().await?;
        let mut inserted = 0;

        for seed in seeds {
            let result = sqlx::query(
                r#"INSERT INTO file_records (path, local_path, local_mtime, local_size, content_fingerprint,
                       remote_revision, status, deletion_origin, status_changed_at, last_synced_at)
                   VALUES (?, ?, ?, ?, ?, NULL, 'active', NULL, ?, ?)
                   ON CONFLICT(path) DO NOTHING"#,
            )
            .bind(&seed.path)
            .bind(&seed.local_path)
            .bind(seed.local_mtime)
            .bind(seed.local_size)
            .bind(&seed.content_fingerprint)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        info!("初始化跟踪: 新增 {} 条记录 (共 {} 个文件)", inserted, seeds.len());
        Ok(inserted)
    }

    async fn current_status(&self, path: &str) -> Result<FileStatus, SyncError> {
        match self.get(path).await? {
            Some(record) => Ok(record.status),
            None => Err(SyncError::UnknownPath(path.to_string())),
        }
    }

    async fn expect_transition(
        &self,
        path: &str,
        rows_affected: u64,
        expected: FileStatus,
    ) -> Result<(), SyncError> {
        if rows_affected == 1 {
            return Ok(());
        }
        let actual = self.current_status(path).await?;
        Err(SyncError::InvalidState {
            path: path.to_string(),
            expected,
            actual,
        })
    }
}

/// key 是否位于某个目录前缀之下（或就是它本身）
pub fn key_in_scope(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// 计算内容指纹（完整 BLAKE3）
pub fn calculate_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 流式计算文件指纹，避免整个文件读入内存
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
