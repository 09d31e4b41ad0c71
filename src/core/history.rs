//! 同步历史（审计日志）

use crate::db::models::SyncHistoryEntry;
use crate::error::StoreError;
use sqlx::SqlitePool;
use tracing::warn;

#[derive(Clone)]
pub struct SyncHistory {
    db: SqlitePool,
}

impl SyncHistory {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// 追加一条历史，失败只记录警告
    pub async fn log(&self, pass_id: &str, action: &str, path: &str, status: &str, details: Option<&str>) {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO sync_history (pass_id, at, action, path, status, details) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(pass_id)
        .bind(now)
        .bind(action)
        .bind(path)
        .bind(status)
        .bind(details)
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            warn!("记录同步历史失败: {}", e);
        }
    }

    /// 最近的历史（新的在前）
    pub async fn recent(&self, limit: u32) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, SyncHistoryEntry>(
            "SELECT id, pass_id, at, action, path, status, details FROM sync_history
             ORDER BY at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}
