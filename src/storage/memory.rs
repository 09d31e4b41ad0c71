//! 内存存储 - 用于测试和演练，支持故障注入

use super::{RemoteEntry, RemoteStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

/// 存储操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Upload,
    Download,
    List,
    Delete,
    Move,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Bytes,
    revision: String,
    modified: i64,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    key: Option<String>,
    error: StorageError,
    /// None 表示一直生效
    remaining: Option<usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
    latency: Mutex<Option<Duration>>,
    next_revision: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入对象（模拟其它客户端的修改），返回版本
    pub fn put(&self, key: &str, data: impl Into<Bytes>, modified: i64) -> String {
        let revision = self.bump_revision();
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                MemoryObject {
                    data: data.into(),
                    revision: revision.clone(),
                    modified,
                },
            );
        revision
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|o| o.data.clone())
    }

    /// 直接删除对象（模拟其它客户端的删除）
    pub fn remove(&self, key: &str) -> bool {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// 持续注入故障（key 为 None 时匹配所有 key）
    pub fn fail(&self, op: StoreOp, key: Option<&str>, error: StorageError) {
        self.push_fault(op, key, error, None);
    }

    /// 注入只生效 times 次的故障
    pub fn fail_times(&self, op: StoreOp, key: Option<&str>, times: usize, error: StorageError) {
        self.push_fault(op, key, error, Some(times));
    }

    pub fn clear_faults(&self) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// 每次操作前的人为延迟
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// 某类操作被调用的次数（包括失败的调用）
    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    fn push_fault(&self, op: StoreOp, key: Option<&str>, error: StorageError, remaining: Option<usize>) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                op,
                key: key.map(str::to_string),
                error,
                remaining,
            });
    }

    fn bump_revision(&self) -> String {
        format!("r{}", self.next_revision.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// 记录调用、模拟延迟并检查注入的故障
    async fn enter(&self, op: StoreOp, key: &str) -> Result<(), StorageError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_insert(0) += 1;

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let index = faults
            .iter()
            .position(|f| f.op == op && f.key.as_deref().map_or(true, |k| k == key));
        let Some(index) = index else {
            return Ok(());
        };

        let error = faults[index].error.clone();
        if let Some(remaining) = faults[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(index);
            }
        }
        Err(error)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError> {
        self.enter(StoreOp::Upload, key).await?;
        Ok(self.put(key, data, now_millis()))
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        self.enter(StoreOp::Download, key).await?;
        self.get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        self.enter(StoreOp::List, prefix).await?;
        let prefix = prefix.trim_matches('/');
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .iter()
            .filter(|(key, _)| crate::core::file_state::key_in_scope(key, prefix))
            .map(|(key, object)| RemoteEntry {
                key: key.clone(),
                revision: object.revision.clone(),
                modified: object.modified,
                size: object.data.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.enter(StoreOp::Delete, key).await?;
        if self.remove(key) {
            Ok(())
        } else {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.enter(StoreOp::Move, from).await?;
        let revision = self.bump_revision();
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let mut object = objects
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        object.revision = revision;
        objects.insert(to.to_string(), object);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revisions_change_on_every_write() {
        let store = MemoryStore::new();
        let r1 = store.upload("vault/a.md", Bytes::from_static(b"1")).await.unwrap();
        let r2 = store.upload("vault/a.md", Bytes::from_static(b"2")).await.unwrap();
        assert_ne!(r1, r2);

        let listed = store.list("vault").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].revision, r2);
        assert_eq!(store.calls(StoreOp::Upload), 2);
    }

    #[tokio::test]
    async fn counted_faults_expire() {
        let store = MemoryStore::new();
        store.fail_times(
            StoreOp::Upload,
            Some("vault/a.md"),
            1,
            StorageError::Network("reset".into()),
        );

        assert!(store.upload("vault/b.md", Bytes::new()).await.is_ok());
        assert_eq!(
            store.upload("vault/a.md", Bytes::new()).await,
            Err(StorageError::Network("reset".into()))
        );
        assert!(store.upload("vault/a.md", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn list_respects_prefix_boundaries() {
        let store = MemoryStore::new();
        store.put("vault/a.md", Bytes::from_static(b"1"), 1);
        store.put("vault_snapshots/s.tar.gz", Bytes::from_static(b"2"), 1);

        let listed = store.list("vault").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(store.list("vault/a.md").await.unwrap().len(), 1);
    }
}
