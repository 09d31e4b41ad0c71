//! 远程传输 - 在存储能力之上加超时、重试和授权过期熔断

use crate::config::VaultConfig;
use crate::error::SyncError;
use crate::storage::{RemoteEntry, RemoteStore, StorageError};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// 单次退避的上限
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 传输配置
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟
    pub retry_base_delay: Duration,
    /// 非 IO 操作超时（list, delete, move）
    pub op_timeout: Duration,
    /// IO 操作超时（upload, download）
    pub io_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_millis(2000),
            op_timeout: Duration::from_secs(crate::storage::OP_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(crate::storage::IO_TIMEOUT_SECS),
        }
    }
}

impl From<&VaultConfig> for TransferConfig {
    fn from(config: &VaultConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            op_timeout: config.op_timeout(),
            io_timeout: config.io_timeout(),
        }
    }
}

/// 带重试的远程操作
#[derive(Clone)]
pub struct RemoteTransfer {
    remote: Arc<dyn RemoteStore>,
    config: TransferConfig,
    /// 授权过期后置位，重新授权前拒绝所有网络操作
    halted: Arc<AtomicBool>,
}

impl RemoteTransfer {
    pub fn new(remote: Arc<dyn RemoteStore>, config: TransferConfig) -> Self {
        Self {
            remote,
            config,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store_name(&self) -> &str {
        self.remote.name()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// 重新授权后恢复网络操作
    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub async fn upload(&self, key: &str, data: Bytes) -> Result<String, SyncError> {
        self.with_retry("上传", key, self.config.io_timeout, || {
            self.remote.upload(key, data.clone())
        })
        .await
    }

    pub async fn download(&self, key: &str) -> Result<Bytes, SyncError> {
        self.with_retry("下载", key, self.config.io_timeout, || {
            self.remote.download(key)
        })
        .await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, SyncError> {
        self.with_retry("列表", prefix, self.config.op_timeout, || {
            self.remote.list(prefix)
        })
        .await
    }

    /// 删除远程对象，对象已不存在视为成功
    pub async fn delete(&self, key: &str) -> Result<(), SyncError> {
        match self
            .with_retry("删除", key, self.config.op_timeout, || self.remote.delete(key))
            .await
        {
            Err(SyncError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn move_object(&self, from: &str, to: &str) -> Result<(), SyncError> {
        self.with_retry("移动", from, self.config.op_timeout, || {
            self.remote.move_object(from, to)
        })
        .await
    }

    /// 带超时和指数退避的执行
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        key: &str,
        timeout: Duration,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            if self.is_halted() {
                return Err(SyncError::AuthExpired(format!(
                    "授权已过期，暂停网络操作 ({} {})",
                    what, key
                )));
            }

            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::TransientNetwork(format!(
                    "{} {} 超时 ({:?})",
                    what, key, timeout
                ))),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match err {
                SyncError::AuthExpired(msg) => {
                    if !self.halted.swap(true, Ordering::SeqCst) {
                        error!("远程授权已过期，暂停所有网络操作: {}", msg);
                    }
                    return Err(SyncError::AuthExpired(msg));
                }
                e if e.is_retryable() && attempt < max_retries => {
                    // 指数退避
                    let delay = self
                        .config
                        .retry_base_delay
                        .saturating_mul(2_u32.saturating_pow(attempt))
                        .min(MAX_BACKOFF);
                    warn!(
                        "{}失败，{:?} 后重试 ({}/{}): {} - {}",
                        what,
                        delay,
                        attempt + 1,
                        max_retries,
                        key,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                e => {
                    if e.is_retryable() {
                        error!("{}最终失败 (已重试{}次): {} - {}", what, max_retries, key, e);
                    }
                    return Err(e);
                }
            }
        }

        Err(SyncError::TransientNetwork(format!("{} {} 重试次数耗尽", what, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreOp};

    fn fast_config() -> TransferConfig {
        TransferConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            op_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        store.fail_times(
            StoreOp::Upload,
            None,
            2,
            StorageError::Network("reset".into()),
        );
        let transfer = RemoteTransfer::new(store.clone(), fast_config());

        transfer
            .upload("vault/a.md", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(store.calls(StoreOp::Upload), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let store = Arc::new(MemoryStore::new());
        store.fail(StoreOp::Download, None, StorageError::RateLimited("429".into()));
        let transfer = RemoteTransfer::new(store.clone(), fast_config());

        let err = transfer.download("vault/a.md").await.unwrap_err();
        assert!(matches!(err, SyncError::TransientNetwork(_)));
        assert_eq!(store.calls(StoreOp::Download), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let transfer = RemoteTransfer::new(store.clone(), fast_config());

        let err = transfer.download("vault/missing.md").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(store.calls(StoreOp::Download), 1);

        // 删除不存在的对象视为成功
        transfer.delete("vault/missing.md").await.unwrap();
    }

    #[tokio::test]
    async fn auth_expiry_halts_until_resumed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_times(
            StoreOp::List,
            None,
            1,
            StorageError::Unauthorized("token expired".into()),
        );
        let transfer = RemoteTransfer::new(store.clone(), fast_config());

        assert!(matches!(
            transfer.list("vault").await,
            Err(SyncError::AuthExpired(_))
        ));
        assert!(transfer.is_halted());

        // 熔断期间不再访问远程
        assert!(transfer.list("vault").await.is_err());
        assert_eq!(store.calls(StoreOp::List), 1);

        transfer.resume();
        assert!(transfer.list("vault").await.is_ok());
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Some(Duration::from_millis(500)));
        let mut config = fast_config();
        config.max_retries = 0;
        config.op_timeout = Duration::from_millis(20);
        let transfer = RemoteTransfer::new(store, config);

        assert!(matches!(
            transfer.list("vault").await,
            Err(SyncError::TransientNetwork(_))
        ));
    }
}
