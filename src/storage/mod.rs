pub mod local;
pub mod memory;
pub mod operator;
pub mod s3;
pub mod webdav;

use crate::config::RemoteConfig;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use local::LocalStore;
pub use memory::{MemoryStore, StoreOp};
pub use operator::OperatorStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 存储能力的错误集合
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("未授权: {0}")]
    Unauthorized(String),
    #[error("对象不存在: {0}")]
    NotFound(String),
    #[error("请求被限流: {0}")]
    RateLimited(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("后端错误: {0}")]
    Backend(String),
}

/// 远程对象条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    /// 完整 key（相对于存储根目录）
    pub key: String,
    /// 版本标识（etag 或 修改时间+大小）
    pub revision: String,
    /// 修改时间（毫秒）
    pub modified: i64,
    pub size: u64,
}

/// 远程对象存储能力
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 写入整个对象，返回新的版本标识
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError>;

    /// 读取整个对象
    async fn download(&self, key: &str) -> Result<Bytes, StorageError>;

    /// 列出 key 等于 prefix 或位于 prefix/ 之下的所有对象（递归，不含目录）
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError>;

    /// 删除对象
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// 移动对象
    async fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 拼接远程 key
pub fn join_key(root: &str, relative: &str) -> String {
    let root = root.trim_matches('/');
    let relative = relative.trim_start_matches('/');
    match (root.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, relative),
    }
}

/// 去掉远程根前缀，得到相对 key
pub fn strip_root<'a>(root: &str, key: &'a str) -> Option<&'a str> {
    let root = root.trim_matches('/');
    if root.is_empty() {
        return Some(key);
    }
    key.strip_prefix(root)?.strip_prefix('/')
}

/// 根据配置创建存储实例
pub fn create_remote(
    config: &RemoteConfig,
    op_timeout: Duration,
    io_timeout: Duration,
) -> Result<Arc<dyn RemoteStore>, StorageError> {
    match config {
        RemoteConfig::Local { path } => {
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalStore::new(path)?))
        }
        RemoteConfig::S3 {
            bucket,
            region,
            access_key,
            secret_key,
            endpoint,
            prefix,
        } => {
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            let operator = s3::build_operator(
                bucket,
                region,
                access_key,
                secret_key,
                endpoint.as_deref(),
                prefix.as_deref(),
            )?;
            let name = format!(
                "s3://{}{}",
                bucket,
                prefix
                    .as_deref()
                    .map(|p| format!("/{}", p))
                    .unwrap_or_default()
            );
            Ok(Arc::new(OperatorStore::new(
                operator, name, op_timeout, io_timeout,
            )))
        }
        RemoteConfig::WebDav {
            endpoint,
            username,
            password,
            root,
        } => {
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, root);
            let operator =
                webdav::build_operator(endpoint, username, password, root.as_deref())?;
            let name = format!("webdav:{}", endpoint);
            Ok(Arc::new(OperatorStore::new(
                operator, name, op_timeout, io_timeout,
            )))
        }
    }
}
