use super::{RemoteEntry, RemoteStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, ErrorKind, Metadata, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

/// 基于 OpenDAL Operator 的远程存储（S3 / WebDAV）
pub struct OperatorStore {
    operator: Operator,
    name: String,
}

impl OperatorStore {
    pub fn new(operator: Operator, name: String, op_timeout: Duration, io_timeout: Duration) -> Self {
        // 添加超时层
        let operator = operator.layer(
            TimeoutLayer::default()
                .with_timeout(op_timeout)
                .with_io_timeout(io_timeout),
        );
        Self { operator, name }
    }

    fn entry_for(key: &str, meta: &Metadata) -> RemoteEntry {
        let modified = meta.last_modified().map_or(0, |t| t.timestamp_millis());
        let revision = match meta.etag() {
            Some(etag) => etag.trim_matches('"').to_string(),
            None => format!("{}-{}", modified, meta.content_length()),
        };
        RemoteEntry {
            key: key.trim_start_matches('/').to_string(),
            revision,
            modified,
            size: meta.content_length(),
        }
    }
}

/// OpenDAL 错误映射到存储错误集合
fn map_error(e: opendal::Error, key: &str) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => StorageError::Unauthorized(e.to_string()),
        ErrorKind::RateLimited => StorageError::RateLimited(e.to_string()),
        _ if e.is_temporary() => StorageError::Network(e.to_string()),
        _ => StorageError::Backend(e.to_string()),
    }
}

#[async_trait]
impl RemoteStore for OperatorStore {
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError> {
        self.operator
            .write(key, data)
            .await
            .map_err(|e| map_error(e, key))?;
        let meta = self
            .operator
            .stat(key)
            .await
            .map_err(|e| map_error(e, key))?;
        Ok(Self::entry_for(key, &meta).revision)
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let data = self
            .operator
            .read(key)
            .await
            .map_err(|e| map_error(e, key))?;
        Ok(Bytes::from(data.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let prefix = prefix.trim_matches('/');

        // prefix 本身是文件时只返回它
        if !prefix.is_empty() {
            match self.operator.stat(prefix).await {
                Ok(meta) if meta.is_file() => return Ok(vec![Self::entry_for(prefix, &meta)]),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(map_error(e, prefix)),
            }
        }

        let dir = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };

        // 使用 lister_with 进行递归列表
        let mut lister = match self
            .operator
            .lister_with(&dir)
            .recursive(true)
            .metakey(
                Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag,
            )
            .await
        {
            Ok(lister) => lister,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_error(e, prefix)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = lister.try_next().await.map_err(|e| map_error(e, prefix))? {
            let path = entry.path();

            // 跳过目录
            if path.is_empty() || path.ends_with('/') || entry.metadata().is_dir() {
                continue;
            }

            entries.push(Self::entry_for(path, entry.metadata()));
        }

        debug!("{} 列出 {} 个对象 (prefix: {})", self.name, entries.len(), prefix);
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.operator
            .delete(key)
            .await
            .map_err(|e| map_error(e, key))
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let capability = self.operator.info().full_capability();

        if capability.rename {
            return self
                .operator
                .rename(from, to)
                .await
                .map_err(|e| map_error(e, from));
        }

        // S3 没有原生重命名：复制后删除源对象
        if capability.copy {
            self.operator
                .copy(from, to)
                .await
                .map_err(|e| map_error(e, from))?;
        } else {
            let data = self
                .operator
                .read(from)
                .await
                .map_err(|e| map_error(e, from))?;
            self.operator
                .write(to, data)
                .await
                .map_err(|e| map_error(e, to))?;
        }

        self.operator
            .delete(from)
            .await
            .map_err(|e| map_error(e, from))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
