//! 应用配置模块

use crate::core::sanitizer::PathSanitizer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 配置文件名
pub const CONFIG_FILE: &str = "config.json";

/// 定时同步的最小间隔（秒）
pub const MIN_SYNC_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("配置格式错误: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("配置文件中缺少 vault 配置: {0:?}")]
    Missing(PathBuf),
    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 远程存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    Local {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    S3 {
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    #[serde(rename = "webdav", rename_all = "camelCase")]
    WebDav {
        endpoint: String,
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<String>,
    },
}

/// 库同步配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// 本地库根目录
    pub vault_root: PathBuf,
    /// 远程库根目录
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// 远程快照目录
    #[serde(default = "default_snapshot_root")]
    pub snapshot_root: String,
    /// 冲突副本目录
    #[serde(default = "default_conflict_root")]
    pub conflict_root: String,
    /// 定时全量同步间隔（秒）
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// 是否启用实时监听
    #[serde(default)]
    pub real_time_enabled: bool,
    /// 全量同步时是否自动确认删除
    #[serde(default)]
    pub auto_confirm_deletions: bool,
    /// 追加的忽略规则
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// 文件事件防抖窗口（毫秒）
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    pub remote: RemoteConfig,
}

fn default_remote_root() -> String {
    "vault".to_string()
}

fn default_snapshot_root() -> String {
    "vault_snapshots".to_string()
}

fn default_conflict_root() -> String {
    "vault_conflicts".to_string()
}

fn default_sync_interval_secs() -> u64 {
    1800 // 默认 30 分钟
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_op_timeout_secs() -> u64 {
    crate::storage::OP_TIMEOUT_SECS
}

fn default_io_timeout_secs() -> u64 {
    crate::storage::IO_TIMEOUT_SECS
}

impl VaultConfig {
    /// 使用默认值创建配置
    pub fn new(vault_root: impl Into<PathBuf>, remote: RemoteConfig) -> Self {
        Self {
            vault_root: vault_root.into(),
            remote_root: default_remote_root(),
            snapshot_root: default_snapshot_root(),
            conflict_root: default_conflict_root(),
            sync_interval_secs: default_sync_interval_secs(),
            real_time_enabled: false,
            auto_confirm_deletions: false,
            ignore_patterns: Vec::new(),
            debounce_ms: default_debounce_ms(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            op_timeout_secs: default_op_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            remote,
        }
    }

    /// 从配置文件加载并校验
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let config = read_config_file(config_dir)?;
        let section = config
            .get("vault")
            .cloned()
            .ok_or_else(|| ConfigError::Missing(config_dir.join(CONFIG_FILE)))?;
        let vault: VaultConfig = serde_json::from_value(section)?;
        vault.validate()?;
        Ok(vault)
    }

    /// 保存到配置文件（保留其它配置段）
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        write_config_section(config_dir, "vault", serde_json::to_value(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.vault_root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "vaultRoot 必须是绝对路径: {:?}",
                self.vault_root
            )));
        }
        if !self.vault_root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "vaultRoot 不存在或不是目录: {:?}",
                self.vault_root
            )));
        }

        let roots = [
            ("remoteRoot", self.remote_root.as_str()),
            ("snapshotRoot", self.snapshot_root.as_str()),
            ("conflictRoot", self.conflict_root.as_str()),
        ];
        for (name, root) in roots {
            let trimmed = root.trim_matches('/');
            if trimmed.is_empty() {
                return Err(ConfigError::Invalid(format!("{} 不能为空", name)));
            }
            if trimmed.split('/').any(|segment| segment == ".." || segment == ".") {
                return Err(ConfigError::Invalid(format!("{} 不能包含 . 或 ..", name)));
            }
        }
        for (i, (name_a, a)) in roots.iter().enumerate() {
            for (name_b, b) in roots.iter().skip(i + 1) {
                let (a, b) = (a.trim_matches('/'), b.trim_matches('/'));
                if crate::core::file_state::key_in_scope(a, b)
                    || crate::core::file_state::key_in_scope(b, a)
                {
                    return Err(ConfigError::Invalid(format!(
                        "{} 与 {} 不能相同或互相嵌套",
                        name_a, name_b
                    )));
                }
            }
        }

        if self.sync_interval_secs < MIN_SYNC_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "syncIntervalSecs 不能小于 {}",
                MIN_SYNC_INTERVAL_SECS
            )));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentTransfers 至少为 1".to_string(),
            ));
        }
        if self.op_timeout_secs == 0 || self.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid("超时时间必须大于 0".to_string()));
        }

        PathSanitizer::with_patterns(&self.ignore_patterns)
            .map_err(|e| ConfigError::Invalid(format!("忽略规则无效: {}", e)))?;

        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// 读取整个配置文件（不存在时返回空对象）
pub fn read_config_file(config_dir: &Path) -> Result<serde_json::Value, ConfigError> {
    let config_file = config_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        return Ok(serde_json::json!({}));
    }
    let content = fs::read_to_string(&config_file).map_err(|source| ConfigError::Io {
        path: config_file.clone(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// 更新配置文件中的某一段
pub fn write_config_section(
    config_dir: &Path,
    key: &str,
    value: serde_json::Value,
) -> Result<(), ConfigError> {
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置，损坏时从空配置开始
    let mut config = read_config_file(config_dir).unwrap_or_else(|_| serde_json::json!({}));
    if !config.is_object() {
        config = serde_json::json!({});
    }
    config[key] = value;

    let content = serde_json::to_string_pretty(&config)?;
    fs::write(&config_file, content).map_err(|source| ConfigError::Io {
        path: config_file,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_remote(dir: &Path) -> RemoteConfig {
        RemoteConfig::Local {
            path: dir.join("remote").to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "vault": {
                "vaultRoot": dir.path(),
                "remote": { "type": "local", "path": "/tmp/remote" }
            }
        });
        fs::write(dir.path().join(CONFIG_FILE), json.to_string()).unwrap();

        let config = VaultConfig::load(dir.path()).unwrap();
        assert_eq!(config.remote_root, "vault");
        assert_eq!(config.snapshot_root, "vault_snapshots");
        assert_eq!(config.sync_interval_secs, 1800);
        assert_eq!(config.debounce_ms, 2000);
        assert!(!config.auto_confirm_deletions);
    }

    #[test]
    fn save_keeps_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        write_config_section(dir.path(), "log", serde_json::json!({"level": "debug"})).unwrap();

        let config = VaultConfig::new(dir.path(), local_remote(dir.path()));
        config.save(dir.path()).unwrap();

        let raw = read_config_file(dir.path()).unwrap();
        assert_eq!(raw["log"]["level"], "debug");
        assert_eq!(VaultConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn s3_remote_parses_camel_case() {
        let remote: RemoteConfig = serde_json::from_value(serde_json::json!({
            "type": "s3",
            "bucket": "notes",
            "region": "us-east-1",
            "accessKey": "ak",
            "secretKey": "sk"
        }))
        .unwrap();
        assert!(matches!(remote, RemoteConfig::S3 { endpoint: None, .. }));
    }

    #[test]
    fn missing_section_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VaultConfig::load(dir.path()),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let base = VaultConfig::new(dir.path(), local_remote(dir.path()));
        assert!(base.validate().is_ok());

        let mut relative = base.clone();
        relative.vault_root = PathBuf::from("vault");
        assert!(relative.validate().is_err());

        let mut nested = base.clone();
        nested.snapshot_root = "vault/snapshots".to_string();
        assert!(nested.validate().is_err());

        let mut traversal = base.clone();
        traversal.conflict_root = "../elsewhere".to_string();
        assert!(traversal.validate().is_err());

        let mut too_fast = base.clone();
        too_fast.sync_interval_secs = 1;
        assert!(too_fast.validate().is_err());

        let mut no_workers = base.clone();
        no_workers.max_concurrent_transfers = 0;
        assert!(no_workers.validate().is_err());

        let mut sibling = base;
        sibling.snapshot_root = "vault_snaps".to_string();
        assert!(sibling.validate().is_ok());
    }
}
