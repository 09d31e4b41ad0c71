//! 日志模块 - 提供文件日志和大小管理功能

use crate::config::{read_config_file, write_config_section, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 合法的日志级别
pub const VALID_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置（缺失或损坏时使用默认值）
    pub fn load(config_dir: &Path) -> Self {
        read_config_file(config_dir)
            .ok()
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default()
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        write_config_section(config_dir, "log", serde_json::to_value(self)?)
    }

    /// 修改日志级别（校验合法性）
    pub fn set_level(&mut self, level: &str) -> Result<(), ConfigError> {
        let level = level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!("无效的日志级别: {}", level)));
        }
        self.level = level;
        Ok(())
    }

    /// 修改日志大小上限（限制范围 1-100 MB）
    pub fn set_max_size_mb(&mut self, size: u32) {
        self.max_size_mb = size.clamp(1, 100);
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小限制的日志写入器
///
/// 超过上限时把 app.log 轮转为 app.log.old（只保留一个备份）。
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb as u64) * 1024 * 1024;
        let writer = open_log(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// 写入一段日志，超出大小后轮转
    fn write_record(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志写入器不可用"))?;

        let written = writer.write(buf)?;
        writer.flush()?;

        let oversized = fs::metadata(&self.file_path)
            .map(|m| m.len() > self.max_size)
            .unwrap_or(false);
        if oversized {
            if let Some(mut old) = guard.take() {
                let _ = old.flush();
            }
            rotate_log(&self.file_path)?;
            *guard = Some(open_log(&self.file_path, self.max_size)?);
        }

        Ok(written)
    }
}

fn open_log(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
    // 检查现有文件大小，如果超过限制则轮转
    if let Ok(metadata) = fs::metadata(file_path) {
        if metadata.len() > max_size {
            rotate_log(file_path)?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;

    Ok(BufWriter::new(file))
}

/// 轮转日志文件
fn rotate_log(file_path: &Path) -> io::Result<()> {
    let backup_path = file_path.with_extension("log.old");
    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }
    fs::rename(file_path, &backup_path)
}

/// 日志写入器包装
pub struct LogWriter {
    inner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.clone(),
        }
    }
}

/// 获取日志目录路径
pub fn get_log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

/// 初始化日志系统
pub fn init_logging(config_dir: &Path) {
    let log_dir = get_log_dir(config_dir);
    let config = LogConfig::load(config_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    // 创建日志级别过滤器
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["sqlx=warn", "hyper=warn", "reqwest=warn", "opendal=warn"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            // 文件日志层 - 始终输出到文件
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            // 在 debug 模式下也输出到控制台
            let console_layer = cfg!(debug_assertions).then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_writer(io::stderr)
            });

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let console_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_writer(io::stderr);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(LogConfig::load(dir.path()), LogConfig::default());

        let mut config = LogConfig::default();
        config.set_level("DEBUG").unwrap();
        config.set_max_size_mb(500);
        config.save(dir.path()).unwrap();

        let loaded = LogConfig::load(dir.path());
        assert_eq!(loaded.level, "debug");
        assert_eq!(loaded.max_size_mb, 100);
        assert_eq!(loaded.tracing_level(), tracing::Level::DEBUG);

        assert!(config.set_level("verbose").is_err());
    }

    #[test]
    fn rotates_when_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let chunk = vec![b'x'; 600 * 1024];

        let mut w = writer.make_writer();
        w.write_all(&chunk).unwrap();
        assert!(!dir.path().join("app.log.old").exists());
        w.write_all(&chunk).unwrap();

        assert!(dir.path().join("app.log.old").exists());
        assert_eq!(fs::metadata(writer.file_path()).unwrap().len(), 0);
    }

    #[test]
    fn init_creates_log_file_under_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        init_logging(dir.path());
        tracing::info!("日志初始化完成");
        assert!(get_log_dir(dir.path()).join("app.log").exists());
    }
}
