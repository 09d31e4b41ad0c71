use anyhow::Context;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{RemoteConfig, VaultConfig};
pub use crate::core::{SyncEngine, SyncReport};
pub use crate::error::{StoreError, SyncError};

pub const APP_NAME: &str = "vaultsync";
pub const DB_FILE: &str = "vaultsync.db";

/// 默认应用配置目录
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".vaultsync"))
}

/// 运行时上下文：启动时创建，`shutdown` 时释放
pub struct SyncContext {
    pub config_dir: PathBuf,
    pub config: VaultConfig,
    pub db: SqlitePool,
    pub engine: Arc<SyncEngine>,
    cancel: CancellationToken,
}

impl SyncContext {
    /// 读取配置、打开数据库并创建远程存储
    pub async fn open(config_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("无法创建配置目录 {:?}", config_dir))?;

        let config = VaultConfig::load(config_dir).context("加载库配置失败")?;
        let db = db::open_pool(&config_dir.join(DB_FILE))
            .await
            .context("打开状态数据库失败")?;
        let remote = storage::create_remote(&config.remote, config.op_timeout(), config.io_timeout())
            .context("初始化远程存储失败")?;

        Self::with_parts(config_dir, config, db, remote)
    }

    /// 用已有的组件组装上下文
    pub fn with_parts(
        config_dir: &Path,
        config: VaultConfig,
        db: SqlitePool,
        remote: Arc<dyn storage::RemoteStore>,
    ) -> anyhow::Result<Self> {
        let engine = SyncEngine::new(config.clone(), db.clone(), remote)?;
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            config,
            db,
            engine: Arc::new(engine),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 定时全量同步，开启实时模式时同时运行监听桥，直到被取消
    ///
    /// 取消只阻止新的同步轮次，不会打断正在进行的一轮。
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut watcher = None;
        let mut bridge = None;

        if self.config.real_time_enabled {
            let (handle, events) = core::start_watcher(&self.config.vault_root)
                .with_context(|| format!("无法监听 {:?}", self.config.vault_root))?;
            watcher = Some(handle);
            let watch_bridge = core::WatchBridge::new(
                self.engine.clone(),
                self.config.vault_root.clone(),
                self.config.debounce(),
            );
            bridge = Some(tokio::spawn(watch_bridge.run(
                UnboundedReceiverStream::new(events),
                self.cancel.child_token(),
            )));
        }

        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "调度器已启动: 每 {} 秒全量同步, 实时模式: {}",
            self.config.sync_interval_secs, self.config.real_time_enabled
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => match self.engine.full_sync().await {
                    Ok(report) if report.blocked.is_some() => {
                        warn!("同步被阻止: {:?}", report.blocked);
                    }
                    Ok(report) => info!(
                        "定时同步完成: {} 个条目, {} 个失败",
                        report.processed.len(),
                        report.failed.len()
                    ),
                    Err(e) => error!("定时同步失败: {}", e),
                },
            }
        }

        drop(watcher);
        if let Some(bridge) = bridge {
            let _ = bridge.await;
        }
        info!("调度器已停止");
        Ok(())
    }

    /// 清理资源（退出时调用）
    pub async fn shutdown(&self) {
        info!("正在清理资源...");
        self.cancel.cancel();
        self.db.close().await;
        info!("资源清理完成");
    }
}
