//! 删除确认相关命令

use super::print_json;
use super::sync::finish;
use crate::SyncContext;
use anyhow::{Context, Result};
use std::path::Path;

/// 检测本地删除，然后列出所有待确认的删除
pub async fn check(config_dir: &Path) -> Result<()> {
    let ctx = SyncContext::open(config_dir).await?;
    let report = ctx.engine.check_deletions().await;
    ctx.shutdown().await;

    let report = report?;
    finish(&report)
}

pub async fn confirm(config_dir: &Path, path: &str) -> Result<()> {
    let ctx = SyncContext::open(config_dir).await?;
    let report = ctx
        .engine
        .confirm_deletion(path)
        .await
        .with_context(|| format!("无法确认删除 {}", path));
    ctx.shutdown().await;
    finish(&report?)
}

pub async fn restore(config_dir: &Path, path: &str) -> Result<()> {
    let ctx = SyncContext::open(config_dir).await?;
    let report = ctx
        .engine
        .restore_deletion(path)
        .await
        .with_context(|| format!("无法恢复 {}", path));
    ctx.shutdown().await;
    finish(&report?)
}

/// 只列出待确认的删除，不做检测
pub async fn list(config_dir: &Path) -> Result<()> {
    let ctx = SyncContext::open(config_dir).await?;
    let pending = ctx.engine.pending_deletions().await;
    ctx.shutdown().await;
    print_json(&pending?)
}
