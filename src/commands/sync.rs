//! 同步相关命令

use super::print_json;
use crate::core::{Operation, SyncReport};
use crate::SyncContext;
use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

/// 打开上下文，执行一次同步操作，然后释放资源
async fn run_operation(config_dir: &Path, operation: Operation) -> Result<SyncReport> {
    let ctx = SyncContext::open(config_dir).await?;
    let engine = &ctx.engine;
    let report = match operation {
        Operation::InitTracking => engine.init_tracking().await,
        Operation::PushLocal => engine.push_local().await,
        Operation::PullRemote => engine.pull_remote().await,
        Operation::Snapshot => engine.snapshot().await,
        Operation::FullSync => engine.full_sync().await,
        other => {
            ctx.shutdown().await;
            bail!("命令行不支持该操作: {:?}", other);
        }
    };
    ctx.shutdown().await;
    Ok(report?)
}

/// 打印报告；有失败或被阻止时返回错误，使进程以非零状态退出
pub(crate) fn finish(report: &SyncReport) -> Result<()> {
    print_json(report)?;
    if let Some(reason) = &report.blocked {
        bail!("同步被阻止: {}", reason);
    }
    if !report.failed.is_empty() {
        bail!("{} 个条目同步失败", report.failed.len());
    }
    Ok(())
}

pub async fn init(config_dir: &Path) -> Result<()> {
    finish(&run_operation(config_dir, Operation::InitTracking).await?)
}

pub async fn full(config_dir: &Path) -> Result<()> {
    finish(&run_operation(config_dir, Operation::FullSync).await?)
}

pub async fn push(config_dir: &Path) -> Result<()> {
    finish(&run_operation(config_dir, Operation::PushLocal).await?)
}

pub async fn pull(config_dir: &Path) -> Result<()> {
    finish(&run_operation(config_dir, Operation::PullRemote).await?)
}

pub async fn snapshot(config_dir: &Path) -> Result<()> {
    finish(&run_operation(config_dir, Operation::Snapshot).await?)
}

pub async fn history(config_dir: &Path, limit: u32) -> Result<()> {
    let ctx = SyncContext::open(config_dir).await?;
    let entries = ctx.engine.history(limit).await;
    ctx.shutdown().await;
    print_json(&entries?)
}

/// 前台运行调度器，收到 Ctrl-C 后停止
pub async fn run(config_dir: &Path) -> Result<()> {
    let ctx = SyncContext::open(config_dir).await?;
    let cancel = ctx.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到退出信号");
            cancel.cancel();
        }
    });

    let result = ctx.run().await;
    ctx.shutdown().await;
    result
}
