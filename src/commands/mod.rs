//! 命令行子命令

pub mod config;
pub mod deletions;
pub mod log;
pub mod sync;

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 以当前本地文件为基线建立跟踪（不访问远程）
    Init,
    /// 双向全量同步
    Sync,
    /// 只把本地变更推送到远程
    Push,
    /// 只把远程变更拉取到本地
    Pull,
    /// 检测本地删除并列出待确认的删除
    Deletions,
    /// 列出待确认的删除（不做检测）
    Pending,
    /// 确认一个待处理的删除
    Confirm {
        /// 库内相对路径
        path: String,
    },
    /// 撤销一个待处理的删除
    Restore {
        /// 库内相对路径
        path: String,
    },
    /// 打包整个库并上传快照
    Snapshot,
    /// 查看同步历史
    History {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// 前台运行定时同步和实时监听，Ctrl-C 退出
    Run,
    /// 显示当前配置（敏感字段已隐藏）
    Config,
    /// 查看或修改日志配置
    Log {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        max_size_mb: Option<u32>,
    },
}

pub async fn execute(command: Command, config_dir: &Path) -> Result<()> {
    match command {
        Command::Init => sync::init(config_dir).await,
        Command::Sync => sync::full(config_dir).await,
        Command::Push => sync::push(config_dir).await,
        Command::Pull => sync::pull(config_dir).await,
        Command::Deletions => deletions::check(config_dir).await,
        Command::Pending => deletions::list(config_dir).await,
        Command::Confirm { path } => deletions::confirm(config_dir, &path).await,
        Command::Restore { path } => deletions::restore(config_dir, &path).await,
        Command::Snapshot => sync::snapshot(config_dir).await,
        Command::History { limit } => sync::history(config_dir, limit).await,
        Command::Run => sync::run(config_dir).await,
        Command::Config => config::show(config_dir),
        Command::Log {
            enabled,
            level,
            max_size_mb,
        } => log::update(config_dir, enabled, level, max_size_mb),
    }
}

/// 以格式化 JSON 输出到标准输出
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
