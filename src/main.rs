use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use vaultsync::commands::{self, Command};
use vaultsync::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "vaultsync", version, about = "Obsidian 库与对象存储之间的双向同步")]
struct Cli {
    /// 配置目录（默认为系统配置目录下的 vaultsync）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli
        .config_dir
        .unwrap_or_else(vaultsync::default_config_dir);

    std::fs::create_dir_all(&config_dir)?;
    init_logging(&config_dir);
    tracing::debug!("配置目录: {:?}", config_dir);

    commands::execute(cli.command, &config_dir).await
}
