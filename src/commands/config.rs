//! 配置查看命令

use super::print_json;
use crate::config::{RemoteConfig, VaultConfig};
use anyhow::Result;
use std::path::Path;

const MASK: &str = "******";

/// 输出当前库配置，密钥和密码以掩码代替
pub fn show(config_dir: &Path) -> Result<()> {
    let config = VaultConfig::load(config_dir)?;
    print_json(&masked(config))
}

fn masked(mut config: VaultConfig) -> VaultConfig {
    match &mut config.remote {
        RemoteConfig::S3 { secret_key, .. } => *secret_key = MASK.to_string(),
        RemoteConfig::WebDav { password, .. } => *password = MASK.to_string(),
        RemoteConfig::Local { .. } => {}
    }
    config
}
