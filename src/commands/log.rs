//! 日志相关命令

use super::print_json;
use crate::logging::LogConfig;
use anyhow::Result;
use std::path::Path;

/// 修改日志配置并输出结果；不带参数时只显示当前配置
pub fn update(
    config_dir: &Path,
    enabled: Option<bool>,
    level: Option<String>,
    max_size_mb: Option<u32>,
) -> Result<()> {
    let mut config = LogConfig::load(config_dir);
    let changed = enabled.is_some() || level.is_some() || max_size_mb.is_some();

    if let Some(e) = enabled {
        config.enabled = e;
    }
    if let Some(size) = max_size_mb {
        config.set_max_size_mb(size);
    }
    if let Some(l) = level {
        config.set_level(&l)?;
    }

    if changed {
        config.save(config_dir)?;
    }
    print_json(&config)
}
