use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 冲突中的一方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Local,
    Remote,
}

impl ConflictSide {
    pub fn other(self) -> Self {
        match self {
            ConflictSide::Local => ConflictSide::Remote,
            ConflictSide::Remote => ConflictSide::Local,
        }
    }
}

impl fmt::Display for ConflictSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictSide::Local => write!(f, "local"),
            ConflictSide::Remote => write!(f, "remote"),
        }
    }
}

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// 修改时间较新的一方获胜（时间相同时本地获胜）
    LastWriterWins,
    KeepLocal,
    KeepRemote,
}

impl ConflictResolution {
    /// 决定获胜方
    pub fn winner(self, local_mtime: i64, remote_mtime: i64) -> ConflictSide {
        match self {
            ConflictResolution::KeepLocal => ConflictSide::Local,
            ConflictResolution::KeepRemote => ConflictSide::Remote,
            ConflictResolution::LastWriterWins if remote_mtime > local_mtime => {
                ConflictSide::Remote
            }
            ConflictResolution::LastWriterWins => ConflictSide::Local,
        }
    }
}

/// 归档名里的时间部分：精确到毫秒，按字典序即按时间排序
pub fn artifact_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// 8 位随机标签，区分同一毫秒内生成的归档
pub fn unique_tag() -> String {
    let mut tag = uuid::Uuid::new_v4().simple().to_string();
    tag.truncate(8);
    tag
}

/// 生成冲突文件名：`<名称>_conflict_<side>_<YYYYmmdd_HHMMSS_mmm>_<tag><.扩展名>`
///
/// 只在最后一个路径段里找扩展名，目录名中的点不受影响。
pub fn generate_conflict_name(path: &str, side: ConflictSide, at: DateTime<Utc>, tag: &str) -> String {
    let suffix = format!("_conflict_{}_{}_{}", side, artifact_stamp(at), tag);

    let file_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[file_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let (name, ext) = path.split_at(file_start + dot);
            format!("{}{}{}", name, suffix, ext)
        }
        _ => format!("{}{}", path, suffix),
    }
}
