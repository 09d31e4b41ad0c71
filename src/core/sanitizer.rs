//! 路径规范化 - 把本地路径映射为远程安全的规范 key

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

/// 远程命名空间的路径长度上限（字符数）
pub const MAX_KEY_LEN: usize = 255;

/// 被拒绝路径的规范形式
pub const SKIP_MARKER: &str = "";

/// 默认忽略规则
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "*.tmp",
    "*.bak",
    ".DS_Store",
    "Thumbs.db",
    ".obsidian/workspace*",
    ".trash/*",
];

static DEFAULT_SANITIZER: LazyLock<PathSanitizer> = LazyLock::new(PathSanitizer::default);

/// 跳过原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    Empty,
    Traversal,
    TooLong { len: usize },
    Ignored { pattern: String },
    /// 两个本地路径映射到同一个 key
    Collision { key: String },
    /// 远程 key 不是规范形式
    NotCanonical { canonical: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Empty => write!(f, "空路径"),
            SkipReason::Traversal => write!(f, "包含 .. 路径段"),
            SkipReason::TooLong { len } => {
                write!(f, "路径过长 ({} > {} 字符)", len, MAX_KEY_LEN)
            }
            SkipReason::Ignored { pattern } => write!(f, "匹配忽略规则 {}", pattern),
            SkipReason::Collision { key } => write!(f, "与已有路径冲突: {}", key),
            SkipReason::NotCanonical { canonical } => {
                write!(f, "不是规范路径 (规范形式: {})", canonical)
            }
        }
    }
}

/// 规范化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sanitized {
    Key(String),
    Skip(SkipReason),
}

impl Sanitized {
    pub fn key(&self) -> Option<&str> {
        match self {
            Sanitized::Key(key) => Some(key),
            Sanitized::Skip(_) => None,
        }
    }

    pub fn into_result(self) -> Result<String, SkipReason> {
        match self {
            Sanitized::Key(key) => Ok(key),
            Sanitized::Skip(reason) => Err(reason),
        }
    }
}

/// 编译后的忽略规则
#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: String,
    regex: Regex,
    /// 不含 `/` 的规则逐段匹配，含 `/` 的规则匹配整个路径
    per_segment: bool,
}

impl IgnoreRule {
    fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let mut body = String::new();
        for c in pattern.chars() {
            match c {
                '*' => body.push_str(".*"),
                '?' => body.push('.'),
                other => body.push_str(&regex::escape(&other.to_string())),
            }
        }

        let per_segment = !pattern.contains('/');
        let regex = if per_segment {
            Regex::new(&format!("(?i)^{}$", body))?
        } else {
            Regex::new(&format!("(?i)^(?:.*/)?{}$", body))?
        };

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            per_segment,
        })
    }

    fn matches(&self, key: &str) -> bool {
        if self.per_segment {
            key.split('/').any(|segment| self.regex.is_match(segment))
        } else {
            self.regex.is_match(key)
        }
    }
}

/// 路径规范化器
///
/// 纯函数、全定义：任何输入都会得到规范 key 或确定的跳过结果，且
/// `canonical(canonical(x)) == canonical(x)`。
#[derive(Debug, Clone)]
pub struct PathSanitizer {
    rules: Vec<IgnoreRule>,
    max_len: usize,
}

impl Default for PathSanitizer {
    fn default() -> Self {
        let rules = DEFAULT_IGNORE_PATTERNS
            .iter()
            .filter_map(|p| IgnoreRule::compile(p).ok())
            .collect();
        Self {
            rules,
            max_len: MAX_KEY_LEN,
        }
    }
}

impl PathSanitizer {
    /// 默认规则之外追加自定义忽略规则
    pub fn with_patterns(extra: &[String]) -> Result<Self, regex::Error> {
        let mut sanitizer = Self::default();
        for pattern in extra {
            sanitizer.rules.push(IgnoreRule::compile(pattern)?);
        }
        Ok(sanitizer)
    }

    pub fn sanitize(&self, raw: &str) -> Sanitized {
        let normalized = raw.replace('\\', "/");
        let mut segments = Vec::new();

        for segment in normalized.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Sanitized::Skip(SkipReason::Traversal),
                _ => {}
            }

            let replaced: String = segment
                .chars()
                .map(|c| if is_invalid_char(c) { '_' } else { c })
                .collect();
            let trimmed = replaced.trim_end_matches([' ', '.']);
            segments.push(if trimmed.is_empty() {
                "_".to_string()
            } else {
                trimmed.to_string()
            });
        }

        if segments.is_empty() {
            return Sanitized::Skip(SkipReason::Empty);
        }

        let key = segments.join("/");
        let len = key.chars().count();
        if len > self.max_len {
            return Sanitized::Skip(SkipReason::TooLong { len });
        }

        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(&key)) {
            return Sanitized::Skip(SkipReason::Ignored {
                pattern: rule.pattern.clone(),
            });
        }

        Sanitized::Key(key)
    }

    /// 规范字符串形式：规范 key，或被拒绝时的 [`SKIP_MARKER`]
    pub fn canonical(&self, raw: &str) -> String {
        match self.sanitize(raw) {
            Sanitized::Key(key) => key,
            Sanitized::Skip(_) => SKIP_MARKER.to_string(),
        }
    }

    pub fn is_ignored(&self, raw: &str) -> bool {
        matches!(
            self.sanitize(raw),
            Sanitized::Skip(SkipReason::Ignored { .. })
        )
    }
}

/// 使用默认规则规范化
pub fn sanitize(raw: &str) -> Sanitized {
    DEFAULT_SANITIZER.sanitize(raw)
}

fn is_invalid_char(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*')
}
