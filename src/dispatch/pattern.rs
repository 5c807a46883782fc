//! 通道名模式匹配
//!
//! Redis `psubscribe` 风格的通配模式：`*` 匹配任意长度片段，`?` 匹配单个字符。
//! 模式不保证特异性排序——注册方必须避免语义上相互覆盖的模式。

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// 一条已注册的通道名通配模式。
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct ChannelPattern(SmolStr);

impl ChannelPattern {
    /// 从模式字符串构造。
    pub fn new(pattern: impl Into<SmolStr>) -> Self {
        Self(pattern.into())
    }

    /// 模式字符串。
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// 通道名是否命中本模式。
    pub fn matches(&self, channel: &str) -> bool {
        glob_match(self.0.as_bytes(), channel.as_bytes())
    }
}

impl std::fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn glob_match(pattern: &[u8], input: &[u8]) -> bool {
    match (pattern.first(), input.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            // `*` 匹配空串，或吞掉一个字符继续
            glob_match(&pattern[1..], input)
                || (!input.is_empty() && glob_match(pattern, &input[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &input[1..]),
        (Some(p), Some(c)) if p == c => glob_match(&pattern[1..], &input[1..]),
        _ => false,
    }
}
