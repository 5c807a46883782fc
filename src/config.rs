//! 配置模块
//!
//! 核心消费的配置值集合：通道模板、每策略风控限额、忽略品种清单、命令超时、
//! 每交易所拉取并发上限与策略规则。加载机制不在范围之内，这里只定义值与
//! JSON 反序列化。

use crate::{bus::ChannelTopics, registry::Exchange, risk::RiskGate, signal::StrategyRule};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// 单交易所拉取并发上限。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct FetchCap {
    /// 交易所。
    pub exchange: Exchange,
    /// 并发许可数。
    pub permits: usize,
}

/// 策略运行器配置。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct TraderConfig {
    /// 经纪商标识。
    pub broker_id: SmolStr,
    /// Redis 连接地址。
    pub redis_url: String,
    /// 通道命名模板。
    #[serde(default)]
    pub channels: ChannelTopics,
    /// 停机宽限期/命令超时（秒）。
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// 忽略品种清单（不产生信号）。
    #[serde(default)]
    pub ignore_products: Vec<SmolStr>,
    /// 风控限额。
    #[serde(default)]
    pub risk: RiskGate,
    /// 策略规则。
    #[serde(default)]
    pub rules: Vec<StrategyRule>,
    /// 每交易所拉取并发上限。
    #[serde(default)]
    pub fetch_caps: Vec<FetchCap>,
    /// 合约元数据刷新的 cron 表达式。
    #[serde(default = "default_refresh_cron")]
    pub instrument_refresh_cron: String,
    /// 例行清仓的 cron 表达式（可选）。
    #[serde(default)]
    pub flatten_cron: Option<String>,
}

fn default_command_timeout() -> u64 {
    5
}

fn default_refresh_cron() -> String {
    "30 8 * * 1-5".to_string()
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            broker_id: SmolStr::new("9999"),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            channels: ChannelTopics::default(),
            command_timeout_secs: default_command_timeout(),
            ignore_products: Vec::new(),
            risk: RiskGate::default(),
            rules: Vec::new(),
            fetch_caps: Vec::new(),
            instrument_refresh_cron: default_refresh_cron(),
            flatten_cron: None,
        }
    }
}

impl TraderConfig {
    /// 从 JSON 文本解析配置。
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_with_defaults() {
        let raw = r#"{
            "broker_id": "9999",
            "redis_url": "redis://127.0.0.1:6379/0",
            "ignore_products": ["WH", "bb", "JR"],
            "flatten_cron": "55 14 * * 1-5"
        }"#;
        let config = TraderConfig::from_json(raw).unwrap();

        assert_eq!(config.broker_id, SmolStr::new("9999"));
        assert_eq!(config.command_timeout_secs, 5);
        assert_eq!(config.ignore_products.len(), 3);
        assert_eq!(config.channels.request_pattern, SmolStr::new("MSG:CTP:REQ:*"));
        assert_eq!(config.flatten_cron.as_deref(), Some("55 14 * * 1-5"));
        assert!(config.rules.is_empty());
    }
}
