//! 总线报文模块
//!
//! 本模块定义通道命名模板与所有出入站的结构化报文载荷。载荷是字段化的 JSON
//! 报文而非原始字节，字段集按操作镜像订单/信号/合约属性。
//!
//! # 通道命名（精确字符串，参数化）
//!
//! - 入站请求：`MSG:CTP:REQ:{operation}`
//! - 交易回报：`MSG:CTP:RSP:TRADE:{broker_id}:{request_id}`
//! - 行情回报：`MSG:CTP:RSP:MARKET:{broker_id}:{request_id}`
//! - 日志扇出：`MSG:LOG:WEIXIN`

use crate::{Direction, Offset, OrderRef, StrategyId};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};

/// Redis 总线连接器。
pub mod redis;

/// 通道命名模板集合。
///
/// 模板值来自配置，运行时以经纪商/请求标识实例化出具体通道名。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChannelTopics {
    /// 请求通道模式（`MSG:CTP:REQ:*`）。
    pub request_pattern: SmolStr,
    /// 请求通道格式（`MSG:CTP:REQ:{operation}`）。
    pub request_format: SmolStr,
    /// 交易回报通道前缀（`MSG:CTP:RSP:TRADE:`）。
    pub trade_response_prefix: SmolStr,
    /// 行情回报通道前缀（`MSG:CTP:RSP:MARKET:`）。
    pub market_response_prefix: SmolStr,
    /// 日志扇出通道（`MSG:LOG:WEIXIN`）。
    pub weixin_log: SmolStr,
}

impl Default for ChannelTopics {
    fn default() -> Self {
        Self {
            request_pattern: SmolStr::new("MSG:CTP:REQ:*"),
            request_format: SmolStr::new("MSG:CTP:REQ:"),
            trade_response_prefix: SmolStr::new("MSG:CTP:RSP:TRADE:"),
            market_response_prefix: SmolStr::new("MSG:CTP:RSP:MARKET:"),
            weixin_log: SmolStr::new("MSG:LOG:WEIXIN"),
        }
    }
}

impl ChannelTopics {
    /// 某经纪商全部交易回报的订阅模式。
    pub fn trade_response_pattern(&self, broker_id: &str) -> SmolStr {
        format_smolstr!("{}{}:*", self.trade_response_prefix, broker_id)
    }

    /// 某经纪商全部行情回报的订阅模式。
    pub fn market_response_pattern(&self, broker_id: &str) -> SmolStr {
        format_smolstr!("{}{}:*", self.market_response_prefix, broker_id)
    }

    /// 实例化请求通道名。
    pub fn request_channel(&self, operation: &str) -> SmolStr {
        format_smolstr!("{}{}", self.request_format, operation)
    }
}

/// 从总线收到的一条入站消息。
///
/// `pattern` 是命中的订阅模式（Redis psubscribe 语义），`payload` 是已经
/// 反序列化的 JSON 值，分发器在调用处理器之前完成反序列化。
#[derive(Debug, Clone, PartialEq, Constructor)]
pub struct InboundMessage {
    /// 具体通道名。
    pub channel: SmolStr,
    /// 命中的订阅模式。
    pub pattern: Option<SmolStr>,
    /// 结构化载荷。
    pub payload: serde_json::Value,
}

/// 待发布到总线的一条出站消息。
#[derive(Debug, Clone, PartialEq, Constructor)]
pub struct OutboundMessage {
    /// 目标通道名。
    pub channel: SmolStr,
    /// 结构化载荷。
    pub payload: serde_json::Value,
}

/// 报单请求载荷，发布到 `MSG:CTP:REQ:SubmitOrder`。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct OrderRequest {
    /// 经纪商标识。
    pub broker_id: SmolStr,
    /// 策略标识。
    pub strategy: StrategyId,
    /// 合约代码。
    pub contract: SmolStr,
    /// 客户端订单引用。
    pub order_ref: OrderRef,
    /// 报单价格（已按最小变动价位取整）。
    pub price: Decimal,
    /// 报单数量。
    pub volume: Decimal,
    /// 持仓方向。
    pub direction: Direction,
    /// 开平标志。
    pub offset: Offset,
    /// 来源信号序号。
    pub signal_id: Option<u64>,
}

/// 交易通道回报载荷。
///
/// 柜台回报是权威状态来源，但必须容忍重复与乱序到达：
/// 指向终态订单的回报是空操作。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TradeEvent {
    /// 报单已被柜台接受。
    OrderAccepted {
        /// 客户端订单引用。
        order_ref: OrderRef,
        /// 交易所订单号。
        exchange_order_id: Option<SmolStr>,
        /// 回报时间。
        time: DateTime<Utc>,
    },
    /// 报单被柜台/交易所拒绝。
    OrderRejected {
        /// 客户端订单引用。
        order_ref: OrderRef,
        /// 拒绝原因。
        reason: String,
        /// 回报时间。
        time: DateTime<Utc>,
    },
    /// 报单已撤销。
    OrderCanceled {
        /// 客户端订单引用。
        order_ref: OrderRef,
        /// 回报时间。
        time: DateTime<Utc>,
    },
    /// 成交回报（部分或全部）。
    OrderFilled {
        /// 客户端订单引用。
        order_ref: OrderRef,
        /// 成交价格。
        price: Decimal,
        /// 本笔成交数量。
        volume: Decimal,
        /// 成交时间。
        time: DateTime<Utc>,
    },
    /// 账户资金回报。
    AccountUpdate {
        /// 账户权益。
        balance: Decimal,
        /// 可用资金。
        available: Decimal,
        /// 回报时间。
        time: DateTime<Utc>,
    },
}

impl TradeEvent {
    /// 回报引用的订单（账户回报返回 `None`）。
    pub fn order_ref(&self) -> Option<&OrderRef> {
        match self {
            TradeEvent::OrderAccepted { order_ref, .. }
            | TradeEvent::OrderRejected { order_ref, .. }
            | TradeEvent::OrderCanceled { order_ref, .. }
            | TradeEvent::OrderFilled { order_ref, .. } => Some(order_ref),
            TradeEvent::AccountUpdate { .. } => None,
        }
    }
}

/// 行情通道回报载荷。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct MarketTick {
    /// 品种代码。
    pub product: SmolStr,
    /// 合约代码。
    pub contract: SmolStr,
    /// 最新价。
    pub last_price: Decimal,
    /// 交易所报告的当前主力合约（用于主力切换检测）。
    pub main_contract: Option<SmolStr>,
    /// 行情时间。
    pub time: DateTime<Utc>,
}

/// 日志扇出载荷，发布到 `MSG:LOG:WEIXIN`。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct LogFanout {
    /// 日志级别。
    pub level: SmolStr,
    /// 日志内容。
    pub message: String,
    /// 记录时间。
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_channel_topics_formatting() {
        let topics = ChannelTopics::default();
        assert_eq!(
            topics.trade_response_pattern("9999"),
            SmolStr::new("MSG:CTP:RSP:TRADE:9999:*")
        );
        assert_eq!(
            topics.market_response_pattern("9999"),
            SmolStr::new("MSG:CTP:RSP:MARKET:9999:*")
        );
        assert_eq!(
            topics.request_channel("SubmitOrder"),
            SmolStr::new("MSG:CTP:REQ:SubmitOrder")
        );
    }

    #[test]
    fn test_trade_event_round_trips_as_tagged_json() {
        let event = TradeEvent::OrderFilled {
            order_ref: OrderRef::from_str_ref("00000001"),
            price: dec!(3150),
            volume: dec!(2),
            time: DateTime::<Utc>::MIN_UTC,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "order_filled");
        let parsed: TradeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_market_tick_deserialises_from_gateway_payload() {
        let raw = serde_json::json!({
            "product": "rb",
            "contract": "rb2410",
            "last_price": "3005.0",
            "main_contract": "rb2410",
            "time": "2024-06-03T01:30:00Z",
        });
        let tick: MarketTick = serde_json::from_value(raw).unwrap();
        assert_eq!(tick.last_price, dec!(3005.0));
        assert_eq!(tick.main_contract, Some(SmolStr::new("rb2410")));
    }
}
