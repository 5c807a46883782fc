#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Ctp-Trader
//! 事件分发驱动的国内商品期货策略运行器核心。
//! * **事件驱动**：基于 Redis 发布/订阅通道与 crontab 定时任务的模式分发器驱动一切逻辑。
//! * **精确**：所有价格、保证金与盈亏运算均使用十进制精确算术，从不使用二进制浮点数。
//! * **健壮**：强类型状态机（信号 → 订单 → 部分成交 → 持仓 → 平仓），同通道消息严格 FIFO。
//!
//! ## 概述
//! 核心组件自底向上：
//! * [`registry`](registry)：合约静态/衍生元数据（最小变动价位、保证金率、涨跌停比例、
//!   主力合约切换检测）与价格取整。
//! * [`risk`](risk)：对拟发订单的纯函数式风控校验（价格带、平仓数量、保证金余量）。
//! * [`position`](position)：按合约/策略维护开平仓状态，应用成交回报。
//! * [`signal`](signal)：根据行情与主力切换条件评估策略规则，产生交易信号。
//! * [`order`](order)：将通过风控的信号转换为订单请求，跟踪订单生命周期，
//!   并把成交推送给持仓跟踪器。
//! * [`dispatch`](dispatch)：事件循环核心——把处理器注册到通道名模式与 cron 表达式上，
//!   将总线消息与定时触发路由到对应处理器，负责 run/stop 生命周期。
//!
//! 数据流：总线消息 → 分发器模式匹配 → 处理器（信号/订单）→ 状态变更（持仓）→
//! 风控校验 → 出站订单消息 → 持久化与日志。

use derive_more::{Constructor, Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// 事件分发器：通道模式与 cron 调度的显式注册表、按通道 FIFO 的并发处理。
pub mod dispatch;

/// 定义核心中所有可能的错误。
pub mod error;

/// 总线通道命名模板与结构化报文载荷。
pub mod bus;

/// 合约注册表：元数据解析、价格取整、主力合约切换检测。
pub mod registry;

/// 持仓跟踪器：开平仓状态、加权均价、已实现盈亏与冻结保证金。
pub mod position;

/// 订单管理器：信号转订单、订单生命周期、柜台回报处理。
pub mod order;

/// 信号引擎：策略规则评估与主力切换配对信号。
pub mod signal;

/// 风控闸门：报单前的纯函数式校验。
pub mod risk;

/// 持久化边界：`Store` 接口与内存实现。
pub mod store;

/// 策略上下文：各组件实例的显式容器，取代环境全局量。
pub mod context;

/// 策略运行器：构建注册表并承载行情/回报处理器与定时任务。
pub mod trader;

/// 配置值集合（通道模板、风控限额、忽略合约等）。
pub mod config;

/// 提供默认的 Tracing 日志初始化器。
pub mod logging;

/// 按交易所限流的外部数据拉取许可。
pub mod throttle;

/// 持仓方向（多/空）。
///
/// 国内期货的持仓方向与买卖方向是两个维度：开多/平多对应买入/卖出，
/// 开空/平空对应卖出/买入。本核心统一以持仓方向建模。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum Direction {
    /// 多头。
    #[display("Long")]
    Long,
    /// 空头。
    #[display("Short")]
    Short,
}

impl Direction {
    /// 返回相反方向。
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// 开平标志。
///
/// 上期所区分平今与平昨，其他交易所统一用 `Close`。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum Offset {
    /// 开仓。
    #[display("Open")]
    Open,
    /// 平仓（平昨）。
    #[display("Close")]
    Close,
    /// 平今仓。
    #[display("CloseToday")]
    CloseToday,
}

impl Offset {
    /// 是否为开仓。
    pub fn is_open(&self) -> bool {
        matches!(self, Offset::Open)
    }

    /// 是否为平仓（含平今）。
    pub fn is_close(&self) -> bool {
        !self.is_open()
    }
}

/// 策略标识。
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Display,
    From,
    Constructor,
)]
pub struct StrategyId(pub SmolStr);

impl StrategyId {
    /// 从字符串构造策略标识。
    pub fn from_name(name: &str) -> Self {
        Self(SmolStr::new(name))
    }
}

/// 客户端自编的订单引用。
///
/// 报单时由 [`OrderManager`](order::OrderManager) 分配，柜台回报以此关联订单。
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Display,
    From,
    Constructor,
)]
pub struct OrderRef(pub SmolStr);

impl OrderRef {
    /// 从字符串构造订单引用。
    pub fn from_str_ref(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

/// 单调递增的序列号。
///
/// 用于分配信号 ID 与订单引用，保证同一进程内唯一且可追溯。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct Sequence(pub u64);

impl Sequence {
    /// 获取序列号的当前值。
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 获取当前序列号并递增。
    pub fn fetch_add(&mut self) -> Sequence {
        let sequence = *self;
        self.0 += 1;
        sequence
    }
}

/// 核心测试工具。
///
/// 提供测试中快速构造品种与成交回报的辅助函数。
pub mod test_utils {
    use crate::{
        Direction, Offset, OrderRef, StrategyId,
        position::Fill,
        registry::{Exchange, Instrument, product_of},
    };
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use smol_str::{SmolStr, format_smolstr};
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_FILL_REF: AtomicU64 = AtomicU64::new(1);

    /// 创建测试用的品种元数据。
    ///
    /// 合约乘数 10、保证金率 0.1、涨跌停比例 0.05，主力合约为 `{code}2410`。
    pub fn instrument(code: &str, price_tick: f64) -> Instrument {
        Instrument {
            code: SmolStr::new(code),
            exchange: Exchange::Shfe,
            name: code.to_string(),
            price_tick: Decimal::try_from(price_tick).unwrap(),
            volume_multiple: Decimal::from(10),
            margin_rate: Decimal::try_from(0.1).unwrap(),
            up_limit_ratio: Decimal::try_from(0.05).unwrap(),
            down_limit_ratio: Decimal::try_from(0.05).unwrap(),
            main_code: SmolStr::new(format!("{code}2410")),
            last_main_code: None,
            main_switch_time: None,
            night_trade: true,
        }
    }

    /// 创建测试用的成交回报。
    ///
    /// 订单总量默认等于本笔成交数量，订单引用每次调用唯一（每笔回报视作
    /// 来自独立订单）。
    pub fn fill(
        strategy: &str,
        contract: &str,
        direction: Direction,
        offset: Offset,
        price: f64,
        volume: f64,
    ) -> Fill {
        let volume = Decimal::try_from(volume).unwrap();
        let seq = NEXT_FILL_REF.fetch_add(1, Ordering::Relaxed);
        Fill {
            strategy: StrategyId::from_name(strategy),
            product: product_of(contract),
            contract: SmolStr::new(contract),
            direction,
            offset,
            price: Decimal::try_from(price).unwrap(),
            volume,
            order_volume: volume,
            order_ref: OrderRef(format_smolstr!("T{seq:07}")),
            time: DateTime::<Utc>::MIN_UTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_fetch_add() {
        let mut sequence = Sequence(0);
        assert_eq!(sequence.fetch_add(), Sequence(0));
        assert_eq!(sequence.fetch_add(), Sequence(1));
        assert_eq!(sequence.value(), 2);
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
    }

    #[test]
    fn test_offset_predicates() {
        assert!(Offset::Open.is_open());
        assert!(Offset::Close.is_close());
        assert!(Offset::CloseToday.is_close());
    }
}
