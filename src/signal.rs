//! 信号引擎模块
//!
//! 本模块根据行情更新与主力合约切换条件评估策略规则，产生交易信号。
//! 信号由本模块独占创建，由订单管理器恰好消费一次。
//!
//! # 核心概念
//!
//! - **Signal**: 交易信号记录，创建后除 `processed` 标志外不可变
//! - **SignalKind**: 信号种类（开多/开空/平多/平空/移仓平/移仓开）
//! - **SignalPriority**: 优先级阶梯——移仓信号 > 自主开平信号 > 例行定时信号
//! - **StrategyRule**: 突破型策略规则（上下轨触发价与下单数量）
//!
//! # 主力切换配对
//!
//! 旧主力上有持仓的品种发生主力切换时，引擎成对产生 `RollClose`（旧合约平仓）与
//! `RollOpen`（新合约等量重建），两者共享触发时间与数量，净敞口跨切换保持不变。
//! 配对是硬性不变量：绝不单独产生其中之一。

use crate::{
    Direction, Offset, Sequence, StrategyId,
    bus::MarketTick,
    position::PositionTracker,
    registry::{ContractRegistry, RolloverEvent},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

/// 信号种类。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum SignalKind {
    /// 开多。
    OpenLong,
    /// 开空。
    OpenShort,
    /// 平多。
    CloseLong,
    /// 平空。
    CloseShort,
    /// 主力切换：旧合约平仓。
    RollClose,
    /// 主力切换：新合约重建。
    RollOpen,
}

impl SignalKind {
    /// 信号对应的开平标志。
    pub fn offset(&self) -> Offset {
        match self {
            SignalKind::OpenLong | SignalKind::OpenShort | SignalKind::RollOpen => Offset::Open,
            SignalKind::CloseLong | SignalKind::CloseShort | SignalKind::RollClose => Offset::Close,
        }
    }

    /// 信号种类的默认优先级。
    pub fn default_priority(&self) -> SignalPriority {
        match self {
            SignalKind::RollClose | SignalKind::RollOpen => SignalPriority::Rollover,
            _ => SignalPriority::Discretionary,
        }
    }
}

/// 信号优先级。
///
/// 订单管理器在同一轮处理中清空积压信号时按优先级从高到低处理；
/// 跨轮次不保证顺序。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum SignalPriority {
    /// 移仓信号，最高优先级。
    Rollover = 0,
    /// 自主开平信号。
    Discretionary = 1,
    /// 例行定时信号，最低优先级。
    Routine = 2,
}

/// 交易信号。
///
/// 由信号引擎创建，订单管理器消费。创建后除 `processed`/`reject_reason`
/// 之外不可变。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Signal {
    /// 信号序号，进程内唯一。
    pub id: u64,
    /// 策略标识。
    pub strategy: StrategyId,
    /// 品种代码。
    pub product: SmolStr,
    /// 合约代码。
    pub contract: SmolStr,
    /// 信号种类。
    pub kind: SignalKind,
    /// 持仓方向。
    pub direction: Direction,
    /// 触发值（突破轨价格或切换前主力价格）。
    pub trigger_value: Decimal,
    /// 目标价格（报单前经过价格取整）。
    pub price: Decimal,
    /// 目标数量。
    pub volume: Decimal,
    /// 触发时间。
    pub time: DateTime<Utc>,
    /// 优先级。
    pub priority: SignalPriority,
    /// 是否已被订单管理器消费。
    pub processed: bool,
    /// 拒绝原因（信号被风控整体拒绝时记录）。
    pub reject_reason: Option<String>,
}

impl Signal {
    /// 标记信号已消费（已提交派生订单）。
    pub fn mark_processed(&mut self) {
        self.processed = true;
    }

    /// 标记信号已消费且被拒绝。
    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        self.processed = true;
        self.reject_reason = Some(reason.into());
    }
}

/// 突破型策略规则。
///
/// 价格上破 `break_high` 开多（或先平空），下破 `break_low` 开空（或先平多）。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct StrategyRule {
    /// 策略标识。
    pub strategy: StrategyId,
    /// 品种代码。
    pub product: SmolStr,
    /// 上轨触发价。
    pub break_high: Decimal,
    /// 下轨触发价。
    pub break_low: Decimal,
    /// 每次下单数量。
    pub volume: Decimal,
    /// 是否参与例行定时清仓。
    #[serde(default)]
    pub flatten_on_schedule: bool,
}

/// 信号引擎。
///
/// 持有策略规则集合，针对行情/切换/定时三类输入产生信号。
#[derive(Debug, Clone)]
pub struct SignalEngine {
    rules: Vec<StrategyRule>,
    sequence: Sequence,
}

impl SignalEngine {
    /// 从规则列表构造引擎。
    pub fn new(rules: Vec<StrategyRule>) -> Self {
        Self {
            rules,
            sequence: Sequence(0),
        }
    }

    /// 规则数量。
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 评估一笔行情更新，返回按优先级排序的信号列表。
    ///
    /// 忽略清单内的品种不产生信号。突破规则只在当前合约上评估：
    /// 上破上轨时有空仓先平空、无持仓则开多；下破下轨对称处理。
    pub fn on_market_update(
        &mut self,
        tick: &MarketTick,
        registry: &ContractRegistry,
        positions: &PositionTracker,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        if registry.is_ignored(tick.product.as_str()) {
            return signals;
        }

        for rule in self.rules.iter().filter(|rule| rule.product == tick.product) {
            let position = positions.position(&rule.strategy, tick.contract.as_str());

            if tick.last_price >= rule.break_high {
                match position {
                    Some(p) if p.direction == Direction::Short && !p.open_volume().is_zero() => {
                        signals.push(make_signal(
                            &mut self.sequence,
                            rule,
                            tick,
                            SignalKind::CloseShort,
                            Direction::Short,
                            rule.break_high,
                            p.open_volume(),
                        ));
                    }
                    None => {
                        signals.push(make_signal(
                            &mut self.sequence,
                            rule,
                            tick,
                            SignalKind::OpenLong,
                            Direction::Long,
                            rule.break_high,
                            rule.volume,
                        ));
                    }
                    _ => {}
                }
            } else if tick.last_price <= rule.break_low {
                match position {
                    Some(p) if p.direction == Direction::Long && !p.open_volume().is_zero() => {
                        signals.push(make_signal(
                            &mut self.sequence,
                            rule,
                            tick,
                            SignalKind::CloseLong,
                            Direction::Long,
                            rule.break_low,
                            p.open_volume(),
                        ));
                    }
                    None => {
                        signals.push(make_signal(
                            &mut self.sequence,
                            rule,
                            tick,
                            SignalKind::OpenShort,
                            Direction::Short,
                            rule.break_low,
                            rule.volume,
                        ));
                    }
                    _ => {}
                }
            }
        }

        sort_for_drain(&mut signals);
        signals
    }

    /// 处理主力切换事件，为旧主力上的每个持仓产生配对的移仓信号。
    ///
    /// `RollClose` 与 `RollOpen` 成对产生——同一触发时间、同一数量，
    /// 净敞口跨切换保持不变。旧主力无持仓时不产生任何信号。
    pub fn on_rollover(
        &mut self,
        event: &RolloverEvent,
        positions: &PositionTracker,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        for rule in self.rules.iter().filter(|rule| rule.product == event.product) {
            let Some(position) = positions.position(&rule.strategy, event.old_main.as_str())
            else {
                continue;
            };
            let open_volume = position.open_volume();
            if open_volume.is_zero() {
                continue;
            }

            debug!(
                strategy = %rule.strategy,
                product = %event.product,
                old_main = %event.old_main,
                new_main = %event.new_main,
                %open_volume,
                "emitting rollover signal pair"
            );

            let base = self.sequence.fetch_add().value();
            signals.push(Signal {
                id: base,
                strategy: rule.strategy.clone(),
                product: event.product.clone(),
                contract: event.old_main.clone(),
                kind: SignalKind::RollClose,
                direction: position.direction,
                trigger_value: position.avg_entry_price,
                price: Decimal::ZERO,
                volume: open_volume,
                time: event.time,
                priority: SignalPriority::Rollover,
                processed: false,
                reject_reason: None,
            });
            signals.push(Signal {
                id: self.sequence.fetch_add().value(),
                strategy: rule.strategy.clone(),
                product: event.product.clone(),
                contract: event.new_main.clone(),
                kind: SignalKind::RollOpen,
                direction: position.direction,
                trigger_value: position.avg_entry_price,
                price: Decimal::ZERO,
                volume: open_volume,
                time: event.time,
                priority: SignalPriority::Rollover,
                processed: false,
                reject_reason: None,
            });
        }

        signals
    }

    /// 例行定时清仓：为参与定时清仓的规则在持仓合约上产生平仓信号。
    ///
    /// 信号优先级为 [`SignalPriority::Routine`]，同一轮处理中排在其他信号之后。
    pub fn on_schedule(
        &mut self,
        now: DateTime<Utc>,
        positions: &PositionTracker,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        for rule in self.rules.iter().filter(|rule| rule.flatten_on_schedule) {
            for position in positions
                .open_positions()
                .filter(|p| p.strategy == rule.strategy && p.product == rule.product)
            {
                let open_volume = position.open_volume();
                if open_volume.is_zero() {
                    continue;
                }
                let kind = match position.direction {
                    Direction::Long => SignalKind::CloseLong,
                    Direction::Short => SignalKind::CloseShort,
                };
                signals.push(Signal {
                    id: self.sequence.fetch_add().value(),
                    strategy: rule.strategy.clone(),
                    product: rule.product.clone(),
                    contract: position.contract.clone(),
                    kind,
                    direction: position.direction,
                    trigger_value: Decimal::ZERO,
                    price: Decimal::ZERO,
                    volume: open_volume,
                    time: now,
                    priority: SignalPriority::Routine,
                    processed: false,
                    reject_reason: None,
                });
            }
        }

        signals
    }
}

/// 同一轮处理内按优先级（其次按产生顺序）排序，供订单管理器清空积压时使用。
pub fn sort_for_drain(signals: &mut [Signal]) {
    signals.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
}

fn make_signal(
    sequence: &mut Sequence,
    rule: &StrategyRule,
    tick: &MarketTick,
    kind: SignalKind,
    direction: Direction,
    trigger_value: Decimal,
    volume: Decimal,
) -> Signal {
    Signal {
        id: sequence.fetch_add().value(),
        strategy: rule.strategy.clone(),
        product: tick.product.clone(),
        contract: tick.contract.clone(),
        kind,
        direction,
        trigger_value,
        price: tick.last_price,
        volume,
        time: tick.time,
        priority: kind.default_priority(),
        processed: false,
        reject_reason: None,
    }
}
