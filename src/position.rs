//! 持仓跟踪模块
//!
//! 本模块是持仓状态的唯一权威来源：按（策略，合约）维护开平仓状态，应用成交回报，
//! 维护加权均价、已实现盈亏与冻结保证金。
//!
//! # 核心概念
//!
//! - **Fill**: 一笔成交回报（价格、数量、方向、开平）
//! - **Position**: 某策略在某合约上的持仓，记录开平数量与均价
//! - **PositionTracker**: 持仓集合的唯一写入方，其他组件只读
//!
//! # 不变量
//!
//! 每次 [`PositionTracker::apply_fill`] 之后都满足
//! `0 ≤ closed_shares ≤ filled_shares ≤ total_shares`。均价按数量加权增量维护，
//! 从不从历史成交重算。所有运算使用精确十进制，只在最小变动价位/货币边界取整，
//! 中间步骤不取整，避免舍入误差累积。
//!
//! # 保证金
//!
//! 开仓冻结 `价格 × 数量 × 合约乘数 × 保证金率`；平仓按平掉数量占未平数量的比例
//! 释放冻结额，完全平仓后冻结额归零、不留残差。

use crate::{Direction, Offset, OrderRef, StrategyId, registry::Instrument};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::warn;

/// 一笔成交回报。
///
/// 由 [`OrderManager`](crate::order::OrderManager) 在收到柜台成交回报时构造并
/// 转发给持仓跟踪器。`order_volume` 是产生此成交的订单的总量，用于维护
/// `total_shares`（部分成交时 `filled < total`）。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Fill {
    /// 策略标识。
    pub strategy: StrategyId,
    /// 品种代码。
    pub product: SmolStr,
    /// 合约代码。
    pub contract: SmolStr,
    /// 持仓方向。
    pub direction: Direction,
    /// 开平标志。
    pub offset: Offset,
    /// 成交价格。
    pub price: Decimal,
    /// 本笔成交数量。
    pub volume: Decimal,
    /// 产生此成交的订单总量。
    pub order_volume: Decimal,
    /// 订单引用。
    pub order_ref: OrderRef,
    /// 成交时间。
    pub time: DateTime<Utc>,
}

/// 某策略在某合约上的持仓。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Position {
    /// 经纪商标识。
    pub broker_id: SmolStr,
    /// 策略标识。
    pub strategy: StrategyId,
    /// 品种代码。
    pub product: SmolStr,
    /// 合约代码。
    pub contract: SmolStr,
    /// 持仓方向。
    pub direction: Direction,
    /// 计划总量（所有开仓订单数量之和）。
    pub total_shares: Decimal,
    /// 已成交的开仓数量。
    pub filled_shares: Decimal,
    /// 已平仓数量。
    pub closed_shares: Decimal,
    /// 开仓加权均价，增量维护。
    pub avg_entry_price: Decimal,
    /// 平仓加权均价，增量维护。
    pub avg_exit_price: Decimal,
    /// 已实现盈亏（方向调整后）。
    pub realised_profit: Decimal,
    /// 冻结保证金。
    pub frozen_margin: Decimal,
    /// 首笔开仓订单引用。
    pub open_order_ref: OrderRef,
    /// 最近一笔平仓订单引用。
    pub close_order_ref: Option<OrderRef>,
    /// 首笔开仓成交时间。
    pub time_open: DateTime<Utc>,
    /// 最近一次更新时间。
    pub time_update: DateTime<Utc>,
    /// 已贡献过 `total_shares` 的开仓订单引用。
    open_refs: Vec<OrderRef>,
}

impl Position {
    /// 未平仓数量（`filled - closed`）。
    pub fn open_volume(&self) -> Decimal {
        self.filled_shares - self.closed_shares
    }

    /// 是否已完全平仓。
    pub fn is_flat(&self) -> bool {
        self.closed_shares == self.filled_shares
    }

    fn check_invariant(&self) -> bool {
        Decimal::ZERO <= self.closed_shares
            && self.closed_shares <= self.filled_shares
            && self.filled_shares <= self.total_shares
    }
}

/// 应用成交后的结果。
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FillOutcome {
    /// 应用后的持仓快照。
    pub position: Position,
    /// 本笔成交是否使持仓完全平掉。
    pub closed: bool,
}

/// 持仓层的数据一致性错误。
///
/// 这些错误由调用方记录并丢弃对应回报，持仓状态保持不变，绝不使进程崩溃。
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PositionError {
    /// 平仓成交找不到对应持仓。
    #[error("no open position for strategy {strategy} contract {contract}")]
    NoPosition {
        /// 策略标识。
        strategy: StrategyId,
        /// 合约代码。
        contract: SmolStr,
    },

    /// 平仓数量超过未平数量。
    #[error(
        "close fill of {requested} exceeds open volume {open} for strategy {strategy} contract {contract}"
    )]
    OverClose {
        /// 策略标识。
        strategy: StrategyId,
        /// 合约代码。
        contract: SmolStr,
        /// 回报中的平仓数量。
        requested: Decimal,
        /// 当前未平数量。
        open: Decimal,
    },

    /// 成交方向与持仓方向不符。
    #[error("fill direction {fill} does not match position direction {position}")]
    DirectionMismatch {
        /// 回报方向。
        fill: Direction,
        /// 持仓方向。
        position: Direction,
    },
}

/// 持仓集合键：（策略，合约）。
#[derive(Debug, Clone, Eq, PartialEq, Hash, Constructor)]
pub struct PositionKey {
    /// 策略标识。
    pub strategy: StrategyId,
    /// 合约代码。
    pub contract: SmolStr,
}

/// 持仓跟踪器。
///
/// 独占持有全部 [`Position`]，是唯一写入方。查询不存在的持仓返回 `None` 而非
/// 默认零值对象，调用方不会把"不存在"误当成"持平"。
#[derive(Debug, Clone)]
pub struct PositionTracker {
    broker_id: SmolStr,
    positions: FnvHashMap<PositionKey, Position>,
    closed: Vec<Position>,
}

impl PositionTracker {
    /// 构造空跟踪器。
    pub fn new(broker_id: impl Into<SmolStr>) -> Self {
        Self {
            broker_id: broker_id.into(),
            positions: FnvHashMap::default(),
            closed: Vec::new(),
        }
    }

    /// 查询（策略，合约）的当前持仓。
    pub fn position(&self, strategy: &StrategyId, contract: &str) -> Option<&Position> {
        self.positions.get(&PositionKey::new(
            strategy.clone(),
            SmolStr::new(contract),
        ))
    }

    /// 遍历全部未平持仓。
    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// 已完全平仓的历史持仓。
    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    /// 应用一笔成交回报。
    ///
    /// 开仓成交：增加 `filled_shares`，按数量加权重算 `avg_entry_price`，
    /// 冻结保证金。平仓成交：增加 `closed_shares`，重算 `avg_exit_price`，
    /// 按比例释放保证金并累计已实现盈亏。完全平仓的持仓移入历史列表。
    ///
    /// 数据一致性问题（超量平仓、无持仓可平、方向不符）返回错误且状态不变。
    pub fn apply_fill(
        &mut self,
        fill: &Fill,
        instrument: &Instrument,
    ) -> Result<FillOutcome, PositionError> {
        match fill.offset {
            Offset::Open => self.apply_open(fill, instrument),
            Offset::Close | Offset::CloseToday => self.apply_close(fill, instrument),
        }
    }

    fn apply_open(
        &mut self,
        fill: &Fill,
        instrument: &Instrument,
    ) -> Result<FillOutcome, PositionError> {
        let key = PositionKey::new(fill.strategy.clone(), fill.contract.clone());

        // 多空是独立的两本账；现有持仓方向不符的开仓成交是不一致回报
        if let Some(existing) = self.positions.get(&key) {
            if existing.direction != fill.direction {
                return Err(PositionError::DirectionMismatch {
                    fill: fill.direction,
                    position: existing.direction,
                });
            }
        }

        let margin_delta =
            fill.price * fill.volume * instrument.volume_multiple * instrument.margin_rate;

        let position = self.positions.entry(key).or_insert_with(|| Position {
            broker_id: self.broker_id.clone(),
            strategy: fill.strategy.clone(),
            product: fill.product.clone(),
            contract: fill.contract.clone(),
            direction: fill.direction,
            total_shares: Decimal::ZERO,
            filled_shares: Decimal::ZERO,
            closed_shares: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            avg_exit_price: Decimal::ZERO,
            realised_profit: Decimal::ZERO,
            frozen_margin: Decimal::ZERO,
            open_order_ref: fill.order_ref.clone(),
            close_order_ref: None,
            time_open: fill.time,
            time_update: fill.time,
            open_refs: Vec::new(),
        });

        // 同一订单只向计划总量贡献一次
        if !position.open_refs.contains(&fill.order_ref) {
            position.open_refs.push(fill.order_ref.clone());
            position.total_shares += fill.order_volume;
        }

        position.avg_entry_price = calculate_average_price(
            position.avg_entry_price,
            position.filled_shares,
            fill.price,
            fill.volume,
        );
        position.filled_shares += fill.volume;
        position.frozen_margin += margin_delta;
        position.time_update = fill.time;

        debug_assert!(position.check_invariant());

        Ok(FillOutcome {
            position: position.clone(),
            closed: false,
        })
    }

    fn apply_close(
        &mut self,
        fill: &Fill,
        instrument: &Instrument,
    ) -> Result<FillOutcome, PositionError> {
        let key = PositionKey::new(fill.strategy.clone(), fill.contract.clone());

        let Some(position) = self.positions.get_mut(&key) else {
            return Err(PositionError::NoPosition {
                strategy: fill.strategy.clone(),
                contract: fill.contract.clone(),
            });
        };

        if position.direction != fill.direction {
            return Err(PositionError::DirectionMismatch {
                fill: fill.direction,
                position: position.direction,
            });
        }

        let open_volume = position.open_volume();
        if fill.volume > open_volume {
            return Err(PositionError::OverClose {
                strategy: fill.strategy.clone(),
                contract: fill.contract.clone(),
                requested: fill.volume,
                open: open_volume,
            });
        }

        // 按平掉数量占未平数量的比例释放冻结保证金，完全平仓时无残差
        let released = if fill.volume == open_volume {
            position.frozen_margin
        } else {
            position.frozen_margin * fill.volume / open_volume
        };

        position.avg_exit_price = calculate_average_price(
            position.avg_exit_price,
            position.closed_shares,
            fill.price,
            fill.volume,
        );
        position.closed_shares += fill.volume;
        position.frozen_margin -= released;
        position.realised_profit += calculate_realised_profit(
            position.direction,
            position.avg_entry_price,
            fill.price,
            fill.volume,
            instrument.volume_multiple,
        );
        position.close_order_ref = Some(fill.order_ref.clone());
        position.time_update = fill.time;

        debug_assert!(position.check_invariant());

        if position.is_flat() {
            let snapshot = position.clone();
            self.positions.remove(&key);
            self.closed.push(snapshot.clone());
            Ok(FillOutcome {
                position: snapshot,
                closed: true,
            })
        } else {
            Ok(FillOutcome {
                position: position.clone(),
                closed: false,
            })
        }
    }

    /// 记录并丢弃一致性错误，供处理器在不中断循环的前提下使用。
    pub fn log_and_drop(error: &PositionError, fill: &Fill) {
        warn!(
            %error,
            strategy = %fill.strategy,
            contract = %fill.contract,
            order_ref = %fill.order_ref,
            "dropping inconsistent fill"
        );
    }
}

/// 计算在现有数量上追加一笔成交后的数量加权平均价格。
///
/// 公式：`(当前均价 × 当前数量 + 成交价 × 成交数量) / (当前数量 + 成交数量)`。
/// 两个数量都为零时返回零。
pub fn calculate_average_price(
    current_average: Decimal,
    current_quantity: Decimal,
    fill_price: Decimal,
    fill_quantity: Decimal,
) -> Decimal {
    if current_quantity.is_zero() && fill_quantity.is_zero() {
        return Decimal::ZERO;
    }

    let current_value = current_average * current_quantity;
    let fill_value = fill_price * fill_quantity;

    (current_value + fill_value) / (current_quantity + fill_quantity)
}

/// 计算一笔平仓成交的已实现盈亏。
///
/// - 多头：`(平仓价 − 开仓均价) × 数量 × 合约乘数`
/// - 空头：`(开仓均价 − 平仓价) × 数量 × 合约乘数`
pub fn calculate_realised_profit(
    direction: Direction,
    avg_entry_price: Decimal,
    close_price: Decimal,
    close_volume: Decimal,
    volume_multiple: Decimal,
) -> Decimal {
    let delta = match direction {
        Direction::Long => close_price - avg_entry_price,
        Direction::Short => avg_entry_price - close_price,
    };
    delta * close_volume * volume_multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fill, instrument};
    use rust_decimal_macros::dec;

    #[test]
    fn test_weighted_entry_average() {
        // 开仓 2 手 @3000 再开 3 手 @3010，加权均价 = (2*3000+3*3010)/5 = 3006
        let inst = instrument("rb", 1.0);
        let mut tracker = PositionTracker::new("1");

        tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Open, 3000.0, 2.0),
                &inst,
            )
            .unwrap();
        let outcome = tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Open, 3010.0, 3.0),
                &inst,
            )
            .unwrap();

        assert_eq!(outcome.position.avg_entry_price, dec!(3006));
        assert_eq!(outcome.position.filled_shares, dec!(5));
        assert!(!outcome.closed);
    }

    #[test]
    fn test_calculate_average_price() {
        struct TestCase {
            current_average: Decimal,
            current_quantity: Decimal,
            fill_price: Decimal,
            fill_quantity: Decimal,
            expected: Decimal,
        }

        let cases = vec![
            // TC0: equal contribution
            TestCase {
                current_average: dec!(3000),
                current_quantity: dec!(2),
                fill_price: dec!(3010),
                fill_quantity: dec!(2),
                expected: dec!(3005),
            },
            // TC1: uneven contribution, 2 lots @3000 + 3 lots @3010
            TestCase {
                current_average: dec!(3000),
                current_quantity: dec!(2),
                fill_price: dec!(3010),
                fill_quantity: dec!(3),
                expected: dec!(3006),
            },
            // TC2: zero current quantity, so expect fill price
            TestCase {
                current_average: dec!(0),
                current_quantity: dec!(0),
                fill_price: dec!(3000),
                fill_quantity: dec!(5),
                expected: dec!(3000),
            },
            // TC3: both zero quantities
            TestCase {
                current_average: dec!(3000),
                current_quantity: dec!(0),
                fill_price: dec!(3010),
                fill_quantity: dec!(0),
                expected: dec!(0),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = calculate_average_price(
                test.current_average,
                test.current_quantity,
                test.fill_price,
                test.fill_quantity,
            );
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_calculate_realised_profit() {
        struct TestCase {
            direction: Direction,
            avg_entry: Decimal,
            close_price: Decimal,
            volume: Decimal,
            multiple: Decimal,
            expected: Decimal,
        }

        let cases = vec![
            // TC0: LONG in profit
            TestCase {
                direction: Direction::Long,
                avg_entry: dec!(3000),
                close_price: dec!(3050),
                volume: dec!(2),
                multiple: dec!(10),
                expected: dec!(1000),
            },
            // TC1: LONG at loss
            TestCase {
                direction: Direction::Long,
                avg_entry: dec!(3000),
                close_price: dec!(2980),
                volume: dec!(1),
                multiple: dec!(10),
                expected: dec!(-200),
            },
            // TC2: SHORT in profit
            TestCase {
                direction: Direction::Short,
                avg_entry: dec!(3000),
                close_price: dec!(2950),
                volume: dec!(3),
                multiple: dec!(10),
                expected: dec!(1500),
            },
            // TC3: SHORT at loss
            TestCase {
                direction: Direction::Short,
                avg_entry: dec!(3000),
                close_price: dec!(3020),
                volume: dec!(1),
                multiple: dec!(10),
                expected: dec!(-200),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = calculate_realised_profit(
                test.direction,
                test.avg_entry,
                test.close_price,
                test.volume,
                test.multiple,
            );
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_margin_freeze_and_proportional_release() {
        let inst = instrument("rb", 1.0); // multiple 10, margin_rate 0.1
        let mut tracker = PositionTracker::new("1");

        // 开仓 4 手 @3000：冻结 3000*4*10*0.1 = 12000
        let outcome = tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Open, 3000.0, 4.0),
                &inst,
            )
            .unwrap();
        assert_eq!(outcome.position.frozen_margin, dec!(12000));

        // 平 1 手：释放 12000 * 1/4 = 3000
        let outcome = tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Close, 3050.0, 1.0),
                &inst,
            )
            .unwrap();
        assert_eq!(outcome.position.frozen_margin, dec!(9000));
        assert_eq!(outcome.position.realised_profit, dec!(500)); // (3050-3000)*1*10
        assert!(!outcome.closed);

        // 平掉剩余 3 手：冻结额归零，持仓转入历史
        let outcome = tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Close, 3050.0, 3.0),
                &inst,
            )
            .unwrap();
        assert_eq!(outcome.position.frozen_margin, dec!(0));
        assert_eq!(outcome.position.realised_profit, dec!(2000));
        assert_eq!(outcome.position.avg_exit_price, dec!(3050));
        assert!(outcome.closed);
        assert!(tracker.position(&StrategyId::from_name("s1"), "rb2410").is_none());
        assert_eq!(tracker.closed_positions().len(), 1);
    }

    #[test]
    fn test_invariant_holds_across_fill_sequences() {
        let inst = instrument("rb", 1.0);
        let mut tracker = PositionTracker::new("1");

        let fills = vec![
            fill("s1", "rb2410", Direction::Short, Offset::Open, 3000.0, 2.0),
            fill("s1", "rb2410", Direction::Short, Offset::Open, 2990.0, 1.0),
            fill("s1", "rb2410", Direction::Short, Offset::Close, 2985.0, 1.0),
            fill("s1", "rb2410", Direction::Short, Offset::Open, 2995.0, 2.0),
            fill("s1", "rb2410", Direction::Short, Offset::Close, 2980.0, 4.0),
        ];

        for (index, f) in fills.iter().enumerate() {
            let outcome = tracker.apply_fill(f, &inst).unwrap();
            let p = &outcome.position;
            assert!(
                Decimal::ZERO <= p.closed_shares
                    && p.closed_shares <= p.filled_shares
                    && p.filled_shares <= p.total_shares,
                "TC{index} invariant failed"
            );
        }
    }

    #[test]
    fn test_overclose_dropped_state_unchanged() {
        let inst = instrument("rb", 1.0);
        let mut tracker = PositionTracker::new("1");

        tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Open, 3000.0, 2.0),
                &inst,
            )
            .unwrap();

        let before = tracker
            .position(&StrategyId::from_name("s1"), "rb2410")
            .unwrap()
            .clone();

        // 超量平仓：拒绝且状态不变
        let err = tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Close, 3010.0, 3.0),
                &inst,
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::OverClose { .. }));
        assert_eq!(
            tracker
                .position(&StrategyId::from_name("s1"), "rb2410")
                .unwrap(),
            &before
        );
    }

    #[test]
    fn test_close_without_position_is_explicit_error() {
        let inst = instrument("rb", 1.0);
        let mut tracker = PositionTracker::new("1");

        assert!(tracker.position(&StrategyId::from_name("s1"), "rb2410").is_none());

        let err = tracker
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Close, 3000.0, 1.0),
                &inst,
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::NoPosition { .. }));
    }

    #[test]
    fn test_partial_fill_keeps_total_above_filled() {
        let inst = instrument("rb", 1.0);
        let mut tracker = PositionTracker::new("1");

        // 订单总量 5 手，先成交 2 手：total=5, filled=2
        let mut partial = fill("s1", "rb2410", Direction::Long, Offset::Open, 3000.0, 2.0);
        partial.order_volume = dec!(5);
        partial.order_ref = OrderRef::from_str_ref("00000042");
        let outcome = tracker.apply_fill(&partial, &inst).unwrap();
        assert_eq!(outcome.position.total_shares, dec!(5));
        assert_eq!(outcome.position.filled_shares, dec!(2));

        // 同一订单余量成交：total 不重复累计
        let mut rest = fill("s1", "rb2410", Direction::Long, Offset::Open, 3002.0, 3.0);
        rest.order_volume = dec!(5);
        rest.order_ref = OrderRef::from_str_ref("00000042");
        let outcome = tracker.apply_fill(&rest, &inst).unwrap();
        assert_eq!(outcome.position.total_shares, dec!(5));
        assert_eq!(outcome.position.filled_shares, dec!(5));
    }
}
