//! 风控模块
//!
//! 本模块对拟发订单做报单前校验。所有检查都是纯函数且无副作用，
//! 因此重试时可以安全地重复执行。
//!
//! # 检查顺序
//!
//! 1. 价格带：报单价必须落在 `[市价 × (1 − 跌停比例), 市价 × (1 + 涨停比例)]`
//!    闭区间内（两端恰好相等时接受）
//! 2. 平仓数量：不得超过当前未平数量（`filled − closed`）
//! 3. 数量合法性：必须为正且不超过单笔上限
//! 4. 保证金：开仓所需冻结额不得超过账户可用资金
//!
//! 第一个失败的检查短路并决定拒绝原因。

use crate::{order::Order, position::Position, registry::Instrument};
use derive_more::{Constructor, Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 账户资金快照（外部账户查询的结果）。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize, Constructor,
)]
pub struct AccountMargin {
    /// 账户权益。
    pub balance: Decimal,
    /// 可用资金。
    pub available: Decimal,
}

/// 风控拒绝原因。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum RiskRefusedReason {
    /// 报单价高于价格带上沿。
    #[error("price {price} above limit-up bound {upper}")]
    PriceAboveBand {
        /// 报单价。
        price: Decimal,
        /// 价格带上沿。
        upper: Decimal,
    },

    /// 报单价低于价格带下沿。
    #[error("price {price} below limit-down bound {lower}")]
    PriceBelowBand {
        /// 报单价。
        price: Decimal,
        /// 价格带下沿。
        lower: Decimal,
    },

    /// 平仓单找不到对应持仓。
    #[error("no open position to close")]
    NoPositionToClose,

    /// 平仓数量超过未平数量。
    #[error("close volume {requested} exceeds open volume {open}")]
    CloseExceedsOpen {
        /// 请求的平仓数量。
        requested: Decimal,
        /// 当前未平数量。
        open: Decimal,
    },

    /// 数量非正。
    #[error("order volume {volume} must be positive")]
    InvalidVolume {
        /// 报单数量。
        volume: Decimal,
    },

    /// 数量超过单笔上限。
    #[error("order volume {volume} exceeds max single-order volume {max}")]
    VolumeExceedsMax {
        /// 报单数量。
        volume: Decimal,
        /// 单笔上限。
        max: Decimal,
    },

    /// 可用资金不足以覆盖新增冻结保证金。
    #[error("required margin {required} exceeds available {available}")]
    InsufficientMargin {
        /// 所需保证金。
        required: Decimal,
        /// 可用资金。
        available: Decimal,
    },
}

/// 包装已通过风控检查的订单的新类型。
#[derive(
    Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Display, From, Constructor,
)]
pub struct RiskApproved<T>(pub T);

impl<T> RiskApproved<T> {
    /// 提取被包装的订单。
    pub fn into_item(self) -> T {
        self.0
    }
}

/// 包装未通过风控检查的订单的类型，附带拒绝原因。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct RiskRefused<T> {
    /// 被拒绝的订单。
    pub item: T,
    /// 拒绝原因。
    pub reason: RiskRefusedReason,
}

impl<T> RiskRefused<T> {
    /// 提取内部订单。
    pub fn into_item(self) -> T {
        self.item
    }
}

/// 风控闸门。
///
/// `price_limit_buffer` 是涨跌停缓冲比例（按市价比例内缩价格带），
/// 默认为零，即恰好在带边界上的报单被接受。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct RiskGate {
    /// 单笔订单最大数量。
    pub max_order_volume: Decimal,
    /// 涨跌停缓冲比例。
    pub price_limit_buffer: Decimal,
}

impl Default for RiskGate {
    fn default() -> Self {
        Self {
            max_order_volume: Decimal::from(100),
            price_limit_buffer: Decimal::ZERO,
        }
    }
}

impl RiskGate {
    /// 校验一笔拟发订单。
    ///
    /// 按模块文档所述顺序执行检查，第一个失败者短路。检查无副作用。
    pub fn validate(
        &self,
        order: &Order,
        instrument: &Instrument,
        market_price: Decimal,
        position: Option<&Position>,
        account: &AccountMargin,
    ) -> Result<(), RiskRefusedReason> {
        let buffer = market_price * self.price_limit_buffer;
        let upper = market_price * (Decimal::ONE + instrument.up_limit_ratio) - buffer;
        let lower = market_price * (Decimal::ONE - instrument.down_limit_ratio) + buffer;

        if order.price > upper {
            return Err(RiskRefusedReason::PriceAboveBand {
                price: order.price,
                upper,
            });
        }
        if order.price < lower {
            return Err(RiskRefusedReason::PriceBelowBand {
                price: order.price,
                lower,
            });
        }

        if order.offset.is_close() {
            let Some(position) = position else {
                return Err(RiskRefusedReason::NoPositionToClose);
            };
            let open = position.open_volume();
            if order.volume > open {
                return Err(RiskRefusedReason::CloseExceedsOpen {
                    requested: order.volume,
                    open,
                });
            }
        }

        if order.volume <= Decimal::ZERO {
            return Err(RiskRefusedReason::InvalidVolume {
                volume: order.volume,
            });
        }
        if order.volume > self.max_order_volume {
            return Err(RiskRefusedReason::VolumeExceedsMax {
                volume: order.volume,
                max: self.max_order_volume,
            });
        }

        if order.offset.is_open() {
            let required = order.price
                * order.volume
                * instrument.volume_multiple
                * instrument.margin_rate;
            if required > account.available {
                return Err(RiskRefusedReason::InsufficientMargin {
                    required,
                    available: account.available,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Direction, Offset, StrategyId,
        order::{Order, OrderStatus},
        position::PositionTracker,
        test_utils::{fill, instrument},
    };
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;
    use smol_str::SmolStr;

    fn order(price: Decimal, volume: Decimal, offset: Offset) -> Order {
        Order {
            broker_id: SmolStr::new("1"),
            strategy: StrategyId::from_name("s1"),
            product: SmolStr::new("rb"),
            contract: SmolStr::new("rb2410"),
            order_ref: crate::OrderRef::from_str_ref("1"),
            price,
            volume,
            filled_volume: dec!(0),
            direction: Direction::Long,
            offset,
            status: OrderStatus::Pending,
            time_submit: DateTime::<Utc>::MIN_UTC,
            time_update: DateTime::<Utc>::MIN_UTC,
            signal_id: None,
            reject_reason: None,
        }
    }

    fn rich_account() -> AccountMargin {
        AccountMargin::new(dec!(10000000), dec!(10000000))
    }

    #[test]
    fn test_price_band_boundaries() {
        // 最小变动价位 1.0、市价 3000、涨停比例 0.05：上沿 3150
        struct TestCase {
            price: Decimal,
            expected_ok: bool,
        }

        let cases = vec![
            // TC0: exactly at upper bound accepted
            TestCase {
                price: dec!(3150),
                expected_ok: true,
            },
            // TC1: one tick above rejected
            TestCase {
                price: dec!(3151),
                expected_ok: false,
            },
            // TC2: exactly at lower bound accepted
            TestCase {
                price: dec!(2850),
                expected_ok: true,
            },
            // TC3: one tick below rejected
            TestCase {
                price: dec!(2849),
                expected_ok: false,
            },
        ];

        let gate = RiskGate::default();
        let inst = instrument("rb", 1.0);

        for (index, test) in cases.into_iter().enumerate() {
            let result = gate.validate(
                &order(test.price, dec!(1), Offset::Open),
                &inst,
                dec!(3000),
                None,
                &rich_account(),
            );
            assert_eq!(result.is_ok(), test.expected_ok, "TC{index} failed");
        }
    }

    #[test]
    fn test_close_volume_check() {
        let gate = RiskGate::default();
        let inst = instrument("rb", 1.0);
        let mut positions = PositionTracker::new("1");
        positions
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Open, 3000.0, 3.0),
                &inst,
            )
            .unwrap();
        let position = positions.position(&StrategyId::from_name("s1"), "rb2410");

        // 平 3 手：通过
        assert!(
            gate.validate(
                &order(dec!(3000), dec!(3), Offset::Close),
                &inst,
                dec!(3000),
                position,
                &rich_account(),
            )
            .is_ok()
        );

        // 平 4 手：超过未平数量
        assert_eq!(
            gate.validate(
                &order(dec!(3000), dec!(4), Offset::Close),
                &inst,
                dec!(3000),
                position,
                &rich_account(),
            ),
            Err(RiskRefusedReason::CloseExceedsOpen {
                requested: dec!(4),
                open: dec!(3),
            })
        );

        // 无持仓可平
        assert_eq!(
            gate.validate(
                &order(dec!(3000), dec!(1), Offset::Close),
                &inst,
                dec!(3000),
                None,
                &rich_account(),
            ),
            Err(RiskRefusedReason::NoPositionToClose)
        );
    }

    #[test]
    fn test_margin_check_only_for_opens() {
        let gate = RiskGate::default();
        let inst = instrument("rb", 1.0); // multiple 10, margin_rate 0.1
        let poor = AccountMargin::new(dec!(5000), dec!(2000));

        // 开 1 手 @3000 需要 3000 保证金 > 2000 可用
        assert_eq!(
            gate.validate(
                &order(dec!(3000), dec!(1), Offset::Open),
                &inst,
                dec!(3000),
                None,
                &poor,
            ),
            Err(RiskRefusedReason::InsufficientMargin {
                required: dec!(3000),
                available: dec!(2000),
            })
        );

        // 平仓不检查保证金
        let mut positions = PositionTracker::new("1");
        positions
            .apply_fill(
                &fill("s1", "rb2410", Direction::Long, Offset::Open, 3000.0, 1.0),
                &inst,
            )
            .unwrap();
        assert!(
            gate.validate(
                &order(dec!(3000), dec!(1), Offset::Close),
                &inst,
                dec!(3000),
                positions.position(&StrategyId::from_name("s1"), "rb2410"),
                &poor,
            )
            .is_ok()
        );
    }

    #[test]
    fn test_volume_sanity() {
        let gate = RiskGate {
            max_order_volume: dec!(10),
            price_limit_buffer: dec!(0),
        };
        let inst = instrument("rb", 1.0);

        assert_eq!(
            gate.validate(
                &order(dec!(3000), dec!(0), Offset::Open),
                &inst,
                dec!(3000),
                None,
                &rich_account(),
            ),
            Err(RiskRefusedReason::InvalidVolume { volume: dec!(0) })
        );
        assert_eq!(
            gate.validate(
                &order(dec!(3000), dec!(11), Offset::Open),
                &inst,
                dec!(3000),
                None,
                &rich_account(),
            ),
            Err(RiskRefusedReason::VolumeExceedsMax {
                volume: dec!(11),
                max: dec!(10),
            })
        );
    }

    #[test]
    fn test_price_limit_buffer_shrinks_band() {
        let gate = RiskGate {
            max_order_volume: dec!(100),
            price_limit_buffer: dec!(0.001),
        };
        let inst = instrument("rb", 1.0);

        // 缓冲 3000*0.001 = 3：上沿收缩到 3147
        assert!(
            gate.validate(
                &order(dec!(3147), dec!(1), Offset::Open),
                &inst,
                dec!(3000),
                None,
                &rich_account(),
            )
            .is_ok()
        );
        assert!(
            gate.validate(
                &order(dec!(3148), dec!(1), Offset::Open),
                &inst,
                dec!(3000),
                None,
                &rich_account(),
            )
            .is_err()
        );
    }

    #[test]
    fn test_checks_are_repeatable() {
        let gate = RiskGate::default();
        let inst = instrument("rb", 1.0);
        let order = order(dec!(3000), dec!(1), Offset::Open);

        let first = gate.validate(&order, &inst, dec!(3000), None, &rich_account());
        let second = gate.validate(&order, &inst, dec!(3000), None, &rich_account());
        assert_eq!(first, second);
    }
}
