//! 订单管理模块
//!
//! 本模块把通过的信号转换为订单请求，跟踪订单对柜台确认/成交的生命周期，
//! 并把成交转发给持仓跟踪器。订单由本模块独占持有。
//!
//! # 订单生命周期
//!
//! `Pending → Submitted → {PartiallyFilled → Filled | Canceled | Rejected}`
//!
//! `Pending → Submitted` 在订单离开进程之前于本模块内同步完成；之后的所有状态
//! 迁移完全由入站柜台回报驱动，本地从不猜测。
//!
//! # 回报容错
//!
//! 柜台回报是权威的，但必须容忍重复与乱序：引用未知订单的回报记录后丢弃；
//! 指向终态订单的回报是空操作，不会二次变更持仓状态。

use crate::{
    Direction, Offset, OrderRef, Sequence, StrategyId,
    bus::{OrderRequest, TradeEvent},
    position::{Fill, FillOutcome, PositionTracker},
    registry::{ContractRegistry, Instrument},
    risk::{AccountMargin, RiskApproved, RiskGate, RiskRefused},
    signal::Signal,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use tracing::{debug, info, warn};

/// 订单状态。
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum OrderStatus {
    /// 已创建，尚未通过风控。
    Pending,
    /// 已通过风控并发出。
    Submitted,
    /// 部分成交。
    PartiallyFilled,
    /// 全部成交（终态）。
    Filled,
    /// 已撤销（终态）。
    Canceled,
    /// 已拒绝（终态，本地风控拒绝或柜台拒绝）。
    Rejected,
}

impl OrderStatus {
    /// 是否为终态。终态订单的后续回报都是空操作。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// 一笔订单。
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Order {
    /// 经纪商标识。
    pub broker_id: SmolStr,
    /// 策略标识。
    pub strategy: StrategyId,
    /// 品种代码。
    pub product: SmolStr,
    /// 合约代码。
    pub contract: SmolStr,
    /// 客户端订单引用。
    pub order_ref: OrderRef,
    /// 报单价格（已按最小变动价位取整）。
    pub price: Decimal,
    /// 报单数量。
    pub volume: Decimal,
    /// 已成交数量。
    pub filled_volume: Decimal,
    /// 持仓方向。
    pub direction: Direction,
    /// 开平标志。
    pub offset: Offset,
    /// 订单状态。
    pub status: OrderStatus,
    /// 报单时间。
    pub time_submit: DateTime<Utc>,
    /// 最近更新时间。
    pub time_update: DateTime<Utc>,
    /// 来源信号序号（审计用的非拥有型回引）。
    pub signal_id: Option<u64>,
    /// 拒绝原因。
    pub reject_reason: Option<String>,
}

impl Order {
    /// 未成交数量。
    pub fn remaining_volume(&self) -> Decimal {
        self.volume - self.filled_volume
    }
}

/// `submit` 对单个订单切片的结果。
///
/// `request` 为 `None` 表示该切片被本地风控拒绝，从未发出。
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubmitOutcome {
    /// 订单（`Submitted` 或 `Rejected`）。
    pub order: Order,
    /// 待发布的报单请求。
    pub request: Option<OrderRequest>,
}

/// 处理一条柜台回报的结果。
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseOutcome {
    /// 回报被忽略（未知引用、终态订单、数据不一致），已记录日志。
    Ignored,
    /// 订单状态已推进。
    Updated {
        /// 订单引用。
        order_ref: OrderRef,
        /// 新状态。
        status: OrderStatus,
    },
    /// 成交已应用到持仓并推进订单状态。
    Filled {
        /// 订单引用。
        order_ref: OrderRef,
        /// 新状态。
        status: OrderStatus,
        /// 持仓应用结果。
        outcome: FillOutcome,
    },
}

/// 订单管理器。
#[derive(Debug, Clone)]
pub struct OrderManager {
    broker_id: SmolStr,
    orders: FnvHashMap<OrderRef, Order>,
    sequence: Sequence,
}

impl OrderManager {
    /// 构造空管理器。
    pub fn new(broker_id: impl Into<SmolStr>) -> Self {
        Self {
            broker_id: broker_id.into(),
            orders: FnvHashMap::default(),
            sequence: Sequence(1),
        }
    }

    /// 按订单引用查询。
    pub fn order(&self, order_ref: &OrderRef) -> Option<&Order> {
        self.orders.get(order_ref)
    }

    /// 遍历全部订单。
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    fn next_ref(&mut self) -> OrderRef {
        let seq = self.sequence.fetch_add().value();
        OrderRef(format_smolstr!("{seq:08}"))
    }

    /// 把一个信号转换为订单并提交。
    ///
    /// 价格经 [`ContractRegistry::round_price`] 取整（信号价格为零表示"按市价"，
    /// 使用当前市价）。数量超过单笔上限的信号被拆分为多个切片，每个切片独立
    /// 通过风控检查。被拒切片就地标记 `Rejected`、绝不发出；信号在提交（或整体
    /// 拒绝）后被标记为已处理——这是本地同步的非阻塞决策。
    pub fn submit(
        &mut self,
        signal: &mut Signal,
        instrument: &Instrument,
        market_price: Decimal,
        positions: &PositionTracker,
        account: &AccountMargin,
        risk: &RiskGate,
        now: DateTime<Utc>,
    ) -> Vec<SubmitOutcome> {
        let raw_price = if signal.price.is_zero() {
            market_price
        } else {
            signal.price
        };
        let price = ContractRegistry::round_price(instrument, raw_price);
        let offset = signal.kind.offset();

        // 超限信号拆分为多个切片，每片独立风控
        let mut slices = Vec::new();
        let mut remaining = signal.volume;
        while remaining > Decimal::ZERO {
            let slice = remaining.min(risk.max_order_volume);
            slices.push(slice);
            remaining -= slice;
        }

        let mut outcomes = Vec::with_capacity(slices.len());
        let mut refusals: Vec<RiskRefused<OrderRef>> = Vec::new();

        for volume in slices {
            let order = Order {
                broker_id: self.broker_id.clone(),
                strategy: signal.strategy.clone(),
                product: signal.product.clone(),
                contract: signal.contract.clone(),
                order_ref: self.next_ref(),
                price,
                volume,
                filled_volume: Decimal::ZERO,
                direction: signal.direction,
                offset,
                status: OrderStatus::Pending,
                time_submit: now,
                time_update: now,
                signal_id: Some(signal.id),
                reject_reason: None,
            };

            let position = positions.position(&signal.strategy, signal.contract.as_str());
            let checked = match risk.validate(&order, instrument, market_price, position, account) {
                Ok(()) => Ok(RiskApproved::new(order)),
                Err(reason) => Err(RiskRefused::new(order, reason)),
            };

            match checked {
                Ok(approved) => {
                    let mut order = approved.into_item();
                    order.status = OrderStatus::Submitted;
                    let request = OrderRequest {
                        broker_id: order.broker_id.clone(),
                        strategy: order.strategy.clone(),
                        contract: order.contract.clone(),
                        order_ref: order.order_ref.clone(),
                        price: order.price,
                        volume: order.volume,
                        direction: order.direction,
                        offset: order.offset,
                        signal_id: order.signal_id,
                    };
                    info!(
                        order_ref = %order.order_ref,
                        contract = %order.contract,
                        %price,
                        volume = %order.volume,
                        direction = %order.direction,
                        offset = %order.offset,
                        "order submitted"
                    );
                    self.orders.insert(order.order_ref.clone(), order.clone());
                    outcomes.push(SubmitOutcome {
                        order,
                        request: Some(request),
                    });
                }
                Err(refused) => {
                    let reason = refused.reason.clone();
                    let mut order = refused.into_item();
                    order.status = OrderStatus::Rejected;
                    order.reject_reason = Some(reason.to_string());
                    warn!(
                        order_ref = %order.order_ref,
                        contract = %order.contract,
                        %reason,
                        "order refused by risk gate"
                    );
                    refusals.push(RiskRefused::new(order.order_ref.clone(), reason));
                    self.orders.insert(order.order_ref.clone(), order.clone());
                    outcomes.push(SubmitOutcome {
                        order,
                        request: None,
                    });
                }
            }
        }

        // 信号恰好消费一次：全部切片被拒时记录首个拒绝原因
        if outcomes.iter().all(|o| o.request.is_none()) {
            match refusals.first() {
                Some(refused) => signal.mark_rejected(refused.reason.to_string()),
                None => signal.mark_rejected("signal volume is zero"),
            }
        } else {
            signal.mark_processed();
        }

        outcomes
    }

    /// 处理一条交易通道回报，推进对应订单的状态。
    ///
    /// 成交回报先转发给持仓跟踪器、再更新订单状态；持仓层拒绝（超量平仓等
    /// 数据一致性问题）时订单状态同样保持不变。
    pub fn on_broker_response(
        &mut self,
        event: &TradeEvent,
        registry: &ContractRegistry,
        positions: &mut PositionTracker,
    ) -> ResponseOutcome {
        let (order_ref, time) = match event {
            TradeEvent::OrderAccepted { order_ref, time, .. }
            | TradeEvent::OrderRejected { order_ref, time, .. }
            | TradeEvent::OrderCanceled { order_ref, time }
            | TradeEvent::OrderFilled { order_ref, time, .. } => (order_ref, *time),
            TradeEvent::AccountUpdate { .. } => {
                // 账户回报由上层处理，不经过订单管理器
                return ResponseOutcome::Ignored;
            }
        };

        let Some(order) = self.orders.get_mut(order_ref) else {
            warn!(%order_ref, "broker response references unknown order, dropping");
            return ResponseOutcome::Ignored;
        };

        if order.status.is_terminal() {
            debug!(
                %order_ref,
                status = ?order.status,
                "broker response for terminal order is a no-op"
            );
            return ResponseOutcome::Ignored;
        }

        match event {
            TradeEvent::OrderAccepted { .. } => {
                order.time_update = time;
                ResponseOutcome::Updated {
                    order_ref: order_ref.clone(),
                    status: order.status,
                }
            }
            TradeEvent::OrderRejected { reason, .. } => {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(reason.clone());
                order.time_update = time;
                warn!(%order_ref, %reason, "order rejected by broker");
                ResponseOutcome::Updated {
                    order_ref: order_ref.clone(),
                    status: OrderStatus::Rejected,
                }
            }
            TradeEvent::OrderCanceled { .. } => {
                order.status = OrderStatus::Canceled;
                order.time_update = time;
                info!(%order_ref, "order canceled");
                ResponseOutcome::Updated {
                    order_ref: order_ref.clone(),
                    status: OrderStatus::Canceled,
                }
            }
            TradeEvent::OrderFilled { price, volume, .. } => {
                if *volume > order.remaining_volume() {
                    warn!(
                        %order_ref,
                        fill_volume = %volume,
                        remaining = %order.remaining_volume(),
                        "fill exceeds remaining order volume, dropping"
                    );
                    return ResponseOutcome::Ignored;
                }

                let instrument = match registry.resolve(order.product.as_str()) {
                    Ok(instrument) => instrument,
                    Err(error) => {
                        warn!(%order_ref, %error, "fill for unknown instrument, dropping");
                        return ResponseOutcome::Ignored;
                    }
                };

                let fill = Fill {
                    strategy: order.strategy.clone(),
                    product: order.product.clone(),
                    contract: order.contract.clone(),
                    direction: order.direction,
                    offset: order.offset,
                    price: *price,
                    volume: *volume,
                    order_volume: order.volume,
                    order_ref: order_ref.clone(),
                    time,
                };

                // 先推持仓、后改订单：持仓层拒绝时订单保持原状
                let outcome = match positions.apply_fill(&fill, instrument) {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        PositionTracker::log_and_drop(&error, &fill);
                        return ResponseOutcome::Ignored;
                    }
                };

                order.filled_volume += *volume;
                order.status = if order.filled_volume == order.volume {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                order.time_update = time;

                info!(
                    %order_ref,
                    contract = %order.contract,
                    %price,
                    %volume,
                    status = ?order.status,
                    "fill applied"
                );

                ResponseOutcome::Filled {
                    order_ref: order_ref.clone(),
                    status: order.status,
                    outcome,
                }
            }
            TradeEvent::AccountUpdate { .. } => ResponseOutcome::Ignored,
        }
    }
}
