//! 策略运行器模块
//!
//! 本模块把各组件装配成一个可运行的策略实例：在启动期构建分发器注册表
//! （行情/交易回报通道处理器与定时任务），连接总线并泵取事件。
//!
//! # 注册表
//!
//! - 行情回报通道（`MSG:CTP:RSP:MARKET:{broker}:*`）→ 行情处理器：
//!   主力切换检测 → 信号引擎 → 订单提交
//! - 交易回报通道（`MSG:CTP:RSP:TRADE:{broker}:*`）→ 回报处理器：
//!   订单状态推进 → 成交推送持仓 → 持久化
//! - 合约元数据刷新 cron：在每交易所限流许可下从存储重载品种
//! - 例行清仓 cron（可选）：为标记品种产生最低优先级的平仓信号
//!
//! # 启动致命条件
//!
//! 初始总线连接失败或合约元数据加载失败向外传播并以非零状态终止进程——
//! 缺少它们无法做出任何正确的交易决策。

use crate::{
    bus::{LogFanout, MarketTick, TradeEvent, redis::RedisBus},
    config::TraderConfig,
    context::StrategyContext,
    dispatch::{ChannelHandler, CronHandler, Dispatcher, DispatcherBuilder, ShutdownReport, StopHandle},
    error::{FatalError, TraderError},
    order::ResponseOutcome,
    registry::{ContractRegistry, Exchange},
    risk::AccountMargin,
    signal::{Signal, sort_for_drain},
    store::Store,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use itertools::Itertools;
use rust_decimal::Decimal;
use serde_json::json;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 所有交易所，合约刷新时逐一拉取。
const EXCHANGES: [Exchange; 5] = [
    Exchange::Shfe,
    Exchange::Dce,
    Exchange::Czce,
    Exchange::Cffex,
    Exchange::Gfex,
];

/// 策略运行器。
#[derive(Debug)]
pub struct Trader {
    ctx: Arc<StrategyContext>,
    outbound_rx: Option<mpsc::UnboundedReceiver<crate::bus::OutboundMessage>>,
    stop_handle: Option<StopHandle>,
}

impl Trader {
    /// 初始化运行器：从存储加载全部品种元数据并组装上下文。
    ///
    /// 元数据加载失败或没有任何品种是致命错误。
    pub async fn init(config: TraderConfig, store: Arc<dyn Store>) -> Result<Self, TraderError> {
        let mut instruments = Vec::new();
        for exchange in EXCHANGES {
            let mut loaded = store.load_instruments(exchange).await.map_err(|error| {
                FatalError::InstrumentLoad(format!("{exchange}: {error}"))
            })?;
            instruments.append(&mut loaded);
        }

        if instruments.is_empty() {
            return Err(TraderError::Fatal(FatalError::InstrumentLoad(
                "no instruments loaded".to_string(),
            )));
        }

        let registry = ContractRegistry::new(instruments, config.ignore_products.clone())
            .map_err(|error| FatalError::InstrumentLoad(error.to_string()))?;

        info!(
            instruments = registry.len(),
            rules = config.rules.len(),
            broker_id = %config.broker_id,
            "trader initialised"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let ctx = StrategyContext::new(config, registry, store, outbound_tx);

        Ok(Self {
            ctx: Arc::new(ctx),
            outbound_rx: Some(outbound_rx),
            stop_handle: None,
        })
    }

    /// 策略上下文（测试与外部查询用）。
    pub fn context(&self) -> Arc<StrategyContext> {
        Arc::clone(&self.ctx)
    }

    /// 运行中分发器的停止句柄。
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.stop_handle.clone()
    }

    /// 取走出站消息接收端（测试或自定义发布泵用）。
    ///
    /// 取走后 [`Trader::run`] 不再可用——出站队列只有一个消费者。
    pub fn take_outbound(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<crate::bus::OutboundMessage>> {
        self.outbound_rx.take()
    }

    /// 构建分发器注册表。
    pub fn build_dispatcher(&mut self) -> Result<Dispatcher, TraderError> {
        let config = &self.ctx.config;

        let market_handler: ChannelHandler = {
            let ctx = Arc::clone(&self.ctx);
            Arc::new(move |channel, payload| {
                let ctx = Arc::clone(&ctx);
                async move { on_market_message(ctx, channel, payload).await }.boxed()
            })
        };

        let trade_handler: ChannelHandler = {
            let ctx = Arc::clone(&self.ctx);
            Arc::new(move |channel, payload| {
                let ctx = Arc::clone(&ctx);
                async move { on_trade_message(ctx, channel, payload).await }.boxed()
            })
        };

        let refresh_handler: CronHandler = {
            let ctx = Arc::clone(&self.ctx);
            Arc::new(move |now| {
                let ctx = Arc::clone(&ctx);
                async move { on_instrument_refresh(ctx, now).await }.boxed()
            })
        };

        let mut builder = DispatcherBuilder::new()
            .on_channel(
                config.channels.market_response_pattern(&config.broker_id),
                market_handler,
            )
            .on_channel(
                config.channels.trade_response_pattern(&config.broker_id),
                trade_handler,
            )
            .on_cron(config.instrument_refresh_cron.clone(), refresh_handler)
            .grace_period(Duration::from_secs(config.command_timeout_secs));

        if let Some(flatten_cron) = &config.flatten_cron {
            let flatten_handler: CronHandler = {
                let ctx = Arc::clone(&self.ctx);
                Arc::new(move |now| {
                    let ctx = Arc::clone(&ctx);
                    async move { on_flatten_schedule(ctx, now).await }.boxed()
                })
            };
            builder = builder.on_cron(flatten_cron.clone(), flatten_handler);
        }

        let dispatcher = builder.build()?;
        self.stop_handle = Some(dispatcher.handle());
        Ok(dispatcher)
    }

    /// 连接总线、订阅注册表中的全部模式并阻塞泵取事件。
    ///
    /// 返回时要么是外部请求的正常停机（附停机报告），要么是致命错误。
    pub async fn run(mut self) -> Result<ShutdownReport, TraderError> {
        let dispatcher = self.build_dispatcher()?;

        let bus = RedisBus::connect(&self.ctx.config.redis_url).await?;
        let events = dispatcher.install(&bus).await?;

        // 出站发布泵：独立任务消费队列，发布失败记录后继续
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return Err(TraderError::Fatal(FatalError::Config(
                "trader already running".to_string(),
            )));
        };
        let mut publish_bus = bus;
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(error) = publish_bus.publish(&message).await {
                    warn!(channel = %message.channel, %error, "outbound publish failed");
                }
            }
            debug!("outbound publisher exited");
        });

        // 启动即请求账户资金快照
        self.ctx.publish(
            self.ctx.config.channels.request_channel("QueryAccount"),
            &json!({ "broker_id": self.ctx.config.broker_id }),
        )?;

        // 终止信号触发与外部 stop() 相同的优雅停机路径
        let stop = dispatcher.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("termination signal received");
                stop.stop();
            }
        });

        dispatcher.run(events).await
    }
}

/// 行情回报处理器。
///
/// 一笔行情触发的完整路径：最新价缓存 → 主力切换检测 → 信号评估 →
/// 按优先级提交订单。同品种的状态段在按键锁内执行。
pub async fn on_market_message(
    ctx: Arc<StrategyContext>,
    channel: SmolStr,
    payload: serde_json::Value,
) -> Result<(), TraderError> {
    let tick: MarketTick = serde_json::from_value(payload)
        .map_err(|error| TraderError::Consistency(format!("malformed market payload: {error}")))?;

    if ctx.registry.read().is_ignored(tick.product.as_str()) {
        return Ok(());
    }

    let _guard = ctx.lock_product(tick.product.clone()).await;

    ctx.last_prices
        .write()
        .insert(tick.contract.clone(), tick.last_price);

    let mut signals = Vec::new();

    // 主力切换检测：交易所报告的主力与缓存不一致时产生配对移仓信号
    if let Some(observed_main) = &tick.main_contract {
        let rollover = ctx
            .registry
            .write()
            .detect_rollover(tick.product.as_str(), observed_main.as_str(), tick.time);
        match rollover {
            Ok(Some(event)) => {
                let positions = ctx.positions.read();
                signals.extend(ctx.signals.write().on_rollover(&event, &positions));
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%channel, %error, "market tick for unknown instrument, dropping");
                return Ok(());
            }
        }
    }

    {
        let registry = ctx.registry.read();
        let positions = ctx.positions.read();
        signals.extend(
            ctx.signals
                .write()
                .on_market_update(&tick, &registry, &positions),
        );
    }

    sort_for_drain(&mut signals);
    process_signals(&ctx, signals, Some(tick.last_price)).await
}

/// 把一轮信号按优先级转为订单：提交、发布请求并持久化。
///
/// 每个信号的市价取其合约的最新价缓存，缺失时退回 `fallback_price`
/// （两者皆无的信号跳过并记录）。持久化在释放全部锁之后进行。
async fn process_signals(
    ctx: &Arc<StrategyContext>,
    signals: Vec<Signal>,
    fallback_price: Option<Decimal>,
) -> Result<(), TraderError> {
    let mut saved_orders = Vec::new();
    let mut first_error = None;

    for mut signal in signals {
        let market_price = ctx
            .last_price(signal.contract.as_str())
            .or(fallback_price);
        let Some(market_price) = market_price else {
            warn!(
                strategy = %signal.strategy,
                contract = %signal.contract,
                "no market price for signal, skipping"
            );
            continue;
        };

        let outcomes = {
            let registry = ctx.registry.read();
            let instrument = match registry.resolve(signal.product.as_str()) {
                Ok(instrument) => instrument,
                Err(error) => {
                    warn!(%error, "signal for unknown instrument, skipping");
                    continue;
                }
            };
            let positions = ctx.positions.read();
            let account = *ctx.account.read();
            ctx.orders.write().submit(
                &mut signal,
                instrument,
                market_price,
                &positions,
                &account,
                &ctx.config.risk,
                Utc::now(),
            )
        };

        for outcome in outcomes {
            if let Some(request) = &outcome.request {
                let channel = ctx.config.channels.request_channel("SubmitOrder");
                if let Err(error) = ctx.publish(channel, request) {
                    warn!(order_ref = %outcome.order.order_ref, %error, "publish failed");
                    first_error.get_or_insert(error);
                }
            }
            saved_orders.push(outcome.order);
        }
    }

    for order in &saved_orders {
        if let Err(error) = ctx.store.save_order(order).await {
            warn!(order_ref = %order.order_ref, %error, "order persistence failed");
            first_error.get_or_insert(TraderError::Store(error));
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// 交易回报处理器。
///
/// 账户回报更新资金快照；订单回报推进订单状态、把成交转发给持仓跟踪器，
/// 然后持久化订单与持仓。柜台拒绝同时扇出到日志通道。
pub async fn on_trade_message(
    ctx: Arc<StrategyContext>,
    channel: SmolStr,
    payload: serde_json::Value,
) -> Result<(), TraderError> {
    let event: TradeEvent = serde_json::from_value(payload)
        .map_err(|error| TraderError::Consistency(format!("malformed trade payload: {error}")))?;

    if let TradeEvent::AccountUpdate {
        balance, available, ..
    } = &event
    {
        *ctx.account.write() = AccountMargin::new(*balance, *available);
        debug!(%balance, %available, "account snapshot updated");
        return Ok(());
    }

    // 同品种的订单/持仓更新串行化；未知订单没有键可锁，直接走丢弃路径
    let product = event
        .order_ref()
        .and_then(|order_ref| ctx.orders.read().order(order_ref).map(|o| o.product.clone()));
    let _guard = match product {
        Some(product) => Some(ctx.lock_product(product).await),
        None => None,
    };

    let outcome = {
        let registry = ctx.registry.read();
        let mut positions = ctx.positions.write();
        ctx.orders
            .write()
            .on_broker_response(&event, &registry, &mut positions)
    };

    match outcome {
        ResponseOutcome::Ignored => Ok(()),
        ResponseOutcome::Updated { order_ref, status } => {
            if let TradeEvent::OrderRejected { reason, .. } = &event {
                let fanout = LogFanout::new(
                    SmolStr::new("WARNING"),
                    format!("order {order_ref} rejected: {reason}"),
                    Utc::now(),
                );
                if let Err(error) = ctx.publish(ctx.config.channels.weixin_log.clone(), &fanout) {
                    warn!(%error, "log fanout failed");
                }
            }
            debug!(%channel, %order_ref, ?status, "order status advanced");
            persist_order(&ctx, &order_ref).await
        }
        ResponseOutcome::Filled {
            order_ref, outcome, ..
        } => {
            if let Err(error) = ctx.store.save_trade(&outcome.position).await {
                warn!(%order_ref, %error, "trade persistence failed");
            }
            persist_order(&ctx, &order_ref).await
        }
    }
}

async fn persist_order(
    ctx: &Arc<StrategyContext>,
    order_ref: &crate::OrderRef,
) -> Result<(), TraderError> {
    let order = ctx.orders.read().order(order_ref).cloned();
    if let Some(order) = order {
        ctx.store
            .save_order(&order)
            .await
            .map_err(TraderError::Store)?;
    }
    Ok(())
}

/// 合约元数据刷新任务：在每交易所限流许可下从存储重载品种。
pub async fn on_instrument_refresh(
    ctx: Arc<StrategyContext>,
    _now: DateTime<Utc>,
) -> Result<(), TraderError> {
    for exchange in EXCHANGES {
        let _permit = ctx.throttle.acquire(exchange).await;
        let instruments = match ctx.store.load_instruments(exchange).await {
            Ok(instruments) => instruments,
            Err(error) => {
                warn!(%exchange, %error, "instrument refresh failed");
                continue;
            }
        };
        let mut registry = ctx.registry.write();
        for instrument in instruments {
            let code = instrument.code.clone();
            if let Err(error) = registry.upsert(instrument) {
                warn!(%code, %error, "skipping invalid instrument on refresh");
            }
        }
    }
    debug!("instrument refresh complete");
    Ok(())
}

/// 例行清仓任务：为标记品种的持仓产生最低优先级的平仓信号。
pub async fn on_flatten_schedule(
    ctx: Arc<StrategyContext>,
    now: DateTime<Utc>,
) -> Result<(), TraderError> {
    let signals = {
        let positions = ctx.positions.read();
        ctx.signals.write().on_schedule(now, &positions)
    };
    if signals.is_empty() {
        return Ok(());
    }

    info!(count = signals.len(), "scheduled flatten sweep");

    // 按品种分组，各品种在按键锁内提交
    let by_product = signals
        .into_iter()
        .into_group_map_by(|signal| signal.product.clone());

    let mut first_error = None;
    for (product, mut group) in by_product {
        let _guard = ctx.lock_product(product).await;
        sort_for_drain(&mut group);
        if let Err(error) = process_signals(&ctx, group, None).await {
            first_error.get_or_insert(error);
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
