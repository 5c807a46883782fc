//! 策略上下文模块
//!
//! 显式的策略上下文对象，持有注册表/持仓/订单等组件实例并传递给处理器，
//! 取代环境全局量。
//!
//! # 共享资源纪律
//!
//! 持仓与订单状态只被分发循环的处理器任务修改；处理器在多个并发工作者上
//! 运行时，对同一品种的持仓/订单记录的访问通过 [`KeyedLocks`] 按键串行化，
//! 跨品种操作不串行。这是本核心唯一要求的加锁纪律。同步读写锁守卫绝不跨越
//! `await` 点持有。

use crate::{
    bus::OutboundMessage,
    config::TraderConfig,
    error::TraderError,
    order::OrderManager,
    position::PositionTracker,
    registry::ContractRegistry,
    risk::AccountMargin,
    signal::SignalEngine,
    store::Store,
    throttle::FetchThrottle,
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use smol_str::SmolStr;
use std::{hash::Hash, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};

/// 按键互斥锁集合。
///
/// 对同一键的临界区串行执行，不同键并行。锁按需创建且不回收——
/// 键空间是有限的品种集合。
#[derive(Debug, Default)]
pub struct KeyedLocks<K> {
    inner: parking_lot::Mutex<FnvHashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// 新建空集合。
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(FnvHashMap::default()),
        }
    }

    /// 锁定某个键，返回持有期内排他该键的守卫。
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock();
            Arc::clone(
                map.entry(key)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        mutex.lock_owned().await
    }
}

/// 策略上下文。
///
/// 分发器的处理器闭包捕获 `Arc<StrategyContext>`，通过它访问全部组件。
pub struct StrategyContext {
    /// 配置值。
    pub config: TraderConfig,
    /// 合约注册表。
    pub registry: RwLock<ContractRegistry>,
    /// 持仓跟踪器。
    pub positions: RwLock<PositionTracker>,
    /// 订单管理器。
    pub orders: RwLock<OrderManager>,
    /// 信号引擎。
    pub signals: RwLock<SignalEngine>,
    /// 最近一次账户资金快照。
    pub account: RwLock<AccountMargin>,
    /// 各合约最新价缓存（定时信号定价用）。
    pub last_prices: RwLock<FnvHashMap<SmolStr, Decimal>>,
    /// 外部存储。
    pub store: Arc<dyn Store>,
    /// 每交易所拉取限流。
    pub throttle: FetchThrottle,
    /// 出站消息队列（由发布泵消费）。
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    locks: KeyedLocks<SmolStr>,
}

impl std::fmt::Debug for StrategyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyContext")
            .field("broker_id", &self.config.broker_id)
            .finish_non_exhaustive()
    }
}

impl StrategyContext {
    /// 组装上下文。
    pub fn new(
        config: TraderConfig,
        registry: ContractRegistry,
        store: Arc<dyn Store>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        let broker_id = config.broker_id.clone();
        let throttle = FetchThrottle::new(
            config
                .fetch_caps
                .iter()
                .map(|cap| (cap.exchange, cap.permits)),
        );
        let signals = SignalEngine::new(config.rules.clone());

        Self {
            registry: RwLock::new(registry),
            positions: RwLock::new(PositionTracker::new(broker_id.clone())),
            orders: RwLock::new(OrderManager::new(broker_id)),
            signals: RwLock::new(signals),
            account: RwLock::new(AccountMargin::default()),
            last_prices: RwLock::new(FnvHashMap::default()),
            store,
            throttle,
            outbound,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// 锁定某品种的状态临界区。
    pub async fn lock_product(&self, product: SmolStr) -> OwnedMutexGuard<()> {
        self.locks.lock(product).await
    }

    /// 序列化载荷并入队发布。
    ///
    /// 发布泵已退出时报瞬时总线错误，由调用方记录。
    pub fn publish<T: Serialize>(
        &self,
        channel: SmolStr,
        payload: &T,
    ) -> Result<(), TraderError> {
        let payload = serde_json::to_value(payload)
            .map_err(|error| TraderError::Bus(format!("payload serialisation: {error}")))?;
        self.outbound
            .send(OutboundMessage::new(channel, payload))
            .map_err(|_| TraderError::Bus("outbound queue closed".to_string()))
    }

    /// 某合约的最新价。
    pub fn last_price(&self, contract: &str) -> Option<Decimal> {
        self.last_prices.read().get(contract).copied()
    }
}
