//! 持久化边界模块
//!
//! 核心通过 [`Store`] 接口调用外部存储，只依赖三类操作：保存订单、保存持仓、
//! 加载合约元数据。存储的表结构与管理界面完全在范围之外。
//!
//! 存储失败属于瞬时基础设施错误：记录日志、作为可恢复错误返回，核心不做
//! 无限重试。

use crate::{order::Order, position::Position, registry::{Exchange, Instrument}};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use thiserror::Error;

/// 存储错误。
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StoreError {
    /// 存储暂时不可用（连接失败、写入超时等）。
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// 请求的记录不存在。
    #[error("not found: {0}")]
    NotFound(String),
}

/// 外部存储接口。
#[async_trait]
pub trait Store: Send + Sync {
    /// 保存/更新一笔订单。
    async fn save_order(&self, order: &Order) -> Result<(), StoreError>;

    /// 保存/更新一笔持仓。
    async fn save_trade(&self, position: &Position) -> Result<(), StoreError>;

    /// 按品种代码加载合约元数据。
    async fn load_instrument(&self, code: &str) -> Result<Instrument, StoreError>;

    /// 加载某交易所的全部品种元数据。
    async fn load_instruments(&self, exchange: Exchange) -> Result<Vec<Instrument>, StoreError>;
}

/// 内存存储实现，用于测试与本地演练。
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: Mutex<FnvHashMap<SmolStr, Order>>,
    trades: Mutex<Vec<Position>>,
    instruments: Mutex<FnvHashMap<SmolStr, Instrument>>,
}

impl MemoryStore {
    /// 以给定品种集合构造。
    pub fn with_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        let store = Self::default();
        {
            let mut map = store.instruments.lock();
            for instrument in instruments {
                map.insert(instrument.code.clone(), instrument);
            }
        }
        store
    }

    /// 已保存的订单快照。
    pub fn orders(&self) -> Vec<Order> {
        self.orders.lock().values().cloned().collect()
    }

    /// 已保存的持仓快照。
    pub fn trades(&self) -> Vec<Position> {
        self.trades.lock().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.orders
            .lock()
            .insert(order.order_ref.0.clone(), order.clone());
        Ok(())
    }

    async fn save_trade(&self, position: &Position) -> Result<(), StoreError> {
        self.trades.lock().push(position.clone());
        Ok(())
    }

    async fn load_instrument(&self, code: &str) -> Result<Instrument, StoreError> {
        self.instruments
            .lock()
            .get(code)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(code.to_string()))
    }

    async fn load_instruments(&self, exchange: Exchange) -> Result<Vec<Instrument>, StoreError> {
        Ok(self
            .instruments
            .lock()
            .values()
            .filter(|instrument| instrument.exchange == exchange)
            .cloned()
            .collect())
    }
}
