//! 外部拉取限流模块
//!
//! 每个交易所对连接数有各自的上限，外部数据拉取按交易所用计数信号量独立限流。
//! 超过上限时调用方被阻塞等待，而不是失败。

use crate::registry::Exchange;
use fnv::FnvHashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 默认的单交易所并发上限。
const DEFAULT_PERMITS: usize = 4;

/// 按交易所限流的许可池。
#[derive(Debug, Clone)]
pub struct FetchThrottle {
    permits: FnvHashMap<Exchange, Arc<Semaphore>>,
    fallback: Arc<Semaphore>,
}

impl Default for FetchThrottle {
    fn default() -> Self {
        Self::new([])
    }
}

impl FetchThrottle {
    /// 以每交易所上限构造，未指定的交易所使用默认上限。
    pub fn new(caps: impl IntoIterator<Item = (Exchange, usize)>) -> Self {
        let permits = caps
            .into_iter()
            .map(|(exchange, cap)| (exchange, Arc::new(Semaphore::new(cap.max(1)))))
            .collect();
        Self {
            permits,
            fallback: Arc::new(Semaphore::new(DEFAULT_PERMITS)),
        }
    }

    /// 获取某交易所的一个拉取许可，上限占满时阻塞等待。
    pub async fn acquire(&self, exchange: Exchange) -> OwnedSemaphorePermit {
        let semaphore = self
            .permits
            .get(&exchange)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback));
        match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            // 信号量从不关闭
            Err(_) => unreachable!("fetch throttle semaphore is never closed"),
        }
    }

    /// 某交易所当前可用许可数。
    pub fn available(&self, exchange: Exchange) -> usize {
        self.permits
            .get(&exchange)
            .map(|semaphore| semaphore.available_permits())
            .unwrap_or_else(|| self.fallback.available_permits())
    }
}
