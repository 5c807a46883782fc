//! 事件分发模块
//!
//! 本模块是整个核心的事件循环：把处理器绑定到通道名通配模式与 crontab 表达式上，
//! 将入站总线消息与定时触发路由到对应处理器，并负责 run/stop 生命周期。
//!
//! # 核心概念
//!
//! - **DispatcherBuilder**: 启动期构建的显式注册表（模式/表达式 → 处理器）
//! - **Dispatcher**: 路由表 + 按通道 FIFO 的工作者 + 定时器泵
//! - **StopHandle**: 外部停止句柄
//!
//! # 顺序与并发保证
//!
//! 处理器调用作为相互独立的并发任务执行，分发器不会把不同处理器串行化；
//! 唯一的顺序保证是**同一通道**上的消息按发布顺序投递给其处理器（按通道 FIFO，
//! 由每通道专属工作者实现）。不同通道之间、通道消息与定时触发之间没有顺序保证。
//!
//! # 失败语义
//!
//! 处理器抛出的错误在分发边界捕获，带上下文（通道/模式、载荷摘要）记录日志，
//! 不会终止分发器或其他在途处理器。订阅流终止对 `run()` 是致命的，向进程
//! 守护方传播以便重启——分发器不做自动重连与消息重放。

use crate::{
    bus::InboundMessage,
    error::{FatalError, TraderError},
};
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHasher};
use futures::{FutureExt, Stream, StreamExt, future::BoxFuture};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{
    hash::Hasher,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

pub mod cron;
pub mod pattern;

use cron::CronExpression;
use pattern::ChannelPattern;

/// 处理器返回的带装箱 Future。
pub type HandlerFuture = BoxFuture<'static, Result<(), TraderError>>;

/// 通道处理器：接收具体通道名与已反序列化的载荷。
pub type ChannelHandler = Arc<dyn Fn(SmolStr, serde_json::Value) -> HandlerFuture + Send + Sync>;

/// 定时处理器：接收触发时刻。
pub type CronHandler = Arc<dyn Fn(DateTime<Utc>) -> HandlerFuture + Send + Sync>;

/// 调度器巡检周期。
const SCHEDULER_TICK: Duration = Duration::from_millis(500);

/// 启动期构建分发器注册表的构建器。
///
/// 这是对装饰器式注册的显式替代：所有绑定在构建阶段完成，
/// 运行期不依赖任何反射/自省。
#[derive(Default)]
pub struct DispatcherBuilder {
    channel_routes: Vec<(SmolStr, ChannelHandler)>,
    cron_routes: Vec<(String, CronHandler)>,
    grace: Duration,
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("channel_routes", &self.channel_routes.len())
            .field("cron_routes", &self.cron_routes.len())
            .field("grace", &self.grace)
            .finish()
    }
}

impl DispatcherBuilder {
    /// 新建空注册表，默认优雅停机宽限期 5 秒。
    pub fn new() -> Self {
        Self {
            channel_routes: Vec::new(),
            cron_routes: Vec::new(),
            grace: Duration::from_secs(5),
        }
    }

    /// 绑定处理器到通道名通配模式。
    ///
    /// 路由按注册顺序做首个命中（first-match-wins），注册方必须避免语义上
    /// 相互覆盖的模式。
    pub fn on_channel(mut self, pattern: impl Into<SmolStr>, handler: ChannelHandler) -> Self {
        self.channel_routes.push((pattern.into(), handler));
        self
    }

    /// 绑定处理器到五字段 cron 表达式。
    pub fn on_cron(mut self, expression: impl Into<String>, handler: CronHandler) -> Self {
        self.cron_routes.push((expression.into(), handler));
        self
    }

    /// 设置停机时等待在途处理器完成的宽限期。
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// 冻结注册表，校验所有模式与表达式。
    ///
    /// 空模式或非法 cron 表达式是配置类致命错误。
    pub fn build(self) -> Result<Dispatcher, TraderError> {
        // 注册顺序即匹配顺序；重复模式后注册者覆盖前者
        let mut channel_routes = IndexMap::with_capacity(self.channel_routes.len());
        for (pattern, handler) in self.channel_routes {
            if pattern.is_empty() {
                return Err(TraderError::Fatal(FatalError::Config(
                    "empty channel pattern".to_string(),
                )));
            }
            channel_routes.insert(ChannelPattern::new(pattern), handler);
        }

        // 所有 next-fire 相对"现在"计算，之后每次触发也相对触发时刻重算
        let now = Utc::now();
        let mut cron_routes = Vec::with_capacity(self.cron_routes.len());
        for (expression, handler) in self.cron_routes {
            let expression = CronExpression::parse(&expression).map_err(|error| {
                TraderError::Fatal(FatalError::Config(format!(
                    "cron expression '{expression}': {error}"
                )))
            })?;
            let next_fire = expression.next_after(now);
            cron_routes.push(CronEntry {
                expression,
                handler,
                next_fire,
            });
        }

        let (stop_tx, _) = watch::channel(false);

        Ok(Dispatcher {
            channel_routes: Arc::new(channel_routes),
            cron_routes,
            workers: FnvHashMap::default(),
            worker_handles: Vec::new(),
            cron_tasks: JoinSet::new(),
            stop: Arc::new(stop_tx),
            grace: self.grace,
            routed: 0,
            unmatched: 0,
        })
    }
}

struct CronEntry {
    expression: CronExpression,
    handler: CronHandler,
    next_fire: Option<DateTime<Utc>>,
}

struct WorkItem {
    channel: SmolStr,
    pattern: SmolStr,
    payload: serde_json::Value,
    handler: ChannelHandler,
}

/// 外部停止句柄。
///
/// `stop()` 使分发循环停止接收新的定时触发并拆除通道订阅；在途处理器任务
/// 在宽限期内运行至完成，不做强制取消，避免订单/持仓状态停在半更新。
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// 请求停止分发循环。
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// 停机报告。
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ShutdownReport {
    /// 成功路由的消息数。
    pub routed: u64,
    /// 无模式命中而丢弃的消息数。
    pub unmatched: u64,
    /// 宽限期后被放弃的在途任务数。
    pub abandoned: usize,
}

/// 事件分发器。
///
/// 路由表在构建时冻结。`run` 阻塞地泵取事件直到 [`StopHandle::stop`]
/// 或订阅流终止。
pub struct Dispatcher {
    channel_routes: Arc<IndexMap<ChannelPattern, ChannelHandler>>,
    cron_routes: Vec<CronEntry>,
    workers: FnvHashMap<SmolStr, mpsc::UnboundedSender<WorkItem>>,
    worker_handles: Vec<JoinHandle<()>>,
    cron_tasks: JoinSet<()>,
    stop: Arc<watch::Sender<bool>>,
    grace: Duration,
    routed: u64,
    unmatched: u64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channel_routes", &self.channel_routes.len())
            .field("cron_routes", &self.cron_routes.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Dispatcher {
    /// 获取停止句柄。
    pub fn handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// 已注册的通道模式（订阅用）。
    pub fn patterns(&self) -> Vec<SmolStr> {
        self.channel_routes
            .keys()
            .map(|pattern| SmolStr::new(pattern.as_str()))
            .collect()
    }

    /// 执行全部订阅：以注册表中的模式订阅总线，返回入站消息流。
    ///
    /// 随后把流交给 [`Dispatcher::run`] 泵取。订阅失败是致命错误。
    pub async fn install(
        &self,
        bus: &crate::bus::redis::RedisBus,
    ) -> Result<impl Stream<Item = InboundMessage> + Unpin + Send + use<>, TraderError> {
        bus.subscribe(self.patterns()).await
    }

    /// 不经 `run` 直接释放资源：排空工作者并返回停机报告。
    ///
    /// 正常停机路径下 `run` 内部已经完成同样的排空，无需额外调用。
    pub async fn uninstall(self) -> ShutdownReport {
        self.drain().await
    }

    /// 阻塞泵取事件直到停止或订阅流终止。
    ///
    /// 订阅流终止返回致命错误（由进程守护方重启）；`stop()` 正常停机并
    /// 返回停机报告。两条路径都会先在宽限期内排空在途处理器。
    pub async fn run<S>(mut self, mut events: S) -> Result<ShutdownReport, TraderError>
    where
        S: Stream<Item = InboundMessage> + Unpin,
    {
        info!(
            channel_routes = self.channel_routes.len(),
            cron_routes = self.cron_routes.len(),
            "dispatcher running"
        );

        let mut stop_rx = self.stop.subscribe();
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let feed_ended = loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    info!("dispatcher stop requested");
                    break false;
                }
                maybe = events.next() => match maybe {
                    Some(message) => self.route(message),
                    None => {
                        error!("subscription stream ended");
                        break true;
                    }
                },
                _ = ticker.tick() => self.fire_due(Utc::now()),
            }
        };

        let report = self.drain().await;
        info!(
            routed = report.routed,
            unmatched = report.unmatched,
            abandoned = report.abandoned,
            "dispatcher shut down"
        );

        if feed_ended {
            Err(TraderError::Fatal(FatalError::BusConnection(
                "subscription stream ended".to_string(),
            )))
        } else {
            Ok(report)
        }
    }

    /// 把一条入站消息路由到首个命中模式的处理器所属的通道工作者。
    fn route(&mut self, message: InboundMessage) {
        let InboundMessage {
            channel,
            pattern,
            payload,
        } = message;

        // 优先用订阅端报告的命中模式，否则按注册顺序首个命中
        let matched = match &pattern {
            Some(pattern) => self
                .channel_routes
                .iter()
                .find(|(candidate, _)| candidate.as_str() == pattern.as_str()),
            None => self
                .channel_routes
                .iter()
                .find(|(candidate, _)| candidate.matches(channel.as_str())),
        };

        let Some((matched_pattern, handler)) = matched else {
            self.unmatched += 1;
            debug!(%channel, "no pattern matched inbound message, dropping");
            return;
        };

        let item = WorkItem {
            channel: channel.clone(),
            pattern: SmolStr::new(matched_pattern.as_str()),
            payload,
            handler: Arc::clone(handler),
        };

        if !self.workers.contains_key(&channel) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.worker_handles
                .push(tokio::spawn(worker_loop(channel.clone(), rx)));
            self.workers.insert(channel.clone(), tx);
        }

        let Some(sender) = self.workers.get(&channel) else {
            return;
        };
        if sender.send(item).is_ok() {
            self.routed += 1;
        }
    }

    /// 触发所有到期的 cron 条目，并相对"现在"重算下一次触发时间。
    ///
    /// 错过的时隙不会补发：重算永远从当前时刻出发，而非上一次计划时间。
    fn fire_due(&mut self, now: DateTime<Utc>) {
        for entry in &mut self.cron_routes {
            let Some(next_fire) = entry.next_fire else {
                continue;
            };
            if next_fire > now {
                continue;
            }

            let handler = Arc::clone(&entry.handler);
            let expression = entry.expression.source().to_string();
            self.cron_tasks.spawn(async move {
                match AssertUnwindSafe(handler(now)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(cron = %expression, %error, "cron handler failed");
                    }
                    Err(_) => {
                        error!(cron = %expression, "cron handler panicked");
                    }
                }
            });

            entry.next_fire = entry.expression.next_after(now);
        }

        // 回收已完成的定时任务，防止集合无界增长
        while let Some(result) = self.cron_tasks.try_join_next() {
            if let Err(error) = result {
                error!(%error, "cron task join error");
            }
        }
    }

    /// 排空在途处理器：工作者队列停止进新消息，宽限期内运行至完成，
    /// 逾期任务被放弃并记录数量。
    async fn drain(mut self) -> ShutdownReport {
        // 丢弃发送端：工作者清空队列后自行退出
        self.workers.clear();

        let deadline = tokio::time::Instant::now() + self.grace;
        let mut abandoned = 0usize;

        for handle in self.worker_handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abandoned += 1;
            }
        }

        loop {
            if self.cron_tasks.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline, self.cron_tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    abandoned += self.cron_tasks.len();
                    warn!(
                        count = self.cron_tasks.len(),
                        "grace period elapsed, abandoning in-flight cron tasks"
                    );
                    self.cron_tasks.detach_all();
                    break;
                }
            }
        }

        ShutdownReport {
            routed: self.routed,
            unmatched: self.unmatched,
            abandoned,
        }
    }
}

/// 单通道工作者：顺序处理队列中的消息，保证该通道的 FIFO 投递。
async fn worker_loop(channel: SmolStr, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
    while let Some(item) = rx.recv().await {
        let digest = payload_digest(&item.payload);
        match AssertUnwindSafe((item.handler)(item.channel.clone(), item.payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(
                    channel = %item.channel,
                    pattern = %item.pattern,
                    payload_digest = %digest,
                    %error,
                    "channel handler failed"
                );
            }
            Err(_) => {
                error!(
                    channel = %item.channel,
                    pattern = %item.pattern,
                    payload_digest = %digest,
                    "channel handler panicked"
                );
            }
        }
    }
    debug!(%channel, "channel worker exited");
}

/// 载荷摘要（fnv 哈希的十六进制），日志定位用。
fn payload_digest(payload: &serde_json::Value) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(payload.to_string().as_bytes());
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn message(channel: &str, payload: serde_json::Value) -> InboundMessage {
        InboundMessage::new(SmolStr::new(channel), None, payload)
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>) -> ChannelHandler {
        Arc::new(move |channel: SmolStr, payload: serde_json::Value| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{channel}:{payload}"));
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let log = Arc::clone(&log);
            Arc::new(move |_channel: SmolStr, _payload: serde_json::Value| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("first".to_string());
                    Ok(())
                }
                .boxed()
            }) as ChannelHandler
        };
        let second = {
            let log = Arc::clone(&log);
            Arc::new(move |_channel: SmolStr, _payload: serde_json::Value| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("second".to_string());
                    Ok(())
                }
                .boxed()
            }) as ChannelHandler
        };

        let dispatcher = DispatcherBuilder::new()
            .on_channel("MSG:CTP:RSP:*", first)
            .on_channel("MSG:CTP:RSP:TRADE:*", second)
            .build()
            .unwrap();
        let handle = dispatcher.handle();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(message("MSG:CTP:RSP:TRADE:1:100", serde_json::json!({})))
            .unwrap();
        drop(tx);

        let run = tokio::spawn(dispatcher.run(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        let _ = run.await.unwrap();

        assert_eq!(log.lock().unwrap().as_slice(), ["first".to_string()]);
    }

    #[tokio::test]
    async fn test_unmatched_messages_counted_and_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = DispatcherBuilder::new()
            .on_channel("MSG:CTP:RSP:TRADE:*", recording_handler(Arc::clone(&log)))
            .build()
            .unwrap();
        let handle = dispatcher.handle();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(message("MSG:UNKNOWN", serde_json::json!({})))
            .unwrap();
        tx.send(message("MSG:CTP:RSP:TRADE:1:1", serde_json::json!(1)))
            .unwrap();

        let run = tokio::spawn(dispatcher.run(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.unmatched, 1);
        assert_eq!(report.routed, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_kill_dispatcher() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let failing = {
            let log = Arc::clone(&log);
            Arc::new(move |_channel: SmolStr, payload: serde_json::Value| {
                let log = Arc::clone(&log);
                async move {
                    if payload == serde_json::json!("boom") {
                        Err(TraderError::Consistency("boom".to_string()))
                    } else {
                        log.lock().unwrap().push(payload.to_string());
                        Ok(())
                    }
                }
                .boxed()
            }) as ChannelHandler
        };

        let dispatcher = DispatcherBuilder::new()
            .on_channel("CH:*", failing)
            .build()
            .unwrap();
        let handle = dispatcher.handle();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(message("CH:1", serde_json::json!("boom"))).unwrap();
        tx.send(message("CH:1", serde_json::json!("ok"))).unwrap();

        let run = tokio::spawn(dispatcher.run(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        let report = run.await.unwrap().unwrap();

        // 失败的处理器不影响后续消息
        assert_eq!(report.routed, 2);
        assert_eq!(log.lock().unwrap().as_slice(), ["\"ok\"".to_string()]);
    }

    #[tokio::test]
    async fn test_feed_end_is_fatal() {
        let dispatcher = DispatcherBuilder::new()
            .on_channel("CH:*", recording_handler(Arc::new(Mutex::new(Vec::new()))))
            .build()
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel::<InboundMessage>();
        drop(tx);

        let result = dispatcher
            .run(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
            .await;
        assert!(matches!(
            result,
            Err(TraderError::Fatal(FatalError::BusConnection(_)))
        ));
    }

    #[tokio::test]
    async fn test_cron_fire_due_recomputes_from_now() {
        let count = Arc::new(Mutex::new(0u32));
        let handler = {
            let count = Arc::clone(&count);
            Arc::new(move |_now: DateTime<Utc>| {
                let count = Arc::clone(&count);
                async move {
                    *count.lock().unwrap() += 1;
                    Ok(())
                }
                .boxed()
            }) as CronHandler
        };

        let mut dispatcher = DispatcherBuilder::new()
            .on_cron("* * * * *", handler)
            .build()
            .unwrap();

        let primed = dispatcher.cron_routes[0].next_fire.unwrap();

        // 模拟调度循环停滞 3 分钟后的巡检：错过的时隙不补发，只触发一次
        let fire_at = primed + chrono::Duration::minutes(3);
        dispatcher.fire_due(fire_at);
        while dispatcher.cron_tasks.join_next().await.is_some() {}
        assert_eq!(*count.lock().unwrap(), 1);

        // 下一次触发相对"现在"（触发时刻）重算，而非上一次计划时间
        let next = dispatcher.cron_routes[0].next_fire.unwrap();
        assert!(next > fire_at);
        assert!(next <= fire_at + chrono::Duration::minutes(1));

        // 未到期不触发
        dispatcher.fire_due(fire_at);
        while dispatcher.cron_tasks.join_next().await.is_some() {}
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_config_error() {
        let handler = Arc::new(|_now: DateTime<Utc>| async { Ok(()) }.boxed()) as CronHandler;
        let result = DispatcherBuilder::new().on_cron("bad expr", handler).build();
        assert!(matches!(
            result,
            Err(TraderError::Fatal(FatalError::Config(_)))
        ));
    }
}
