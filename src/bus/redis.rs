//! Redis 总线连接器
//!
//! 通过 Redis 发布/订阅承载总线通道：`psubscribe` 注册表里的全部模式得到
//! 入站消息流，出站请求按通道名 `publish`。
//!
//! 建立初始连接失败是致命错误；订阅流随后中断由分发器按致命路径处理，
//! 本连接器不做自动重连与消息重放。

use crate::{
    bus::{InboundMessage, OutboundMessage},
    error::{FatalError, TraderError},
};
use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

/// Redis 发布/订阅连接器。
pub struct RedisBus {
    client: redis::Client,
    publish_conn: redis::aio::MultiplexedConnection,
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

impl RedisBus {
    /// 连接 Redis。失败是致命错误——没有总线就没有任何正确的交易决策。
    pub async fn connect(url: &str) -> Result<Self, TraderError> {
        let client = redis::Client::open(url)
            .map_err(|error| FatalError::BusConnection(error.to_string()))?;
        let publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| FatalError::BusConnection(error.to_string()))?;

        info!(%url, "redis bus connected");
        Ok(Self {
            client,
            publish_conn,
        })
    }

    /// 以模式订阅建立入站消息流。
    ///
    /// 载荷在进入分发器之前完成 JSON 反序列化；无法解析的消息记录后丢弃。
    pub async fn subscribe<I>(
        &self,
        patterns: I,
    ) -> Result<impl Stream<Item = InboundMessage> + Unpin + Send + use<I>, TraderError>
    where
        I: IntoIterator<Item = SmolStr>,
    {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|error| FatalError::BusConnection(error.to_string()))?;

        for pattern in patterns {
            debug!(%pattern, "psubscribe");
            pubsub
                .psubscribe(pattern.as_str())
                .await
                .map_err(|error| FatalError::BusConnection(error.to_string()))?;
        }

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| std::future::ready(decode(msg)))
            .boxed())
    }

    /// 发布一条出站消息。失败是瞬时基础设施错误，由调用方记录。
    pub async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TraderError> {
        let payload = message.payload.to_string();
        let _: () = self
            .publish_conn
            .publish(message.channel.as_str(), payload)
            .await
            .map_err(|error| TraderError::Bus(error.to_string()))?;
        Ok(())
    }
}

fn decode(msg: redis::Msg) -> Option<InboundMessage> {
    let channel = SmolStr::new(msg.get_channel_name());
    let pattern = msg.get_pattern::<String>().ok().map(SmolStr::from);

    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%channel, %error, "non-text payload on bus, dropping");
            return None;
        }
    };

    match serde_json::from_str(&payload) {
        Ok(value) => Some(InboundMessage::new(channel, pattern, value)),
        Err(error) => {
            warn!(%channel, %error, "malformed JSON payload, dropping");
            None
        }
    }
}
