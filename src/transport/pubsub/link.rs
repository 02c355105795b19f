//! broker 链路抽象
//!
//! 模拟一个会自动重连的客户端库：`open` 之后链路在后台维持连接，
//! 并通过事件通道报告上线、掉线、拒绝与收到的消息。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::HubError;

/// 服务质量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// 连接被拒时 broker 返回的原因码：用户名或密码错误
pub const REASON_BAD_CREDENTIALS: u8 = 134;
/// 原因码：未授权
pub const REASON_NOT_AUTHORIZED: u8 = 135;

/// 原因码是否表示认证失败
pub fn is_auth_reason(code: u8) -> bool {
    code == REASON_BAD_CREDENTIALS || code == REASON_NOT_AUTHORIZED
}

/// 发布报文
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PubPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Option<QoS>,
    pub retain: bool,
    pub correlation_data: Option<Vec<u8>>,
    pub response_topic: Option<String>,
    /// `json` 或 `error`
    pub content_type: Option<String>,
}

impl PubPacket {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: Some(qos),
            ..Default::default()
        }
    }
}

/// 链路事件
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// 连接（或重连）成功，会话为全新会话
    Up,
    /// 连接被服务端断开，库会自动重试
    Down { reason: String },
    /// 连接被拒绝
    Refused { code: u8, reason: String },
    Message(PubPacket),
}

/// 打开链路所需参数
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// broker 侧的会话 ID
    pub connect_id: String,
    pub username: String,
    /// 密码或令牌
    pub secret: String,
    pub timeout: Duration,
}

/// 已打开的链路
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, packet: PubPacket) -> Result<(), HubError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), HubError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), HubError>;

    /// 关闭链路并停止重试
    async fn close(&self);
}

/// 链路工厂
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(
        &self,
        options: LinkOptions,
    ) -> Result<(Arc<dyn BrokerLink>, mpsc::UnboundedReceiver<LinkEvent>), HubError>;
}
