//! Hub 传输层
//!
//! 三种可互换的实现共用 [`HubTransport`] 契约：
//! - **pubsub**：主题树发布订阅，通过收件箱与关联 ID 实现请求/应答
//! - **subject**：主题（subject）树，原生请求/应答、队列组与流消费
//! - **http**：HTTPS POST 请求 + 单条 SSE 长连接接收事件
//!
//! 传输的可变状态由一把读写锁保护；回调在锁内复制、锁外调用。

pub mod address;
pub mod correlation;
pub mod credentials;
pub mod http;
pub mod pubsub;
pub mod subject;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::core::HubError;
use crate::things::{Payload, ThingMessage, TransportStatus};

pub use address::{Address, AddressCodec};
pub use correlation::{CorrelationRegistry, CorrelationSlot};
pub use credentials::{is_jwt, KeyPair};
pub use supervisor::{ConnectHandler, ConnectionSupervisor, StatusNotice};

/// 收到事件时的回调
pub type EventHandler = Arc<dyn Fn(ThingMessage) + Send + Sync>;

/// 收到请求时的回调；返回的应答由传输负责发回
pub type RequestHandler = Arc<dyn Fn(ThingMessage) -> BoxFuture<'static, RequestReply> + Send + Sync>;

/// 请求处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestReply {
    pub reply: Vec<u8>,
    pub error: Option<String>,
    /// 为 true 时不发送应答
    pub do_not_reply: bool,
}

impl RequestReply {
    pub fn ok(reply: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: reply.into(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn no_reply() -> Self {
        Self {
            do_not_reply: true,
            ..Default::default()
        }
    }
}

/// 传输连接参数
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// 例如 `mqtts://hub:8883`、`nats://hub:4222`、`https://hub:8444`
    pub full_url: String,
    pub client_id: String,
    /// PEM 格式的 CA 证书；为空时不校验服务端证书
    pub ca_cert: Option<String>,
    /// 请求超时
    pub timeout: Duration,
    /// SSE 路径（仅 HTTP 传输）
    pub sse_path: String,
    /// SSE 断线后重连的初始间隔，连续失败时翻倍
    pub retry_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            full_url: String::new(),
            client_id: String::new(),
            ca_cert: None,
            timeout: Duration::from_secs(10),
            sse_path: "/sse".to_string(),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl TransportOptions {
    pub fn new(full_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            full_url: full_url.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ca_cert(mut self, pem: impl Into<String>) -> Self {
        self.ca_cert = Some(pem.into());
        self
    }

    pub fn with_sse_path(mut self, path: impl Into<String>) -> Self {
        self.sse_path = path.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// 状态快照的初始值
    pub(crate) fn initial_status(&self, core: &str) -> TransportStatus {
        TransportStatus {
            hub_url: self.full_url.clone(),
            ca_cert: self.ca_cert.clone(),
            core: core.to_string(),
            client_id: self.client_id.clone(),
            ..Default::default()
        }
    }
}

/// Hub 传输契约
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// 本传输使用的地址编解码
    fn codec(&self) -> AddressCodec;

    /// 以密码登录并连接
    async fn connect_with_password(&self, password: &str) -> Result<(), HubError>;

    /// 以令牌连接；密钥对用于 nonce 签名（仅部分传输需要）
    async fn connect_with_token(
        &self,
        key_pair: Option<Arc<dyn KeyPair>>,
        token: &str,
    ) -> Result<(), HubError>;

    /// 用户断开：状态变为 disconnected，等待中的请求以 connection lost 失败
    async fn disconnect(&self);

    /// 清空所有回调，打破回调与会话间的循环引用
    fn shutdown(&self);

    fn status(&self) -> TransportStatus;

    /// 发布事件，不等待应答
    async fn pub_event(&self, address: &str, payload: &[u8]) -> Result<(), HubError>;

    /// 发布请求并等待应答
    async fn pub_request(&self, address: &str, payload: &[u8]) -> Result<Vec<u8>, HubError>;

    /// 订阅地址模式；重连后自动恢复
    async fn subscribe(&self, address: &str) -> Result<(), HubError>;

    async fn unsubscribe(&self, address: &str) -> Result<(), HubError>;

    fn set_connect_handler(&self, handler: Option<ConnectHandler>);

    fn set_event_handler(&self, handler: Option<EventHandler>);

    fn set_request_handler(&self, handler: Option<RequestHandler>);
}

/// 把接收到的地址与负载转换为 ThingMessage；`created_msec` ≤0 时使用当前时间
pub(crate) fn message_from_address(
    codec: &AddressCodec,
    address: &str,
    payload: &[u8],
    created_msec: i64,
) -> Result<ThingMessage, HubError> {
    let addr = codec.decode(address)?;
    Ok(ThingMessage {
        msg_type: addr.msg_type,
        agent_id: addr.agent_id,
        thing_id: addr.thing_id,
        name: addr.name,
        sender_id: addr.sender_id,
        created_msec: if created_msec > 0 {
            created_msec
        } else {
            crate::things::now_msec()
        },
        data: Payload::from(payload),
    })
}

/// 在新任务上调用事件回调
pub(crate) fn dispatch_event(handler: Option<EventHandler>, msg: ThingMessage) {
    match handler {
        Some(handler) => {
            tokio::spawn(async move { handler(msg) });
        }
        None => tracing::debug!(
            thing_id = %msg.thing_id,
            name = %msg.name,
            "Event received but no event handler is set"
        ),
    }
}

/// 调用请求回调；未设置时返回 no handler 错误
pub(crate) async fn invoke_request_handler(
    handler: Option<RequestHandler>,
    msg: ThingMessage,
) -> RequestReply {
    match handler {
        Some(handler) => handler(msg).await,
        None => {
            tracing::warn!(
                thing_id = %msg.thing_id,
                name = %msg.name,
                "Request received but no request handler is set"
            );
            RequestReply::error(HubError::NoHandler.to_string())
        }
    }
}
