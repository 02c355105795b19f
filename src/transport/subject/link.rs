//! 主题（subject）树 broker 链路抽象
//!
//! 这类 broker 自带请求/应答、队列组与持久化流，连接断开后由客户端库自动重连
//! 并恢复订阅，所以这里的链路事件比主题树链路更少。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::HubError;
use crate::transport::KeyPair;

/// 应答头中携带错误文本的键
pub const ERROR_HEADER: &str = "error";

/// 认证方式
#[derive(Clone)]
pub enum SubjectAuth {
    Password { user: String, password: String },
    /// 用密钥对签名服务端下发的 nonce
    Nkey { key_pair: Arc<dyn KeyPair> },
    Jwt {
        jwt: String,
        key_pair: Option<Arc<dyn KeyPair>>,
    },
}

impl SubjectAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            SubjectAuth::Password { .. } => "password",
            SubjectAuth::Nkey { .. } => "nkey",
            SubjectAuth::Jwt { .. } => "jwt",
        }
    }
}

#[derive(Clone)]
pub struct SubjectConnectOptions {
    /// 连接名，即 client ID
    pub name: String,
    /// 原生请求使用的收件箱前缀：`_INBOX.clientID`
    pub inbox_prefix: String,
    pub auth: SubjectAuth,
    pub timeout: Duration,
}

/// 收到的消息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectMsg {
    pub subject: String,
    /// 请求的应答主题
    pub reply: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SubjectEvent {
    /// 连接断开，客户端库正在重连
    Down { reason: String },
    /// 重连成功，订阅已由客户端库恢复
    Reconnected,
    Message(SubjectMsg),
}

/// 消费者起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// 只接收新消息
    New,
    /// 先接收每个主题的最后一条，再接收新消息
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    None,
    Explicit,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub description: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
}

/// 流中的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub sequence: u64,
    /// 流元数据中的写入时间（Unix 毫秒）
    pub timestamp_msec: i64,
}

/// 拉取式消费者
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// 最多取 `batch` 条；在 `max_wait` 内没有消息时返回 Timeout
    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<StreamMessage>, HubError>;

    /// 流或消费者被删除后失效
    fn is_valid(&self) -> bool;
}

#[async_trait]
pub trait SubjectLink: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), HubError>;

    /// 原生请求/应答
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<SubjectMsg, HubError>;

    /// 订阅，返回订阅 ID；指定队列组时组内只有一个成员收到消息
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<u64, HubError>;

    async fn unsubscribe(&self, sid: u64) -> Result<(), HubError>;

    /// 在指定流上创建临时拉取消费者
    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<Box<dyn PullConsumer>, HubError>;

    async fn close(&self);
}

#[async_trait]
pub trait SubjectConnector: Send + Sync {
    async fn connect(
        &self,
        options: SubjectConnectOptions,
    ) -> Result<(Arc<dyn SubjectLink>, mpsc::UnboundedReceiver<SubjectEvent>), HubError>;
}
