//! 主题（subject）树传输：原生请求/应答与流消费
//!
//! 错误应答有两种形式，任一出现即视为错误：
//! - 应答头 `error=<msg>`
//! - 负载为 `{"error":"<msg>"}`
//!
//! 流订阅在指定流上创建临时拉取消费者（不需要 ack），后台循环每次取一条，
//! 直到消费者失效或订阅被取消。

pub mod link;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::HubError;
use crate::things::{ConnectionStatus, TransportStatus};
use crate::transport::supervisor::deliver_all;
use crate::transport::{
    dispatch_event, invoke_request_handler, is_jwt, message_from_address, AddressCodec,
    ConnectHandler, ConnectionSupervisor, EventHandler, HubTransport, KeyPair, RequestHandler,
    TransportOptions,
};

pub use link::{
    AckPolicy, ConsumerConfig, DeliverPolicy, PullConsumer, StreamMessage, SubjectAuth,
    SubjectConnectOptions, SubjectConnector, SubjectEvent, SubjectLink, SubjectMsg, ERROR_HEADER,
};
pub use memory::MemorySubjectServer;
#[cfg(feature = "nats")]
pub use nats::NatsConnector;

/// 拉取一条消息的最长等待时间
const FETCH_WAIT: Duration = Duration::from_secs(1);

struct State {
    supervisor: ConnectionSupervisor,
    link: Option<Arc<dyn SubjectLink>>,
    /// 地址 → 订阅 ID
    subscriptions: HashMap<String, u64>,
    event_handler: Option<EventHandler>,
    request_handler: Option<RequestHandler>,
    /// 断开时一并取消事件循环与流消费循环
    tasks: CancellationToken,
}

struct Inner {
    codec: AddressCodec,
    options: TransportOptions,
    connector: Arc<dyn SubjectConnector>,
    state: RwLock<State>,
}

pub struct SubjectTransport {
    inner: Arc<Inner>,
}

/// 流订阅句柄
pub struct StreamSubscription {
    stream: String,
    token: CancellationToken,
}

impl StreamSubscription {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// 停止消费循环
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }
}

/// 从应答中提取错误：先看应答头，再看 `{"error": ...}` 负载
fn reply_error(msg: &SubjectMsg) -> Option<String> {
    if let Some(err) = msg.headers.get(ERROR_HEADER) {
        return Some(err.clone());
    }
    let value: serde_json::Value = serde_json::from_slice(&msg.payload).ok()?;
    value
        .as_object()
        .filter(|obj| obj.len() == 1)
        .and_then(|obj| obj.get("error"))
        .and_then(|e| e.as_str())
        .map(str::to_string)
}

impl SubjectTransport {
    pub fn new(options: TransportOptions, connector: Arc<dyn SubjectConnector>) -> Self {
        let status = TransportStatus {
            supports_password_auth: true,
            supports_keys_auth: true,
            supports_token_auth: true,
            ..options.initial_status("nats")
        };
        Self {
            inner: Arc::new(Inner {
                codec: AddressCodec::subject_tree(),
                options,
                connector,
                state: RwLock::new(State {
                    supervisor: ConnectionSupervisor::new(status),
                    link: None,
                    subscriptions: HashMap::new(),
                    event_handler: None,
                    request_handler: None,
                    tasks: CancellationToken::new(),
                }),
            }),
        }
    }

    fn inbox_prefix(&self) -> String {
        self.inner.codec.inbox(&self.inner.options.client_id)
    }

    async fn connect(&self, auth: SubjectAuth) -> Result<(), HubError> {
        let inner = &self.inner;
        let notice = {
            let mut st = inner.write();
            if st.link.is_some() {
                return Err(HubError::AlreadyConnected);
            }
            st.supervisor.begin_connect()?
        };
        deliver_all([notice]);

        let options = SubjectConnectOptions {
            name: inner.options.client_id.clone(),
            inbox_prefix: self.inbox_prefix(),
            auth,
            timeout: inner.options.timeout,
        };
        let (link, events) = match inner.connector.connect(options).await {
            Ok(connected) => connected,
            Err(e) => {
                let next = if e.is_terminal() {
                    ConnectionStatus::Unauthorized
                } else {
                    ConnectionStatus::ConnectFailed
                };
                let notice = inner.write().supervisor.transition(next, Some(e.to_string()));
                tracing::warn!(client_id = %inner.options.client_id, "Connection to the hub failed: {}", e);
                deliver_all([notice]);
                return Err(e);
            }
        };

        let (token, notice) = {
            let mut st = inner.write();
            st.link = Some(link);
            st.tasks = CancellationToken::new();
            let notice = st.supervisor.transition(ConnectionStatus::Connected, None);
            (st.tasks.clone(), notice)
        };
        tokio::spawn(run_event_loop(Arc::downgrade(inner), events, token));
        tracing::info!(client_id = %inner.options.client_id, "Connected to the hub");
        deliver_all([notice]);
        Ok(())
    }

    /// 以队列组订阅：组内只有一个成员处理同一条消息
    pub async fn subscribe_group(&self, address: &str, group: &str) -> Result<(), HubError> {
        let link = self.inner.connected_link()?;
        let sid = link.subscribe(address, Some(group)).await?;
        self.inner
            .write()
            .subscriptions
            .insert(address.to_string(), sid);
        Ok(())
    }

    /// 订阅流；`receive_latest` 为 true 时先追上每个主题的最新值
    pub async fn sub_stream(
        &self,
        stream: &str,
        receive_latest: bool,
    ) -> Result<StreamSubscription, HubError> {
        let inner = &self.inner;
        let link = inner.connected_link()?;
        let config = ConsumerConfig {
            description: format!("group consumer for client {}", inner.options.client_id),
            deliver_policy: if receive_latest {
                DeliverPolicy::LastPerSubject
            } else {
                DeliverPolicy::New
            },
            ack_policy: AckPolicy::None,
        };
        let consumer = link.create_consumer(stream, config).await?;
        let token = inner.read().tasks.child_token();

        tokio::spawn(run_stream_loop(
            Arc::downgrade(inner),
            stream.to_string(),
            consumer,
            token.clone(),
        ));
        Ok(StreamSubscription {
            stream: stream.to_string(),
            token,
        })
    }
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<SubjectEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_event(event);
    }
}

async fn run_stream_loop(
    inner: Weak<Inner>,
    stream: String,
    consumer: Box<dyn PullConsumer>,
    token: CancellationToken,
) {
    tracing::debug!(stream = %stream, "Stream consumer started");
    while consumer.is_valid() {
        let fetched = tokio::select! {
            _ = token.cancelled() => break,
            r = consumer.fetch(1, FETCH_WAIT) => r,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match fetched {
            Ok(messages) => {
                for m in messages {
                    match message_from_address(&inner.codec, &m.subject, &m.payload, m.timestamp_msec) {
                        Ok(msg) => dispatch_event(inner.read().event_handler.clone(), msg),
                        Err(e) => tracing::warn!(subject = %m.subject, "Ignoring stream message: {}", e),
                    }
                }
            }
            Err(HubError::Timeout) => continue,
            Err(e) => tracing::debug!(stream = %stream, "Stream fetch failed: {}", e),
        }
    }
    token.cancel();
    tracing::debug!(stream = %stream, "Stream consumer ended");
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn connected_link(&self) -> Result<Arc<dyn SubjectLink>, HubError> {
        let st = self.read();
        match &st.link {
            Some(link) if st.supervisor.is_connected() => Ok(link.clone()),
            _ => Err(HubError::NoConnection),
        }
    }

    fn on_event(&self, event: SubjectEvent) {
        match event {
            SubjectEvent::Down { reason } => {
                let notice = self.write().supervisor.transition(
                    ConnectionStatus::Connecting,
                    Some(format!("disconnected by server: {}", reason)),
                );
                deliver_all([notice]);
            }
            SubjectEvent::Reconnected => {
                let notice = self
                    .write()
                    .supervisor
                    .transition(ConnectionStatus::Connected, None);
                deliver_all([notice]);
            }
            SubjectEvent::Message(msg) => match msg.reply.clone() {
                Some(reply) => self.on_request(msg, reply),
                None => match message_from_address(&self.codec, &msg.subject, &msg.payload, 0) {
                    Ok(tm) => dispatch_event(self.read().event_handler.clone(), tm),
                    Err(e) => tracing::warn!(subject = %msg.subject, "Ignoring event: {}", e),
                },
            },
        }
    }

    fn on_request(&self, msg: SubjectMsg, reply_subject: String) {
        let (handler, link) = {
            let st = self.read();
            (st.request_handler.clone(), st.link.clone())
        };
        let decoded = message_from_address(&self.codec, &msg.subject, &msg.payload, 0);

        tokio::spawn(async move {
            let reply = match decoded {
                Ok(tm) => invoke_request_handler(handler, tm).await,
                Err(e) => crate::transport::RequestReply::error(e.to_string()),
            };
            if reply.do_not_reply {
                return;
            }
            let Some(link) = link else {
                return;
            };
            let mut headers = HashMap::new();
            if let Some(err) = &reply.error {
                headers.insert(ERROR_HEADER.to_string(), err.clone());
            }
            if let Err(e) = link.publish(&reply_subject, headers, reply.reply).await {
                tracing::warn!(subject = %msg.subject, "Failed to publish reply: {}", e);
            }
        });
    }
}

#[async_trait]
impl HubTransport for SubjectTransport {
    fn codec(&self) -> AddressCodec {
        self.inner.codec
    }

    async fn connect_with_password(&self, password: &str) -> Result<(), HubError> {
        self.connect(SubjectAuth::Password {
            user: self.inner.options.client_id.clone(),
            password: password.to_string(),
        })
        .await
    }

    /// 令牌可解析为 JWT 时用 JWT 认证，否则退回密钥对认证
    async fn connect_with_token(
        &self,
        key_pair: Option<Arc<dyn KeyPair>>,
        token: &str,
    ) -> Result<(), HubError> {
        let auth = if is_jwt(token) {
            SubjectAuth::Jwt {
                jwt: token.to_string(),
                key_pair,
            }
        } else if let Some(key_pair) = key_pair {
            tracing::info!(
                client_id = %self.inner.options.client_id,
                "Token is not a JWT, falling back to key pair authentication"
            );
            SubjectAuth::Nkey { key_pair }
        } else {
            return Err(HubError::unauthorized(
                "token is not a valid JWT and no key pair is provided",
            ));
        };
        self.connect(auth).await
    }

    async fn disconnect(&self) {
        let (link, notice) = {
            let mut st = self.inner.write();
            st.tasks.cancel();
            st.subscriptions.clear();
            let notice = st.supervisor.transition(
                ConnectionStatus::Disconnected,
                Some("disconnected by user".to_string()),
            );
            (st.link.take(), notice)
        };
        if let Some(link) = link {
            link.close().await;
        }
        deliver_all([notice]);
    }

    fn shutdown(&self) {
        let mut st = self.inner.write();
        st.event_handler = None;
        st.request_handler = None;
        st.supervisor.set_connect_handler(None);
    }

    fn status(&self) -> TransportStatus {
        self.inner.read().supervisor.status()
    }

    async fn pub_event(&self, address: &str, payload: &[u8]) -> Result<(), HubError> {
        let link = self.inner.connected_link()?;
        tokio::time::timeout(
            self.inner.options.timeout,
            link.publish(address, HashMap::new(), payload.to_vec()),
        )
        .await
        .map_err(|_| HubError::Timeout)?
    }

    async fn pub_request(&self, address: &str, payload: &[u8]) -> Result<Vec<u8>, HubError> {
        let link = self.inner.connected_link()?;
        let reply = link
            .request(address, payload.to_vec(), self.inner.options.timeout)
            .await?;
        match reply_error(&reply) {
            Some(err) => Err(HubError::Handler(err)),
            None => Ok(reply.payload),
        }
    }

    async fn subscribe(&self, address: &str) -> Result<(), HubError> {
        let link = self.inner.connected_link()?;
        let sid = link.subscribe(address, None).await?;
        let previous = self
            .inner
            .write()
            .subscriptions
            .insert(address.to_string(), sid);
        if let Some(old) = previous {
            link.unsubscribe(old).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, address: &str) -> Result<(), HubError> {
        let (link, sid) = {
            let mut st = self.inner.write();
            (st.link.clone(), st.subscriptions.remove(address))
        };
        match (link, sid) {
            (Some(link), Some(sid)) => link.unsubscribe(sid).await,
            _ => Ok(()),
        }
    }

    fn set_connect_handler(&self, handler: Option<ConnectHandler>) {
        self.inner.write().supervisor.set_connect_handler(handler);
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        self.inner.write().event_handler = handler;
    }

    fn set_request_handler(&self, handler: Option<RequestHandler>) {
        self.inner.write().request_handler = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_error_from_header() {
        let mut msg = SubjectMsg::default();
        msg.headers.insert("error".into(), "bad level".into());
        assert_eq!(reply_error(&msg).as_deref(), Some("bad level"));
    }

    #[test]
    fn test_reply_error_from_payload() {
        let msg = SubjectMsg {
            payload: br#"{"error":"bad level"}"#.to_vec(),
            ..Default::default()
        };
        assert_eq!(reply_error(&msg).as_deref(), Some("bad level"));

        let ok = SubjectMsg {
            payload: br#"{"ok":true}"#.to_vec(),
            ..Default::default()
        };
        assert_eq!(reply_error(&ok), None);
    }

    #[tokio::test]
    async fn test_token_without_jwt_or_key_pair_is_rejected() {
        let server = MemorySubjectServer::new();
        let t = SubjectTransport::new(TransportOptions::new("nats://mem", "c1"), Arc::new(server));
        let err = t.connect_with_token(None, "opaque").await.unwrap_err();
        assert!(err.is_terminal());
        // 未发起连接，状态不变
        assert_eq!(t.status().connection_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let server = MemorySubjectServer::new();
        server.add_user("c1", "pw");
        let t = SubjectTransport::new(TransportOptions::new("nats://mem", "c1"), Arc::new(server));
        assert!(t.connect_with_password("nope").await.unwrap_err().is_terminal());
        assert_eq!(t.status().connection_status, ConnectionStatus::Unauthorized);
    }
}
