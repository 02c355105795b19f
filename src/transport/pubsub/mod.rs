//! 主题树发布订阅传输
//!
//! 请求/应答建立在普通发布订阅之上：每个连接有自己的收件箱主题
//! `_INBOX/connectID`，请求携带 correlationData 与 responseTopic，
//! 应答回到收件箱后由 [`CorrelationRegistry`] 交给等待的调用方。
//!
//! 链路每次（重新）上线都是全新会话，订阅集合会在通知 "connected" 之前全部重放。

pub mod link;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::HubError;
use crate::things::{ConnectionStatus, MsgType, TransportStatus};
use crate::transport::supervisor::{deliver_all, settle_result, wait_settled};
use crate::transport::{
    dispatch_event, invoke_request_handler, message_from_address, AddressCodec, ConnectHandler,
    ConnectionSupervisor, CorrelationRegistry, EventHandler, HubTransport, KeyPair, RequestHandler,
    TransportOptions,
};

pub use link::{
    is_auth_reason, BrokerConnector, BrokerLink, LinkEvent, LinkOptions, PubPacket, QoS,
    REASON_BAD_CREDENTIALS, REASON_NOT_AUTHORIZED,
};
pub use memory::{BrokerRecord, MemoryBroker};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttConnector;

const CONTENT_TYPE_JSON: &str = "json";
const CONTENT_TYPE_ERROR: &str = "error";

struct State {
    supervisor: ConnectionSupervisor,
    link: Option<Arc<dyn BrokerLink>>,
    link_up: bool,
    connect_id: String,
    inbox_topic: Option<String>,
    inbox_subscribed: bool,
    /// 按订阅顺序保存，重连时按同样顺序重放
    subscriptions: Vec<String>,
    event_handler: Option<EventHandler>,
    request_handler: Option<RequestHandler>,
    loop_token: Option<CancellationToken>,
}

struct Inner {
    codec: AddressCodec,
    options: TransportOptions,
    connector: Arc<dyn BrokerConnector>,
    correlation: CorrelationRegistry<Vec<u8>>,
    state: RwLock<State>,
}

/// 主题树发布订阅传输
pub struct PubSubTransport {
    inner: Arc<Inner>,
}

/// 生成 `clientID-host-timestamp-random` 形式的连接 ID
fn make_connect_id(client_id: &str) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S%.3f");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", client_id, host, timestamp, &suffix[..8])
}

impl PubSubTransport {
    pub fn new(options: TransportOptions, connector: Arc<dyn BrokerConnector>) -> Self {
        let status = TransportStatus {
            supports_password_auth: true,
            supports_token_auth: true,
            ..options.initial_status("mqtt")
        };
        Self {
            inner: Arc::new(Inner {
                codec: AddressCodec::topic_tree(),
                options,
                connector,
                correlation: CorrelationRegistry::new(),
                state: RwLock::new(State {
                    supervisor: ConnectionSupervisor::new(status),
                    link: None,
                    link_up: false,
                    connect_id: String::new(),
                    inbox_topic: None,
                    inbox_subscribed: false,
                    subscriptions: Vec::new(),
                    event_handler: None,
                    request_handler: None,
                    loop_token: None,
                }),
            }),
        }
    }

    /// 当前连接的收件箱主题；连接上线前为 None
    pub fn inbox_topic(&self) -> Option<String> {
        self.inner.read().inbox_topic.clone()
    }

    /// 当前保存的订阅集合
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.read().subscriptions.clone()
    }

    /// 等待应答中的请求数
    pub fn pending_requests(&self) -> usize {
        self.inner.correlation.len()
    }

    async fn connect(&self, secret: &str) -> Result<(), HubError> {
        let inner = &self.inner;
        let (notice, watch, connect_id) = {
            let mut st = inner.write();
            if st.link.is_some() {
                return Err(HubError::AlreadyConnected);
            }
            let notice = st.supervisor.begin_connect()?;
            st.connect_id = make_connect_id(&inner.options.client_id);
            (notice, st.supervisor.watch(), st.connect_id.clone())
        };
        deliver_all([notice]);
        tracing::info!(
            client_id = %inner.options.client_id,
            connect_id = %connect_id,
            url = %inner.options.full_url,
            "Connecting to the hub"
        );

        let options = link::LinkOptions {
            connect_id,
            username: inner.options.client_id.clone(),
            secret: secret.to_string(),
            timeout: inner.options.timeout,
        };
        let (link, events) = match inner.connector.open(options).await {
            Ok(opened) => opened,
            Err(e) => {
                let notice = inner
                    .write()
                    .supervisor
                    .transition(ConnectionStatus::ConnectFailed, Some(e.to_string()));
                deliver_all([notice]);
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        {
            let mut st = inner.write();
            st.link = Some(link);
            st.loop_token = Some(token.clone());
        }
        tokio::spawn(run_event_loop(Arc::downgrade(inner), events, token));

        let settled = wait_settled(watch, inner.options.timeout).await;
        settle_result(settled, &inner.read().supervisor.status())
    }
}

/// 链路事件循环；只持有弱引用，传输被释放后自动退出
async fn run_event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
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
        inner.on_link_event(event).await;
    }
    tracing::debug!("Link event loop ended");
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn active_link(&self) -> Result<Arc<dyn BrokerLink>, HubError> {
        let st = self.read();
        match (&st.link, st.link_up) {
            (Some(link), true) => Ok(link.clone()),
            _ => Err(HubError::NoConnection),
        }
    }

    async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Up => self.on_link_up().await,
            LinkEvent::Down { reason } => {
                let notice = {
                    let mut st = self.write();
                    if st.link.is_none() {
                        return;
                    }
                    st.link_up = false;
                    st.inbox_subscribed = false;
                    st.supervisor.transition(
                        ConnectionStatus::Connecting,
                        Some(format!("disconnected by server: {}", reason)),
                    )
                };
                tracing::warn!(reason = %reason, "Connection to the hub lost, reconnecting");
                self.correlation.abort_all(HubError::ConnectionLost);
                deliver_all([notice]);
            }
            LinkEvent::Refused { code, reason } if is_auth_reason(code) => {
                let (link, notice) = {
                    let mut st = self.write();
                    let Some(link) = st.link.take() else {
                        return;
                    };
                    st.link_up = false;
                    if let Some(token) = st.loop_token.take() {
                        token.cancel();
                    }
                    let notice = st
                        .supervisor
                        .transition(ConnectionStatus::Unauthorized, Some(reason.clone()));
                    (link, notice)
                };
                tracing::warn!(
                    client_id = %self.options.client_id,
                    code,
                    reason = %reason,
                    "Hub refused the connection. Not retrying"
                );
                link.close().await;
                self.correlation.abort_all(HubError::unauthorized(reason));
                deliver_all([notice]);
            }
            LinkEvent::Refused { code, reason } => {
                let notice = {
                    let mut st = self.write();
                    if st.link.is_none() {
                        return;
                    }
                    st.supervisor.transition(
                        ConnectionStatus::Connecting,
                        Some(format!("connection refused ({}): {}", code, reason)),
                    )
                };
                deliver_all([notice]);
            }
            LinkEvent::Message(packet) => self.on_message(packet),
        }
    }

    /// 上线：生成收件箱、重放订阅，最后才通知 connected
    async fn on_link_up(&self) {
        let (link, subscriptions) = {
            let mut st = self.write();
            let Some(link) = st.link.clone() else {
                return;
            };
            st.link_up = true;
            st.inbox_subscribed = false;
            st.inbox_topic = Some(self.codec.inbox(&st.connect_id));
            (link, st.subscriptions.clone())
        };

        for filter in &subscriptions {
            if let Err(e) = link.subscribe(filter, QoS::AtLeastOnce).await {
                tracing::warn!(filter = %filter, "Failed to restore subscription: {}", e);
            }
        }

        // 重放期间链路可能已被用户断开或再次掉线
        let notice = {
            let mut st = self.write();
            let same_link = st.link.as_ref().is_some_and(|l| Arc::ptr_eq(l, &link));
            if !same_link || !st.link_up {
                tracing::debug!(
                    client_id = %self.options.client_id,
                    "Link changed while restoring subscriptions"
                );
                return;
            }
            st.supervisor.transition(ConnectionStatus::Connected, None)
        };
        tracing::info!(
            client_id = %self.options.client_id,
            restored = subscriptions.len(),
            "Connected to the hub"
        );
        deliver_all([notice]);
    }

    fn on_message(&self, packet: PubPacket) {
        let PubPacket {
            topic,
            payload,
            correlation_data,
            response_topic,
            content_type,
            ..
        } = packet;

        if topic.starts_with(MsgType::Inbox.as_str()) {
            let Some(cid) = correlation_data else {
                tracing::warn!(topic = %topic, "Inbox message without correlation data. Dropped");
                return;
            };
            let id = String::from_utf8_lossy(&cid).to_string();
            let outcome = if content_type.as_deref() == Some(CONTENT_TYPE_ERROR) {
                Err(HubError::Handler(String::from_utf8_lossy(&payload).to_string()))
            } else {
                Ok(payload)
            };
            self.correlation.deliver(&id, outcome);
            return;
        }

        match (correlation_data, response_topic) {
            (Some(cid), Some(reply_to)) => self.on_request(topic, payload, cid, reply_to),
            _ => match message_from_address(&self.codec, &topic, &payload, 0) {
                Ok(msg) => dispatch_event(self.read().event_handler.clone(), msg),
                Err(e) => tracing::warn!(topic = %topic, "Ignoring event: {}", e),
            },
        }
    }

    /// 收到请求：在新任务上调用处理器并把结果发回 responseTopic
    fn on_request(&self, topic: String, payload: Vec<u8>, cid: Vec<u8>, reply_to: String) {
        let (handler, link) = {
            let st = self.read();
            (st.request_handler.clone(), st.link.clone())
        };
        let msg = message_from_address(&self.codec, &topic, &payload, 0);

        tokio::spawn(async move {
            let reply = match msg {
                Ok(msg) => invoke_request_handler(handler, msg).await,
                Err(e) => {
                    tracing::warn!(topic = %topic, "Malformed request address: {}", e);
                    crate::transport::RequestReply::error(e.to_string())
                }
            };
            if reply.do_not_reply {
                return;
            }
            let Some(link) = link else {
                tracing::warn!(topic = %topic, "Unable to reply, link is gone");
                return;
            };

            let (body, content_type) = match reply.error {
                Some(err) => (err.into_bytes(), CONTENT_TYPE_ERROR),
                None => (reply.reply, CONTENT_TYPE_JSON),
            };
            let mut packet = PubPacket::new(reply_to, body, QoS::AtLeastOnce);
            packet.correlation_data = Some(cid);
            packet.content_type = Some(content_type.to_string());
            if let Err(e) = link.publish(packet).await {
                tracing::warn!(topic = %topic, "Failed to publish reply: {}", e);
            }
        });
    }
}

#[async_trait]
impl HubTransport for PubSubTransport {
    fn codec(&self) -> AddressCodec {
        self.inner.codec
    }

    async fn connect_with_password(&self, password: &str) -> Result<(), HubError> {
        self.connect(password).await
    }

    /// 令牌作为密码发送；主题树 broker 不使用密钥对
    async fn connect_with_token(
        &self,
        _key_pair: Option<Arc<dyn KeyPair>>,
        token: &str,
    ) -> Result<(), HubError> {
        self.connect(token).await
    }

    async fn disconnect(&self) {
        let inner = &self.inner;
        let (link, token, notice) = {
            let mut st = inner.write();
            st.link_up = false;
            st.subscriptions.clear();
            st.inbox_topic = None;
            st.inbox_subscribed = false;
            let notice = st.supervisor.transition(
                ConnectionStatus::Disconnected,
                Some("disconnected by user".to_string()),
            );
            (st.link.take(), st.loop_token.take(), notice)
        };
        if let Some(token) = token {
            token.cancel();
        }
        inner.correlation.abort_all(HubError::ConnectionLost);
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
        let link = self.inner.active_link()?;
        let packet = PubPacket::new(address, payload.to_vec(), QoS::AtMostOnce);
        tokio::time::timeout(self.inner.options.timeout, link.publish(packet))
            .await
            .map_err(|_| HubError::Timeout)?
    }

    async fn pub_request(&self, address: &str, payload: &[u8]) -> Result<Vec<u8>, HubError> {
        let inner = &self.inner;
        let link = inner.active_link()?;
        let (inbox, subscribed) = {
            let st = inner.read();
            let inbox = st.inbox_topic.clone().ok_or(HubError::NoConnection)?;
            (inbox, st.inbox_subscribed)
        };
        if !subscribed {
            link.subscribe(&inbox, QoS::AtLeastOnce).await?;
            let mut st = inner.write();
            if st.inbox_topic.as_deref() == Some(inbox.as_str()) {
                st.inbox_subscribed = true;
            }
        }

        let slot = inner.correlation.register_next();
        let mut packet = PubPacket::new(address, payload.to_vec(), QoS::AtLeastOnce);
        packet.correlation_data = Some(slot.id().as_bytes().to_vec());
        packet.response_topic = Some(inbox);
        packet.content_type = Some(CONTENT_TYPE_JSON.to_string());

        if let Err(e) = link.publish(packet).await {
            inner.correlation.remove(slot.id());
            return Err(e);
        }
        inner.correlation.wait(slot, inner.options.timeout).await
    }

    async fn subscribe(&self, address: &str) -> Result<(), HubError> {
        let link = {
            let mut st = self.inner.write();
            if !st.subscriptions.iter().any(|s| s == address) {
                st.subscriptions.push(address.to_string());
            }
            if st.link_up {
                st.link.clone()
            } else {
                None
            }
        };
        match link {
            Some(link) => link.subscribe(address, QoS::AtLeastOnce).await,
            None => {
                tracing::debug!(address, "Not connected, subscription recorded for replay");
                Ok(())
            }
        }
    }

    async fn unsubscribe(&self, address: &str) -> Result<(), HubError> {
        let link = {
            let mut st = self.inner.write();
            st.subscriptions.retain(|s| s != address);
            if st.link_up {
                st.link.clone()
            } else {
                None
            }
        };
        match link {
            Some(link) => link.unsubscribe(address).await,
            None => Ok(()),
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
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::BoxFuture;

    use crate::things::ThingMessage;
    use crate::transport::RequestReply;

    fn transport(broker: &MemoryBroker, client_id: &str) -> PubSubTransport {
        let options = TransportOptions::new("mem://broker", client_id)
            .with_timeout(Duration::from_millis(500));
        PubSubTransport::new(options, Arc::new(broker.clone()))
    }

    /// 订阅耗时较长的链路，用于在订阅重放期间插入其他操作
    struct SlowSubscribeConnector {
        broker: MemoryBroker,
        delay: Duration,
    }

    struct SlowSubscribeLink {
        inner: Arc<dyn BrokerLink>,
        delay: Duration,
    }

    #[async_trait]
    impl BrokerLink for SlowSubscribeLink {
        async fn publish(&self, packet: PubPacket) -> Result<(), HubError> {
            self.inner.publish(packet).await
        }

        async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), HubError> {
            tokio::time::sleep(self.delay).await;
            self.inner.subscribe(filter, qos).await
        }

        async fn unsubscribe(&self, filter: &str) -> Result<(), HubError> {
            self.inner.unsubscribe(filter).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[async_trait]
    impl BrokerConnector for SlowSubscribeConnector {
        async fn open(
            &self,
            options: LinkOptions,
        ) -> Result<(Arc<dyn BrokerLink>, mpsc::UnboundedReceiver<LinkEvent>), HubError> {
            let (inner, events) = self.broker.open(options).await?;
            let link: Arc<dyn BrokerLink> = Arc::new(SlowSubscribeLink {
                inner,
                delay: self.delay,
            });
            Ok((link, events))
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_subscription_replay_stays_disconnected() {
        let broker = MemoryBroker::new();
        broker.add_user("c1", "pw");
        let connector = SlowSubscribeConnector {
            broker: broker.clone(),
            delay: Duration::from_millis(200),
        };
        let options =
            TransportOptions::new("mem://broker", "c1").with_timeout(Duration::from_millis(500));
        let t = Arc::new(PubSubTransport::new(options, Arc::new(connector)));

        // 未连接时的订阅会在上线时重放
        t.subscribe("event/a/t/+").await.unwrap();
        let connecting = {
            let t = t.clone();
            tokio::spawn(async move { t.connect_with_password("pw").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.disconnect().await;

        let _ = connecting.await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(t.status().connection_status, ConnectionStatus::Disconnected);
        assert_eq!(
            t.pub_event("event/c1/t/temp/c1", b"1").await,
            Err(HubError::NoConnection)
        );
    }

    #[test]
    fn test_connect_id_is_unique() {
        let a = make_connect_id("c1");
        let b = make_connect_id("c1");
        assert!(a.starts_with("c1-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails() {
        let broker = MemoryBroker::new();
        let t = transport(&broker, "c1");
        assert_eq!(
            t.pub_event("event/a/t/temp", b"1").await,
            Err(HubError::NoConnection)
        );
        assert_eq!(
            t.pub_request("action/a/t/dim", b"1").await,
            Err(HubError::NoConnection)
        );
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let broker = MemoryBroker::new();
        broker.add_user("c1", "pw");
        let t = transport(&broker, "c1");
        t.connect_with_password("pw").await.unwrap();
        assert_eq!(
            t.connect_with_password("pw").await,
            Err(HubError::AlreadyConnected)
        );
        assert!(t.inbox_topic().unwrap().starts_with("_INBOX/c1-"));
        t.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_by_user() {
        let broker = MemoryBroker::new();
        broker.add_user("c1", "pw");
        let t = transport(&broker, "c1");
        t.connect_with_password("pw").await.unwrap();
        t.subscribe("event/a/t/+").await.unwrap();

        t.disconnect().await;
        let status = t.status();
        assert_eq!(status.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(status.last_error.as_deref(), Some("disconnected by user"));
        assert!(t.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_request_timeout_removes_slot() {
        let broker = MemoryBroker::new();
        broker.add_user("c1", "pw");
        let t = transport(&broker, "c1");
        t.connect_with_password("pw").await.unwrap();

        let res = t.pub_request("action/nobody/t/dim/c1", b"{}").await;
        assert_eq!(res, Err(HubError::Timeout));
        assert_eq!(t.pending_requests(), 0);
        t.disconnect().await;
    }

    #[tokio::test]
    async fn test_events_are_delivered() {
        let broker = MemoryBroker::new();
        broker.add_user("c1", "pw");
        broker.add_user("agent1", "pw");
        let consumer = transport(&broker, "c1");
        let agent = transport(&broker, "agent1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer.set_event_handler(Some(Arc::new(move |msg: ThingMessage| {
            let _ = tx.send(msg);
        })));
        consumer.connect_with_password("pw").await.unwrap();
        consumer.subscribe("event/agent1/+/+/+").await.unwrap();
        agent.connect_with_password("pw").await.unwrap();

        agent
            .pub_event("event/agent1/thing1/temp/agent1", b"21")
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.thing_id, "thing1");
        assert_eq!(msg.name, "temp");
        assert_eq!(msg.data, "21");
        assert_eq!(msg.sender_id, "agent1");

        consumer.disconnect().await;
        agent.disconnect().await;
    }

    #[tokio::test]
    async fn test_handler_may_publish_reentrantly() {
        let broker = MemoryBroker::new();
        broker.add_user("agent1", "pw");
        broker.add_user("c2", "pw");
        let agent = Arc::new(transport(&broker, "agent1"));
        let consumer = transport(&broker, "c2");

        // 请求处理器内部再发布一个事件
        let weak = Arc::downgrade(&agent);
        agent.set_request_handler(Some(Arc::new(move |_msg: ThingMessage| -> BoxFuture<'static, RequestReply> {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    let _ = agent.pub_event("event/agent1/thing1/dimmed/agent1", b"1").await;
                }
                RequestReply::ok(b"done".to_vec())
            })
        })));
        agent.connect_with_password("pw").await.unwrap();
        agent.subscribe("action/agent1/+/+/#").await.unwrap();
        consumer.connect_with_password("pw").await.unwrap();

        let reply = consumer
            .pub_request("action/agent1/thing1/dim/c2", b"{}")
            .await
            .unwrap();
        assert_eq!(reply, b"done");

        agent.disconnect().await;
        consumer.disconnect().await;
    }

    #[tokio::test]
    async fn test_server_drop_aborts_pending_requests() {
        let broker = MemoryBroker::new().with_retry_interval(Duration::from_millis(50));
        broker.add_user("c1", "pw");
        let t = Arc::new(transport(&broker, "c1"));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let s = statuses.clone();
        t.set_connect_handler(Some(Arc::new(move |st: TransportStatus| {
            s.lock().unwrap().push(st.connection_status);
        })));
        t.connect_with_password("pw").await.unwrap();

        let pending = {
            let t = t.clone();
            tokio::spawn(async move { t.pub_request("action/a/t/dim/c1", b"{}").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.sever("c1");

        assert_eq!(pending.await.unwrap(), Err(HubError::ConnectionLost));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
        t.disconnect().await;
    }
}
