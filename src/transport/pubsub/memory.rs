//! 进程内主题树 broker
//!
//! 行为与常见 MQTT broker 一致的最小子集：用户名/密码认证、通配符路由、
//! 每次重连都是全新会话（不保留订阅）。可以主动切断某个客户端的连接，
//! 并记录连接尝试与订阅日志，便于验证重连与订阅恢复。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::link::{
    BrokerConnector, BrokerLink, LinkEvent, LinkOptions, PubPacket, QoS, REASON_BAD_CREDENTIALS,
};
use crate::core::HubError;
use crate::transport::AddressCodec;

/// broker 日志记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerRecord {
    Connect { username: String },
    Subscribe { username: String, filter: String },
    Publish { username: String, topic: String },
}

struct Session {
    username: String,
    online: bool,
    subs: Vec<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
    severed: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    credentials: HashMap<String, String>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    connect_attempts: HashMap<String, usize>,
    journal: Vec<BrokerRecord>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    codec: AddressCodec,
    retry_interval: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            codec: AddressCodec::topic_tree(),
            retry_interval: Duration::from_millis(100),
        }
    }

    /// 链路断开或被拒后重试的间隔
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 添加用户；secret 可以是密码或令牌
    pub fn add_user(&self, username: &str, secret: &str) {
        self.lock()
            .credentials
            .insert(username.to_string(), secret.to_string());
    }

    /// 切断该用户的所有在线连接，返回切断数量
    pub fn sever(&self, username: &str) -> usize {
        let mut state = self.lock();
        let mut count = 0;
        for session in state.sessions.values_mut() {
            if session.username == username && session.online {
                session.online = false;
                session.subs.clear();
                session.severed.notify_one();
                count += 1;
            }
        }
        tracing::info!(username, count, "Broker severed client connections");
        count
    }

    pub fn connect_attempts(&self, username: &str) -> usize {
        self.lock()
            .connect_attempts
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    pub fn journal(&self) -> Vec<BrokerRecord> {
        self.lock().journal.clone()
    }

    /// 某用户对某过滤器发起 SUBSCRIBE 的次数
    pub fn subscribe_count(&self, username: &str, filter: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|r| {
                matches!(r, BrokerRecord::Subscribe { username: u, filter: f } if u == username && f == filter)
            })
            .count()
    }

    pub fn online_sessions(&self) -> usize {
        self.lock().sessions.values().filter(|s| s.online).count()
    }

    fn try_connect(&self, session_id: u64, secret: &str) -> Result<(), u8> {
        let mut state = self.lock();
        let Some(username) = state.sessions.get(&session_id).map(|s| s.username.clone()) else {
            return Err(REASON_BAD_CREDENTIALS);
        };
        *state.connect_attempts.entry(username.clone()).or_insert(0) += 1;
        state.journal.push(BrokerRecord::Connect {
            username: username.clone(),
        });

        if state.credentials.get(&username).map(String::as_str) != Some(secret) {
            return Err(REASON_BAD_CREDENTIALS);
        }
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.online = true;
            session.subs.clear();
        }
        Ok(())
    }

    fn route(&self, session_id: u64, packet: PubPacket) -> Result<(), HubError> {
        let mut state = self.lock();
        let username = match state.sessions.get(&session_id) {
            Some(s) if s.online => s.username.clone(),
            _ => return Err(HubError::NoConnection),
        };
        state.journal.push(BrokerRecord::Publish {
            username,
            topic: packet.topic.clone(),
        });
        for session in state.sessions.values() {
            if session.online && session.subs.iter().any(|f| self.codec.matches(f, &packet.topic)) {
                let _ = session.events.send(LinkEvent::Message(packet.clone()));
            }
        }
        Ok(())
    }

    fn add_subscription(&self, session_id: u64, filter: &str) -> Result<(), HubError> {
        let mut state = self.lock();
        let username = match state.sessions.get_mut(&session_id) {
            Some(s) if s.online => {
                if !s.subs.iter().any(|f| f == filter) {
                    s.subs.push(filter.to_string());
                }
                s.username.clone()
            }
            _ => return Err(HubError::NoConnection),
        };
        state.journal.push(BrokerRecord::Subscribe {
            username,
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn remove_subscription(&self, session_id: u64, filter: &str) -> Result<(), HubError> {
        match self.lock().sessions.get_mut(&session_id) {
            Some(s) if s.online => {
                s.subs.retain(|f| f != filter);
                Ok(())
            }
            _ => Err(HubError::NoConnection),
        }
    }

    fn set_offline(&self, session_id: u64) {
        if let Some(s) = self.lock().sessions.get_mut(&session_id) {
            s.online = false;
            s.subs.clear();
        }
    }

    fn remove_session(&self, session_id: u64) {
        self.lock().sessions.remove(&session_id);
    }

    /// 链路后台循环：连接、等待切断或关闭、按间隔重试
    async fn run_link(
        self,
        session_id: u64,
        secret: String,
        severed: Arc<Notify>,
        closed: CancellationToken,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        loop {
            if closed.is_cancelled() {
                break;
            }
            match self.try_connect(session_id, &secret) {
                Ok(()) => {
                    let _ = events.send(LinkEvent::Up);
                    tokio::select! {
                        _ = severed.notified() => {
                            let _ = events.send(LinkEvent::Down {
                                reason: "connection severed by broker".to_string(),
                            });
                        }
                        _ = closed.cancelled() => break,
                    }
                }
                Err(code) => {
                    let _ = events.send(LinkEvent::Refused {
                        code,
                        reason: "not authorized".to_string(),
                    });
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = closed.cancelled() => break,
            }
        }
        self.set_offline(session_id);
        self.remove_session(session_id);
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    session_id: u64,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn publish(&self, packet: PubPacket) -> Result<(), HubError> {
        self.broker.route(self.session_id, packet)
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), HubError> {
        self.broker.add_subscription(self.session_id, filter)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), HubError> {
        self.broker.remove_subscription(self.session_id, filter)
    }

    async fn close(&self) {
        self.closed.cancel();
        self.broker.set_offline(self.session_id);
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(
        &self,
        options: LinkOptions,
    ) -> Result<(Arc<dyn BrokerLink>, mpsc::UnboundedReceiver<LinkEvent>), HubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let severed = Arc::new(Notify::new());
        let session_id = {
            let mut state = self.lock();
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(
                id,
                Session {
                    username: options.username.clone(),
                    online: false,
                    subs: Vec::new(),
                    events: tx.clone(),
                    severed: severed.clone(),
                },
            );
            id
        };
        tracing::debug!(connect_id = %options.connect_id, "Memory broker link opened");

        let closed = CancellationToken::new();
        tokio::spawn(self.clone().run_link(
            session_id,
            options.secret,
            severed,
            closed.clone(),
            tx,
        ));

        let link: Arc<dyn BrokerLink> = Arc::new(MemoryLink {
            broker: self.clone(),
            session_id,
            closed,
        });
        Ok((link, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(user: &str, secret: &str) -> LinkOptions {
        LinkOptions {
            connect_id: format!("{}-test", user),
            username: user.to_string(),
            secret: secret.to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_routes_to_matching_subscribers() {
        let broker = MemoryBroker::new();
        broker.add_user("c1", "pw");
        broker.add_user("c2", "pw");

        let (l1, mut rx1) = broker.open(options("c1", "pw")).await.unwrap();
        let (l2, mut rx2) = broker.open(options("c2", "pw")).await.unwrap();
        assert!(matches!(rx1.recv().await, Some(LinkEvent::Up)));
        assert!(matches!(rx2.recv().await, Some(LinkEvent::Up)));

        l1.subscribe("event/a/+/+", QoS::AtMostOnce).await.unwrap();
        l2.publish(PubPacket::new("event/a/t/temp", b"21".to_vec(), QoS::AtMostOnce))
            .await
            .unwrap();

        match rx1.recv().await {
            Some(LinkEvent::Message(p)) => assert_eq!(p.payload, b"21"),
            other => panic!("unexpected event: {:?}", other),
        }
        l1.close().await;
        l2.close().await;
    }

    #[tokio::test]
    async fn test_bad_credentials_are_refused_and_retried() {
        let broker = MemoryBroker::new().with_retry_interval(Duration::from_millis(10));
        broker.add_user("c1", "pw");

        let (link, mut rx) = broker.open(options("c1", "wrong")).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::Refused { code: 134, .. })
        ));
        assert!(matches!(rx.recv().await, Some(LinkEvent::Refused { .. })));
        assert!(broker.connect_attempts("c1") >= 2);
        link.close().await;
    }

    #[tokio::test]
    async fn test_sever_reconnects_with_clean_session() {
        let broker = MemoryBroker::new().with_retry_interval(Duration::from_millis(10));
        broker.add_user("c1", "pw");

        let (link, mut rx) = broker.open(options("c1", "pw")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Up)));
        link.subscribe("event/#", QoS::AtMostOnce).await.unwrap();

        assert_eq!(broker.sever("c1"), 1);
        assert!(matches!(rx.recv().await, Some(LinkEvent::Down { .. })));
        assert!(matches!(rx.recv().await, Some(LinkEvent::Up)));
        assert_eq!(broker.connect_attempts("c1"), 2);
        link.close().await;
    }
}
