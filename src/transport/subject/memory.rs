//! 进程内主题（subject）broker
//!
//! 支持密码、nkey（nonce 签名）与 JWT 认证，原生请求/应答，队列组，
//! 以及按主题捕获消息的流（可从每个主题的最后一条开始消费）。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};

use super::link::{
    ConsumerConfig, DeliverPolicy, PullConsumer, StreamMessage, SubjectAuth, SubjectConnectOptions,
    SubjectConnector, SubjectEvent, SubjectLink, SubjectMsg,
};
use crate::core::HubError;
use crate::things::now_msec;
use crate::transport::{AddressCodec, KeyPair};

struct StreamState {
    subjects: Vec<String>,
    messages: Mutex<Vec<StreamMessage>>,
    notify: Notify,
    deleted: AtomicBool,
}

impl StreamState {
    fn messages(&self) -> MutexGuard<'_, Vec<StreamMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_sequence(&self) -> u64 {
        self.messages().last().map(|m| m.sequence).unwrap_or(0)
    }
}

struct Conn {
    name: String,
    online: bool,
    events: mpsc::UnboundedSender<SubjectEvent>,
}

struct Sub {
    conn: u64,
    sid: u64,
    subject: String,
    queue_group: Option<String>,
}

#[derive(Default)]
struct ServerState {
    passwords: HashMap<String, String>,
    nkeys: Vec<Arc<dyn KeyPair>>,
    jwts: HashSet<String>,
    conns: HashMap<u64, Conn>,
    subs: Vec<Sub>,
    replies: HashMap<String, oneshot::Sender<SubjectMsg>>,
    streams: HashMap<String, Arc<StreamState>>,
    next_id: u64,
    round_robin: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct MemorySubjectServer {
    state: Arc<Mutex<ServerState>>,
    codec: AddressCodec,
    reconnect_delay: Duration,
}

impl Default for MemorySubjectServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySubjectServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            codec: AddressCodec::subject_tree(),
            reconnect_delay: Duration::from_millis(50),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, user: &str, password: &str) {
        self.lock()
            .passwords
            .insert(user.to_string(), password.to_string());
    }

    /// 登记可信密钥（服务端用其校验 nonce 签名）
    pub fn add_nkey(&self, key: Arc<dyn KeyPair>) {
        self.lock().nkeys.push(key);
    }

    pub fn add_jwt(&self, jwt: &str) {
        self.lock().jwts.insert(jwt.to_string());
    }

    /// 创建流，捕获匹配 `subjects` 的所有消息
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        self.lock().streams.insert(
            name.to_string(),
            Arc::new(StreamState {
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                messages: Mutex::new(Vec::new()),
                notify: Notify::new(),
                deleted: AtomicBool::new(false),
            }),
        );
    }

    /// 删除流；其上的消费者随之失效
    pub fn delete_stream(&self, name: &str) {
        if let Some(stream) = self.lock().streams.remove(name) {
            stream.deleted.store(true, Ordering::SeqCst);
            stream.notify.notify_waiters();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().conns.len()
    }

    /// 暂时断开某客户端，`reconnect_delay` 后恢复（订阅保留）
    pub fn sever(&self, name: &str) {
        let ids: Vec<u64> = {
            let mut state = self.lock();
            let mut ids = Vec::new();
            for (id, conn) in state.conns.iter_mut() {
                if conn.name == name && conn.online {
                    conn.online = false;
                    let _ = conn.events.send(SubjectEvent::Down {
                        reason: "connection reset by server".to_string(),
                    });
                    ids.push(*id);
                }
            }
            ids
        };
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(server.reconnect_delay).await;
            let mut state = server.lock();
            for id in ids {
                if let Some(conn) = state.conns.get_mut(&id) {
                    conn.online = true;
                    let _ = conn.events.send(SubjectEvent::Reconnected);
                }
            }
        });
    }

    fn authenticate(&self, auth: &SubjectAuth) -> Result<(), HubError> {
        let state = self.lock();
        let ok = match auth {
            SubjectAuth::Password { user, password } => {
                state.passwords.get(user).map(String::as_str) == Some(password.as_str())
            }
            SubjectAuth::Nkey { key_pair } => {
                let nonce = uuid::Uuid::new_v4().as_bytes().to_vec();
                let signature = key_pair.sign(&nonce);
                let public_key = key_pair.public_key();
                state
                    .nkeys
                    .iter()
                    .any(|k| k.public_key() == public_key && k.verify(&nonce, &signature))
            }
            SubjectAuth::Jwt { jwt, .. } => state.jwts.contains(jwt),
        };
        if ok {
            Ok(())
        } else {
            Err(HubError::unauthorized(format!(
                "authorization violation ({})",
                auth.kind()
            )))
        }
    }

    /// 路由一条消息，返回接收方数量
    fn route(
        &self,
        from: u64,
        subject: &str,
        reply: Option<String>,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<usize, HubError> {
        let mut state = self.lock();
        match state.conns.get(&from) {
            Some(conn) if conn.online => {}
            _ => return Err(HubError::NoConnection),
        }

        let msg = SubjectMsg {
            subject: subject.to_string(),
            reply,
            headers,
            payload,
        };

        if let Some(tx) = state.replies.remove(subject) {
            return Ok(usize::from(tx.send(msg).is_ok()));
        }

        for stream in state.streams.values() {
            if stream.subjects.iter().any(|p| self.codec.matches(p, subject)) {
                let mut messages = stream.messages();
                let sequence = messages.last().map(|m| m.sequence).unwrap_or(0) + 1;
                messages.push(StreamMessage {
                    subject: subject.to_string(),
                    payload: msg.payload.clone(),
                    sequence,
                    timestamp_msec: now_msec(),
                });
                drop(messages);
                stream.notify.notify_waiters();
            }
        }

        let mut targets: Vec<u64> = Vec::new();
        let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
        for sub in &state.subs {
            if !self.codec.matches(&sub.subject, subject) {
                continue;
            }
            match &sub.queue_group {
                None => targets.push(sub.conn),
                Some(group) => groups
                    .entry(format!("{}|{}", group, sub.subject))
                    .or_default()
                    .push(sub.conn),
            }
        }
        let mut group_keys: Vec<String> = groups.keys().cloned().collect();
        group_keys.sort();
        for key in group_keys {
            let members = &groups[&key];
            let counter = state.round_robin.entry(key.clone()).or_insert(0);
            targets.push(members[*counter % members.len()]);
            *counter += 1;
        }

        let mut delivered = 0;
        for conn_id in targets {
            if let Some(conn) = state.conns.get(&conn_id) {
                if conn.online && conn.events.send(SubjectEvent::Message(msg.clone())).is_ok() {
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }
}

struct MemorySubjectLink {
    server: MemorySubjectServer,
    conn: u64,
    inbox_prefix: String,
}

#[async_trait]
impl SubjectLink for MemorySubjectLink {
    async fn publish(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), HubError> {
        self.server
            .route(self.conn, subject, None, headers, payload)
            .map(|_| ())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<SubjectMsg, HubError> {
        let reply_subject = format!(
            "{}.{}",
            self.inbox_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let (tx, rx) = oneshot::channel();
        self.server.lock().replies.insert(reply_subject.clone(), tx);

        let receivers = self.server.route(
            self.conn,
            subject,
            Some(reply_subject.clone()),
            HashMap::new(),
            payload,
        );
        match receivers {
            Ok(0) => {
                self.server.lock().replies.remove(&reply_subject);
                return Err(HubError::TransientNetwork(
                    "no responders available for request".to_string(),
                ));
            }
            Err(e) => {
                self.server.lock().replies.remove(&reply_subject);
                return Err(e);
            }
            Ok(_) => {}
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(HubError::ConnectionLost),
            Err(_) => {
                self.server.lock().replies.remove(&reply_subject);
                Err(HubError::Timeout)
            }
        }
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<u64, HubError> {
        let mut state = self.server.lock();
        if !state.conns.contains_key(&self.conn) {
            return Err(HubError::NoConnection);
        }
        state.next_id += 1;
        let sid = state.next_id;
        state.subs.push(Sub {
            conn: self.conn,
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
        });
        Ok(sid)
    }

    async fn unsubscribe(&self, sid: u64) -> Result<(), HubError> {
        self.server
            .lock()
            .subs
            .retain(|s| !(s.conn == self.conn && s.sid == sid));
        Ok(())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<Box<dyn PullConsumer>, HubError> {
        let stream_state = self
            .server
            .lock()
            .streams
            .get(stream)
            .cloned()
            .ok_or_else(|| HubError::TransientNetwork(format!("stream '{}' not found", stream)))?;

        let (pending, next_sequence) = {
            let messages = stream_state.messages();
            let last = messages.last().map(|m| m.sequence).unwrap_or(0);
            let pending = match config.deliver_policy {
                DeliverPolicy::New => VecDeque::new(),
                DeliverPolicy::LastPerSubject => {
                    let mut latest: HashMap<&str, &StreamMessage> = HashMap::new();
                    for m in messages.iter() {
                        latest.insert(m.subject.as_str(), m);
                    }
                    let mut picked: Vec<StreamMessage> = latest.into_values().cloned().collect();
                    picked.sort_by_key(|m| m.sequence);
                    picked.into_iter().collect()
                }
            };
            (pending, last + 1)
        };
        tracing::debug!(stream, description = %config.description, "Consumer created");

        Ok(Box::new(MemoryConsumer {
            stream: stream_state,
            cursor: Mutex::new(Cursor {
                pending,
                next_sequence,
            }),
        }))
    }

    async fn close(&self) {
        let mut state = self.server.lock();
        state.conns.remove(&self.conn);
        state.subs.retain(|s| s.conn != self.conn);
    }
}

struct Cursor {
    pending: VecDeque<StreamMessage>,
    next_sequence: u64,
}

struct MemoryConsumer {
    stream: Arc<StreamState>,
    cursor: Mutex<Cursor>,
}

impl MemoryConsumer {
    fn take(&self, batch: usize) -> Vec<StreamMessage> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while out.len() < batch {
            match cursor.pending.pop_front() {
                Some(m) => out.push(m),
                None => break,
            }
        }
        if out.len() < batch {
            let messages = self.stream.messages();
            for m in messages.iter().filter(|m| m.sequence >= cursor.next_sequence) {
                if out.len() >= batch {
                    break;
                }
                out.push(m.clone());
            }
        }
        if let Some(last) = out.iter().map(|m| m.sequence).max() {
            cursor.next_sequence = cursor.next_sequence.max(last + 1);
        }
        out
    }
}

#[async_trait]
impl PullConsumer for MemoryConsumer {
    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<StreamMessage>, HubError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if !self.is_valid() {
                return Err(HubError::TransientNetwork("consumer deleted".to_string()));
            }
            let notified = self.stream.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let out = self.take(batch);
            if !out.is_empty() {
                return Ok(out);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(HubError::Timeout);
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.stream.deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubjectConnector for MemorySubjectServer {
    async fn connect(
        &self,
        options: SubjectConnectOptions,
    ) -> Result<(Arc<dyn SubjectLink>, mpsc::UnboundedReceiver<SubjectEvent>), HubError> {
        self.authenticate(&options.auth)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.conns.insert(
                id,
                Conn {
                    name: options.name.clone(),
                    online: true,
                    events: tx,
                },
            );
            id
        };
        tracing::debug!(name = %options.name, auth = options.auth.kind(), "Subject server accepted connection");

        let link: Arc<dyn SubjectLink> = Arc::new(MemorySubjectLink {
            server: self.clone(),
            conn,
            inbox_prefix: options.inbox_prefix,
        });
        Ok((link, rx))
    }
}
