//! 基于 async-nats 的 subject 链路
//!
//! 客户端库自行重连并恢复订阅，这里只把它的连接事件翻译为 [`SubjectEvent`]。
//! 流消费使用 JetStream 临时拉取消费者。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::PullConsumer as JsConsumer;
use async_nats::{ConnectErrorKind, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::link::{
    AckPolicy, ConsumerConfig, DeliverPolicy, PullConsumer, StreamMessage, SubjectAuth,
    SubjectConnectOptions, SubjectConnector, SubjectEvent, SubjectLink, SubjectMsg, ERROR_HEADER,
};
use crate::core::HubError;

/// NATS 连接器
pub struct NatsConnector {
    full_url: String,
    ca_cert_file: Option<PathBuf>,
}

impl NatsConnector {
    pub fn new(full_url: impl Into<String>, ca_cert_file: Option<PathBuf>) -> Self {
        Self {
            full_url: full_url.into(),
            ca_cert_file,
        }
    }

    fn base_options(&self, auth: &SubjectAuth) -> ConnectOptions {
        match auth.clone() {
            SubjectAuth::Password { user, password } => {
                ConnectOptions::with_user_and_password(user, password)
            }
            SubjectAuth::Nkey { key_pair } => ConnectOptions::with_auth_callback(move |nonce: Vec<u8>| {
                let key_pair = key_pair.clone();
                async move {
                    let mut auth = async_nats::Auth::new();
                    auth.nkey = Some(key_pair.public_key());
                    auth.signature = Some(key_pair.sign(&nonce));
                    Ok::<_, async_nats::AuthError>(auth)
                }
            }),
            SubjectAuth::Jwt {
                jwt,
                key_pair: Some(key_pair),
            } => ConnectOptions::with_jwt(jwt, move |nonce: Vec<u8>| {
                let key_pair = key_pair.clone();
                async move { Ok::<Vec<u8>, async_nats::AuthError>(key_pair.sign(&nonce)) }
            }),
            SubjectAuth::Jwt {
                jwt,
                key_pair: None,
            } => ConnectOptions::with_token(jwt),
        }
    }
}

fn to_nats_deliver(policy: DeliverPolicy) -> jetstream::consumer::DeliverPolicy {
    match policy {
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
    }
}

fn to_nats_ack(policy: AckPolicy) -> jetstream::consumer::AckPolicy {
    match policy {
        AckPolicy::None => jetstream::consumer::AckPolicy::None,
        AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
    }
}

fn to_subject_msg(msg: async_nats::Message) -> SubjectMsg {
    let mut headers = HashMap::new();
    if let Some(value) = msg.headers.as_ref().and_then(|h| h.get(ERROR_HEADER)) {
        headers.insert(ERROR_HEADER.to_string(), value.as_str().to_string());
    }
    SubjectMsg {
        subject: msg.subject.to_string(),
        reply: msg.reply.map(|r| r.to_string()),
        headers,
        payload: msg.payload.to_vec(),
    }
}

fn network_error(e: impl std::fmt::Display) -> HubError {
    HubError::TransientNetwork(e.to_string())
}

struct NatsLink {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    events: mpsc::UnboundedSender<SubjectEvent>,
    next_sid: AtomicU64,
    subs: Mutex<HashMap<u64, CancellationToken>>,
    closed: CancellationToken,
}

impl NatsLink {
    fn subs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SubjectLink for NatsLink {
    async fn publish(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), HubError> {
        let mut nats_headers = HeaderMap::new();
        for (k, v) in &headers {
            nats_headers.insert(k.as_str(), v.as_str());
        }
        self.client
            .publish_with_headers(subject.to_string(), nats_headers, payload.into())
            .await
            .map_err(network_error)
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<SubjectMsg, HubError> {
        let reply = tokio::time::timeout(timeout, self.client.request(subject.to_string(), payload.into()))
            .await
            .map_err(|_| HubError::Timeout)?
            .map_err(|e| match e.kind() {
                async_nats::client::RequestErrorKind::TimedOut => HubError::Timeout,
                async_nats::client::RequestErrorKind::NoResponders => {
                    HubError::TransientNetwork("no responders available for request".to_string())
                }
                _ => network_error(e),
            })?;
        Ok(to_subject_msg(reply))
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<u64, HubError> {
        let mut subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(network_error)?;

        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.closed.child_token();
        self.subs().insert(sid, token.clone());

        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    m = subscriber.next() => match m {
                        Some(m) => m,
                        None => break,
                    },
                };
                if events.send(SubjectEvent::Message(to_subject_msg(msg))).is_err() {
                    break;
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                tracing::debug!("NATS unsubscribe failed: {}", e);
            }
        });
        Ok(sid)
    }

    async fn unsubscribe(&self, sid: u64) -> Result<(), HubError> {
        if let Some(token) = self.subs().remove(&sid) {
            token.cancel();
        }
        Ok(())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<Box<dyn PullConsumer>, HubError> {
        let js_stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(network_error)?;
        let consumer: JsConsumer = js_stream
            .create_consumer(jetstream::consumer::pull::Config {
                description: Some(config.description),
                deliver_policy: to_nats_deliver(config.deliver_policy),
                ack_policy: to_nats_ack(config.ack_policy),
                ..Default::default()
            })
            .await
            .map_err(network_error)?;
        Ok(Box::new(NatsPullConsumer {
            consumer,
            valid: AtomicBool::new(true),
        }))
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.client.drain().await {
            tracing::debug!("NATS drain failed: {}", e);
        }
    }
}

struct NatsPullConsumer {
    consumer: JsConsumer,
    valid: AtomicBool,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<StreamMessage>, HubError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| self.fetch_failed(e))?;

        let mut out = Vec::new();
        while let Some(next) = messages.next().await {
            let m = next.map_err(|e| self.fetch_failed(e))?;
            let (sequence, timestamp_msec) = match m.info() {
                Ok(info) => (
                    info.stream_sequence,
                    (info.published.unix_timestamp_nanos() / 1_000_000) as i64,
                ),
                Err(_) => (0, 0),
            };
            out.push(StreamMessage {
                subject: m.message.subject.to_string(),
                payload: m.message.payload.to_vec(),
                sequence,
                timestamp_msec,
            });
        }
        if out.is_empty() {
            return Err(HubError::Timeout);
        }
        Ok(out)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

impl NatsPullConsumer {
    /// 服务端报告消费者或流已不存在时标记失效
    fn fetch_failed(&self, e: impl std::fmt::Display) -> HubError {
        let text = e.to_string();
        let lower = text.to_lowercase();
        if lower.contains("consumer not found") || lower.contains("stream not found") {
            self.valid.store(false, Ordering::SeqCst);
        }
        HubError::TransientNetwork(text)
    }
}

#[async_trait]
impl SubjectConnector for NatsConnector {
    async fn connect(
        &self,
        options: SubjectConnectOptions,
    ) -> Result<(Arc<dyn SubjectLink>, mpsc::UnboundedReceiver<SubjectEvent>), HubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = tx.clone();
        let mut nats_options = self
            .base_options(&options.auth)
            .name(&options.name)
            .custom_inbox_prefix(&options.inbox_prefix)
            .connection_timeout(options.timeout)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    let translated = match event {
                        async_nats::Event::Disconnected => Some(SubjectEvent::Down {
                            reason: "disconnected".to_string(),
                        }),
                        async_nats::Event::Connected => Some(SubjectEvent::Reconnected),
                        other => {
                            tracing::debug!("NATS event: {}", other);
                            None
                        }
                    };
                    if let Some(ev) = translated {
                        let _ = events.send(ev);
                    }
                }
            });
        if self.full_url.starts_with("tls://") {
            nats_options = nats_options.require_tls(true);
        }
        if let Some(path) = &self.ca_cert_file {
            nats_options = nats_options.add_root_certificates(path.clone());
        }

        let client = match nats_options.connect(self.full_url.as_str()).await {
            Ok(client) => client,
            Err(e) => {
                let auth_failed = matches!(
                    e.kind(),
                    ConnectErrorKind::AuthorizationViolation | ConnectErrorKind::Authentication
                );
                return Err(if auth_failed {
                    HubError::unauthorized(e.to_string())
                } else {
                    network_error(e)
                });
            }
        };
        tracing::info!(
            auth = options.auth.kind(),
            server = %self.full_url,
            "NATS connection established"
        );

        let link: Arc<dyn SubjectLink> = Arc::new(NatsLink {
            jetstream: jetstream::new(client.clone()),
            client,
            events: tx,
            next_sid: AtomicU64::new(0),
            subs: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });
        Ok((link, rx))
    }
}
