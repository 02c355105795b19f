//! HTTPS + SSE 传输
//!
//! 两条通道：
//! - 发出：HTTPS POST 到 `/event/{thingID}/{key}` 与 `/action/{thingID}/{key}`，
//!   action 的应答即响应体
//! - 接收：一条长连接 SSE，每个 `data:` 帧是一条 JSON 编码的 ThingMessage
//!
//! 服务端决定该客户端能看到哪些消息，因此订阅与取消订阅都是空操作。
//!
//! SSE 流结束或出错后回到 connecting 并按指数退避重连；令牌被拒（401/403）
//! 时进入 expired 终止态，不再重试。

pub mod sse;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{AuthFailure, HubError};
use crate::things::{ConnectionStatus, MsgType, ThingMessage, TransportStatus};
use crate::transport::supervisor::{deliver_all, StatusNotice};
use crate::transport::{
    dispatch_event, AddressCodec, ConnectHandler, ConnectionSupervisor, EventHandler,
    HubTransport, KeyPair, RequestHandler, TransportOptions,
};

pub use sse::{SseDecoder, SseEvent};

pub const LOGIN_PATH: &str = "/authn/login";
pub const REFRESH_PATH: &str = "/authn/refresh";
pub const POST_EVENT_PATH: &str = "/event/{thingID}/{key}";
pub const POST_ACTION_PATH: &str = "/action/{thingID}/{key}";

/// 重连退避上限
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "clientID")]
    client_id: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// 第 `failures` 次连续失败后的等待时间
fn retry_backoff(base: Duration, failures: u32) -> Duration {
    base.saturating_mul(1u32 << failures.min(5)).min(MAX_RETRY_BACKOFF)
}

/// 认证失败对应的终止态
fn auth_status(err: &HubError) -> ConnectionStatus {
    match err {
        HubError::AuthFailed {
            kind: AuthFailure::Expired,
            ..
        } => ConnectionStatus::Expired,
        _ => ConnectionStatus::Unauthorized,
    }
}

/// 代入路径模板中的 `{thingID}` 与 `{key}`
pub fn substitute_path(template: &str, thing_id: &str, key: &str) -> String {
    template.replace("{thingID}", thing_id).replace("{key}", key)
}

struct State {
    supervisor: ConnectionSupervisor,
    token: Option<String>,
    sse_cancel: Option<CancellationToken>,
    event_handler: Option<EventHandler>,
}

struct Inner {
    codec: AddressCodec,
    options: TransportOptions,
    client: reqwest::Client,
    state: RwLock<State>,
}

pub struct HttpSseTransport {
    inner: Arc<Inner>,
}

impl HttpSseTransport {
    /// 构造 HTTP 客户端；有 CA 证书时只信任该证书，否则不校验服务端证书
    pub fn new(options: TransportOptions) -> Result<Self, HubError> {
        let mut builder = reqwest::Client::builder().connect_timeout(options.timeout);
        builder = match &options.ca_cert {
            Some(pem) => {
                let cert = reqwest::Certificate::from_pem(pem.as_bytes())?;
                builder
                    .add_root_certificate(cert)
                    .tls_built_in_root_certs(false)
            }
            None => {
                tracing::warn!("No CA certificate provided, server certificate is not verified");
                builder.danger_accept_invalid_certs(true)
            }
        };
        let client = builder.build()?;

        let status = TransportStatus {
            supports_password_auth: true,
            supports_token_auth: true,
            ..options.initial_status("https")
        };
        Ok(Self {
            inner: Arc::new(Inner {
                codec: AddressCodec::topic_tree(),
                options,
                client,
                state: RwLock::new(State {
                    supervisor: ConnectionSupervisor::new(status),
                    token: None,
                    sse_cancel: None,
                    event_handler: None,
                }),
            }),
        })
    }

    /// 当前持有的 bearer 令牌
    pub fn token(&self) -> Option<String> {
        self.inner.read().token.clone()
    }

    fn begin_connect(&self) -> Result<Option<StatusNotice>, HubError> {
        let mut st = self.inner.write();
        if st.sse_cancel.is_some() {
            return Err(HubError::AlreadyConnected);
        }
        st.supervisor.begin_connect()
    }

    fn fail(&self, err: &HubError) {
        let next = if err.is_terminal() {
            auth_status(err)
        } else {
            ConnectionStatus::ConnectFailed
        };
        let notice = self
            .inner
            .write()
            .supervisor
            .transition(next, Some(err.to_string()));
        deliver_all([notice]);
    }

    async fn login(&self, password: &str) -> Result<String, HubError> {
        let inner = &self.inner;
        let resp = inner
            .client
            .post(inner.url(LOGIN_PATH))
            .timeout(inner.options.timeout)
            .json(&LoginRequest {
                client_id: &inner.options.client_id,
                password,
            })
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body: TokenResponse = resp.json().await?;
        Ok(body.token)
    }

    /// 用当前令牌换取新令牌；令牌被拒时进入 expired 并停止 SSE
    pub async fn refresh_token(&self) -> Result<String, HubError> {
        let inner = &self.inner;
        let token = inner.read().token.clone().ok_or(HubError::NoConnection)?;
        let resp = inner
            .client
            .post(inner.url(REFRESH_PATH))
            .timeout(inner.options.timeout)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "clientID": inner.options.client_id, "oldToken": token }))
            .send()
            .await?;
        let resp = match check_status(resp).await {
            Ok(resp) => resp,
            Err(e) if e.is_terminal() => {
                let err = HubError::expired(format!("token refresh rejected: {}", e));
                inner.expire(None, &err);
                return Err(err);
            }
            Err(e) => return Err(e),
        };
        let body: TokenResponse = resp.json().await?;
        inner.write().token = Some(body.token.clone());
        tracing::info!(client_id = %inner.options.client_id, "Token refreshed");
        Ok(body.token)
    }

    /// 打开 SSE 长连接；响应头到达即视为已连接
    async fn connect_sse(&self) -> Result<(), HubError> {
        let inner = &self.inner;
        let resp = match inner.open_sse().await {
            Ok(resp) => resp,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let notice = {
            let mut st = inner.write();
            st.sse_cancel = Some(cancel.clone());
            st.supervisor.transition(ConnectionStatus::Connected, None)
        };
        tracing::info!(client_id = %inner.options.client_id, "SSE connection established");
        deliver_all([notice]);
        tokio::spawn(run_sse_loop(Arc::downgrade(inner), resp, cancel));
        Ok(())
    }

    async fn post(&self, template: &str, address: &str, payload: &[u8]) -> Result<Vec<u8>, HubError> {
        let inner = &self.inner;
        let token = inner.read().token.clone().ok_or(HubError::NoConnection)?;
        let addr = inner.codec.decode(address)?;
        let path = substitute_path(template, &addr.thing_id, &addr.name);

        let resp = inner
            .client
            .post(inner.url(&path))
            .timeout(inner.options.timeout)
            .bearer_auth(token)
            .body(payload.to_vec())
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// 非 2xx 响应转换为错误；401/403 视为认证失败
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, HubError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HubError::unauthorized(format!(
            "{}: {}",
            status, body
        ))),
        _ => Err(HubError::Http(format!("{}: {}", status, body))),
    }
}

/// 单条 SSE 流的结束方式
enum StreamEnd {
    Cancelled,
    Closed,
    Failed(String),
}

/// 读取一条 SSE 流直到结束
async fn read_sse(inner: &Weak<Inner>, resp: reqwest::Response, cancel: &CancellationToken) -> StreamEnd {
    let mut decoder = SseDecoder::new();
    let mut stream = resp.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let Some(inner) = inner.upgrade() else {
                    return StreamEnd::Cancelled;
                };
                for ev in decoder.feed(&chunk) {
                    inner.on_sse_event(ev);
                }
            }
            Some(Err(e)) => return StreamEnd::Failed(e.to_string()),
            None => return StreamEnd::Closed,
        }
    }
}

/// SSE 读取循环：流结束或出错 → connecting 并退避重连，重新打开后 → connected；
/// 令牌被拒 → expired 并退出；用户断开取消整个循环
async fn run_sse_loop(inner: Weak<Inner>, first: reqwest::Response, cancel: CancellationToken) {
    let mut resp = Some(first);
    let mut failures: u32 = 0;

    loop {
        if let Some(current) = resp.take() {
            let reason = match read_sse(&inner, current, &cancel).await {
                StreamEnd::Cancelled => return,
                StreamEnd::Closed => "sse connection closed".to_string(),
                StreamEnd::Failed(e) => format!("sse connection failed: {}", e),
            };
            tracing::warn!("{}, reconnecting", reason);
            let Some(strong) = inner.upgrade() else {
                return;
            };
            if !strong.transition_live(&cancel, ConnectionStatus::Connecting, Some(reason)) {
                return;
            }
        }

        let Some(base) = inner.upgrade().map(|i| i.options.retry_interval) else {
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_backoff(base, failures)) => {}
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        match strong.open_sse().await {
            Ok(r) => {
                if !strong.transition_live(&cancel, ConnectionStatus::Connected, None) {
                    return;
                }
                tracing::info!(client_id = %strong.options.client_id, "SSE connection re-established");
                failures = 0;
                resp = Some(r);
            }
            Err(e) if e.is_terminal() => {
                tracing::warn!(client_id = %strong.options.client_id, "SSE token rejected: {}", e);
                strong.expire(Some(&cancel), &HubError::expired(e.to_string()));
                return;
            }
            Err(e) => {
                tracing::debug!("SSE reconnect failed: {}", e);
                failures = failures.saturating_add(1);
                if !strong.transition_live(&cancel, ConnectionStatus::Connecting, Some(e.to_string())) {
                    return;
                }
            }
        }
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.options.full_url.trim_end_matches('/'), path)
    }

    /// 以当前令牌发起 SSE GET
    async fn open_sse(&self) -> Result<reqwest::Response, HubError> {
        let token = self.read().token.clone().ok_or(HubError::NoConnection)?;
        let resp = self
            .client
            .get(self.url(&self.options.sse_path))
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        check_status(resp).await
    }

    /// 读取循环未被取消时迁移状态；已取消返回 false
    fn transition_live(
        &self,
        cancel: &CancellationToken,
        next: ConnectionStatus,
        last_error: Option<String>,
    ) -> bool {
        let notice = {
            let mut st = self.write();
            if cancel.is_cancelled() {
                return false;
            }
            st.supervisor.transition(next, last_error)
        };
        deliver_all([notice]);
        true
    }

    /// 令牌失效：停止读取循环、丢弃令牌并进入 expired
    ///
    /// `owner` 为发起方的读取循环；它已被用户断开取消时不做任何事。
    fn expire(&self, owner: Option<&CancellationToken>, err: &HubError) {
        let notice = {
            let mut st = self.write();
            if owner.is_some_and(|c| c.is_cancelled()) {
                return;
            }
            if let Some(cancel) = st.sse_cancel.take() {
                cancel.cancel();
            }
            st.token = None;
            st.supervisor
                .transition(ConnectionStatus::Expired, Some(err.to_string()))
        };
        deliver_all([notice]);
    }

    fn on_sse_event(&self, ev: SseEvent) {
        match serde_json::from_str::<ThingMessage>(&ev.data) {
            Ok(msg) => dispatch_event(self.read().event_handler.clone(), msg),
            Err(e) => tracing::warn!(
                event = ?ev.event,
                "Received non-ThingMessage sse event. Ignored: {}",
                e
            ),
        }
    }
}

#[async_trait]
impl HubTransport for HttpSseTransport {
    fn codec(&self) -> AddressCodec {
        self.inner.codec
    }

    async fn connect_with_password(&self, password: &str) -> Result<(), HubError> {
        deliver_all([self.begin_connect()?]);
        match self.login(password).await {
            Ok(token) => self.inner.write().token = Some(token),
            Err(e) => {
                tracing::warn!(client_id = %self.inner.options.client_id, "Login failed: {}", e);
                self.fail(&e);
                return Err(e);
            }
        }
        self.connect_sse().await
    }

    async fn connect_with_token(
        &self,
        _key_pair: Option<Arc<dyn KeyPair>>,
        token: &str,
    ) -> Result<(), HubError> {
        deliver_all([self.begin_connect()?]);
        self.inner.write().token = Some(token.to_string());
        self.connect_sse().await
    }

    async fn disconnect(&self) {
        let notice = {
            let mut st = self.inner.write();
            if let Some(cancel) = st.sse_cancel.take() {
                cancel.cancel();
            }
            st.token = None;
            st.supervisor.transition(
                ConnectionStatus::Disconnected,
                Some("disconnected by user".to_string()),
            )
        };
        deliver_all([notice]);
    }

    fn shutdown(&self) {
        let mut st = self.inner.write();
        st.event_handler = None;
        st.supervisor.set_connect_handler(None);
    }

    fn status(&self) -> TransportStatus {
        self.inner.read().supervisor.status()
    }

    async fn pub_event(&self, address: &str, payload: &[u8]) -> Result<(), HubError> {
        self.post(POST_EVENT_PATH, address, payload).await.map(|_| ())
    }

    async fn pub_request(&self, address: &str, payload: &[u8]) -> Result<Vec<u8>, HubError> {
        let addr = self.inner.codec.decode(address)?;
        if addr.msg_type == MsgType::Event {
            return Err(HubError::MalformedAddress(format!(
                "'{}' is not a request address",
                address
            )));
        }
        self.post(POST_ACTION_PATH, address, payload).await
    }

    async fn subscribe(&self, address: &str) -> Result<(), HubError> {
        tracing::debug!(address, "Subscribe ignored, the hub decides what this client receives");
        Ok(())
    }

    async fn unsubscribe(&self, _address: &str) -> Result<(), HubError> {
        Ok(())
    }

    fn set_connect_handler(&self, handler: Option<ConnectHandler>) {
        self.inner.write().supervisor.set_connect_handler(handler);
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        self.inner.write().event_handler = handler;
    }

    /// 该传输不会收到请求
    fn set_request_handler(&self, handler: Option<RequestHandler>) {
        if handler.is_some() {
            tracing::debug!("Request handler ignored, requests are not delivered over SSE");
        }
    }
}
