//! Hub 客户端门面
//!
//! 在任意 [`HubTransport`] 之上以 Thing 的语义收发消息：
//! 发布事件、发起 action / config / rpc 请求、订阅事件，
//! 并把收到的请求按类型分派给对应的处理器。
//!
//! 传输只持有指向客户端共享状态的回调，客户端对传输的反向引用是弱引用，
//! 不会形成引用环。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::HubError;
use crate::things::{ConnectionStatus, MsgType, ThingMessage, TransportStatus};
use crate::transport::{
    Address, ConnectHandler, EventHandler, HubTransport, KeyPair, RequestHandler, RequestReply,
};

/// action / rpc 请求处理器，返回应答负载
pub type ActionHandler =
    Arc<dyn Fn(ThingMessage) -> BoxFuture<'static, Result<Vec<u8>, HubError>> + Send + Sync>;

/// config 请求处理器，只确认不返回数据
pub type ConfigHandler =
    Arc<dyn Fn(ThingMessage) -> BoxFuture<'static, Result<(), HubError>> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    action: Option<ActionHandler>,
    config: Option<ConfigHandler>,
    rpc: Option<ActionHandler>,
    event: Option<EventHandler>,
    connection: Option<ConnectHandler>,
}

struct Shared {
    client_id: String,
    retry_connect: AtomicBool,
    last_status: RwLock<ConnectionStatus>,
    handlers: RwLock<Handlers>,
}

impl Shared {
    fn handlers(&self) -> RwLockReadGuard<'_, Handlers> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn handlers_mut(&self) -> RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 状态变化：不重试时在连接断开或失败后主动断开，然后转发给用户
    fn on_connect(&self, transport: &Weak<dyn HubTransport>, status: TransportStatus) {
        let next = status.connection_status;
        let previous = {
            let mut last = self.last_status.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *last, next)
        };
        let lost = (previous == ConnectionStatus::Connected && next == ConnectionStatus::Connecting)
            || next == ConnectionStatus::ConnectFailed;

        if lost && !self.retry_connect.load(Ordering::SeqCst) {
            tracing::warn!(client_id = %self.client_id, "Disconnecting and not retrying");
            if let Some(transport) = transport.upgrade() {
                tokio::spawn(async move { transport.disconnect().await });
            }
        } else {
            match next {
                ConnectionStatus::Connected => {
                    tracing::info!(client_id = %self.client_id, "Connection established")
                }
                ConnectionStatus::Connecting => {
                    tracing::warn!(client_id = %self.client_id, "Retrying to connect")
                }
                ConnectionStatus::Disconnected => {
                    tracing::warn!(client_id = %self.client_id, "Disconnected")
                }
                _ => {}
            }
        }

        let handler = self.handlers().connection.clone();
        if let Some(handler) = handler {
            handler(status);
        }
    }

    /// 按消息类型分派请求；发给其他 agent 的请求当作事件处理且不应答
    async fn route_request(&self, msg: ThingMessage) -> RequestReply {
        if msg.agent_id != self.client_id {
            let handler = self.handlers().event.clone();
            if let Some(handler) = handler {
                handler(msg);
            }
            return RequestReply::no_reply();
        }

        let (action, rpc, config) = {
            let h = self.handlers();
            (h.action.clone(), h.rpc.clone(), h.config.clone())
        };
        match (msg.msg_type, action, rpc, config) {
            (MsgType::Action, Some(handler), _, _) => {
                tracing::info!(sender = %msg.sender_id, thing_id = %msg.thing_id, action = %msg.name, "Received action request");
                into_reply(handler(msg).await)
            }
            (MsgType::Rpc, _, Some(handler), _) => {
                tracing::info!(sender = %msg.sender_id, capability = %msg.thing_id, method = %msg.name, "Received RPC request");
                into_reply(handler(msg).await)
            }
            (MsgType::Config, _, _, Some(handler)) => {
                tracing::info!(sender = %msg.sender_id, thing_id = %msg.thing_id, property = %msg.name, "Received config request");
                into_reply(handler(msg).await.map(|_| Vec::new()))
            }
            _ => {
                tracing::warn!(
                    sender = %msg.sender_id,
                    msg_type = %msg.msg_type,
                    "Received request without a matching handler"
                );
                RequestReply::error(HubError::NoHandler.to_string())
            }
        }
    }
}

fn into_reply(result: Result<Vec<u8>, HubError>) -> RequestReply {
    match result {
        Ok(reply) => RequestReply::ok(reply),
        Err(e) => RequestReply::error(e.to_string()),
    }
}

pub struct HubClient {
    transport: Arc<dyn HubTransport>,
    shared: Arc<Shared>,
}

impl HubClient {
    /// 包装传输并接管其连接状态回调
    pub fn new(transport: Arc<dyn HubTransport>) -> Self {
        let status = transport.status();
        let shared = Arc::new(Shared {
            client_id: status.client_id,
            retry_connect: AtomicBool::new(true),
            last_status: RwLock::new(status.connection_status),
            handlers: RwLock::new(Handlers::default()),
        });

        let weak_transport = Arc::downgrade(&transport);
        let s = shared.clone();
        let on_connect: ConnectHandler =
            Arc::new(move |status: TransportStatus| s.on_connect(&weak_transport, status));
        transport.set_connect_handler(Some(on_connect));

        Self { transport, shared }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn transport(&self) -> &Arc<dyn HubTransport> {
        &self.transport
    }

    pub fn status(&self) -> TransportStatus {
        self.transport.status()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status().connection_status
    }

    /// 生成地址；空字段使用通配符，`msg_type` 缺省为 event
    pub fn make_address(
        &self,
        msg_type: Option<MsgType>,
        agent_id: &str,
        thing_id: &str,
        name: &str,
        client_id: &str,
    ) -> String {
        self.transport
            .codec()
            .encode(msg_type, agent_id, thing_id, name, client_id)
    }

    pub fn split_address(&self, address: &str) -> Result<Address, HubError> {
        self.transport.codec().decode(address)
    }

    pub async fn connect_with_password(&self, password: &str) -> Result<(), HubError> {
        self.transport.connect_with_password(password).await
    }

    pub async fn connect_with_token(
        &self,
        key_pair: Option<Arc<dyn KeyPair>>,
        token: &str,
    ) -> Result<(), HubError> {
        self.transport.connect_with_token(key_pair, token).await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await
    }

    /// 清空传输与客户端上的所有回调
    pub fn shutdown(&self) {
        self.transport.shutdown();
        *self.shared.handlers_mut() = Handlers::default();
    }

    /// 以本客户端为 agent 发布事件
    pub async fn pub_event(&self, thing_id: &str, name: &str, payload: &[u8]) -> Result<(), HubError> {
        let me = &self.shared.client_id;
        let addr = self.make_address(Some(MsgType::Event), me, thing_id, name, me);
        tracing::debug!(addr = %addr, "PubEvent");
        self.transport.pub_event(&addr, payload).await
    }

    /// 请求 Thing 执行 action，返回应答
    pub async fn pub_action(
        &self,
        agent_id: &str,
        thing_id: &str,
        name: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HubError> {
        let addr = self.make_address(Some(MsgType::Action), agent_id, thing_id, name, &self.shared.client_id);
        tracing::info!(addr = %addr, "PubAction");
        self.transport.pub_request(&addr, payload).await
    }

    /// 请求修改 Thing 配置并等待确认
    pub async fn pub_config(
        &self,
        agent_id: &str,
        thing_id: &str,
        prop_name: &str,
        payload: &[u8],
    ) -> Result<(), HubError> {
        let addr = self.make_address(Some(MsgType::Config), agent_id, thing_id, prop_name, &self.shared.client_id);
        tracing::info!(addr = %addr, "PubConfig");
        self.transport.pub_request(&addr, payload).await.map(|_| ())
    }

    /// 调用服务的 RPC 方法；请求与应答均为 JSON
    pub async fn pub_rpc_request<Req, Resp>(
        &self,
        agent_id: &str,
        capability: &str,
        method: &str,
        req: &Req,
    ) -> Result<Resp, HubError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(req)?;
        let addr = self.make_address(Some(MsgType::Rpc), agent_id, capability, method, &self.shared.client_id);
        tracing::info!(addr = %addr, "PubRPCRequest");
        let data = self.transport.pub_request(&addr, &payload).await?;
        let data: &[u8] = if data.is_empty() { b"null" } else { &data };
        Ok(serde_json::from_slice(data)?)
    }

    /// 订阅事件；空字段表示任意
    pub async fn sub_events(&self, agent_id: &str, thing_id: &str, name: &str) -> Result<(), HubError> {
        let addr = self.make_address(Some(MsgType::Event), agent_id, thing_id, name, "");
        self.transport.subscribe(&addr).await
    }

    /// 处理发给本 agent 的 action 请求
    pub async fn set_action_handler(&self, handler: ActionHandler) -> Result<(), HubError> {
        self.shared.handlers_mut().action = Some(handler);
        self.subscribe_requests(MsgType::Action).await
    }

    /// 处理发给本 agent 的 config 请求
    pub async fn set_config_handler(&self, handler: ConfigHandler) -> Result<(), HubError> {
        self.shared.handlers_mut().config = Some(handler);
        self.subscribe_requests(MsgType::Config).await
    }

    /// 处理发给本 agent 的 RPC 请求
    pub async fn set_rpc_handler(&self, handler: ActionHandler) -> Result<(), HubError> {
        self.shared.handlers_mut().rpc = Some(handler);
        self.subscribe_requests(MsgType::Rpc).await
    }

    async fn subscribe_requests(&self, msg_type: MsgType) -> Result<(), HubError> {
        let shared = self.shared.clone();
        let router: RequestHandler = Arc::new(move |msg: ThingMessage| {
            let shared = shared.clone();
            Box::pin(async move { shared.route_request(msg).await })
        });
        self.transport.set_request_handler(Some(router));

        let addr = self.make_address(Some(msg_type), &self.shared.client_id, "", "", "");
        self.transport.subscribe(&addr).await
    }

    /// 接收已订阅的事件
    pub fn set_event_handler(&self, handler: Option<EventHandler>) {
        self.shared.handlers_mut().event = handler.clone();
        self.transport.set_event_handler(handler);
    }

    pub fn set_connection_handler(&self, handler: Option<ConnectHandler>) {
        self.shared.handlers_mut().connection = handler;
    }

    /// 关闭后，连接断开或失败时直接断开而不是由传输重试
    pub fn set_retry_connect(&self, enable: bool) {
        self.shared.retry_connect.store(enable, Ordering::SeqCst);
    }
}
