//! 连接监管
//!
//! 嵌入在每个传输的状态锁内：记录状态、判定是否真正发生变化，
//! 并生成待投递的 [`StatusNotice`]。通知必须在释放锁之后投递，
//! 这样回调里可以再次调用传输的方法而不会死锁。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::core::HubError;
use crate::things::{ConnectionStatus, TransportStatus};

/// 连接状态回调
pub type ConnectHandler = Arc<dyn Fn(TransportStatus) + Send + Sync>;

/// 一次待投递的状态变化
#[must_use = "status notices must be delivered after the state lock is released"]
pub struct StatusNotice {
    handler: Option<ConnectHandler>,
    status: TransportStatus,
}

impl StatusNotice {
    pub fn status(&self) -> &TransportStatus {
        &self.status
    }

    /// 调用用户回调；未设置时记录日志
    pub fn deliver(self) {
        match self.handler {
            Some(handler) => handler(self.status),
            None => tracing::info!(
                client_id = %self.status.client_id,
                status = %self.status.connection_status,
                last_error = %self.status.info(),
                "Connection status changed"
            ),
        }
    }
}

/// 投递一组可能为空的通知
pub fn deliver_all(notices: impl IntoIterator<Item = Option<StatusNotice>>) {
    for notice in notices.into_iter().flatten() {
        notice.deliver();
    }
}

pub struct ConnectionSupervisor {
    status: TransportStatus,
    connect_handler: Option<ConnectHandler>,
    settled_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionSupervisor {
    pub fn new(status: TransportStatus) -> Self {
        let (settled_tx, _) = watch::channel(status.connection_status);
        Self {
            status,
            connect_handler: None,
            settled_tx,
        }
    }

    pub fn status(&self) -> TransportStatus {
        self.status.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status.connection_status
    }

    pub fn is_connected(&self) -> bool {
        self.status.connection_status == ConnectionStatus::Connected
    }

    pub fn set_connect_handler(&mut self, handler: Option<ConnectHandler>) {
        self.connect_handler = handler;
    }

    /// 用户发起连接：已在连接中或已连接时返回 AlreadyConnected
    pub fn begin_connect(&mut self) -> Result<Option<StatusNotice>, HubError> {
        match self.status.connection_status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                Err(HubError::AlreadyConnected)
            }
            _ => {
                self.status.last_error = None;
                Ok(self.apply(ConnectionStatus::Connecting))
            }
        }
    }

    /// 链路事件驱动的状态迁移
    ///
    /// 终止态（unauthorized / expired）只能被用户断开改写。
    /// 只有连接状态真正变化时才返回通知，错误文本总是更新。
    pub fn transition(
        &mut self,
        next: ConnectionStatus,
        last_error: Option<String>,
    ) -> Option<StatusNotice> {
        let current = self.status.connection_status;
        if current.is_terminal() && next != ConnectionStatus::Disconnected {
            tracing::debug!(
                client_id = %self.status.client_id,
                "Ignoring transition {} -> {} after terminal state",
                current,
                next
            );
            return None;
        }
        self.status.last_error = last_error;
        self.apply(next)
    }

    fn apply(&mut self, next: ConnectionStatus) -> Option<StatusNotice> {
        if self.status.connection_status == next {
            return None;
        }
        self.status.connection_status = next;
        self.settled_tx.send_replace(next);
        Some(StatusNotice {
            handler: self.connect_handler.clone(),
            status: self.status.clone(),
        })
    }

    /// 订阅状态变化，用于连接调用等待首个稳定状态
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.settled_tx.subscribe()
    }
}

/// 等待状态离开 connecting；超时返回 None
pub async fn wait_settled(
    mut rx: watch::Receiver<ConnectionStatus>,
    timeout: Duration,
) -> Option<ConnectionStatus> {
    let settled = tokio::time::timeout(
        timeout,
        rx.wait_for(|s| *s != ConnectionStatus::Connecting),
    )
    .await;
    match settled {
        Ok(Ok(status)) => Some(*status),
        _ => None,
    }
}

/// 连接调用的结果：已连接为 Ok，其余映射为对应错误
pub fn settle_result(status: Option<ConnectionStatus>, snapshot: &TransportStatus) -> Result<(), HubError> {
    let reason = snapshot.info().to_string();
    match status {
        Some(ConnectionStatus::Connected) => Ok(()),
        Some(ConnectionStatus::Unauthorized) => Err(HubError::unauthorized(reason)),
        Some(ConnectionStatus::Expired) => Err(HubError::expired(reason)),
        Some(ConnectionStatus::Disconnected) => Err(HubError::NoConnection),
        Some(_) => Err(HubError::TransientNetwork(reason)),
        None if reason.is_empty() => Err(HubError::TransientNetwork(
            "no connection established within the timeout".to_string(),
        )),
        None => Err(HubError::TransientNetwork(reason)),
    }
}
