//! 连接状态

use std::fmt;

use serde::{Deserialize, Serialize};

/// 连接生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    ConnectFailed,
    #[default]
    Disconnected,
    Expired,
    Unauthorized,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::ConnectFailed => "connectFailed",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Unauthorized => "unauthorized",
        }
    }

    /// 认证失败类终止态，进入后不再重连
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Unauthorized | ConnectionStatus::Expired)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层对外公开的状态快照
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
    #[serde(rename = "hubURL")]
    pub hub_url: String,
    /// PEM 格式的 CA 证书
    pub ca_cert: Option<String>,
    /// 传输内核：mqtt / nats / https
    pub core: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    pub supports_cert_auth: bool,
    pub supports_password_auth: bool,
    pub supports_keys_auth: bool,
    pub supports_token_auth: bool,
}

impl TransportStatus {
    /// 展示用的错误信息（无错误时为空串）
    pub fn info(&self) -> &str {
        self.last_error.as_deref().unwrap_or("")
    }
}
