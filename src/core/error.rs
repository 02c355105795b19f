//! Hub 客户端错误类型
//!
//! 发布类 API 直接返回 HubError；接收路径上的格式错误只记录日志并丢弃。
//! `AuthFailed` 为终止态错误：连接监管据此停止重连。

use std::fmt;

use thiserror::Error;

/// 认证失败的子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// 凭据被拒绝
    Unauthorized,
    /// 令牌过期
    Expired,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Unauthorized => write!(f, "unauthorized"),
            AuthFailure::Expired => write!(f, "expired"),
        }
    }
}

/// 传输、关联、缓存过程中可能出现的错误
///
/// 需要 `Clone`：断线时同一个错误会广播给所有等待中的请求。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("no connection with the hub")]
    NoConnection,

    #[error("already connected")]
    AlreadyConnected,

    #[error("Authentication failed ({kind}): {reason}")]
    AuthFailed { kind: AuthFailure, reason: String },

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unable to decode stored values of '{thing_addr}': {reason}")]
    StoreDecode { thing_addr: String, reason: String },

    /// 远端请求处理器返回的错误，原样展示其文本
    #[error("{0}")]
    Handler(String),

    #[error("Cannot handle request. No handler is set")]
    NoHandler,

    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}

impl HubError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        HubError::AuthFailed {
            kind: AuthFailure::Unauthorized,
            reason: reason.into(),
        }
    }

    pub fn expired(reason: impl Into<String>) -> Self {
        HubError::AuthFailed {
            kind: AuthFailure::Expired,
            reason: reason.into(),
        }
    }

    /// 是否为终止态错误（不再重连）
    pub fn is_terminal(&self) -> bool {
        matches!(self, HubError::AuthFailed { .. })
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialize(e.to_string())
    }
}

impl From<rusqlite::Error> for HubError {
    fn from(e: rusqlite::Error) -> Self {
        HubError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HubError::Timeout
        } else if e.is_connect() {
            HubError::TransientNetwork(e.to_string())
        } else {
            HubError::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for HubError {
    fn from(e: config::ConfigError) -> Self {
        HubError::Config(e.to_string())
    }
}
