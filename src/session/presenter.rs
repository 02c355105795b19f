//! 连接状态展示
//!
//! 只读取传输公开的 [`TransportStatus`]，产出图标、文字与状态变化通知。

use serde::Serialize;

use crate::things::{ConnectionStatus, TransportStatus};

/// 状态栏上的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub icon: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Warning,
}

/// 推送给操作员的一条通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

/// 附加说明：有错误时为错误文本，否则为 Hub 地址
fn detail(status: &TransportStatus) -> &str {
    match status.info() {
        "" => &status.hub_url,
        info => info,
    }
}

pub fn present(status: &TransportStatus) -> StatusView {
    let info = detail(status);
    let (icon, text) = match status.connection_status {
        ConnectionStatus::Connected => ("link", format!("Connected ({})", info)),
        ConnectionStatus::ConnectFailed => ("link_off", format!("Failed to connect: {}", info)),
        ConnectionStatus::Connecting => ("leak_add", format!("Connecting... {}", info)),
        _ => ("unknown", format!("unknown ({})", info)),
    };
    StatusView {
        icon: icon.to_string(),
        text,
    }
}

/// 状态变化时给操作员的通知
pub fn notification_for(status: &TransportStatus) -> Notification {
    let (level, message) = match status.connection_status {
        ConnectionStatus::Connected => (
            NotificationLevel::Success,
            "Connection established with the Hub".to_string(),
        ),
        ConnectionStatus::Connecting => (
            NotificationLevel::Warning,
            "Reconnecting to the Hub... stand by".to_string(),
        ),
        ConnectionStatus::Unauthorized | ConnectionStatus::Expired => (
            NotificationLevel::Warning,
            "Connection with Hub refused".to_string(),
        ),
        ConnectionStatus::Disconnected => {
            (NotificationLevel::Warning, "Disconnected".to_string())
        }
        ConnectionStatus::ConnectFailed => (
            NotificationLevel::Warning,
            format!("Connection failed: {}", status.info()),
        ),
    };
    Notification { level, message }
}
