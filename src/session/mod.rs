//! 操作员会话：连接状态的展示层

pub mod presenter;

pub use presenter::{notification_for, present, Notification, NotificationLevel, StatusView};
