//! Thing 消息模型与连接状态

pub mod message;
pub mod payload;
pub mod status;

pub use message::{now_msec, thing_addr, MsgType, ThingMessage, ThingValue, PROPERTIES_BUNDLE};
pub use payload::Payload;
pub use status::{ConnectionStatus, TransportStatus};
