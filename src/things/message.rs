//! ThingMessage：所有传输共用的消息信封
//!
//! JSON 字段名与 Hub 保持一致（`msgType`、`agentID`、`thingID` ...），
//! SSE 推送与值缓存的持久化格式都使用这一结构。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::HubError;
use super::payload::Payload;

/// 批量属性事件的名称，`data` 为 name → value 的 JSON 对象
pub const PROPERTIES_BUNDLE: &str = "$properties";

/// 消息类型（地址的第一段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MsgType {
    #[default]
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "action")]
    Action,
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "rpc")]
    Rpc,
    /// 请求应答收件箱
    #[serde(rename = "_INBOX")]
    Inbox,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Event => "event",
            MsgType::Action => "action",
            MsgType::Config => "config",
            MsgType::Rpc => "rpc",
            MsgType::Inbox => "_INBOX",
        }
    }

    /// action / config / rpc 需要应答
    pub fn is_request(&self) -> bool {
        matches!(self, MsgType::Action | MsgType::Config | MsgType::Rpc)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(MsgType::Event),
            "action" => Ok(MsgType::Action),
            "config" => Ok(MsgType::Config),
            "rpc" => Ok(MsgType::Rpc),
            "_INBOX" => Ok(MsgType::Inbox),
            other => Err(HubError::MalformedAddress(format!(
                "unknown message type '{}'",
                other
            ))),
        }
    }
}

/// 通用消息信封；作为缓存值时即 ThingValue
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThingMessage {
    #[serde(rename = "msgType", default)]
    pub msg_type: MsgType,
    /// 发布者身份；consumer 对数字孪生发起的 action 可为空
    #[serde(rename = "agentID", default)]
    pub agent_id: String,
    #[serde(rename = "thingID", default)]
    pub thing_id: String,
    /// 事件 / 动作 / 属性名
    #[serde(default)]
    pub name: String,
    /// 发送方的 client ID
    #[serde(rename = "senderID", default)]
    pub sender_id: String,
    /// 生产者时间戳（Unix 毫秒），≤0 时由接收方补上当前时间
    #[serde(rename = "createdMSec", default)]
    pub created_msec: i64,
    /// 不透明负载，通常是序列化后的对象
    #[serde(default)]
    pub data: Payload,
}

/// 缓存中的值与消息共用同一结构
pub type ThingValue = ThingMessage;

impl ThingMessage {
    /// 构造一条事件消息
    pub fn event(
        agent_id: impl Into<String>,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        data: impl Into<Payload>,
        created_msec: i64,
    ) -> Self {
        Self {
            msg_type: MsgType::Event,
            agent_id: agent_id.into(),
            thing_id: thing_id.into(),
            name: name.into(),
            sender_id: String::new(),
            created_msec,
            data: data.into(),
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// 值缓存使用的 Thing 地址：`agentID/thingID`
    pub fn thing_addr(&self) -> String {
        thing_addr(&self.agent_id, &self.thing_id)
    }

    /// 负载的原始字节
    pub fn payload(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// 负载的文本形式；非 UTF-8 时为 None
    pub fn text(&self) -> Option<&str> {
        self.data.as_str()
    }
}

pub fn thing_addr(agent_id: &str, thing_id: &str) -> String {
    format!("{}/{}", agent_id, thing_id)
}

/// 当前 Unix 毫秒时间
pub fn now_msec() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
