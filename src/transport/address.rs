//! 地址编解码
//!
//! 地址语法：`msgType ⟨sep⟩ agentID ⟨sep⟩ thingID ⟨sep⟩ name ⟨sep⟩ clientID`。
//! 每种传输提供自己的分隔符与两个通配符，如 `("/", "+", "#")` 或 `(".", "*", ">")`。
//! 收件箱地址使用短格式 `_INBOX ⟨sep⟩ clientID`。

use crate::core::HubError;
use crate::things::MsgType;

/// 解码后的五元组
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub msg_type: MsgType,
    pub agent_id: String,
    pub thing_id: String,
    pub name: String,
    /// 第五段：发送方 client ID
    pub sender_id: String,
}

/// 某一传输的分隔符与通配符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressCodec {
    sep: char,
    single_wildcard: &'static str,
    multi_wildcard: &'static str,
}

impl AddressCodec {
    pub const fn new(sep: char, single_wildcard: &'static str, multi_wildcard: &'static str) -> Self {
        Self {
            sep,
            single_wildcard,
            multi_wildcard,
        }
    }

    /// 主题树：`/`、`+`、`#`
    pub const fn topic_tree() -> Self {
        Self::new('/', "+", "#")
    }

    /// 主题（subject）树：`.`、`*`、`>`
    pub const fn subject_tree() -> Self {
        Self::new('.', "*", ">")
    }

    pub fn separator(&self) -> char {
        self.sep
    }

    pub fn single_wildcard(&self) -> &'static str {
        self.single_wildcard
    }

    pub fn multi_wildcard(&self) -> &'static str {
        self.multi_wildcard
    }

    /// 编码地址；空字段替换为默认值或通配符
    pub fn encode(
        &self,
        msg_type: Option<MsgType>,
        agent_id: &str,
        thing_id: &str,
        name: &str,
        client_id: &str,
    ) -> String {
        let or_single = |s: &str| -> String {
            if s.is_empty() {
                self.single_wildcard.to_string()
            } else {
                s.to_string()
            }
        };
        let client = if client_id.is_empty() {
            self.multi_wildcard
        } else {
            client_id
        };
        let parts = [
            msg_type.unwrap_or_default().as_str().to_string(),
            or_single(agent_id),
            or_single(thing_id),
            or_single(name),
            client.to_string(),
        ];
        parts.join(&self.sep.to_string())
    }

    /// 收件箱地址 `_INBOX ⟨sep⟩ id`
    pub fn inbox(&self, id: &str) -> String {
        format!("{}{}{}", MsgType::Inbox.as_str(), self.sep, id)
    }

    /// 解码地址；多于五段时忽略多余部分
    pub fn decode(&self, address: &str) -> Result<Address, HubError> {
        let parts: Vec<&str> = address.split(self.sep).collect();

        if parts[0] == MsgType::Inbox.as_str() {
            return match parts.get(1) {
                Some(client) if !client.is_empty() => Ok(Address {
                    msg_type: MsgType::Inbox,
                    agent_id: client.to_string(),
                    ..Default::default()
                }),
                _ => Err(HubError::MalformedAddress(address.to_string())),
            };
        }
        if parts.len() < 4 {
            return Err(HubError::MalformedAddress(address.to_string()));
        }

        Ok(Address {
            msg_type: parts[0].parse()?,
            agent_id: parts[1].to_string(),
            thing_id: parts[2].to_string(),
            name: parts[3].to_string(),
            sender_id: parts.get(4).map(|s| s.to_string()).unwrap_or_default(),
        })
    }

    /// 订阅模式是否匹配具体地址（供内存 broker 路由使用）
    pub fn matches(&self, pattern: &str, address: &str) -> bool {
        let mut pat = pattern.split(self.sep);
        let mut addr = address.split(self.sep);
        loop {
            match (pat.next(), addr.next()) {
                (Some(p), _) if p == self.multi_wildcard => return true,
                (Some(p), Some(a)) => {
                    if p != self.single_wildcard && p != a {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let codecs = [AddressCodec::topic_tree(), AddressCodec::subject_tree()];
        let types = [MsgType::Event, MsgType::Action, MsgType::Config, MsgType::Rpc];
        for codec in codecs {
            for t in types {
                let addr = codec.encode(Some(t), "agent1", "thing-1", "dim", "c_2");
                let decoded = codec.decode(&addr).unwrap();
                assert_eq!(decoded.msg_type, t);
                assert_eq!(decoded.agent_id, "agent1");
                assert_eq!(decoded.thing_id, "thing-1");
                assert_eq!(decoded.name, "dim");
                assert_eq!(decoded.sender_id, "c_2");
            }
        }
    }

    #[test]
    fn test_empty_fields_become_wildcards() {
        assert_eq!(
            AddressCodec::topic_tree().encode(None, "", "", "", ""),
            "event/+/+/+/#"
        );
        assert_eq!(
            AddressCodec::subject_tree().encode(None, "", "", "", ""),
            "event.*.*.*.>"
        );
    }

    #[test]
    fn test_inbox_short_form() {
        let codec = AddressCodec::topic_tree();
        let addr = codec.decode("_INBOX/c-42").unwrap();
        assert_eq!(
            addr,
            Address {
                msg_type: MsgType::Inbox,
                agent_id: "c-42".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(codec.inbox("c-42"), "_INBOX/c-42");
    }

    #[test]
    fn test_malformed() {
        let codec = AddressCodec::topic_tree();
        assert!(matches!(codec.decode("event/a/t"), Err(HubError::MalformedAddress(_))));
        assert!(matches!(codec.decode("_INBOX"), Err(HubError::MalformedAddress(_))));
        assert!(matches!(codec.decode(""), Err(HubError::MalformedAddress(_))));
    }

    #[test]
    fn test_four_parts_without_sender() {
        let addr = AddressCodec::topic_tree().decode("event/a/t/temp").unwrap();
        assert_eq!(addr.name, "temp");
        assert_eq!(addr.sender_id, "");
    }

    #[test]
    fn test_extra_segments_ignored() {
        let addr = AddressCodec::subject_tree().decode("event.a.t.temp.c1.x.y").unwrap();
        assert_eq!(addr.sender_id, "c1");
    }

    #[test]
    fn test_matches() {
        let codec = AddressCodec::topic_tree();
        assert!(codec.matches("event/a/t/+", "event/a/t/temp"));
        assert!(!codec.matches("event/a/t/+", "event/a/t/temp/c1"));
        assert!(codec.matches("action/agent1/thing1/+/#", "action/agent1/thing1/dim/C2"));
        assert!(codec.matches("_INBOX/c1", "_INBOX/c1"));
        assert!(!codec.matches("event/b/#", "event/a/t/temp"));

        let subj = AddressCodec::subject_tree();
        assert!(subj.matches("event.*.*.>", "event.a.t.temp.c1"));
    }
}
