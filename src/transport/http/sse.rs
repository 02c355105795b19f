//! SSE 帧解析
//!
//! 按行增量解析；只有完整的行才会被解码，跨块的多字节字符不会被截断。

/// 一条完整的 SSE 事件
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送入一块字节，返回其中已完整的事件
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).to_string();
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(ev) = self.process_line(&line) {
                events.push(ev);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let ev = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.last_id.clone(),
        };
        self.data.clear();
        Some(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"event: msg\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("msg".into()),
                data: "{\"a\":1}".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_split_across_chunks_and_crlf() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: hel").is_empty());
        assert!(d.feed(b"lo\r\n").is_empty());
        let events = d.feed(b"\r\n");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut d = SseDecoder::new();
        let events = d.feed(b": keep-alive\n\ndata: a\ndata: b\nid: 7\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_multibyte_char_split() {
        let mut d = SseDecoder::new();
        let bytes = "data: 温度\n\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        assert!(d.feed(a).is_empty());
        assert_eq!(d.feed(b)[0].data, "温度");
    }
}
