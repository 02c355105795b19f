//! 请求关联表
//!
//! 在没有原生请求/应答的发布订阅传输上实现 RPC：请求携带关联 ID，
//! 应答到达收件箱后按 ID 找到等待中的槽位并唤醒调用方。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::HubError;

type Outcome<T> = Result<T, HubError>;

/// 单次请求的等待槽位
#[derive(Debug)]
pub struct CorrelationSlot<T> {
    id: String,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> CorrelationSlot<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct Inner<T> {
    pending: HashMap<String, oneshot::Sender<Outcome<T>>>,
    last_nanos: i64,
}

/// 关联 ID → 等待槽位；可并发使用
pub struct CorrelationRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for CorrelationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CorrelationRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                last_nanos: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // 锁内不会 panic，中毒时直接沿用数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 以指定 ID 注册槽位；ID 已存在时失败
    pub fn register(&self, id: &str) -> Result<CorrelationSlot<T>, HubError> {
        let mut inner = self.lock();
        if inner.pending.contains_key(id) {
            return Err(HubError::DuplicateCorrelation(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.to_string(), tx);
        Ok(CorrelationSlot {
            id: id.to_string(),
            rx,
        })
    }

    /// 生成单调递增的纳秒时间戳 ID 并注册；冲突时 +1 重试
    pub fn register_next(&self) -> CorrelationSlot<T> {
        let mut inner = self.lock();
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let mut nanos = now.max(inner.last_nanos + 1);
        while inner.pending.contains_key(&nanos.to_string()) {
            nanos += 1;
        }
        inner.last_nanos = nanos;

        let id = nanos.to_string();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.clone(), tx);
        CorrelationSlot { id, rx }
    }

    /// 取出槽位并交付结果；未知 ID 记录日志后丢弃
    pub fn deliver(&self, id: &str, outcome: Outcome<T>) -> bool {
        let tx = self.lock().pending.remove(id);
        match tx {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(correlation_id = %id, "Requester gave up before the reply arrived");
                }
                true
            }
            None => {
                tracing::warn!(correlation_id = %id, "Reply with unknown correlation id. Dropped");
                false
            }
        }
    }

    /// 等待应答；超时后槽位被移除
    pub async fn wait(&self, slot: CorrelationSlot<T>, timeout: Duration) -> Outcome<T> {
        let CorrelationSlot { id, rx } = slot;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::ConnectionLost),
            Err(_) => {
                self.remove(&id);
                Err(HubError::Timeout)
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    /// 唤醒所有等待者并返回同一个错误
    pub fn abort_all(&self, err: HubError) -> usize {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        if count > 0 {
            tracing::info!("Aborted {} outstanding requests: {}", count, err);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_register_duplicate_fails() {
        let reg: CorrelationRegistry<String> = CorrelationRegistry::new();
        let _slot = reg.register("1").unwrap();
        assert!(matches!(reg.register("1"), Err(HubError::DuplicateCorrelation(_))));
    }

    #[test]
    fn test_generated_ids_are_unique_and_increasing() {
        let reg: CorrelationRegistry<()> = CorrelationRegistry::new();
        let ids: Vec<i64> = (0..1000)
            .map(|_| reg.register_next().id().parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(reg.len(), 1000);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_match_ids() {
        let reg: Arc<CorrelationRegistry<String>> = Arc::new(CorrelationRegistry::new());
        let a = reg.register_next();
        let b = reg.register_next();
        let (id_a, id_b) = (a.id().to_string(), b.id().to_string());

        // 逆序到达
        reg.deliver(&id_b, Ok("reply-b".into()));
        reg.deliver(&id_a, Ok("reply-a".into()));

        let timeout = Duration::from_secs(1);
        assert_eq!(reg.wait(a, timeout).await.unwrap(), "reply-a");
        assert_eq!(reg.wait(b, timeout).await.unwrap(), "reply-b");
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_many_concurrent_registrations() {
        let reg: Arc<CorrelationRegistry<u32>> = Arc::new(CorrelationRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32u32 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                let slot = reg.register_next();
                let id = slot.id().to_string();
                let reg2 = reg.clone();
                let id2 = id.clone();
                tokio::spawn(async move { reg2.deliver(&id2, Ok(i)) });
                (id, reg.wait(slot, Duration::from_secs(2)).await.unwrap(), i)
            }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            let (id, got, want) = h.await.unwrap();
            assert_eq!(got, want);
            assert!(ids.insert(id));
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_slot() {
        let reg: CorrelationRegistry<String> = CorrelationRegistry::new();
        let slot = reg.register_next();
        let id = slot.id().to_string();

        let res = reg.wait(slot, Duration::from_millis(20)).await;
        assert_eq!(res, Err(HubError::Timeout));
        assert!(!reg.contains(&id));
        // 迟到的应答被丢弃
        assert!(!reg.deliver(&id, Ok("late".into())));
    }

    #[tokio::test]
    async fn test_abort_all_wakes_waiters() {
        let reg: Arc<CorrelationRegistry<String>> = Arc::new(CorrelationRegistry::new());
        let slot = reg.register_next();
        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.wait(slot, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(reg.abort_all(HubError::ConnectionLost), 1);
        assert_eq!(waiter.await.unwrap(), Err(HubError::ConnectionLost));
    }
}
