//! Thing 最新值缓存
//!
//! 以 `agentID/thingID` 为键，缓存每个属性/事件名的最新 [`ThingValue`]：
//! - 首次访问某个 Thing 时才从桶中加载
//! - 只有时间戳严格更大的值才会覆盖旧值，乱序到达是安全的
//! - 写入只标记脏；`save_changes` 批量写回
//!
//! 桶的读写都在缓存锁之外进行，已加载的 Thing 读取不会被 I/O 阻塞。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::HubError;
use crate::store::{Bucket, SqliteBucket};
use crate::things::{now_msec, Payload, ThingValue, PROPERTIES_BUNDLE};

/// 值缓存配置
#[derive(Debug, Clone)]
pub struct ValueStoreConfig {
    pub directory: PathBuf,
    pub store_filename: String,
    /// 自动保存间隔
    pub autosave: Duration,
}

impl Default for ValueStoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            store_filename: "thingValues".to_string(),
            autosave: Duration::from_secs(5),
        }
    }
}

impl ValueStoreConfig {
    /// 数据库文件路径：`{directory}/{store_filename}.db`
    pub fn db_path(&self) -> PathBuf {
        self.directory.join(format!("{}.db", self.store_filename))
    }
}

#[derive(Debug, Default)]
struct CachedThingProperties {
    props: HashMap<String, ThingValue>,
    dirty: bool,
}

pub struct ThingValueStore {
    bucket: Arc<dyn Bucket>,
    cache: RwLock<HashMap<String, CachedThingProperties>>,
}

impl ThingValueStore {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self {
            bucket,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 以 SQLite 文件为后端打开
    pub fn open(config: &ValueStoreConfig) -> Result<Self, HubError> {
        let bucket = SqliteBucket::open(config.db_path())?;
        tracing::info!(path = %config.db_path().display(), "Thing value store opened");
        Ok(Self::new(Arc::new(bucket)))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CachedThingProperties>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CachedThingProperties>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 确保缓存项存在；已缓存或桶中有记录时返回 true
    ///
    /// 记录缺失或无法解析时以空表开始，后者会记录日志。
    pub fn load_props(&self, thing_addr: &str) -> bool {
        if self.read().contains_key(thing_addr) {
            return true;
        }

        let (found, props) = match self.bucket.get(thing_addr) {
            Ok(Some(raw)) => match decode_props(thing_addr, &raw) {
                Ok(props) => (true, props),
                Err(e) => {
                    tracing::error!("{}", e);
                    (false, HashMap::new())
                }
            },
            Ok(None) => (false, HashMap::new()),
            Err(e) => {
                tracing::error!(thing_addr, "Failed to read cached properties: {}", e);
                (false, HashMap::new())
            }
        };

        // 并发加载时先到者生效
        self.write()
            .entry(thing_addr.to_string())
            .or_insert(CachedThingProperties {
                props,
                dirty: false,
            });
        found
    }

    /// 读取 Thing 的值；给定 `names` 时按其顺序返回存在的项，否则按名称排序返回全部
    pub fn get_properties(&self, thing_addr: &str, names: Option<&[&str]>) -> Vec<ThingValue> {
        self.load_props(thing_addr);
        let cache = self.read();
        let Some(cached) = cache.get(thing_addr) else {
            return Vec::new();
        };
        match names {
            Some(names) => names
                .iter()
                .filter_map(|n| cached.props.get(*n).cloned())
                .collect(),
            None => {
                let mut all: Vec<ThingValue> = cached.props.values().cloned().collect();
                all.sort_by(|a, b| a.name.cmp(&b.name));
                all
            }
        }
    }

    /// 写入一条更新；`$properties` 批量事件会展开为逐个属性
    pub fn handle_add_value(&self, mut tv: ThingValue) {
        if tv.created_msec <= 0 {
            tv.created_msec = now_msec();
        }
        let thing_addr = tv.thing_addr();

        let values = if tv.name == PROPERTIES_BUNDLE {
            match expand_bundle(&tv) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(thing_addr = %thing_addr, "Ignoring property bundle: {}", e);
                    return;
                }
            }
        } else {
            vec![tv]
        };

        self.load_props(&thing_addr);
        let mut cache = self.write();
        let cached = cache.entry(thing_addr).or_default();
        for value in values {
            match cached.props.get(&value.name) {
                Some(existing) if existing.created_msec >= value.created_msec => {
                    tracing::debug!(
                        name = %value.name,
                        existing = existing.created_msec,
                        incoming = value.created_msec,
                        "Ignoring out-of-order value"
                    );
                }
                _ => {
                    cached.props.insert(value.name.clone(), value);
                }
            }
        }
        cached.dirty = true;
    }

    /// 把脏 Thing 写回桶；所有写入都会尝试，返回最后一个错误
    pub fn save_changes(&self) -> Result<(), HubError> {
        let dirty: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(addr, _)| addr.clone())
            .collect();

        let mut last_err = None;
        for thing_addr in dirty {
            let serialized = {
                let mut cache = self.write();
                let Some(cached) = cache.get_mut(&thing_addr) else {
                    continue;
                };
                cached.dirty = false;
                serde_json::to_vec(&cached.props)
            };
            let result = serialized
                .map_err(HubError::from)
                .and_then(|raw| self.bucket.set(&thing_addr, &raw));
            if let Err(e) = result {
                tracing::error!(thing_addr = %thing_addr, "Failed to save thing values: {}", e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 是否有尚未写回的修改
    pub fn is_dirty(&self, thing_addr: &str) -> bool {
        self.read().get(thing_addr).is_some_and(|c| c.dirty)
    }

    /// 周期性保存；取消时再保存一次后退出
    pub fn spawn_autosave(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = self.save_changes() {
                            tracing::warn!("Final save of thing values failed: {}", e);
                        }
                        tracing::debug!("Autosave stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.save_changes() {
                            tracing::warn!("Autosave of thing values failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

fn decode_props(thing_addr: &str, raw: &[u8]) -> Result<HashMap<String, ThingValue>, HubError> {
    serde_json::from_slice(raw).map_err(|e| HubError::StoreDecode {
        thing_addr: thing_addr.to_string(),
        reason: e.to_string(),
    })
}

/// 把 `{"name": value}` 展开为逐个属性值；非字符串值保留其 JSON 文本
fn expand_bundle(bundle: &ThingValue) -> Result<Vec<ThingValue>, HubError> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bundle.data)
        .map_err(|e| HubError::MalformedMessage(format!("property bundle is not a map: {}", e)))?;
    Ok(map
        .into_iter()
        .map(|(name, value)| {
            let data = match value {
                serde_json::Value::String(s) => Payload::from(s),
                other => Payload::from(other.to_string()),
            };
            ThingValue {
                msg_type: bundle.msg_type,
                agent_id: bundle.agent_id.clone(),
                thing_id: bundle.thing_id.clone(),
                name,
                sender_id: bundle.sender_id.clone(),
                created_msec: bundle.created_msec,
                data,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBucket;
    use crate::things::ThingMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 统计读取次数，并可让指定键写入失败
    #[derive(Default)]
    struct CountingBucket {
        inner: MemoryBucket,
        gets: AtomicUsize,
        fail_key: Option<String>,
    }

    impl Bucket for CountingBucket {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> Result<(), HubError> {
            if self.fail_key.as_deref() == Some(key) {
                return Err(HubError::Store("disk full".into()));
            }
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), HubError> {
            self.inner.delete(key)
        }
    }

    fn value(name: &str, data: &str, created: i64) -> ThingValue {
        ThingMessage::event("a", "t", name, data, created)
    }

    #[test]
    fn test_out_of_order_value_is_ignored() {
        let store = ThingValueStore::new(Arc::new(MemoryBucket::new()));
        store.handle_add_value(value("n", "a", 10));
        store.handle_add_value(value("n", "b", 5));
        store.handle_add_value(value("n", "c", 10));

        let props = store.get_properties("a/t", Some(&["n"][..]));
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].data, "a");
    }

    #[test]
    fn test_property_bundle_expansion() {
        let store = ThingValueStore::new(Arc::new(MemoryBucket::new()));
        let bundle = ThingMessage::event("a", "t", PROPERTIES_BUNDLE, r#"{"x":"1","y":2}"#, 100)
            .with_sender("agent-svc");
        store.handle_add_value(bundle);

        let props = store.get_properties("a/t", Some(&["y", "x"][..]));
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "y");
        assert_eq!(props[0].data, "2");
        assert_eq!(props[1].data, "1");
        for p in &props {
            assert_eq!(p.created_msec, 100);
            assert_eq!(p.sender_id, "agent-svc");
        }
        assert!(store.get_properties("a/t", None).iter().all(|p| p.name != PROPERTIES_BUNDLE));
    }

    #[test]
    fn test_missing_timestamp_is_stamped() {
        let store = ThingValueStore::new(Arc::new(MemoryBucket::new()));
        store.handle_add_value(value("n", "a", 0));
        let props = store.get_properties("a/t", None);
        assert!(props[0].created_msec > 0);
    }

    #[test]
    fn test_save_error_clears_dirty_flag_and_other_things_persist() {
        let bucket = Arc::new(CountingBucket {
            fail_key: Some("a/t".into()),
            ..Default::default()
        });
        let store = ThingValueStore::new(bucket.clone());
        store.handle_add_value(value("n", "1", 1));
        store.handle_add_value(ThingMessage::event("a", "u", "n", "2", 1));

        let err = store.save_changes().unwrap_err();
        assert_eq!(err, HubError::Store("disk full".into()));
        assert!(!store.is_dirty("a/t"));
        assert!(bucket.inner.get("a/u").unwrap().is_some());

        store.handle_add_value(value("n", "3", 2));
        assert!(store.is_dirty("a/t"));
    }

    #[test]
    fn test_load_props_is_idempotent() {
        let bucket = Arc::new(CountingBucket::default());
        bucket.inner.set("a/t", br#"{"n":{"thingID":"t","name":"n","createdMSec":1,"data":"x"}}"#).unwrap();
        let store = ThingValueStore::new(bucket.clone());

        assert!(store.load_props("a/t"));
        assert!(store.load_props("a/t"));
        assert!(store.load_props("a/t"));
        assert_eq!(bucket.gets.load(Ordering::SeqCst), 1);

        assert!(!store.load_props("a/missing"));
        assert!(store.load_props("a/missing"));
    }

    #[test]
    fn test_unparseable_row_starts_empty() {
        let bucket = Arc::new(MemoryBucket::new());
        bucket.set("a/t", b"not json").unwrap();
        let store = ThingValueStore::new(bucket);
        assert!(!store.load_props("a/t"));
        assert!(store.get_properties("a/t", None).is_empty());
    }

    #[tokio::test]
    async fn test_autosave_flushes_on_cancel() {
        let bucket = Arc::new(MemoryBucket::new());
        let store = Arc::new(ThingValueStore::new(bucket.clone()));
        let token = CancellationToken::new();
        let handle = store.clone().spawn_autosave(Duration::from_secs(3600), token.clone());

        store.handle_add_value(value("temp", "22", 1000));
        token.cancel();
        handle.await.unwrap();
        assert!(bucket.get("a/t").unwrap().is_some());
    }
}
