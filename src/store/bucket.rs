//! 键值桶
//!
//! 值缓存的后端存储。实现必须自身线程安全；值缓存只在锁外调用桶。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::HubError;

pub trait Bucket: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), HubError>;

    fn delete(&self, key: &str) -> Result<(), HubError>;
}

/// 内存桶，用于测试与不需要持久化的场景
#[derive(Debug, Default)]
pub struct MemoryBucket {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Bucket for MemoryBucket {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), HubError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), HubError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.remove(key);
        Ok(())
    }
}

/// SQLite 桶：单表 `kv(key TEXT PRIMARY KEY, value BLOB)`
pub struct SqliteBucket {
    conn: Mutex<Connection>,
}

impl SqliteBucket {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HubError::Store(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;
        tracing::debug!(path = %path.display(), "Opened sqlite bucket");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Bucket for SqliteBucket {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), HubError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), HubError> {
        self.conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_bucket() {
        let b = MemoryBucket::new();
        assert!(b.get("k").unwrap().is_none());
        b.set("k", b"v").unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));
        b.delete("k").unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn test_sqlite_bucket_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("values.db");
        {
            let b = SqliteBucket::open(&path).unwrap();
            b.set("a/t", b"{}").unwrap();
            b.set("a/t", b"{\"x\":1}").unwrap();
        }
        let b = SqliteBucket::open(&path).unwrap();
        assert_eq!(b.get("a/t").unwrap(), Some(b"{\"x\":1}".to_vec()));
        b.delete("a/t").unwrap();
        assert!(b.get("a/t").unwrap().is_none());
    }
}
