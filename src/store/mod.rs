//! Thing 值缓存与其后端存储

pub mod bucket;
pub mod value_store;

pub use bucket::{Bucket, MemoryBucket, SqliteBucket};
pub use value_store::{ThingValueStore, ValueStoreConfig};
