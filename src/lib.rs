//! Hub 客户端消息运行时
//!
//! 模块划分：
//! - **things**: ThingMessage 信封与连接状态
//! - **transport**: 地址编解码、请求关联、连接监管与三种可互换的 Hub 传输
//! - **store**: Thing 最新值缓存及其键值桶
//! - **session**: 连接状态的展示
//! - **client**: 以 Thing 语义封装传输的 Hub 客户端
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭

pub mod client;
pub mod config;
pub mod core;
pub mod observability;
pub mod session;
pub mod store;
pub mod things;
pub mod transport;

pub use client::HubClient;
pub use core::HubError;
pub use store::ThingValueStore;
pub use transport::HubTransport;
