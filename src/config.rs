//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HUB__*` 覆盖（双下划线表示嵌套，如 `HUB__TRANSPORT__FULL_URL=mqtts://hub:8883`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::HubError;
use crate::store::ValueStoreConfig;
use crate::transport::TransportOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// [transport] 段：Hub 地址、身份与超时
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub full_url: String,
    #[serde(default)]
    pub client_id: String,
    /// "mqtt" / "nats" / "https"；为空时按 URL scheme 推断
    #[serde(default)]
    pub core: String,
    /// PEM 格式 CA 证书文件；未设置时不校验服务端证书
    pub ca_cert_file: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    /// SSE 断线重连的初始间隔（秒）
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_sse_path() -> String {
    "/sse".to_string()
}

fn default_retry_secs() -> u64 {
    1
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            full_url: String::new(),
            client_id: String::new(),
            core: String::new(),
            ca_cert_file: None,
            timeout_secs: default_timeout_secs(),
            sse_path: default_sse_path(),
            retry_secs: default_retry_secs(),
        }
    }
}

impl TransportSection {
    /// 实际使用的传输内核
    pub fn core(&self) -> &str {
        if !self.core.is_empty() {
            return &self.core;
        }
        let scheme = self.full_url.split("://").next().unwrap_or_default();
        match scheme {
            "nats" | "tls" => "nats",
            "https" | "http" => "https",
            _ => "mqtt",
        }
    }

    /// 转换为传输参数；读取 CA 证书文件
    pub fn to_options(&self) -> Result<TransportOptions, HubError> {
        if self.full_url.is_empty() {
            return Err(HubError::Config("transport.full_url is not set".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(HubError::Config("transport.client_id is not set".to_string()));
        }
        let mut options = TransportOptions::new(&self.full_url, &self.client_id)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_sse_path(&self.sse_path)
            .with_retry_interval(Duration::from_secs(self.retry_secs.max(1)));
        if let Some(path) = &self.ca_cert_file {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                HubError::Config(format!("cannot read CA certificate {}: {}", path.display(), e))
            })?;
            options = options.with_ca_cert(pem);
        }
        Ok(options)
    }
}

/// [store] 段：值缓存文件位置与自动保存间隔
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_store_filename")]
    pub store_filename: String,
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_store_filename() -> String {
    "thingValues".to_string()
}

fn default_autosave_secs() -> u64 {
    5
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            store_filename: default_store_filename(),
            autosave_secs: default_autosave_secs(),
        }
    }
}

impl StoreSection {
    pub fn to_config(&self) -> ValueStoreConfig {
        ValueStoreConfig {
            directory: self.directory.clone(),
            store_filename: self.store_filename.clone(),
            autosave: Duration::from_secs(self.autosave_secs.max(1)),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HUB__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HUB__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HUB")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
