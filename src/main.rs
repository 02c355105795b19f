//! hub-client：连接 Hub、订阅全部事件并维护 Thing 最新值缓存
//!
//! 用法：`hub-client [config.toml]`，凭据来自环境变量 `HUB_TOKEN` 或 `HUB_PASSWORD`。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hub_client::client::HubClient;
use hub_client::config::load_config;
use hub_client::core::{
    join_background, run_until_shutdown, HubError, ShutdownCoordinator, ShutdownManager, TransportCleanup,
    ValueStoreCleanup,
};
use hub_client::session::notification_for;
use hub_client::store::ThingValueStore;
use hub_client::things::{ThingMessage, TransportStatus};
use hub_client::transport::http::HttpSseTransport;
use hub_client::transport::{HubTransport, TransportOptions};

#[cfg_attr(not(feature = "nats"), allow(unused_variables))]
fn build_transport(
    core: &str,
    options: TransportOptions,
    ca_cert_file: Option<PathBuf>,
) -> Result<Arc<dyn HubTransport>, HubError> {
    match core {
        "https" => Ok(Arc::new(HttpSseTransport::new(options)?)),
        #[cfg(feature = "mqtt")]
        "mqtt" => {
            use hub_client::transport::pubsub::{MqttConnector, PubSubTransport};
            let connector = MqttConnector::new(options.full_url.clone(), options.ca_cert.clone());
            Ok(Arc::new(PubSubTransport::new(options, Arc::new(connector))))
        }
        #[cfg(feature = "nats")]
        "nats" => {
            use hub_client::transport::subject::{NatsConnector, SubjectTransport};
            let connector = NatsConnector::new(options.full_url.clone(), ca_cert_file);
            Ok(Arc::new(SubjectTransport::new(options, Arc::new(connector))))
        }
        other => Err(HubError::Config(format!(
            "transport core '{}' is not available in this build",
            other
        ))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hub_client::observability::init();

    let cfg = load_config(std::env::args().nth(1).map(PathBuf::from))
        .context("Failed to load config")?;
    let options = cfg.transport.to_options()?;
    let transport = build_transport(cfg.transport.core(), options, cfg.transport.ca_cert_file.clone())?;
    let client = HubClient::new(transport.clone());

    let store_config = cfg.store.to_config();
    let store = Arc::new(ThingValueStore::open(&store_config).context("Failed to open value store")?);

    let s = store.clone();
    client.set_event_handler(Some(Arc::new(move |msg: ThingMessage| {
        s.handle_add_value(msg);
    })));
    client.set_connection_handler(Some(Arc::new(|status: TransportStatus| {
        let n = notification_for(&status);
        tracing::info!(level = ?n.level, "{}", n.message);
    })));

    let connected = if let Ok(token) = std::env::var("HUB_TOKEN") {
        client.connect_with_token(None, token.trim()).await
    } else if let Ok(password) = std::env::var("HUB_PASSWORD") {
        client.connect_with_password(&password).await
    } else {
        anyhow::bail!("set HUB_TOKEN or HUB_PASSWORD to connect");
    };
    connected.context("Failed to connect to the hub")?;

    client.sub_events("", "", "").await?;

    let manager = ShutdownManager::new();
    let autosave = store
        .clone()
        .spawn_autosave(store_config.autosave, manager.token());

    let mut coordinator = ShutdownCoordinator::new(manager);
    coordinator.register(TransportCleanup::new(transport));
    coordinator.register(ValueStoreCleanup::new(store));

    run_until_shutdown(&coordinator, std::future::pending::<()>()).await;
    join_background("autosave", autosave).await;
    Ok(())
}
