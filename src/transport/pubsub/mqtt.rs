//! 基于 rumqttc（MQTT v5）的 broker 链路
//!
//! rumqttc 的事件循环在 poll 出错后会自行重连；这里把它的事件翻译为
//! [`LinkEvent`]，拒绝原因码原样上报，是否停止由传输层决定。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::link::{BrokerConnector, BrokerLink, LinkEvent, LinkOptions, PubPacket, QoS};
use crate::core::HubError;

/// MQTT 连接器
pub struct MqttConnector {
    full_url: String,
    ca_cert: Option<String>,
    retry_interval: Duration,
}

impl MqttConnector {
    pub fn new(full_url: impl Into<String>, ca_cert: Option<String>) -> Self {
        Self {
            full_url: full_url.into(),
            ca_cert,
            retry_interval: Duration::from_secs(3),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// 解析 `mqtts://host:port` / `tcp://host:port`
    fn parse_url(&self) -> Result<(bool, String, u16), HubError> {
        let (scheme, rest) = self
            .full_url
            .split_once("://")
            .ok_or_else(|| HubError::Config(format!("invalid broker url '{}'", self.full_url)))?;
        let tls = matches!(scheme, "mqtts" | "ssl" | "tls");
        let (host, port) = match rest.trim_end_matches('/').rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse::<u16>()
                    .map_err(|_| HubError::Config(format!("invalid broker port '{}'", p)))?,
            ),
            None => (rest.to_string(), if tls { 8883 } else { 1883 }),
        };
        Ok((tls, host, port))
    }
}

fn to_mqtt_qos(qos: Option<QoS>) -> MqttQoS {
    match qos {
        Some(QoS::AtLeastOnce) => MqttQoS::AtLeastOnce,
        _ => MqttQoS::AtMostOnce,
    }
}

fn reason_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::BadUserNamePassword => 134,
        ConnectReturnCode::NotAuthorized => 135,
        _ => 128,
    }
}

struct MqttLink {
    client: AsyncClient,
    closed: CancellationToken,
}

fn client_error(e: rumqttc::v5::ClientError) -> HubError {
    tracing::warn!("MQTT client error: {}", e);
    HubError::NoConnection
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, packet: PubPacket) -> Result<(), HubError> {
        let properties = PublishProperties {
            correlation_data: packet.correlation_data.map(Bytes::from),
            response_topic: packet.response_topic,
            content_type: packet.content_type,
            ..Default::default()
        };
        self.client
            .publish_with_properties(
                packet.topic,
                to_mqtt_qos(packet.qos),
                packet.retain,
                packet.payload,
                properties,
            )
            .await
            .map_err(client_error)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), HubError> {
        self.client
            .subscribe(filter, to_mqtt_qos(Some(qos)))
            .await
            .map_err(client_error)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), HubError> {
        self.client.unsubscribe(filter).await.map_err(client_error)
    }

    async fn close(&self) {
        self.closed.cancel();
        let _ = self.client.disconnect().await;
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    retry_interval: Duration,
    closed: CancellationToken,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        let polled = tokio::select! {
            _ = closed.cancelled() => break,
            ev = eventloop.poll() => ev,
        };
        let link_event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Some(LinkEvent::Up),
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let props = p.properties.unwrap_or_default();
                Some(LinkEvent::Message(PubPacket {
                    topic: String::from_utf8_lossy(&p.topic).to_string(),
                    payload: p.payload.to_vec(),
                    qos: None,
                    retain: p.retain,
                    correlation_data: props.correlation_data.map(|b| b.to_vec()),
                    response_topic: props.response_topic,
                    content_type: props.content_type,
                }))
            }
            Ok(Event::Incoming(Packet::Disconnect(d))) => Some(LinkEvent::Down {
                reason: format!("{:?}", d.reason_code),
            }),
            Ok(_) => None,
            Err(ConnectionError::ConnectionRefused(code)) => Some(LinkEvent::Refused {
                code: reason_code(code),
                reason: format!("{:?}", code),
            }),
            Err(e) => Some(LinkEvent::Down {
                reason: e.to_string(),
            }),
        };

        if let Some(ev) = link_event {
            let failed = matches!(ev, LinkEvent::Down { .. } | LinkEvent::Refused { .. });
            if events.send(ev).is_err() {
                break;
            }
            if failed {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn open(
        &self,
        options: LinkOptions,
    ) -> Result<(Arc<dyn BrokerLink>, mpsc::UnboundedReceiver<LinkEvent>), HubError> {
        let (tls, host, port) = self.parse_url()?;
        let mut mqtt_options = MqttOptions::new(options.connect_id.clone(), host, port);
        mqtt_options
            .set_credentials(options.username.clone(), options.secret.clone())
            .set_keep_alive(Duration::from_secs(30))
            .set_clean_start(true);
        if tls {
            let transport = match &self.ca_cert {
                Some(pem) => Transport::Tls(TlsConfiguration::Simple {
                    ca: pem.as_bytes().to_vec(),
                    alpn: None,
                    client_auth: None,
                }),
                None => Transport::tls_with_default_config(),
            };
            mqtt_options.set_transport(transport);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        tokio::spawn(run_event_loop(
            eventloop,
            self.retry_interval,
            closed.clone(),
            tx,
        ));

        let link: Arc<dyn BrokerLink> = Arc::new(MqttLink { client, closed });
        Ok((link, rx))
    }
}
