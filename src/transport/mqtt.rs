#![forbid(unsafe_code)]

use crate::config::{MqttConfig, MqttTlsConfig};
use crate::transport::broker::payload_to_bytes;
use crate::transport::{BrokerEndpoint, Publisher, TransportError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
enum LinkState {
    Connecting,
    Connected,
    Failed(TransportError),
    Closed,
}

/// rumqttc-backed publisher. A spawned driver task polls the event loop and reports
/// connection state through a watch channel.
pub struct RumqttcPublisher {
    client: AsyncClient,
    qos: QoS,
    state: watch::Receiver<LinkState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcPublisher {
    pub fn connect(config: &MqttConfig) -> Result<Self, TransportError> {
        let options = build_mqtt_options(config)?;
        let qos = qos_from_u8(config.qos)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (tx, rx) = watch::channel(LinkState::Connecting);
        let driver = tokio::spawn(drive_event_loop(eventloop, tx));

        Ok(Self {
            client,
            qos,
            state: rx,
            driver: Mutex::new(Some(driver)),
        })
    }

    fn current(&self) -> LinkState {
        self.state.borrow().clone()
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, state: watch::Sender<LinkState>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    tracing::info!(
                        target: "syntised::mqtt",
                        event = "broker_connected",
                        session_present = ack.session_present
                    );
                    state.send_replace(LinkState::Connected);
                } else {
                    let reason = format!("{:?}", ack.code);
                    tracing::error!(
                        target: "syntised::mqtt",
                        event = "broker_refused",
                        code = %reason
                    );
                    state.send_replace(LinkState::Failed(TransportError::ConnectionRefused(
                        reason,
                    )));
                    return;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.send_replace(LinkState::Closed);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                if matches!(*state.borrow(), LinkState::Closed) {
                    return;
                }
                tracing::error!(
                    target: "syntised::mqtt",
                    event = "event_loop_failed",
                    error = %err
                );
                state.send_replace(LinkState::Failed(TransportError::Connection(
                    err.to_string(),
                )));
                return;
            }
        }
    }
}

#[async_trait]
impl Publisher for RumqttcPublisher {
    async fn ready(&self) -> Result<(), TransportError> {
        let mut rx = self.state.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                LinkState::Connected => return Ok(()),
                LinkState::Failed(err) => return Err(err),
                LinkState::Closed => return Err(TransportError::Closed),
                LinkState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn publish(&self, topic: &str, payload: &JsonValue) -> Result<(), TransportError> {
        match self.current() {
            LinkState::Failed(err) => return Err(err),
            LinkState::Closed => return Err(TransportError::Closed),
            LinkState::Connecting | LinkState::Connected => {}
        }

        let bytes = payload_to_bytes(topic, payload)?;
        self.client
            .publish(topic.to_string(), self.qos, false, bytes)
            .await
            .map_err(|err| TransportError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn failed(&self) -> TransportError {
        let mut rx = self.state.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let LinkState::Failed(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(
                target: "syntised::mqtt",
                event = "disconnect_skipped",
                error = %err
            );
        }

        let driver = self
            .driver
            .lock()
            .map_err(|_| TransportError::Closed)?
            .take();

        if let Some(mut handle) = driver {
            if timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!(
                    target: "syntised::mqtt",
                    event = "close_timed_out",
                    timeout_ms = CLOSE_TIMEOUT.as_millis() as u64
                );
                handle.abort();
            }
        }

        Ok(())
    }
}

fn build_mqtt_options(config: &MqttConfig) -> Result<MqttOptions, TransportError> {
    let endpoint = BrokerEndpoint::parse(&config.url)?;

    let client_id = config
        .client_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("syntised-{}", Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);

    if let Some(seconds) = config.keep_alive_secs {
        options.set_keep_alive(Duration::from_secs(seconds));
    }

    if let Some(user) = config.username.as_deref() {
        options.set_credentials(user, config.password.as_deref().unwrap_or(""));
    }

    if endpoint.tls || config.tls.is_some() {
        options.set_transport(build_transport(config.tls.as_ref())?);
    }

    Ok(options)
}

fn build_transport(tls: Option<&MqttTlsConfig>) -> Result<Transport, TransportError> {
    let Some(tls) = tls else {
        return Ok(Transport::tls_with_default_config());
    };

    let client_auth = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => Some((read_pem(cert, "cert")?, read_pem(key, "key")?)),
        (None, None) => None,
        _ => {
            return Err(TransportError::Tls(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    };

    match &tls.ca {
        Some(ca) => Ok(Transport::tls(read_pem(ca, "ca")?, client_auth, None)),
        None if client_auth.is_some() => Err(TransportError::Tls(
            "client authentication requires `mqtt.tls.ca`".to_string(),
        )),
        None => Ok(Transport::tls_with_default_config()),
    }
}

fn read_pem(path: &Path, label: &str) -> Result<Vec<u8>, TransportError> {
    fs::read(path).map_err(|err| {
        TransportError::Tls(format!(
            "failed to read mqtt tls {label} `{}`: {err}",
            path.display()
        ))
    })
}

fn qos_from_u8(qos: u8) -> Result<QoS, TransportError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::Connection(format!(
            "unsupported mqtt qos `{other}`"
        ))),
    }
}
