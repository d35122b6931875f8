use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use uuid::Uuid;

use meek_core::error::MeekError;
use meek_core::ports::{CommandBus, QosLevel, Result};
use meek_core::proto::{topics, ConnectionMessage};
use meek_core::queue::MessageQueue;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub keep_alive: Duration,
    /// First reconnect delay; doubles per attempt, capped at 60 s.
    pub reconnect_initial: Duration,
    pub max_reconnect_attempts: u32,
    pub default_qos: QosLevel,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: format!("api_service-{}", Uuid::new_v4().simple()),
            username: None,
            password: None,
            topic_prefix: meek_core::proto::DEFAULT_TOPIC_PREFIX.into(),
            keep_alive: Duration::from_secs(60),
            reconnect_initial: Duration::from_secs(5),
            max_reconnect_attempts: 20,
            default_qos: QosLevel::AtLeastOnce,
        }
    }
}

const RECONNECT_CAP: Duration = Duration::from_secs(60);

fn to_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Outbound handle shared with the control plane. Publishing while the
/// connection is down fails fast with a transport error — queueing retries
/// is the retry queue's responsibility.
pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl CommandBus for MqttBus {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        qos: QosLevel,
        retain: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(MeekError::Transport("mqtt client is not connected".into()));
        }
        let bytes =
            serde_json::to_vec(&payload).map_err(|e| MeekError::Internal(anyhow::anyhow!(e)))?;
        self.client
            .publish(topic, to_qos(qos), retain, bytes)
            .await
            .map_err(|e| MeekError::Transport(format!("publish to {topic} failed: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connect to the broker and spawn the event loop.
///
/// Inbound publishes are parsed as JSON (non-JSON payloads are wrapped as
/// `{"message": <text>}`) and pushed onto `queue`; nothing in this loop
/// blocks on handlers. The returned handle resolves when the reconnect
/// budget is exhausted — the controller keeps running its database-only
/// functions after that.
pub fn spawn_bus(
    settings: MqttSettings,
    queue: Arc<MessageQueue>,
) -> (Arc<MqttBus>, tokio::task::JoinHandle<()>) {
    let mut options = MqttOptions::new(
        settings.client_id.clone(),
        settings.host.clone(),
        settings.port,
    );
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    // Ungraceful drops still announce us offline via the broker.
    let offline = ConnectionMessage::offline(&settings.client_id, &settings.client_id, "api");
    options.set_last_will(LastWill::new(
        topics::connection(&settings.topic_prefix),
        serde_json::to_vec(&offline).unwrap_or_default(),
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let connected = Arc::new(AtomicBool::new(false));
    let bus = Arc::new(MqttBus { client: client.clone(), connected: Arc::clone(&connected) });

    let handle = tokio::spawn(async move {
        let mut backoff = settings.reconnect_initial;
        let mut failures: u32 = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    backoff = settings.reconnect_initial;
                    failures = 0;
                    tracing::info!(
                        "connected to mqtt broker {}:{}",
                        settings.host,
                        settings.port
                    );
                    if let Err(e) = on_connected(&client, &settings).await {
                        tracing::error!("post-connect setup failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = match serde_json::from_slice(&publish.payload) {
                        Ok(v) => v,
                        Err(_) => serde_json::json!({
                            "message": String::from_utf8_lossy(&publish.payload).to_string()
                        }),
                    };
                    queue.push(&publish.topic, payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    let was_connected = connected.swap(false, Ordering::SeqCst);
                    failures += 1;
                    if failures > settings.max_reconnect_attempts {
                        tracing::error!(
                            "mqtt reconnect budget exhausted after {} attempts: {e}; \
                             continuing without a broker connection",
                            settings.max_reconnect_attempts
                        );
                        return;
                    }
                    if was_connected {
                        tracing::warn!("mqtt connection lost: {e}");
                    }
                    tracing::info!(
                        "mqtt reconnect attempt {failures}/{} in {backoff:?}",
                        settings.max_reconnect_attempts
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    });

    (bus, handle)
}

/// Subscriptions and the retained online status, re-applied on every
/// (re)connect.
async fn on_connected(
    client: &AsyncClient,
    settings: &MqttSettings,
) -> std::result::Result<(), rumqttc::ClientError> {
    let prefix = &settings.topic_prefix;
    let qos = to_qos(settings.default_qos);
    client.subscribe(topics::connection(prefix), qos).await?;
    client.subscribe(topics::device_config_reply(prefix), qos).await?;
    client.subscribe(topics::status_wildcard(prefix), qos).await?;
    client.subscribe(topics::result_wildcard(prefix), qos).await?;

    let online = ConnectionMessage::online(&settings.client_id, &settings.client_id, "api");
    client
        .publish(
            topics::connection(prefix),
            QoS::AtLeastOnce,
            true,
            serde_json::to_vec(&online).unwrap_or_default(),
        )
        .await?;
    tracing::info!("subscribed to control topics under {prefix}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = MqttSettings::default();
        assert_eq!(s.port, 1883);
        assert_eq!(s.topic_prefix, "meek/");
        assert_eq!(s.max_reconnect_attempts, 20);
        assert!(s.client_id.starts_with("api_service-"));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }
}
