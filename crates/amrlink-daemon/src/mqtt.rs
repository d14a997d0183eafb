//! MQTT subscription loop
//!
//! Subscribes to the configured topic and feeds every publish into the
//! [`Forwarder`], one message at a time in delivery order. The subscription
//! is re-issued on every ConnAck so it survives broker reconnects.

use std::sync::Arc;
use std::time::Duration;

use amrlink_core::Forwarder;
use anyhow::{anyhow, bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

/// Map a numeric QoS level onto rumqttc's enum
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => bail!("Invalid MQTT QoS level {}", other),
    }
}

/// Client ID used when none is configured
pub fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("amrlink-{}", &id[..12])
}

/// Build connection options from configuration
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(generate_client_id);

    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// When to stop retrying a broken connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated; 0 means retry forever
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            delay: Duration::from_secs(config.reconnect_delay_secs),
        }
    }

    pub fn exhausted(&self, consecutive_failures: u32) -> bool {
        self.max_attempts > 0 && consecutive_failures >= self.max_attempts
    }
}

/// Run the subscriber until `shutdown` fires or the connection is lost for good
///
/// A failure before the first successful connection is returned as an error.
pub async fn run(
    config: &MqttConfig,
    forwarder: Arc<Forwarder>,
    shutdown: CancellationToken,
) -> Result<()> {
    let qos = qos_from_level(config.qos)?;
    let policy = ReconnectPolicy::from_config(config);
    let options = mqtt_options(config);
    let broker = format!("{}:{}", config.host, config.port);

    info!(
        broker = %broker,
        client_id = %options.client_id(),
        topic = %config.topic,
        tls = config.tls,
        "Connecting to MQTT broker"
    );

    let (client, mut eventloop) = AsyncClient::new(options, 100);
    let mut connected = false;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, disconnecting from MQTT broker");
                if let Err(e) = client.disconnect().await {
                    debug!(error = %e, "Disconnect failed");
                }
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        forwarder.handle_message(&publish.payload, &publish.topic).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if connected {
                            info!(broker = %broker, "Reconnected to MQTT broker");
                        } else {
                            info!(broker = %broker, "Connected to MQTT broker");
                        }
                        connected = true;
                        failures = 0;
                        client
                            .subscribe(config.topic.as_str(), qos)
                            .await
                            .context("Failed to subscribe")?;
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        info!(topic = %config.topic, "Subscribed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !connected {
                            return Err(anyhow!(e)
                                .context(format!("Failed to connect to MQTT broker {}", broker)));
                        }

                        failures += 1;
                        error!(error = %e, attempt = failures, "MQTT connection error");
                        if policy.exhausted(failures) {
                            bail!(
                                "Giving up on MQTT broker {} after {} consecutive failures",
                                broker,
                                failures
                            );
                        }

                        warn!(delay_secs = policy.delay.as_secs(), "Reconnecting to MQTT broker");
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(policy.delay) => {}
                        }
                    }
                }
            }
        }
    }
}
