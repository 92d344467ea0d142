use crate::config::Config;
use crate::measurement::parse_payload;
use crate::topology::Dispatcher;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub publishes: AtomicU64,
    pub measurements: AtomicU64,
    /// Elements of a decodable payload that were dropped.
    pub malformed: AtomicU64,
    pub undecodable: AtomicU64,
}

/// Consumes every configured topic and hands each measurement to all pipelines.
/// Publishes are acknowledged only after the dispatch completed.
pub async fn run_listener(
    config: Config,
    dispatcher: Dispatcher,
    stats: Arc<ListenerStats>,
) -> Result<()> {
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.client_id(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        mqttoptions.set_manual_acks(true);
        mqttoptions.set_clean_session(false);
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        let mut subscribed = true;
        for topic in &config.input_topics {
            match client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                Ok(_) => tracing::info!(topic = %topic, "subscribed to measurement feed"),
                Err(err) => {
                    tracing::warn!(error = %err, topic = %topic, "failed to subscribe to MQTT; retrying");
                    subscribed = false;
                    break;
                }
            }
        }
        if !subscribed {
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    stats.publishes.fetch_add(1, Ordering::Relaxed);
                    let mut payload = publish.payload.to_vec();
                    match parse_payload(&mut payload) {
                        Ok(decoded) => {
                            for err in &decoded.rejected {
                                stats.malformed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(error = %err, topic = %publish.topic, "dropped malformed measurement");
                            }
                            for measurement in decoded.measurements {
                                stats.measurements.fetch_add(1, Ordering::Relaxed);
                                // A closed pipeline means the process is going down; leave
                                // the publish unacknowledged so the broker redelivers it.
                                dispatcher.dispatch(measurement).await?;
                            }
                        }
                        Err(err) => {
                            stats.undecodable.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %err, topic = %publish.topic, "failed to decode measurement payload");
                        }
                    }
                    if let Err(err) = client.ack(&publish).await {
                        tracing::warn!(error = %err, topic = %publish.topic, "failed to acknowledge publish");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
