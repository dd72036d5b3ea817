use crate::config::Config;
use crate::message::{self, InboundMessage};
use anyhow::{anyhow, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

/// Bounded retry accounting for the reconnect loop. A success resets the
/// budget; `failure` returns false once the budget is exhausted.
struct RetryBudget {
    attempts: u32,
    max: u32,
}

impl RetryBudget {
    fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    fn success(&mut self) {
        self.attempts = 0;
    }

    fn failure(&mut self) -> bool {
        self.attempts += 1;
        self.attempts < self.max
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Own the broker session: subscribe to the full topic space and feed the
/// ingestion queue. Returns `Ok` only when the queue side is gone (the writer
/// exited and carries the real cause); an `Err` means the reconnect budget is
/// exhausted and the process must die, since there is no durability
/// substitute for the live feed.
pub async fn run_supervisor(
    config: Config,
    tx: mpsc::UnboundedSender<InboundMessage>,
) -> Result<()> {
    // Random suffix keeps concurrently running instances from stealing each
    // other's broker session.
    let suffix = Uuid::new_v4().simple().to_string();
    let client_id = format!("{}-{}", config.mqtt_client_id, &suffix[..8]);
    let mut budget = RetryBudget::new(config.mqtt_max_reconnects.max(1));

    loop {
        let mut options = MqttOptions::new(
            client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);

        if let Err(err) = client.subscribe("#", QoS::AtLeastOnce).await {
            if !budget.failure() {
                return Err(anyhow!(
                    "broker unreachable after {} attempts: {err}",
                    budget.attempts()
                ));
            }
            tracing::warn!(
                error = %err,
                attempt = budget.attempts(),
                max = config.mqtt_max_reconnects,
                "failed to queue subscription; retrying"
            );
            sleep(config.reconnect_delay()).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!(client_id = %client_id, "connected to MQTT broker, subscribed to all topics");
                    budget.success();
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    match message::decode(&publish.topic, &publish.payload, received_at) {
                        Ok(msg) => {
                            if tx.send(msg).is_err() {
                                tracing::info!("ingestion queue closed; stopping broker session");
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, topic = %publish.topic, "dropping undecodable message");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if !budget.failure() {
                        return Err(anyhow!(
                            "MQTT reconnect budget exhausted after {} attempts: {err}",
                            budget.attempts()
                        ));
                    }
                    tracing::warn!(
                        error = %err,
                        attempt = budget.attempts(),
                        max = config.mqtt_max_reconnects,
                        "MQTT connection dropped; reconnecting"
                    );
                    break;
                }
            }
        }

        sleep(config.reconnect_delay()).await;
    }
}
