use rumqttc::{AsyncClient, Event, Outgoing};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::sources::mqtt::{mqtt_options, qos};

/// Publishes collector reports and mode commands onto the bus.
pub struct ReportPublisher {
    client: AsyncClient,
    driver: JoinHandle<()>,
    qos: u8,
}

impl ReportPublisher {
    /// `role` suffixes the configured client id so concurrent tools do not
    /// evict each other from the broker.
    pub fn connect(cfg: &MqttConfig, role: &str) -> Self {
        let client_id = format!("{}-{role}", cfg.client_id);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(cfg, &client_id), 64);

        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "broker connection lost while publishing");
                        break;
                    }
                }
            }
        });

        Self {
            client,
            driver,
            qos: cfg.qos,
        }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .publish(topic, qos(self.qos), false, payload)
            .await
            .map_err(|e| anyhow::anyhow!("failed to publish to {topic}: {e}"))?;
        metrics::counter!("bus_messages_published_total").increment(1);
        tracing::info!(topic, "published to bus");
        Ok(())
    }

    /// Flush queued publishes and close the connection.
    pub async fn finish(self) -> anyhow::Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| anyhow::anyhow!("failed to disconnect from broker: {e}"))?;
        self.driver.await?;
        Ok(())
    }
}
