use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::MqttConfig;
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, RawMessage, Source};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub fn mqtt_options(cfg: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &cfg.host, cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
        options.set_credentials(username, password);
    }
    options
}

/// Subscribes to the configured topic filter and yields every publish.
///
/// The event loop runs on its own task and forwards into a bounded channel,
/// so a slow pipeline back-pressures the broker connection. Connection
/// errors are logged and retried; the subscription is renewed on every
/// (re)connect.
pub struct MqttSource {
    cfg: MqttConfig,
}

impl MqttSource {
    pub fn new(cfg: MqttConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait::async_trait]
impl Source<RawMessage> for MqttSource {
    async fn stream(&self) -> EnvelopeStream<RawMessage> {
        let cfg = self.cfg.clone();
        let capacity = cfg.channel_capacity.max(1);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&cfg, &cfg.client_id), capacity);
        let (tx, rx) = mpsc::channel::<Result<Envelope<RawMessage>, PipelineError>>(capacity);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(host = %cfg.host, port = cfg.port, topic = %cfg.topic, "connected to broker, subscribing");
                        if let Err(e) = client.try_subscribe(cfg.topic.clone(), qos(cfg.qos)) {
                            tracing::error!(error = %e, topic = %cfg.topic, "failed to queue subscription");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = RawMessage::new(publish.topic, publish.payload);
                        if tx.send(Ok(Envelope::now(message))).await.is_err() {
                            tracing::info!("message consumer gone, stopping broker event loop");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        metrics::counter!("bus_connection_errors_total").increment(1);
                        tracing::warn!(error = %e, retry_in_secs = RECONNECT_DELAY.as_secs(), "broker connection error");
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
