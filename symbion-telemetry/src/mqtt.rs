/*!
 * MQTT - Réception des payloads agents publiés sur le bus
 *
 * Alternative à POST /agents/payload pour les agents déjà branchés sur le
 * broker. Les messages sont ingérés dans l'ordre de réception ; en cas de
 * coupure, reconnexion avec back-off (2s puis doublement, plafond 30s).
 */

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::ingest::Ingestor;
use crate::payload::AgentPayload;

const CLIENT_ID: &str = "symbion-telemetry";
const BACKOFF_START: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub fn decode_payload(bytes: &[u8]) -> Result<AgentPayload, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Délai avant la tentative `attempt` (0 = première reconnexion)
pub fn backoff(attempt: u32) -> Duration {
    BACKOFF_START
        .checked_mul(1u32 << attempt.min(8))
        .map_or(BACKOFF_MAX, |d| d.min(BACKOFF_MAX))
}

pub fn spawn_payload_listener(conf: MqttConf, ingestor: Arc<Ingestor>, health: HealthTracker) -> JoinHandle<()> {
    task::spawn(async move {
        let mut opts = MqttOptions::new(CLIENT_ID, conf.host.clone(), conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        health.mark_mqtt_connecting();
        info!(host = %conf.host, port = conf.port, topic = %conf.topic, "mqtt listener starting");

        let mut failures: u32 = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    failures = 0;
                    health.mark_mqtt_connected();
                    // session non persistante : réabonnement à chaque connexion
                    if let Err(e) = client.subscribe(conf.topic.as_str(), QoS::AtLeastOnce).await {
                        warn!(error = %e, "mqtt subscribe failed");
                    } else {
                        info!(topic = %conf.topic, "mqtt connected");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == conf.topic => {
                    match decode_payload(&p.payload) {
                        Ok(payload) => {
                            if let Err(e) = ingestor.ingest(payload).await {
                                debug!(error = %e, "mqtt payload rejected");
                            }
                        }
                        Err(e) => warn!(error = %e, bytes = p.payload.len(), "invalid payload json on mqtt"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = backoff(failures);
                    failures = failures.saturating_add(1);
                    health.increment_reconnects();
                    warn!(error = %e, retry_in = ?delay, "mqtt connection error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}
