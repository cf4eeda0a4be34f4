/**
 * SYMBION TELEMETRY - Point d'entrée du service de métriques
 *
 * RÔLE : Assemble stockage, handlers, archiver, moteur d'alertes et surfaces
 * HTTP / MQTT à partir de la config YAML.
 *
 * ERREURS : un stockage inaccessible au démarrage est fatal (exit 1), de même
 * qu'un échec de passe d'archivage pendant l'exécution.
 */

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use symbion_telemetry::alerts::{AlertEngine, AlertSink, LogSink, SlackSink};
use symbion_telemetry::archiver::Archiver;
use symbion_telemetry::clock::{SharedClock, SystemClock};
use symbion_telemetry::config::{load_config, TelemetryConfig};
use symbion_telemetry::health::HealthTracker;
use symbion_telemetry::http;
use symbion_telemetry::ingest::Ingestor;
use symbion_telemetry::logging::init_logging;
use symbion_telemetry::mqtt;
use symbion_telemetry::query::QueryService;
use symbion_telemetry::state::AppState;
use symbion_telemetry::store::TelemetryStore;

fn open_store(cfg: &TelemetryConfig) -> anyhow::Result<TelemetryStore> {
    let store = if cfg.storage.in_memory() {
        TelemetryStore::open_in_memory()
    } else {
        TelemetryStore::open(&cfg.storage.path)
    };
    store.with_context(|| format!("opening telemetry store at {}", cfg.storage.path))
}

fn alert_sink(cfg: &TelemetryConfig) -> Arc<dyn AlertSink> {
    match &cfg.slack {
        Some(slack) => {
            info!(channel = ?slack.channel, "alerts routed to slack");
            Arc::new(SlackSink::new(
                slack.webhook_url.clone(),
                slack.channel.clone(),
                slack.username.clone(),
            ))
        }
        None => {
            info!("no slack webhook configured, alerts go to the log");
            Arc::new(LogSink)
        }
    }
}

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg = load_config().await;
    init_logging(cfg.log_filter.as_deref());

    let store = match open_store(&cfg) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = ?e, "storage unavailable");
            std::process::exit(1);
        }
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let health = HealthTracker::new();

    let engine = Arc::new(AlertEngine::new(store.clone(), clock.clone(), alert_sink(&cfg)));
    let ingestor = Arc::new(
        Ingestor::new(store.clone(), cfg.agent_key.clone())
            .with_alerts(engine.clone())
            .with_health(health.clone()),
    );
    let query = Arc::new(QueryService::new(store.clone(), clock.clone()));

    // archivage + alertes sur les frontières d'horloge
    let archiver = Arc::new(
        Archiver::new(store.clone(), clock.clone())
            .with_alerts(engine.clone())
            .with_health(health.clone()),
    );
    archiver.spawn();

    // MQTT optionnel
    if let Some(mqtt_conf) = cfg.mqtt.clone() {
        mqtt::spawn_payload_listener(mqtt_conf, ingestor.clone(), health.clone());
    }

    let app_state = AppState {
        ingestor,
        query,
        alerts: engine,
        health,
    };
    let app = http::build_router(app_state);

    let addr: SocketAddr = match format!("{}:{}", cfg.http.host, cfg.http.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %cfg.http.host, port = cfg.http.port, error = %e, "invalid http address");
            std::process::exit(1);
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "cannot bind http listener");
            std::process::exit(1);
        }
    };
    info!("listening on http://{addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "http server stopped");
        std::process::exit(1);
    }
}
