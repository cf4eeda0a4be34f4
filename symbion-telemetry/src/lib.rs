/*!
 * SYMBION TELEMETRY - Pipeline de métriques hôtes
 *
 * RÔLE :
 * Reçoit les compteurs bruts des agents, les convertit en débits, les stocke
 * sur quatre résolutions (5s, 1min, 20min, 2h), archive et purge selon
 * l'horloge murale, puis déclenche les alertes après chaque minute archivée.
 *
 * MODULES :
 * - payload / counters : décodage et conversion compteurs -> débits
 * - store / archiver   : persistance SQLite, rollups et rétention
 * - alerts             : règles, hystérésis et notifications
 * - ingest / query     : chemins d'écriture et de lecture
 * - http / mqtt        : surfaces de transport
 */

pub mod alerts;
pub mod archiver;
pub mod clock;
pub mod config;
pub mod counters;
pub mod health;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod mqtt;
pub mod payload;
pub mod query;
pub mod state;
pub mod store;

pub use alerts::{AlertEngine, AlertSink, NotificationEntry};
pub use archiver::Archiver;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use ingest::{IngestError, Ingestor};
pub use models::{Host, Sample, Tier, Timestamp};
pub use payload::AgentPayload;
pub use query::QueryService;
pub use store::TelemetryStore;
