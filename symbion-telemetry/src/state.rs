use parking_lot::Mutex;
use std::sync::Arc;

use crate::alerts::AlertEngine;
use crate::health::HealthTracker;
use crate::ingest::Ingestor;
use crate::query::QueryService;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Services partagés par les surfaces HTTP et MQTT
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub query: Arc<QueryService>,
    pub alerts: Arc<AlertEngine>,
    pub health: HealthTracker,
}
