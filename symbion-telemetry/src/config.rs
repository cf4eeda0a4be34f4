use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const CONFIG_ENV: &str = "SYMBION_TELEMETRY_CONFIG";
pub const DEFAULT_TOPIC: &str = "symbion/telemetry/payload@v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub http: HttpConf,
    pub mqtt: Option<MqttConf>,
    pub storage: StorageConf,
    /// Clé partagée que chaque payload agent doit porter
    pub agent_key: Option<String>,
    pub slack: Option<SlackConf>,
    pub log_filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    /// Fichier SQLite, ou ":memory:"
    pub path: String,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { path: "./data/telemetry.db".into() }
    }
}

impl StorageConf {
    pub fn in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SlackConf {
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
}

impl TelemetryConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&txt)
    }
}

/// Charge la config depuis `SYMBION_TELEMETRY_CONFIG` (défaut telemetry.yaml).
/// Fichier absent ou invalide : config par défaut. Le logging n'est pas encore
/// installé à ce stade, d'où eprintln.
pub async fn load_config() -> TelemetryConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "telemetry.yaml".into());
    if !Path::new(&path).exists() {
        eprintln!("[telemetry] pas de {path}, usage config par défaut");
        return TelemetryConfig::default();
    }
    TelemetryConfig::from_file(&path).await.unwrap_or_else(|e| {
        eprintln!("[telemetry] config invalide: {e}");
        TelemetryConfig::default()
    })
}
