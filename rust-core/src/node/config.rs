use crate::conduct::ConductType;
use crate::scoring::ReputationModel;
use crate::transaction::NodeServiceType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_ip: String,
    #[serde(default = "default_group")]
    pub node_group: String,
    #[serde(default)]
    pub conduct: ConductType,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub reputation: ReputationModel,
    #[serde(default)]
    pub reply_retention: ReplyRetention,
    /// Services this node asks peers for; empty means every known service.
    #[serde(default)]
    pub requested_services: Vec<NodeServiceType>,
}

fn default_group() -> String {
    "default".to_string()
}

/// What the collection window keeps when several qualifying replies arrive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyRetention {
    /// Every replying peer is ranked; a repeat reply from a peer replaces its earlier one.
    #[default]
    Accumulate,
    /// Only the most recent reply survives to ranking.
    KeepLatest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub check_devices_ms: u64,
    pub request_data_ms: u64,
    pub wait_device_response_ms: u64,
    pub device_response_tick_ms: u64,
    pub check_nodes_services_ms: u64,
    pub wait_nodes_responses_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            check_devices_ms: 5_000,
            request_data_ms: 30_000,
            wait_device_response_ms: 10_000,
            device_response_tick_ms: 1_000,
            check_nodes_services_ms: 45_000,
            wait_nodes_responses_ms: 10_000,
        }
    }
}

impl TaskConfig {
    pub fn check_devices(&self) -> Duration {
        Duration::from_millis(self.check_devices_ms)
    }

    pub fn request_data(&self) -> Duration {
        Duration::from_millis(self.request_data_ms)
    }

    pub fn wait_device_response(&self) -> Duration {
        Duration::from_millis(self.wait_device_response_ms)
    }

    pub fn device_response_tick(&self) -> Duration {
        Duration::from_millis(self.device_response_tick_ms)
    }

    pub fn check_nodes_services(&self) -> Duration {
        Duration::from_millis(self.check_nodes_services_ms)
    }

    pub fn wait_nodes_responses(&self) -> Duration {
        Duration::from_millis(self.wait_nodes_responses_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port peers serve device readings on.
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
    /// Where this node serves its own readings; `None` disables the server.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

fn default_http_port() -> u16 {
    8181
}

fn default_path_prefix() -> String {
    "/cxf/iot-service".to_string()
}

fn default_http_timeout() -> u64 {
    5_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            path_prefix: default_path_prefix(),
            timeout_ms: default_http_timeout(),
            listen_addr: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl NodeConfig {
    pub fn new(node_id: &str, node_ip: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_ip: node_ip.to_string(),
            node_group: default_group(),
            conduct: ConductType::default(),
            tasks: TaskConfig::default(),
            http: HttpConfig::default(),
            reputation: ReputationModel::default(),
            reply_retention: ReplyRetention::default(),
            requested_services: Vec::new(),
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let cfg: NodeConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.node_ip.trim().is_empty() {
            return Err(ConfigError::Invalid("node_ip must not be empty".into()));
        }
        let t = &self.tasks;
        let periods = [
            ("check_devices_ms", t.check_devices_ms),
            ("request_data_ms", t.request_data_ms),
            ("wait_device_response_ms", t.wait_device_response_ms),
            ("device_response_tick_ms", t.device_response_tick_ms),
            ("check_nodes_services_ms", t.check_nodes_services_ms),
            ("wait_nodes_responses_ms", t.wait_nodes_responses_ms),
        ];
        for (name, ms) in periods {
            if ms == 0 {
                return Err(ConfigError::Invalid(format!("tasks.{} must be > 0", name)));
            }
        }
        if let ReputationModel::Recency { decay } = self.reputation
            && !(decay > 0.0 && decay <= 1.0)
        {
            return Err(ConfigError::Invalid("reputation decay must be in (0, 1]".into()));
        }
        if !self.http.path_prefix.is_empty() && !self.http.path_prefix.starts_with('/') {
            return Err(ConfigError::Invalid("http.path_prefix must start with '/'".into()));
        }
        Ok(())
    }

    /// Services the discovery job chooses from.
    pub fn services_to_request(&self) -> Vec<NodeServiceType> {
        if self.requested_services.is_empty() {
            NodeServiceType::ALL.to_vec()
        } else {
            self.requested_services.clone()
        }
    }
}
