// Ledger record model: broadcast service queries, targeted service replies and evaluations.
// Records are immutable once built; the ledger only stores and indexes them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type Hash = [u8; 32];
pub type NodeId = String;

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Sensing services a node can offer or consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeServiceType {
    HumiditySensor,
    PulseOxymeter,
    Thermometer,
    WindDirectionSensor,
}

impl NodeServiceType {
    pub const ALL: [NodeServiceType; 4] = [
        NodeServiceType::HumiditySensor,
        NodeServiceType::PulseOxymeter,
        NodeServiceType::Thermometer,
        NodeServiceType::WindDirectionSensor,
    ];

    /// Wire name; also the sensor type string reported by devices.
    pub fn description(&self) -> &'static str {
        match self {
            NodeServiceType::HumiditySensor => "HUMIDITY_SENSOR",
            NodeServiceType::PulseOxymeter => "PULSE_OXYMETER",
            NodeServiceType::Thermometer => "THERMOMETER",
            NodeServiceType::WindDirectionSensor => "WIND_DIRECTION_SENSOR",
        }
    }

    pub fn from_description(description: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.description() == description)
    }

    /// Transaction type a provider uses to answer a query for this service.
    pub fn reply_type(&self) -> TransactionType {
        match self {
            NodeServiceType::HumiditySensor => TransactionType::RepSvcHumiditySensor,
            NodeServiceType::PulseOxymeter => TransactionType::RepSvcPulseOxymeter,
            NodeServiceType::Thermometer => TransactionType::RepSvcThermometer,
            NodeServiceType::WindDirectionSensor => TransactionType::RepSvcWindDirectionSensor,
        }
    }
}

impl fmt::Display for NodeServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    RepHasSvc,
    RepSvcHumiditySensor,
    RepSvcPulseOxymeter,
    RepSvcThermometer,
    RepSvcWindDirectionSensor,
    RepEvaluation,
}

impl TransactionType {
    /// Topics a node listens to: the broadcast query plus every reply type.
    pub const NODE_TOPICS: [TransactionType; 5] = [
        TransactionType::RepHasSvc,
        TransactionType::RepSvcHumiditySensor,
        TransactionType::RepSvcPulseOxymeter,
        TransactionType::RepSvcThermometer,
        TransactionType::RepSvcWindDirectionSensor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TransactionType::RepHasSvc => "REP_HAS_SVC",
            TransactionType::RepSvcHumiditySensor => "REP_SVC_HUMIDITY_SENSOR",
            TransactionType::RepSvcPulseOxymeter => "REP_SVC_PULSE_OXYMETER",
            TransactionType::RepSvcThermometer => "REP_SVC_THERMOMETER",
            TransactionType::RepSvcWindDirectionSensor => "REP_SVC_WIND_DIRECTION_SENSOR",
            TransactionType::RepEvaluation => "REP_EVALUATION",
        }
    }

    pub fn is_service_reply(&self) -> bool {
        !matches!(
            self,
            TransactionType::RepHasSvc | TransactionType::RepEvaluation
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSensorId {
    pub device_id: String,
    pub sensor_id: String,
}

impl DeviceSensorId {
    pub fn new(device_id: impl Into<String>, sensor_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
        }
    }
}

/// Broadcast query: "who offers `service`?"
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HasReputationService {
    pub source: NodeId,
    pub group: String,
    pub service: String,
}

/// Targeted reply listing the provider's matching (device, sensor) pairs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReputationService {
    pub source: NodeId,
    pub source_ip: String,
    pub target: NodeId,
    pub services: Vec<DeviceSensorId>,
    pub group: String,
    pub service_type: TransactionType,
}

/// Evaluation of a subject (peer node or device) by an evaluator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub source: NodeId,
    pub target: String,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    HasReputationService(HasReputationService),
    ReputationService(ReputationService),
    Evaluation(Evaluation),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub timestamp_ms: u64,
    /// Per-process sequence; keeps identical records in the same millisecond distinct.
    #[serde(default)]
    pub nonce: u64,
    pub payload: Payload,
}

impl Transaction {
    pub fn new(payload: Payload) -> Self {
        Self {
            timestamp_ms: now_ms(),
            nonce: NONCE.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }

    pub fn has_service(source: &str, group: &str, service: NodeServiceType) -> Self {
        Self::new(Payload::HasReputationService(HasReputationService {
            source: source.to_string(),
            group: group.to_string(),
            service: service.description().to_string(),
        }))
    }

    pub fn evaluation(source: &str, target: &str, value: f64) -> Self {
        Self::new(Payload::Evaluation(Evaluation {
            source: source.to_string(),
            target: target.to_string(),
            value,
        }))
    }

    pub fn source(&self) -> &str {
        match &self.payload {
            Payload::HasReputationService(t) => &t.source,
            Payload::ReputationService(t) => &t.source,
            Payload::Evaluation(t) => &t.source,
        }
    }

    pub fn tx_type(&self) -> TransactionType {
        match &self.payload {
            Payload::HasReputationService(_) => TransactionType::RepHasSvc,
            Payload::ReputationService(t) => t.service_type,
            Payload::Evaluation(_) => TransactionType::RepEvaluation,
        }
    }

    /// Addressee of targeted records; broadcast queries have none.
    pub fn target(&self) -> Option<&str> {
        match &self.payload {
            Payload::HasReputationService(_) => None,
            Payload::ReputationService(t) => Some(&t.target),
            Payload::Evaluation(t) => Some(&t.target),
        }
    }

    /// Ledger index: evaluations by subject, everything else by type name.
    pub fn index(&self) -> String {
        match &self.payload {
            Payload::Evaluation(e) => e.target.clone(),
            _ => self.tx_type().name().to_string(),
        }
    }

    pub fn as_evaluation(&self) -> Option<&Evaluation> {
        match &self.payload {
            Payload::Evaluation(e) => Some(e),
            _ => None,
        }
    }
}

/// Canonical hash: sha256 over the JSON encoding.
pub fn hash_transaction(tx: &Transaction) -> Hash {
    let bytes = serde_json::to_vec(tx).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

pub(crate) fn now_ms() -> u64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    dur.as_millis() as u64
}
