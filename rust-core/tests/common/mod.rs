#![allow(dead_code)]

use fog_reputation::device::{Device, StaticDeviceRegistry};
use fog_reputation::ledger::{LedgerGateway, LocalLedger};
use fog_reputation::node::http::{FetchError, ServiceFetcher};
use fog_reputation::node::{Collaborators, Node, NodeConfig};
use fog_reputation::transaction::{Evaluation, Transaction};
use fog_reputation::transport::{
    device_reply_topic, device_topic, LocalBroker, LocalClient, MessageListener, PubSub,
    TransportError, QOS,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephem")
        .local_addr()
        .expect("local addr")
        .port()
}

/// Fast cadence for tests that drive operations by hand.
pub fn fast_config(node_id: &str) -> NodeConfig {
    let mut cfg = NodeConfig::new(node_id, "127.0.0.1");
    cfg.tasks.wait_device_response_ms = 150;
    cfg.tasks.device_response_tick_ms = 10;
    cfg.tasks.wait_nodes_responses_ms = 100;
    cfg.http.timeout_ms = 2_000;
    cfg
}

/// Evaluations of `subject` stored on the ledger, oldest first.
pub fn evaluations(ledger: &LocalLedger, subject: &str) -> Vec<Evaluation> {
    ledger
        .transactions_by_index(subject, true)
        .iter()
        .filter_map(|t| t.as_evaluation().cloned())
        .collect()
}

/// Evaluations of `subject` written by `source`.
pub fn evaluations_by(ledger: &LocalLedger, subject: &str, source: &str) -> Vec<f64> {
    evaluations(ledger, subject)
        .into_iter()
        .filter(|e| e.source == source)
        .map(|e| e.value)
        .collect()
}

pub fn seed_evaluation(ledger: &LocalLedger, subject: &str, value: f64) {
    ledger
        .put(Transaction::evaluation("seed", subject, value))
        .expect("seed evaluation");
}

pub fn thermometer_device(id: &str) -> Device {
    Device::new(id, &[("temperatureSensor", "THERMOMETER")])
}

/// Transport that counts subscribe calls per topic before handing them to a `LocalClient`.
pub struct CountingTransport {
    inner: LocalClient,
    subscribes: Mutex<HashMap<String, usize>>,
}

impl CountingTransport {
    pub fn new(inner: LocalClient) -> Self {
        Self {
            inner,
            subscribes: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribes.lock().values().sum()
    }

    pub fn subscribe_calls_for(&self, topic: &str) -> usize {
        self.subscribes.lock().get(topic).copied().unwrap_or(0)
    }
}

impl PubSub for CountingTransport {
    fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect()
    }
    fn disconnect(&self) {
        self.inner.disconnect()
    }
    fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), TransportError> {
        self.inner.publish(topic, payload, qos)
    }
    fn subscribe(
        &self,
        qos: u8,
        listener: Arc<dyn MessageListener>,
        topic: &str,
    ) -> Result<(), TransportError> {
        *self.subscribes.lock().entry(topic.to_string()).or_default() += 1;
        self.inner.subscribe(qos, listener, topic)
    }
    fn unsubscribe(&self, topic: &str) {
        self.inner.unsubscribe(topic)
    }
}

/// Fetcher answering from a fixed table keyed by peer ip; unknown peers fail.
#[derive(Default)]
pub struct StubFetcher {
    values: Mutex<HashMap<String, Option<String>>>,
    calls: Mutex<Vec<(String, String, String)>>,
    enable_calls: AtomicUsize,
    enable_fails: AtomicBool,
}

impl StubFetcher {
    pub fn answer(&self, peer_ip: &str, value: Option<&str>) {
        self.values
            .lock()
            .insert(peer_ip.to_string(), value.map(str::to_string));
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().clone()
    }

    /// Makes every `enable_device_page` call answer 500.
    pub fn fail_enable(&self, fail: bool) {
        self.enable_fails.store(fail, Ordering::SeqCst);
    }

    pub fn enable_calls(&self) -> usize {
        self.enable_calls.load(Ordering::SeqCst)
    }
}

impl ServiceFetcher for StubFetcher {
    fn enable_device_page(&self, _: &str, _: &str, _: &str) -> Result<(), FetchError> {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        if self.enable_fails.load(Ordering::SeqCst) {
            return Err(FetchError::Status(500));
        }
        Ok(())
    }

    fn fetch_sensor_value(
        &self,
        peer_ip: &str,
        device_id: &str,
        sensor_id: &str,
    ) -> Result<Option<String>, FetchError> {
        self.calls.lock().push((
            peer_ip.to_string(),
            device_id.to_string(),
            sensor_id.to_string(),
        ));
        match self.values.lock().get(peer_ip) {
            Some(v) => Ok(v.clone()),
            None => Err(FetchError::Status(503)),
        }
    }
}

/// Plays attached devices on the bus: answers `GET VALUE {sensor}` unless muted.
pub struct DeviceResponder {
    client: LocalClient,
    muted: AtomicBool,
    value: String,
}

impl DeviceResponder {
    pub fn start(broker: &Arc<LocalBroker>, device_ids: &[&str], value: &str) -> Arc<Self> {
        let client = broker.client();
        client.connect().expect("responder connect");
        let responder = Arc::new(Self {
            client,
            muted: AtomicBool::new(false),
            value: value.to_string(),
        });
        for id in device_ids {
            responder
                .client
                .subscribe(QOS, responder.clone(), &device_topic(id))
                .expect("responder subscribe");
        }
        responder
    }

    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.client.disconnect();
    }

    /// Publishes a reading as if the device spoke on its own.
    pub fn reply_now(&self, device_id: &str, sensor_id: &str) {
        let reply = json!({
            "METHOD": "GET",
            "HEADER": { "NAME": device_id },
            "BODY": { sensor_id: self.value.clone() },
        });
        let _ = self
            .client
            .publish(&device_reply_topic(device_id), reply.to_string().as_bytes(), QOS);
    }
}

impl MessageListener for DeviceResponder {
    fn message_arrived(&self, topic: &str, payload: &[u8]) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        let Some(device_id) = topic.strip_prefix("dev/") else {
            return;
        };
        let command = String::from_utf8_lossy(payload);
        let Some(sensor_id) = command.strip_prefix("GET VALUE ") else {
            return;
        };
        self.reply_now(device_id, sensor_id);
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub registry: Arc<StaticDeviceRegistry>,
}

/// Builds and connects a node (no periodic jobs) with the given devices already refreshed.
pub fn connected_node(
    cfg: NodeConfig,
    broker: &Arc<LocalBroker>,
    ledger: &Arc<LocalLedger>,
    devices: Vec<Device>,
    fetcher: Option<Arc<dyn ServiceFetcher>>,
) -> TestNode {
    let registry = Arc::new(StaticDeviceRegistry::new(devices));
    let node = Node::with_seed(
        cfg,
        Collaborators {
            transport: Arc::new(broker.client()),
            ledger: ledger.clone(),
            registry: registry.clone(),
            fetcher,
        },
        11,
    )
    .expect("build node");
    node.connect().expect("connect node");
    node.update_device_list().expect("initial device list");
    TestNode { node, registry }
}
