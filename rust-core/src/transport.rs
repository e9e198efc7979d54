// Publish/subscribe transport used to talk to devices.
// LocalBroker is an in-process bus: exact topic match, one delivery thread, no cross-topic ordering.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use thiserror::Error;
use tracing::{debug, info};

pub const QOS: u8 = 1;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Failed(String),
}

pub trait MessageListener: Send + Sync {
    fn message_arrived(&self, topic: &str, payload: &[u8]);
}

pub trait PubSub: Send + Sync {
    fn connect(&self) -> Result<(), TransportError>;
    fn disconnect(&self);
    fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), TransportError>;
    fn subscribe(
        &self,
        qos: u8,
        listener: Arc<dyn MessageListener>,
        topic: &str,
    ) -> Result<(), TransportError>;
    fn unsubscribe(&self, topic: &str);
}

/// Device command topic.
pub fn device_topic(device_id: &str) -> String {
    format!("dev/{}", device_id)
}

/// Topic a device answers on.
pub fn device_reply_topic(device_id: &str) -> String {
    format!("dev/{}/RES", device_id)
}

struct Route {
    client_id: u64,
    listener: Arc<dyn MessageListener>,
}

struct Envelope {
    topic: String,
    payload: Vec<u8>,
}

/// Shared in-process bus. Clients obtained from `client()` are independent connections.
pub struct LocalBroker {
    routes: Arc<Mutex<HashMap<String, Vec<Route>>>>,
    tx: Mutex<mpsc::Sender<Envelope>>,
    next_client: AtomicU64,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        let routes: Arc<Mutex<HashMap<String, Vec<Route>>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<Envelope>();
        let delivery = Arc::clone(&routes);
        thread::spawn(move || {
            while let Ok(env) = rx.recv() {
                let listeners: Vec<Arc<dyn MessageListener>> = delivery
                    .lock()
                    .get(&env.topic)
                    .map(|r| r.iter().map(|r| Arc::clone(&r.listener)).collect())
                    .unwrap_or_default();
                for l in listeners {
                    l.message_arrived(&env.topic, &env.payload);
                }
            }
        });
        Arc::new(Self {
            routes,
            tx: Mutex::new(tx),
            next_client: AtomicU64::new(1),
        })
    }

    pub fn client(self: &Arc<Self>) -> LocalClient {
        LocalClient {
            broker: Arc::clone(self),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }

    /// Number of listeners on `topic`, across all clients.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.routes.lock().get(topic).map_or(0, Vec::len)
    }

    fn route(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.tx
            .lock()
            .send(Envelope {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::Failed("broker delivery thread gone".into()))
    }
}

pub struct LocalClient {
    broker: Arc<LocalBroker>,
    client_id: u64,
    connected: AtomicBool,
}

impl LocalClient {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl PubSub for LocalClient {
    fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        info!(client = self.client_id, "transport connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut routes = self.broker.routes.lock();
        for list in routes.values_mut() {
            list.retain(|r| r.client_id != self.client_id);
        }
        routes.retain(|_, list| !list.is_empty());
        info!(client = self.client_id, "transport disconnected");
    }

    fn publish(&self, topic: &str, payload: &[u8], _qos: u8) -> Result<(), TransportError> {
        self.ensure_connected()?;
        debug!(topic, bytes = payload.len(), "publish");
        self.broker.route(topic, payload)
    }

    fn subscribe(
        &self,
        _qos: u8,
        listener: Arc<dyn MessageListener>,
        topic: &str,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.broker
            .routes
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Route {
                client_id: self.client_id,
                listener,
            });
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) {
        let mut routes = self.broker.routes.lock();
        if let Some(list) = routes.get_mut(topic) {
            list.retain(|r| r.client_id != self.client_id);
            if list.is_empty() {
                routes.remove(topic);
            }
        }
    }
}
