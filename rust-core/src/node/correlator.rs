// Device-read correlation: one pending read at a time, raced by a watchdog and the reply listener.
// Whoever takes the pending slot first decides the outcome; the loser finds the slot empty.

use crate::conduct::Conduct;
use crate::node::readings::ReadingCache;
use crate::transport::MessageListener;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Evaluation recorded when a device answers in time.
pub const ANSWERED: f64 = 1.0;
/// Evaluation recorded when it does not.
pub const UNANSWERED: f64 = 0.0;

struct PendingRead {
    request_id: u64,
    device_id: String,
    cancel: mpsc::Sender<()>,
}

pub struct DeviceCorrelator {
    conduct: Arc<Conduct>,
    tick: Duration,
    deadline: Duration,
    pending: Arc<Mutex<Option<PendingRead>>>,
    next_request: AtomicU64,
}

impl DeviceCorrelator {
    pub fn new(conduct: Arc<Conduct>, tick: Duration, deadline: Duration) -> Self {
        Self {
            conduct,
            tick,
            deadline,
            pending: Arc::new(Mutex::new(None)),
            next_request: AtomicU64::new(1),
        }
    }

    /// Starts watching a read of `device_id`. A read still pending is resolved negatively first.
    pub fn arm(&self, device_id: &str) -> u64 {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = mpsc::channel::<()>();
        let superseded = self.pending.lock().replace(PendingRead {
            request_id,
            device_id: device_id.to_string(),
            cancel,
        });
        if let Some(old) = superseded {
            let _ = old.cancel.send(());
            info!(device = %old.device_id, request = old.request_id, "previous read superseded without reply");
            record(&self.conduct, &old.device_id, UNANSWERED);
        }

        let pending = Arc::clone(&self.pending);
        let conduct = Arc::clone(&self.conduct);
        let tick = self.tick;
        let deadline = self.deadline;
        thread::spawn(move || watchdog(request_id, pending, conduct, cancelled, tick, deadline));
        debug!(device = device_id, request = request_id, "device read armed");
        request_id
    }

    /// Resolves the pending read of `device_id` positively. False when nothing was waiting for it.
    pub fn complete(&self, device_id: &str) -> bool {
        let taken = {
            let mut slot = self.pending.lock();
            match slot.as_ref() {
                Some(p) if p.device_id == device_id => slot.take(),
                _ => None,
            }
        };
        let Some(read) = taken else {
            return false;
        };
        let _ = read.cancel.send(());
        debug!(device = device_id, request = read.request_id, "device answered");
        record(&self.conduct, device_id, ANSWERED);
        true
    }

    /// Drops the pending read `request_id` with no evaluation.
    pub fn disarm(&self, request_id: u64) -> bool {
        let taken = {
            let mut slot = self.pending.lock();
            match slot.as_ref() {
                Some(p) if p.request_id == request_id => slot.take(),
                _ => None,
            }
        };
        match taken {
            Some(read) => {
                let _ = read.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Drops whatever read is pending, with no evaluation.
    pub fn cancel_all(&self) {
        if let Some(read) = self.pending.lock().take() {
            let _ = read.cancel.send(());
            debug!(device = %read.device_id, "pending device read cancelled");
        }
    }

    pub fn pending_device(&self) -> Option<String> {
        self.pending.lock().as_ref().map(|p| p.device_id.clone())
    }
}

fn watchdog(
    request_id: u64,
    pending: Arc<Mutex<Option<PendingRead>>>,
    conduct: Arc<Conduct>,
    cancelled: mpsc::Receiver<()>,
    tick: Duration,
    deadline: Duration,
) {
    let started = Instant::now();
    loop {
        match cancelled.recv_timeout(tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        if started.elapsed() < deadline {
            continue;
        }
        let expired = {
            let mut slot = pending.lock();
            match slot.as_ref() {
                Some(p) if p.request_id == request_id => slot.take(),
                _ => None,
            }
        };
        if let Some(read) = expired {
            info!(device = %read.device_id, request = request_id, "device did not answer in time");
            record(&conduct, &read.device_id, UNANSWERED);
        }
        return;
    }
}

fn record(conduct: &Conduct, device_id: &str, value: f64) {
    if let Err(e) = conduct.evaluate_device(device_id, value) {
        warn!(device = device_id, error = %e, "device evaluation lost");
    }
}

/// Listener on `dev/{id}/RES` topics.
pub struct DeviceListener {
    correlator: Arc<DeviceCorrelator>,
    readings: Arc<ReadingCache>,
}

impl DeviceListener {
    pub fn new(correlator: Arc<DeviceCorrelator>, readings: Arc<ReadingCache>) -> Self {
        Self {
            correlator,
            readings,
        }
    }
}

impl MessageListener for DeviceListener {
    fn message_arrived(&self, topic: &str, payload: &[u8]) {
        let msg: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(topic, error = %e, "undecodable device reply");
                return;
            }
        };
        if msg.get("METHOD").and_then(Value::as_str) != Some("GET") {
            return;
        }
        let Some(device_id) = msg.pointer("/HEADER/NAME").and_then(Value::as_str) else {
            debug!(topic, "device reply without HEADER.NAME");
            return;
        };
        if let Some(body) = msg.get("BODY") {
            self.readings.record_body(device_id, body);
        }
        if !self.correlator.complete(device_id) {
            debug!(device = device_id, "unsolicited device reply; reading cached only");
        }
    }
}
