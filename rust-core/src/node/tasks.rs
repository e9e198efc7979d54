// Periodic jobs. Each job runs on its own thread: first run immediately, then once per period.
// Jobs hold a Weak reference to the node so a dropped node ends them.

use crate::node::node::Node;
use rand::seq::SliceRandom;
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handed to a running job; lets it sleep without outliving a shutdown.
pub struct TaskContext {
    name: String,
    stop: mpsc::Receiver<()>,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sleeps for `dur`. Returns false when the scheduler is shutting down.
    pub fn wait(&self, dur: Duration) -> bool {
        match self.stop.recv_timeout(dur) {
            Err(mpsc::RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => false,
        }
    }
}

struct Task {
    name: String,
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn every<F>(&mut self, name: &str, period: Duration, mut job: F)
    where
        F: FnMut(&TaskContext) + Send + 'static,
    {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let ctx = TaskContext {
            name: name.to_string(),
            stop: stop_rx,
        };
        let handle = thread::spawn(move || {
            loop {
                job(&ctx);
                if !ctx.wait(period) {
                    break;
                }
            }
            debug!(task = %ctx.name, "task stopped");
        });
        self.tasks.push(Task {
            name: name.to_string(),
            stop,
            handle,
        });
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Signals every job and waits for the ones currently running to return.
    pub fn shutdown(self) {
        // Dropping the senders disconnects every context, so all later waits return false.
        let mut running = Vec::with_capacity(self.tasks.len());
        for Task { name, stop, handle } in self.tasks {
            drop(stop);
            running.push((name, handle));
        }
        for (name, handle) in running {
            if handle.join().is_err() {
                warn!(task = %name, "task panicked");
            }
        }
    }
}

/// Registers the node's three recurring jobs.
pub(crate) fn schedule_node_tasks(node: &Arc<Node>) -> Scheduler {
    let tasks = node.config().tasks.clone();
    let mut scheduler = Scheduler::new();

    let weak = Arc::downgrade(node);
    scheduler.every("check-devices", tasks.check_devices(), move |_| {
        let Some(node) = weak.upgrade() else { return };
        if let Err(e) = node.update_device_list() {
            warn!(error = %e, "device list refresh failed; keeping previous list");
        }
    });

    let weak = Arc::downgrade(node);
    scheduler.every("request-data", tasks.request_data(), move |_| {
        let Some(node) = weak.upgrade() else { return };
        if let Err(e) = node.request_data_from_random_device() {
            warn!(error = %e, "device poll abandoned");
        }
    });

    let weak = Arc::downgrade(node);
    let window = tasks.wait_nodes_responses();
    scheduler.every("check-nodes-services", tasks.check_nodes_services(), move |ctx| {
        run_discovery_cycle(&weak, ctx, window);
    });

    info!(tasks = ?scheduler.task_names(), "node tasks scheduled");
    scheduler
}

fn run_discovery_cycle(weak: &Weak<Node>, ctx: &TaskContext, window: Duration) {
    let service = {
        let Some(node) = weak.upgrade() else { return };
        let choices = node.config().services_to_request();
        let Some(service) = node.with_rng(|rng| choices.choose(rng).copied()) else {
            return;
        };
        match node.request_node_services(service) {
            Ok(true) => service,
            Ok(false) => return,
            Err(e) => {
                warn!(%service, error = %e, "service query not submitted");
                return;
            }
        }
    };

    // Collect replies without pinning the node.
    if !ctx.wait(window) {
        return;
    }
    let Some(node) = weak.upgrade() else { return };
    node.close_collection_window();
    match node.use_node_service() {
        Ok(outcome) => debug!(%service, ?outcome, "discovery cycle finished"),
        Err(e) => warn!(%service, error = %e, "discovery cycle failed"),
    }
}
