// Node orchestrator: owns protocol state and drives the discovery/evaluation cycle.
//
// Two independent locks:
// - `devices` guards the attached device list, its count and the subscribed-topic set;
// - `discovery` guards the cycle marker, the window flag and the pending replies.
// Neither is held across a ledger put, a transport call or an HTTP fetch.
// `refresh` only serializes device-list refreshes with each other and with `stop`.

use crate::conduct::{Conduct, ConductType};
use crate::device::{dedupe_devices, Device, DeviceRegistry, RegistryError};
use crate::ledger::{LedgerError, LedgerGateway, LedgerSubscriber};
use crate::node::config::{ConfigError, NodeConfig, ReplyRetention};
use crate::node::correlator::{DeviceCorrelator, DeviceListener};
use crate::node::http::{
    start_reading_server, FetchError, HttpServiceFetcher, ReadingServer, ServiceFetcher,
};
use crate::node::readings::ReadingCache;
use crate::node::tasks::{schedule_node_tasks, Scheduler};
use crate::scoring::{evaluations_of, select_highest, RankingError, ReputationCalc, ThingReputation};
use crate::transaction::{
    DeviceSensorId, NodeServiceType, Payload, ReputationService, Transaction, TransactionType,
};
use crate::transport::{device_reply_topic, device_topic, MessageListener, PubSub, TransportError, QOS};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("ranking defect: {0}")]
    Ranking(#[from] RankingError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// External collaborators a node is wired to.
pub struct Collaborators {
    pub transport: Arc<dyn PubSub>,
    pub ledger: Arc<dyn LedgerGateway>,
    pub registry: Arc<dyn DeviceRegistry>,
    /// `None` builds an HTTP fetcher from the node's `http` config.
    pub fetcher: Option<Arc<dyn ServiceFetcher>>,
}

#[derive(Default)]
struct DeviceTable {
    devices: Vec<Device>,
    amount_devices: usize,
    subscribed: HashSet<String>,
}

#[derive(Default)]
struct DiscoveryState {
    /// Service of the active cycle; `Some` exactly while a cycle is requesting.
    cycle: Option<NodeServiceType>,
    can_receive: bool,
    pending: Vec<ReputationService>,
}

/// Changes applied by one device-list refresh.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceRefresh {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub amount_devices: usize,
}

/// A read command that reached the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRead {
    pub request_id: u64,
    pub device_id: String,
    pub sensor_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServiceOutcome {
    /// `use_node_service` ran with no active cycle.
    NoCycle,
    /// The window closed with no qualifying reply.
    NoReplies,
    Evaluated {
        provider: String,
        device: DeviceSensorId,
        value: f64,
        /// False when the evaluation was withheld by conduct or lost on submission.
        recorded: bool,
    },
}

pub struct Node {
    config: NodeConfig,
    transport: Arc<dyn PubSub>,
    ledger: Arc<dyn LedgerGateway>,
    registry: Arc<dyn DeviceRegistry>,
    fetcher: Arc<dyn ServiceFetcher>,
    conduct: Arc<Conduct>,
    reputation: Box<dyn ReputationCalc>,
    readings: Arc<ReadingCache>,
    correlator: Arc<DeviceCorrelator>,
    device_listener: Arc<dyn MessageListener>,
    devices: Mutex<DeviceTable>,
    discovery: Mutex<DiscoveryState>,
    refresh: Mutex<()>,
    rng: Mutex<StdRng>,
    ledger_handle: Mutex<Option<Arc<dyn LedgerSubscriber>>>,
    scheduler: Mutex<Option<Scheduler>>,
    reading_server: Mutex<Option<ReadingServer>>,
}

impl Node {
    pub fn new(config: NodeConfig, parts: Collaborators) -> Result<Arc<Self>, NodeError> {
        Self::build(config, parts, StdRng::from_entropy())
    }

    /// Same as `new`, with reproducible random choices.
    pub fn with_seed(config: NodeConfig, parts: Collaborators, seed: u64) -> Result<Arc<Self>, NodeError> {
        Self::build(config, parts, StdRng::seed_from_u64(seed))
    }

    fn build(config: NodeConfig, parts: Collaborators, rng: StdRng) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let fetcher: Arc<dyn ServiceFetcher> = match parts.fetcher {
            Some(f) => f,
            None => Arc::new(HttpServiceFetcher::new(&config.http)?),
        };
        let conduct = Arc::new(Conduct::new(
            config.conduct,
            Arc::clone(&parts.ledger),
            &config.node_id,
        ));
        let readings = Arc::new(ReadingCache::new());
        let correlator = Arc::new(DeviceCorrelator::new(
            Arc::clone(&conduct),
            config.tasks.device_response_tick(),
            config.tasks.wait_device_response(),
        ));
        let device_listener: Arc<dyn MessageListener> = Arc::new(DeviceListener::new(
            Arc::clone(&correlator),
            Arc::clone(&readings),
        ));
        let reputation = config.reputation.build();

        Ok(Arc::new(Self {
            config,
            transport: parts.transport,
            ledger: parts.ledger,
            registry: parts.registry,
            fetcher,
            conduct,
            reputation,
            readings,
            correlator,
            device_listener,
            devices: Mutex::new(DeviceTable::default()),
            discovery: Mutex::new(DiscoveryState::default()),
            refresh: Mutex::new(()),
            rng: Mutex::new(rng),
            ledger_handle: Mutex::new(None),
            scheduler: Mutex::new(None),
            reading_server: Mutex::new(None),
        }))
    }

    /// Connects and subscribes, then schedules the periodic jobs.
    pub fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        self.connect()?;
        self.spawn_tasks();
        Ok(())
    }

    /// Connects the transport, starts the reading server and subscribes to ledger topics.
    /// No periodic job runs until `spawn_tasks`.
    pub fn connect(self: &Arc<Self>) -> Result<(), NodeError> {
        self.transport.connect()?;

        if let Some(addr) = &self.config.http.listen_addr {
            let server = start_reading_server(
                addr,
                Arc::clone(&self.readings),
                &self.config.http.path_prefix,
            )?;
            *self.reading_server.lock() = Some(server);
        }

        let handler: Arc<dyn LedgerSubscriber> = Arc::clone(self) as Arc<dyn LedgerSubscriber>;
        for topic in TransactionType::NODE_TOPICS {
            self.ledger.subscribe(topic.name(), Arc::clone(&handler));
        }
        *self.ledger_handle.lock() = Some(handler);

        info!(
            node = %self.config.node_id,
            group = %self.config.node_group,
            conduct = %self.conduct.conduct_type(),
            "node started"
        );
        Ok(())
    }

    pub fn spawn_tasks(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock();
        if slot.is_none() {
            *slot = Some(schedule_node_tasks(self));
        }
    }

    /// Halts jobs, drops every subscription and disconnects. A pending device read ends with no outcome.
    pub fn stop(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }

        {
            let _refresh = self.refresh.lock();
            let topics: Vec<String> = self.devices.lock().subscribed.drain().collect();
            for id in &topics {
                self.transport.unsubscribe(&device_reply_topic(id));
            }
        }

        if let Some(handler) = self.ledger_handle.lock().take() {
            for topic in TransactionType::NODE_TOPICS {
                self.ledger.unsubscribe(topic.name(), &handler);
            }
        }

        self.correlator.cancel_all();
        self.reset_discovery();
        let server = self.reading_server.lock().take();
        if let Some(server) = server {
            server.shutdown();
        }
        self.transport.disconnect();
        info!(node = %self.config.node_id, "node stopped");
    }

    /// Refetches the registry and swaps the list in; newly seen devices get their reply topic subscribed.
    /// A registry failure leaves the current list untouched.
    pub fn update_device_list(&self) -> Result<DeviceRefresh, NodeError> {
        let _refresh = self.refresh.lock();
        let fetched = dedupe_devices(self.registry.all_devices()?);

        let (to_subscribe, to_unsubscribe, amount) = {
            let mut table = self.devices.lock();
            let current: HashSet<&str> = fetched.iter().map(|d| d.id.as_str()).collect();
            let to_subscribe: Vec<String> = fetched
                .iter()
                .filter(|d| !table.subscribed.contains(&d.id))
                .map(|d| d.id.clone())
                .collect();
            let to_unsubscribe: Vec<String> = table
                .subscribed
                .iter()
                .filter(|id| !current.contains(id.as_str()))
                .cloned()
                .collect();
            for id in &to_subscribe {
                table.subscribed.insert(id.clone());
            }
            for id in &to_unsubscribe {
                table.subscribed.remove(id);
            }
            table.amount_devices = fetched.len();
            table.devices = fetched;
            (to_subscribe, to_unsubscribe, table.amount_devices)
        };

        let mut subscribed = Vec::with_capacity(to_subscribe.len());
        for id in to_subscribe {
            let topic = device_reply_topic(&id);
            match self
                .transport
                .subscribe(QOS, Arc::clone(&self.device_listener), &topic)
            {
                Ok(()) => {
                    debug!(device = %id, %topic, "subscribed to device replies");
                    subscribed.push(id);
                }
                Err(e) => {
                    // Retried on the next refresh.
                    warn!(device = %id, error = %e, "device reply subscription failed");
                    self.devices.lock().subscribed.remove(&id);
                }
            }
        }
        for id in &to_unsubscribe {
            self.transport.unsubscribe(&device_reply_topic(id));
        }
        if !to_unsubscribe.is_empty() {
            let attached = self.attached_ids();
            self.readings.retain_devices(|d| attached.contains(d));
        }

        if !subscribed.is_empty() || !to_unsubscribe.is_empty() {
            info!(
                amount_devices = amount,
                added = subscribed.len(),
                removed = to_unsubscribe.len(),
                "device list updated"
            );
        }
        Ok(DeviceRefresh {
            subscribed,
            unsubscribed: to_unsubscribe,
            amount_devices: amount,
        })
    }

    /// Polls one sensor of one device, both chosen uniformly. `None` when there is nothing to poll.
    pub fn request_data_from_random_device(&self) -> Result<Option<DeviceRead>, NodeError> {
        let picked = {
            let table = self.devices.lock();
            if table.devices.is_empty() {
                warn!("no devices connected; nothing to poll");
                return Ok(None);
            }
            let mut rng = self.rng.lock();
            let device = &table.devices[rng.gen_range(0..table.devices.len())];
            if device.sensors.is_empty() {
                warn!(device = %device.id, "device reports no sensors");
                return Ok(None);
            }
            let sensor = &device.sensors[rng.gen_range(0..device.sensors.len())];
            (device.id.clone(), sensor.id.clone())
        };
        let (device_id, sensor_id) = picked;

        // Armed before publishing so a fast reply finds the pending read.
        let request_id = self.correlator.arm(&device_id);
        let command = format!("GET VALUE {}", sensor_id);
        if let Err(e) = self
            .transport
            .publish(&device_topic(&device_id), command.as_bytes(), QOS)
        {
            self.correlator.disarm(request_id);
            return Err(e.into());
        }
        debug!(device = %device_id, sensor = %sensor_id, request = request_id, "device read requested");
        Ok(Some(DeviceRead {
            request_id,
            device_id,
            sensor_id,
        }))
    }

    /// Answers a peer's query when at least one attached sensor provides `service`.
    /// Returns whether a reply was submitted.
    pub fn publish_node_services(&self, service: &str, requester: &str) -> Result<bool, NodeError> {
        let Some(service_type) = NodeServiceType::from_description(service) else {
            debug!(service, requester, "unknown service type; query ignored");
            return Ok(false);
        };

        let services: Vec<DeviceSensorId> = {
            let table = self.devices.lock();
            table
                .devices
                .iter()
                .flat_map(|d| {
                    d.sensors_of_type(service_type.description())
                        .map(move |s| DeviceSensorId::new(d.id.clone(), s.id.clone()))
                })
                .collect()
        };
        if services.is_empty() {
            debug!(%service_type, requester, "no attached sensor offers the service");
            return Ok(false);
        }

        let count = services.len();
        let reply = Transaction::new(Payload::ReputationService(ReputationService {
            source: self.config.node_id.clone(),
            source_ip: self.config.node_ip.clone(),
            target: requester.to_string(),
            services,
            group: self.config.node_group.clone(),
            service_type: service_type.reply_type(),
        }));
        self.ledger.put(reply)?;
        info!(%service_type, requester, sensors = count, "service offer published");
        Ok(true)
    }

    /// Opens a discovery cycle for `service` and broadcasts the query.
    /// Returns false when another cycle is still active.
    pub fn request_node_services(&self, service: NodeServiceType) -> Result<bool, NodeError> {
        {
            let mut d = self.discovery.lock();
            if let Some(active) = d.cycle {
                debug!(requested = %service, %active, "discovery cycle already active");
                return Ok(false);
            }
            d.cycle = Some(service);
            d.can_receive = true;
            d.pending.clear();
        }

        let query = Transaction::has_service(&self.config.node_id, &self.config.node_group, service);
        if let Err(e) = self.ledger.put(query) {
            self.reset_discovery();
            return Err(e.into());
        }
        info!(%service, "service query broadcast");
        Ok(true)
    }

    /// Stops accepting replies for the active cycle.
    pub fn close_collection_window(&self) {
        self.discovery.lock().can_receive = false;
    }

    /// Ranks the collected replies, fetches from the winner and records the outcome.
    /// The cycle is reset whatever happens.
    pub fn use_node_service(&self) -> Result<ServiceOutcome, NodeError> {
        let (service, replies) = {
            let mut d = self.discovery.lock();
            d.can_receive = false;
            (d.cycle, std::mem::take(&mut d.pending))
        };
        let Some(service) = service else {
            return Ok(ServiceOutcome::NoCycle);
        };
        let result = self.select_and_evaluate(service, replies);
        self.reset_discovery();
        result
    }

    fn select_and_evaluate(
        &self,
        service: NodeServiceType,
        replies: Vec<ReputationService>,
    ) -> Result<ServiceOutcome, NodeError> {
        let replies: Vec<ReputationService> =
            replies.into_iter().filter(|r| !r.services.is_empty()).collect();
        if replies.is_empty() {
            info!(%service, "no peer offered the service");
            return Ok(ServiceOutcome::NoReplies);
        }

        let peers: Vec<ThingReputation> = replies
            .iter()
            .map(|r| ThingReputation::new(r.source.clone(), self.reputation_of(&r.source)))
            .collect();
        let provider_id = self.pick(&peers)?;
        let Some(reply) = replies.iter().find(|r| r.source == provider_id) else {
            error!(provider = %provider_id, "ranked provider missing from replies");
            return Err(RankingError::NoCandidates.into());
        };

        let device = if reply.services.len() == 1 {
            reply.services[0].clone()
        } else {
            let candidates: Vec<ThingReputation> = reply
                .services
                .iter()
                .map(|s| ThingReputation::new(device_key(s), self.reputation_of(&s.device_id)))
                .collect();
            let key = self.pick(&candidates)?;
            match reply.services.iter().find(|s| device_key(s) == key) {
                Some(s) => s.clone(),
                None => return Err(RankingError::NoCandidates.into()),
            }
        };
        info!(
            %service,
            provider = %reply.source,
            device = %device.device_id,
            sensor = %device.sensor_id,
            "service provider selected"
        );

        let value = self.fetch_and_score(&reply.source_ip, &device);
        let recorded = match self.evaluate_service_provider(&reply.source, value) {
            Ok(()) => self.conduct.conduct_type() != ConductType::Selfish,
            Err(e) => {
                warn!(provider = %reply.source, error = %e, "provider evaluation lost");
                false
            }
        };
        Ok(ServiceOutcome::Evaluated {
            provider: reply.source.clone(),
            device,
            value,
            recorded,
        })
    }

    fn pick(&self, candidates: &[ThingReputation]) -> Result<String, NodeError> {
        let mut rng = self.rng.lock();
        match select_highest(candidates, &mut *rng) {
            Ok(winner) => Ok(winner.thing_id.clone()),
            Err(e) => {
                error!(error = %e, candidates = candidates.len(), "ranking produced no winner");
                Err(e.into())
            }
        }
    }

    /// 1 when the peer returned a value, 0 for the null sentinel or any failure.
    fn fetch_and_score(&self, peer_ip: &str, device: &DeviceSensorId) -> f64 {
        if let Err(e) = self
            .fetcher
            .enable_device_page(peer_ip, &device.device_id, &device.sensor_id)
        {
            warn!(peer_ip, device = %device.device_id, error = %e, "could not enable device page");
        }
        match self
            .fetcher
            .fetch_sensor_value(peer_ip, &device.device_id, &device.sensor_id)
        {
            Ok(Some(value)) => {
                debug!(peer_ip, device = %device.device_id, %value, "sensor value received");
                1.0
            }
            Ok(None) => {
                info!(peer_ip, device = %device.device_id, "peer has no value for the sensor");
                0.0
            }
            Err(e) => {
                warn!(peer_ip, device = %device.device_id, error = %e, "sensor fetch failed");
                0.0
            }
        }
    }

    /// Records an evaluation of a provider through this node's conduct.
    pub fn evaluate_service_provider(&self, provider_id: &str, value: f64) -> Result<(), NodeError> {
        self.conduct.evaluate_device(provider_id, value)?;
        Ok(())
    }

    /// Current score of `subject` from its evaluation history, newest first.
    pub fn reputation_of(&self, subject: &str) -> f64 {
        let history = evaluations_of(&self.ledger.transactions_by_index(subject, false));
        self.reputation.calc(&history)
    }

    fn accept_reply(&self, reply: &ReputationService) {
        if reply.target != self.node_id() {
            return;
        }
        if !reply.service_type.is_service_reply() {
            debug!(from = %reply.source, got = %reply.service_type, "malformed service reply");
            return;
        }
        let mut d = self.discovery.lock();
        let Some(expected) = d.cycle else {
            debug!(from = %reply.source, "reply outside a discovery cycle");
            return;
        };
        if !d.can_receive {
            debug!(from = %reply.source, "reply after the window closed");
            return;
        }
        if reply.service_type != expected.reply_type() {
            debug!(from = %reply.source, got = %reply.service_type, "reply for another service");
            return;
        }
        match self.config.reply_retention {
            ReplyRetention::KeepLatest => d.pending.clear(),
            ReplyRetention::Accumulate => d.pending.retain(|r| r.source != reply.source),
        }
        d.pending.push(reply.clone());
        debug!(from = %reply.source, pending = d.pending.len(), "service reply collected");
    }

    fn reset_discovery(&self) {
        let mut d = self.discovery.lock();
        d.cycle = None;
        d.can_receive = false;
        d.pending.clear();
    }

    fn attached_ids(&self) -> HashSet<String> {
        self.devices.lock().devices.iter().map(|d| d.id.clone()).collect()
    }

    pub(crate) fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock();
        f(&mut *rng)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.lock().devices.clone()
    }

    pub fn amount_devices(&self) -> usize {
        self.devices.lock().amount_devices
    }

    pub fn is_requesting_node_services(&self) -> bool {
        self.discovery.lock().cycle.is_some()
    }

    pub fn last_requested_service(&self) -> Option<NodeServiceType> {
        self.discovery.lock().cycle
    }

    pub fn can_receive_nodes_response(&self) -> bool {
        self.discovery.lock().can_receive
    }

    pub fn pending_replies(&self) -> Vec<ReputationService> {
        self.discovery.lock().pending.clone()
    }

    pub fn readings(&self) -> &Arc<ReadingCache> {
        &self.readings
    }

    pub fn pending_device_read(&self) -> Option<String> {
        self.correlator.pending_device()
    }

    pub fn reading_server_addr(&self) -> Option<std::net::SocketAddr> {
        self.reading_server.lock().as_ref().map(ReadingServer::addr)
    }
}

impl LedgerSubscriber for Node {
    fn update(&self, tx: &Transaction) {
        if tx.source() == self.node_id() {
            return;
        }
        match &tx.payload {
            Payload::HasReputationService(query) => {
                if let Err(e) = self.publish_node_services(&query.service, &query.source) {
                    warn!(requester = %query.source, error = %e, "service offer not published");
                }
            }
            Payload::ReputationService(reply) => self.accept_reply(reply),
            Payload::Evaluation(_) => {}
        }
    }
}

fn device_key(s: &DeviceSensorId) -> String {
    format!("{}@{}", s.device_id, s.sensor_id)
}
