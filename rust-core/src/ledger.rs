// Ledger gateway: submit, subscribe by transaction type, query by index.
// LocalLedger is an in-process implementation; delivery to subscribers runs on its own thread.

use crate::storage::{LedgerStore, StorageError};
use crate::transaction::{hash_transaction, Hash, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger submission interrupted: {0}")]
    Interrupted(String),
    #[error("duplicate transaction {0}")]
    Duplicate(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Receives transactions of the types it subscribed to.
pub trait LedgerSubscriber: Send + Sync {
    fn update(&self, tx: &Transaction);
}

pub trait LedgerGateway: Send + Sync {
    fn put(&self, tx: Transaction) -> Result<Hash, LedgerError>;
    fn subscribe(&self, type_name: &str, handler: Arc<dyn LedgerSubscriber>);
    fn unsubscribe(&self, type_name: &str, handler: &Arc<dyn LedgerSubscriber>);
    /// Transactions stored under `index`, oldest first when `ascending`.
    fn transactions_by_index(&self, index: &str, ascending: bool) -> Vec<Transaction>;
}

type Subscribers = HashMap<String, Vec<Arc<dyn LedgerSubscriber>>>;

struct LedgerState {
    txs: HashMap<Hash, Transaction>,
    by_index: HashMap<String, Vec<Hash>>,
    store: Option<LedgerStore>,
}

impl LedgerState {
    fn insert(&mut self, hash: Hash, tx: Transaction) {
        self.by_index.entry(tx.index()).or_default().push(hash);
        self.txs.insert(hash, tx);
    }
}

pub struct LocalLedger {
    state: Mutex<LedgerState>,
    subscribers: Arc<Mutex<Subscribers>>,
    dispatch: Mutex<Option<mpsc::Sender<Transaction>>>,
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::with_store(None, Vec::new())
    }

    /// Opens a persistent ledger, replaying whatever the directory already holds.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, LedgerError> {
        let store = LedgerStore::new(data_dir)?;
        let history = store.load()?;
        store.compact(&history)?;
        Ok(Self::with_store(Some(store), history))
    }

    fn with_store(store: Option<LedgerStore>, history: Vec<Transaction>) -> Self {
        let mut state = LedgerState {
            txs: HashMap::new(),
            by_index: HashMap::new(),
            store,
        };
        for tx in history {
            let hash = hash_transaction(&tx);
            if !state.txs.contains_key(&hash) {
                state.insert(hash, tx);
            }
        }

        let subscribers: Arc<Mutex<Subscribers>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx_dispatch, rx_dispatch) = mpsc::channel::<Transaction>();
        let delivery = Arc::clone(&subscribers);
        thread::spawn(move || deliver_loop(rx_dispatch, delivery));

        Self {
            state: Mutex::new(state),
            subscribers,
            dispatch: Mutex::new(Some(tx_dispatch)),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all transaction hashes.
    pub fn hashes_set(&self) -> HashSet<Hash> {
        self.state.lock().txs.keys().cloned().collect()
    }

    /// Stops the delivery thread; later submissions fail as interrupted.
    pub fn close(&self) {
        self.dispatch.lock().take();
    }
}

impl Default for LocalLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerGateway for LocalLedger {
    fn put(&self, tx: Transaction) -> Result<Hash, LedgerError> {
        let hash = hash_transaction(&tx);
        let dispatch = self
            .dispatch
            .lock()
            .clone()
            .ok_or_else(|| LedgerError::Interrupted("ledger closed".into()))?;

        {
            let mut state = self.state.lock();
            if state.txs.contains_key(&hash) {
                return Err(LedgerError::Duplicate(hex::encode(hash)));
            }
            if let Some(store) = &state.store {
                store.append(&tx)?;
            }
            state.insert(hash, tx.clone());
        }

        dispatch
            .send(tx)
            .map_err(|_| LedgerError::Interrupted("delivery thread gone".into()))?;
        Ok(hash)
    }

    fn subscribe(&self, type_name: &str, handler: Arc<dyn LedgerSubscriber>) {
        self.subscribers
            .lock()
            .entry(type_name.to_string())
            .or_default()
            .push(handler);
    }

    fn unsubscribe(&self, type_name: &str, handler: &Arc<dyn LedgerSubscriber>) {
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.get_mut(type_name) {
            list.retain(|h| !same_subscriber(h, handler));
            if list.is_empty() {
                subs.remove(type_name);
            }
        }
    }

    fn transactions_by_index(&self, index: &str, ascending: bool) -> Vec<Transaction> {
        let state = self.state.lock();
        let Some(hashes) = state.by_index.get(index) else {
            return Vec::new();
        };
        let mut out: Vec<Transaction> = hashes
            .iter()
            .filter_map(|h| state.txs.get(h).cloned())
            .collect();
        if !ascending {
            out.reverse();
        }
        out
    }
}

fn same_subscriber(a: &Arc<dyn LedgerSubscriber>, b: &Arc<dyn LedgerSubscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn deliver_loop(rx: mpsc::Receiver<Transaction>, subscribers: Arc<Mutex<Subscribers>>) {
    while let Ok(tx) = rx.recv() {
        let type_name = tx.tx_type().name();
        // Handlers may re-enter the ledger; never call them under the lock.
        let handlers = subscribers.lock().get(type_name).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!(tx_type = type_name, "no subscribers for transaction");
            continue;
        }
        for handler in handlers {
            handler.update(&tx);
        }
    }
    debug!("ledger delivery thread stopped");
}
