// Reputation-driven fog node: peers advertise sensing services on a shared ledger,
// consumers rank them by recorded evaluations and evaluate whoever they used.

pub mod conduct;
pub mod device;
pub mod ledger;
pub mod node;
pub mod scoring;
pub mod storage;
pub mod transaction;
pub mod transport;

pub use conduct::{Conduct, ConductType};
pub use ledger::{LedgerError, LedgerGateway, LedgerSubscriber, LocalLedger};
pub use node::{Collaborators, Node, NodeConfig, NodeError};
