// Conduct: how honestly a node reports the evaluations it makes.
// The variant is fixed when the node is built; there is no runtime transition.

use crate::ledger::{LedgerError, LedgerGateway};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConductType {
    /// Records every evaluation as observed.
    #[default]
    Honest,
    /// Records the opposite of what was observed.
    Malicious,
    /// Consumes others' reputation without ever contributing evaluations.
    Selfish,
}

impl fmt::Display for ConductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConductType::Honest => "honest",
            ConductType::Malicious => "malicious",
            ConductType::Selfish => "selfish",
        };
        f.write_str(s)
    }
}

pub struct Conduct {
    conduct_type: ConductType,
    ledger: Arc<dyn LedgerGateway>,
    node_id: String,
}

impl Conduct {
    pub fn new(conduct_type: ConductType, ledger: Arc<dyn LedgerGateway>, node_id: &str) -> Self {
        Self {
            conduct_type,
            ledger,
            node_id: node_id.to_string(),
        }
    }

    pub fn conduct_type(&self) -> ConductType {
        self.conduct_type
    }

    /// Records (or withholds) an evaluation of `subject_id`.
    /// At most one ledger submission per call; only submission failures are reported.
    pub fn evaluate_device(&self, subject_id: &str, value: f64) -> Result<(), LedgerError> {
        let recorded = match self.conduct_type {
            ConductType::Honest => value,
            ConductType::Malicious => 1.0 - value,
            ConductType::Selfish => {
                info!(subject = subject_id, "selfish node does not evaluate the device");
                return Ok(());
            }
        };
        let tx = Transaction::evaluation(&self.node_id, subject_id, recorded);
        self.ledger.put(tx)?;
        debug!(
            subject = subject_id,
            observed = value,
            recorded,
            conduct = %self.conduct_type,
            "evaluation submitted"
        );
        Ok(())
    }
}
