// Reputation scoring (local, non-consensus).
// Deterministic and side-effect free; ranking is an argmax with uniform random tie-break.

use crate::transaction::{Evaluation, Transaction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prior for a subject with no recorded evaluations: neutral, unearned trust.
pub const COLD_START_PRIOR: f64 = 0.5;

/// Scoring policy: history of evaluations -> score in [0, 1].
pub trait ReputationCalc: Send + Sync {
    fn calc(&self, history: &[Evaluation]) -> f64;
}

/// Baseline policy: arithmetic mean of evaluation values.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanReputation;

impl ReputationCalc for MeanReputation {
    fn calc(&self, history: &[Evaluation]) -> f64 {
        if history.is_empty() {
            return COLD_START_PRIOR;
        }
        let sum: f64 = history.iter().map(|e| clamp_unit(e.value)).sum();
        clamp_unit(sum / history.len() as f64)
    }
}

/// Exponentially recency-weighted mean.
/// `history` is newest first; entry `i` has weight `decay^i`.
#[derive(Clone, Copy, Debug)]
pub struct RecencyWeighted {
    pub decay: f64,
}

impl ReputationCalc for RecencyWeighted {
    fn calc(&self, history: &[Evaluation]) -> f64 {
        if history.is_empty() {
            return COLD_START_PRIOR;
        }
        let decay = if self.decay.is_finite() {
            self.decay.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        let mut weight = 1.0;
        let mut num = 0.0;
        let mut den = 0.0;
        for e in history {
            num += weight * clamp_unit(e.value);
            den += weight;
            weight *= decay;
        }
        if den <= 0.0 {
            return COLD_START_PRIOR;
        }
        clamp_unit(num / den)
    }
}

/// Configured scoring model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ReputationModel {
    #[default]
    Mean,
    Recency {
        decay: f64,
    },
}

impl ReputationModel {
    pub fn build(&self) -> Box<dyn ReputationCalc> {
        match *self {
            ReputationModel::Mean => Box::new(MeanReputation),
            ReputationModel::Recency { decay } => Box::new(RecencyWeighted { decay }),
        }
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, 1.0)
}

/// Keeps only evaluation records from a ledger query, preserving order.
pub fn evaluations_of(history: &[Transaction]) -> Vec<Evaluation> {
    history
        .iter()
        .filter_map(|tx| tx.as_evaluation().cloned())
        .collect()
}

/// Transient (id, score) pair used while ranking peers or devices.
#[derive(Clone, Debug, PartialEq)]
pub struct ThingReputation {
    pub thing_id: String,
    pub reputation: f64,
}

impl ThingReputation {
    pub fn new(thing_id: impl Into<String>, reputation: f64) -> Self {
        Self {
            thing_id: thing_id.into(),
            reputation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RankingError {
    #[error("no candidates to rank")]
    NoCandidates,
    #[error("no candidate holds the highest reputation {0}")]
    EmptyTieSet(f64),
}

/// Selects the candidate with the highest reputation.
/// Ties (exact equality) are broken uniformly at random.
pub fn select_highest<'a, R: Rng>(
    candidates: &'a [ThingReputation],
    rng: &mut R,
) -> Result<&'a ThingReputation, RankingError> {
    if candidates.is_empty() {
        return Err(RankingError::NoCandidates);
    }

    let mut highest = f64::NEG_INFINITY;
    for c in candidates {
        if c.reputation > highest {
            highest = c.reputation;
        }
    }

    let ties: Vec<&ThingReputation> = candidates
        .iter()
        .filter(|c| c.reputation == highest)
        .collect();

    match ties.len() {
        0 => Err(RankingError::EmptyTieSet(highest)),
        1 => Ok(ties[0]),
        n => Ok(ties[rng.gen_range(0..n)]),
    }
}
