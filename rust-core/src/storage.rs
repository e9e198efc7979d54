use crate::transaction::Transaction;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("ledger store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Append-only JSON-lines log backing a `LocalLedger`.
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            path: data_dir.as_ref().join("ledger.jsonl"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every decodable line; a torn or corrupt line is skipped.
    pub fn load(&self) -> Result<Vec<Transaction>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Transaction>(&line) {
                Ok(tx) => out.push(tx),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping corrupt ledger line"),
            }
        }
        Ok(out)
    }

    pub fn append(&self, tx: &Transaction) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(tx)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Rewrites the log with exactly `txs` (write-to-temp then rename).
    pub fn compact(&self, txs: &[Transaction]) -> Result<(), StorageError> {
        let mut data = Vec::new();
        for tx in txs {
            serde_json::to_writer(&mut data, tx)?;
            data.push(b'\n');
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerGateway, LocalLedger};

    #[test]
    fn reopened_ledger_keeps_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hashes = {
            let ledger = LocalLedger::open(dir.path()).expect("open");
            ledger
                .put(Transaction::evaluation("n1", "dev-1", 1.0))
                .expect("put");
            ledger
                .put(Transaction::evaluation("n2", "dev-1", 0.0))
                .expect("put");
            ledger.hashes_set()
        };

        let reopened = LocalLedger::open(dir.path()).expect("reopen");
        assert_eq!(reopened.hashes_set(), hashes);
        let history = reopened.transactions_by_index("dev-1", true);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].source(), "n1");
    }

    #[test]
    fn corrupt_tail_is_dropped_on_compaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path()).expect("store");
        store
            .append(&Transaction::evaluation("n1", "dev-1", 1.0))
            .expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.path())
            .expect("open log");
        file.write_all(b"{\"timestamp_ms\":").expect("torn write");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.len(), 1);
        store.compact(&loaded).expect("compact");
        let raw = fs::read_to_string(store.path()).expect("read log");
        assert_eq!(raw.lines().count(), 1);
    }
}
