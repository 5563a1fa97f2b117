//! Append-only version ledger.
//!
//! Every committed mutation appends one [`VersionRecord`] (timestamp, full
//! model snapshot, and the generated formula text) as a single JSON line.
//! Prior entries are never rewritten or deleted, and the file is parsable by
//! an auditing tool without running the engine ([`Ledger::read_all`]).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use stockflow_core::model::ModelState;

use crate::error::EngineError;

/// One committed model version. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub timestamp: DateTime<Utc>,
    pub state: ModelState,
    pub formula_text: String,
}

/// Append-only persistent log of accepted model versions, with an in-memory
/// mirror of everything read or written through this handle.
pub struct Ledger {
    path: PathBuf,
    records: Vec<VersionRecord>,
}

impl Ledger {
    /// Opens (or creates) a ledger file, loading any existing records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let records = if path.exists() {
            Self::read_all(&path)?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    /// Appends a record for the given committed state. Flushes before
    /// returning so a reader never sees a half-written line on a clean
    /// shutdown.
    pub fn append(&mut self, state: &ModelState) -> Result<&VersionRecord, EngineError> {
        let record = VersionRecord {
            timestamp: Utc::now(),
            state: state.clone(),
            formula_text: state.formula_text(),
        };
        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;

        info!(
            version = self.records.len() + 1,
            path = %self.path.display(),
            "appended version record"
        );
        self.records.push(record);
        Ok(self.records.last().expect("record just pushed"))
    }

    /// Records seen by this handle, oldest first.
    pub fn records(&self) -> &[VersionRecord] {
        &self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record from a ledger file. Standalone so audit tooling
    /// can replay history without constructing an engine.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<VersionRecord>, EngineError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("versions.jsonl");
        let mut ledger = Ledger::open(&path).expect("open");

        let baseline = ModelState::baseline();
        ledger.append(&baseline).expect("append");
        let mut modified = baseline.clone();
        modified.set_derivative("R", "revenue_flow * 2").expect("set");
        ledger.append(&modified).expect("append");

        let records = Ledger::read_all(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].state, baseline);
        assert_eq!(records[1].state, modified);
        assert_eq!(records[0].formula_text, baseline.formula_text());
    }

    #[test]
    fn append_never_rewrites_existing_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("versions.jsonl");
        let mut ledger = Ledger::open(&path).expect("open");

        ledger.append(&ModelState::baseline()).expect("append");
        let first_line = std::fs::read_to_string(&path).expect("read");

        let mut modified = ModelState::baseline();
        modified.set_derivative("R", "0").expect("set");
        ledger.append(&modified).expect("append");
        let contents = std::fs::read_to_string(&path).expect("read");

        assert!(contents.starts_with(&first_line));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn reopening_recovers_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("versions.jsonl");
        {
            let mut ledger = Ledger::open(&path).expect("open");
            ledger.append(&ModelState::baseline()).expect("append");
        }
        let reopened = Ledger::open(&path).expect("reopen");
        assert_eq!(reopened.records().len(), 1);
        assert_eq!(reopened.records()[0].state, ModelState::baseline());
    }
}
