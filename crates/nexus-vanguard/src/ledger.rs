//! Learning ledger - append-only corpus of resolution knowledge
//!
//! Bulk resolutions append a learning record here. The corpus has exactly
//! one consumer: the read endpoint, which also exports a training payload.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct LearningRecord {
    pub fingerprints: Vec<String>,
    pub notes: String,
    pub resolved_count: usize,
    pub captured_at: DateTime<Utc>,
}

/// Append-only log of resolution batches.
pub struct LearningLedger {
    records: Mutex<Vec<LearningRecord>>,
}

impl LearningLedger {
    pub fn new() -> Self {
        LearningLedger {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn capture(&self, fingerprints: Vec<String>, notes: &str) {
        let record = LearningRecord {
            resolved_count: fingerprints.len(),
            fingerprints,
            notes: notes.to_string(),
            captured_at: Utc::now(),
        };
        self.records.lock().push(record);
    }

    pub fn all(&self) -> Vec<LearningRecord> {
        self.records.lock().clone()
    }

    /// Exportable training payload: one example per batch.
    pub fn export_training_payload(&self) -> serde_json::Value {
        let records = self.records.lock();
        serde_json::json!({
            "record_count": records.len(),
            "examples": records
                .iter()
                .map(|r| serde_json::json!({
                    "fingerprints": r.fingerprints,
                    "resolution_notes": r.notes,
                    "captured_at": r.captured_at,
                }))
                .collect::<Vec<_>>(),
        })
    }
}

impl Default for LearningLedger {
    fn default() -> Self {
        Self::new()
    }
}
