//! Local interaction log queue.
//!
//! Every accepted protocol request produces exactly one [`InteractionRecord`]
//! before its response goes out on the wire. Records are appended with
//! `uploaded = false`; the agent's sync tick periodically drains the
//! oldest unuploaded batch, POSTs it to the server, and marks it uploaded
//! on success. The queue is in-process and unbounded — it lives for the
//! agent's process lifetime, not across restarts, so there is no
//! replay-on-startup step to perform.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Which wire protocol an interaction was recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Modbus/TCP.
    Modbus,
    /// Siemens S7comm.
    S7comm,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        hex.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(deserializer)?;
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// One logged protocol interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// Monotonically assigned id, unique within this agent process.
    pub id: u64,
    /// ISO-8601 timestamp of when the request was handled.
    pub timestamp: String,
    /// Remote peer's IP address.
    pub attacker_ip: String,
    /// Which protocol this interaction used.
    pub protocol: Protocol,
    /// Full raw request frame.
    #[serde(with = "hex_bytes")]
    pub raw_request: Vec<u8>,
    /// Full raw response frame.
    #[serde(with = "hex_bytes")]
    pub raw_response: Vec<u8>,
    /// Protocol-specific metadata (function code, unit id, SZL id, ...).
    pub metadata: HashMap<String, String>,
    /// Whether the server has acknowledged receipt of this record.
    pub uploaded: bool,
}

/// The in-process append-only interaction log for one agent.
#[derive(Debug, Default)]
pub struct InteractionLog {
    next_id: AtomicU64,
    records: Mutex<VecDeque<InteractionRecord>>,
}

impl InteractionLog {
    /// An empty log, ids starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), records: Mutex::new(VecDeque::new()) }
    }

    /// Append a new record with `uploaded = false` and return its id.
    pub fn record(
        &self,
        protocol: Protocol,
        attacker_ip: String,
        raw_request: Vec<u8>,
        raw_response: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = InteractionRecord {
            id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            attacker_ip,
            protocol,
            raw_request,
            raw_response,
            metadata,
            uploaded: false,
        };
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(record);
        id
    }

    /// Fetch up to `limit` of the oldest unuploaded records, in FIFO order.
    #[must_use]
    pub fn pending(&self, limit: usize) -> Vec<InteractionRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|r| !r.uploaded)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Mark the given ids as uploaded. Unknown ids are ignored; the
    /// transition is monotonic (already-uploaded records are untouched).
    pub fn mark_uploaded(&self, ids: &[u64]) {
        let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for record in records.iter_mut() {
            if ids.contains(&record.id) {
                record.uploaded = true;
            }
        }
    }

    /// Total records currently held, uploaded or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether the log holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Upload batch size: how many oldest unuploaded records one sync tick sends.
pub const UPLOAD_BATCH_SIZE: usize = 10;
