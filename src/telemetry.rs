//! Traffic counters and point-in-time snapshots
//!
//! The aggregator is a pure accumulator: byte totals and per-username message
//! counts, all behind one mutex so a snapshot observes every update exactly
//! once. Per-session counters live in the sessions themselves and are merged
//! in at snapshot time.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::session::Session;

#[derive(Default)]
struct Counters {
    total_bytes_received: u64,
    total_bytes_sent: u64,
    messages_by_user: HashMap<String, u64>,
}

pub struct Telemetry {
    counters: Mutex<Counters>,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry {
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn record_received(&self, bytes: u64) {
        self.counters.lock().total_bytes_received += bytes;
    }

    pub fn record_sent(&self, bytes: u64) {
        self.counters.lock().total_bytes_sent += bytes;
    }

    /// Count one message against a username, accumulated across reconnects
    pub fn record_message(&self, username: &str) {
        *self
            .counters
            .lock()
            .messages_by_user
            .entry(username.to_string())
            .or_insert(0) += 1;
    }

    /// Build a snapshot from the counters plus the given session summaries.
    /// Counters are read, never reset.
    pub fn snapshot(&self, sessions: Vec<SessionSummary>) -> Snapshot {
        let counters = self.counters.lock();
        Snapshot {
            taken_at: Utc::now().to_rfc3339(),
            total_bytes_received: counters.total_bytes_received,
            total_bytes_sent: counters.total_bytes_sent,
            active_connections: sessions.len(),
            connected_addrs: sessions.iter().map(|s| s.addr.clone()).collect(),
            messages_by_user: counters.messages_by_user.clone(),
            sessions,
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferSummary {
    pub filename: String,
    pub direction: String,
    pub bytes_transferred: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub addr: String,
    pub username: String,
    pub role: String,
    pub connected_at: String,
    pub message_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub active_transfer: Option<TransferSummary>,
}

impl SessionSummary {
    pub fn of(session: &Session) -> SessionSummary {
        SessionSummary {
            addr: session.addr.to_string(),
            username: session.username.clone(),
            role: session.role.as_str().to_string(),
            connected_at: session.connected_at.to_rfc3339(),
            message_count: session.message_count,
            bytes_received: session.bytes_received,
            bytes_sent: session.bytes_sent,
            active_transfer: session.active_transfer().map(|t| TransferSummary {
                filename: t.filename.clone(),
                direction: t.direction.as_str().to_string(),
                bytes_transferred: t.bytes_transferred,
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: String,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub active_connections: usize,
    pub connected_addrs: Vec<String>,
    pub messages_by_user: HashMap<String, u64>,
    pub sessions: Vec<SessionSummary>,
}

impl Snapshot {
    /// Overwrite the stats file with this snapshot
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
