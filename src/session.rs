//! Per-connection session state
//!
//! A session moves through a small state machine: unauthenticated until the
//! first HELLO, then authenticated, with at most one transfer attached at a
//! time. All fields are owned by the session's connection task; the registry
//! only ever touches them through the handle's lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::protocol::Role;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Complete,
    Aborted,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Complete => "complete",
            TransferStatus::Aborted => "aborted",
        }
    }
}

/// One in-flight upload or download
#[derive(Clone, Debug)]
pub struct Transfer {
    pub filename: String,
    pub direction: TransferDirection,
    /// Declared by the client, uploads only
    pub expected_size: Option<u64>,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
}

impl Transfer {
    pub fn upload(filename: &str, expected_size: u64) -> Transfer {
        Transfer {
            filename: filename.to_string(),
            direction: TransferDirection::Upload,
            expected_size: Some(expected_size),
            bytes_transferred: 0,
            status: TransferStatus::InProgress,
        }
    }

    pub fn download(filename: &str) -> Transfer {
        Transfer {
            filename: filename.to_string(),
            direction: TransferDirection::Download,
            expected_size: None,
            bytes_transferred: 0,
            status: TransferStatus::InProgress,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Transferring(Transfer),
}

#[derive(Debug)]
pub struct Session {
    pub addr: SocketAddr,
    pub username: String,
    pub role: Role,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub message_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub state: SessionState,
}

impl Session {
    pub fn new(addr: SocketAddr) -> Self {
        Session {
            addr,
            // Until HELLO names the user, the endpoint string stands in
            username: addr.to_string(),
            role: Role::Read,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            message_count: 0,
            bytes_received: 0,
            bytes_sent: 0,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self.state, SessionState::Unauthenticated)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Apply a HELLO. The first one authenticates; any later one just
    /// reconfigures username and role without touching an active transfer.
    pub fn hello(&mut self, username: String, role: Role) {
        self.username = username;
        self.role = role;
        if let SessionState::Unauthenticated = self.state {
            self.state = SessionState::Authenticated;
        }
    }

    /// Attach a new transfer. Returns the superseded one, already marked
    /// aborted, if a transfer was still active.
    pub fn begin_transfer(&mut self, transfer: Transfer) -> Option<Transfer> {
        match std::mem::replace(&mut self.state, SessionState::Transferring(transfer)) {
            SessionState::Transferring(mut prior) => {
                prior.status = TransferStatus::Aborted;
                Some(prior)
            }
            _ => None,
        }
    }

    /// Detach the active transfer with the given final status and drop back
    /// to authenticated. No-op when no transfer is active.
    pub fn end_transfer(&mut self, status: TransferStatus) -> Option<Transfer> {
        match std::mem::replace(&mut self.state, SessionState::Authenticated) {
            SessionState::Transferring(mut t) => {
                t.status = status;
                Some(t)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn active_transfer(&self) -> Option<&Transfer> {
        match &self.state {
            SessionState::Transferring(t) => Some(t),
            _ => None,
        }
    }

    pub fn add_transfer_bytes(&mut self, n: u64) {
        if let SessionState::Transferring(t) = &mut self.state {
            t.bytes_transferred += n;
        }
    }
}

/// Shared handle to one session: the lock for short metadata updates and a
/// notify the registry uses to tell the connection task to shut down.
#[derive(Debug)]
pub struct SessionHandle {
    session: Mutex<Session>,
    pub shutdown: Notify,
}

impl SessionHandle {
    pub fn new(addr: SocketAddr) -> Self {
        SessionHandle {
            session: Mutex::new(Session::new(addr)),
            shutdown: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn test_hello_authenticates_once() {
        let mut s = Session::new(addr());
        assert!(!s.is_authenticated());
        s.hello("alice".into(), Role::Admin);
        assert!(s.is_authenticated());
        assert_eq!(s.role, Role::Admin);

        // Later HELLO reconfigures in place
        s.hello("bob".into(), Role::Read);
        assert_eq!(s.username, "bob");
        assert_eq!(s.role, Role::Read);
        assert!(s.is_authenticated());
    }

    #[test]
    fn test_hello_does_not_interrupt_transfer() {
        let mut s = Session::new(addr());
        s.hello("alice".into(), Role::Read);
        s.begin_transfer(Transfer::upload("a.bin", 100));
        s.hello("alice2".into(), Role::Admin);
        assert_eq!(s.active_transfer().unwrap().filename, "a.bin");
        assert_eq!(s.username, "alice2");
    }

    #[test]
    fn test_begin_transfer_supersedes_prior() {
        let mut s = Session::new(addr());
        s.hello("alice".into(), Role::Read);
        assert!(s.begin_transfer(Transfer::upload("a.bin", 10)).is_none());
        let prior = s.begin_transfer(Transfer::download("b.bin")).unwrap();
        assert_eq!(prior.filename, "a.bin");
        assert_eq!(prior.status, TransferStatus::Aborted);
        assert_eq!(s.active_transfer().unwrap().filename, "b.bin");
    }

    #[test]
    fn test_end_transfer_returns_to_authenticated() {
        let mut s = Session::new(addr());
        s.hello("alice".into(), Role::Read);
        s.begin_transfer(Transfer::upload("a.bin", 10));
        s.add_transfer_bytes(10);
        let done = s.end_transfer(TransferStatus::Complete).unwrap();
        assert_eq!(done.bytes_transferred, 10);
        assert_eq!(done.status, TransferStatus::Complete);
        assert!(s.active_transfer().is_none());
        assert!(s.is_authenticated());

        // Ending with nothing active changes nothing
        assert!(s.end_transfer(TransferStatus::Aborted).is_none());
    }

    #[test]
    fn test_end_transfer_keeps_unauthenticated_state() {
        let mut s = Session::new(addr());
        assert!(s.end_transfer(TransferStatus::Aborted).is_none());
        assert!(!s.is_authenticated());
    }
}
