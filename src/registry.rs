//! Connection registry: session admission, lookup and idle eviction
//!
//! Owns the map from peer address to live session. Capacity is enforced at
//! admission; an idle sweep removes sessions whose last activity is older
//! than the timeout and signals their connection tasks to shut down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::logger::EventLog;
use crate::protocol::ErrorKind;
use crate::session::{SessionHandle, TransferStatus};
use crate::telemetry::{SessionSummary, Snapshot, Telemetry};

pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<SocketAddr, Arc<SessionHandle>>>,
    max_sessions: usize,
    idle_timeout: Duration,
    telemetry: Arc<Telemetry>,
    log: Arc<dyn EventLog>,
}

impl ConnectionRegistry {
    pub fn new(
        max_sessions: usize,
        idle_timeout: Duration,
        telemetry: Arc<Telemetry>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        ConnectionRegistry {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            idle_timeout,
            telemetry,
            log,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Admit a new connection, or refuse it when the table is full
    pub fn admit(&self, addr: SocketAddr) -> Result<Arc<SessionHandle>, ErrorKind> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_sessions && !sessions.contains_key(&addr) {
            self.log.rejected(addr, sessions.len());
            return Err(ErrorKind::TooManyConnections);
        }
        let handle = Arc::new(SessionHandle::new(addr));
        sessions.insert(addr, handle.clone());
        self.log.session_opened(addr);
        Ok(handle)
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().get(&addr).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Account one inbound message against its session
    pub fn record_inbound(&self, handle: &SessionHandle, bytes: u64) {
        {
            let mut session = handle.lock();
            session.message_count += 1;
            session.bytes_received += bytes;
            session.touch();
        }
        self.telemetry.record_received(bytes);
    }

    /// Drop a session on disconnect or explicit close. Any active transfer is
    /// marked aborted. Returns None if the session was already evicted.
    pub fn remove(&self, addr: SocketAddr, reason: &str) -> Option<Arc<SessionHandle>> {
        let handle = self.sessions.lock().remove(&addr)?;
        self.finish(addr, &handle, reason);
        Some(handle)
    }

    /// Sweep out every session idle beyond the timeout. Returns how many were
    /// evicted. Each evicted connection task is woken via its shutdown notify
    /// so transfer resources are released promptly.
    pub fn evict_idle(&self) -> usize {
        let expired: Vec<(SocketAddr, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.lock();
            let addrs: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, h)| h.lock().idle_for() > self.idle_timeout)
                .map(|(a, _)| *a)
                .collect();
            addrs
                .into_iter()
                .filter_map(|a| sessions.remove(&a).map(|h| (a, h)))
                .collect()
        };
        for (addr, handle) in &expired {
            self.finish(*addr, handle, "idle timeout");
            handle.shutdown.notify_one();
        }
        expired.len()
    }

    fn finish(&self, addr: SocketAddr, handle: &SessionHandle, reason: &str) {
        let aborted = handle.lock().end_transfer(TransferStatus::Aborted);
        if let Some(t) = aborted {
            self.log.transfer_finished(
                addr,
                t.direction.as_str(),
                &t.filename,
                t.bytes_transferred,
                t.status.as_str(),
            );
        }
        self.log.session_closed(addr, reason);
    }

    /// Point-in-time view of the whole registry plus the global counters
    pub fn snapshot(&self) -> Snapshot {
        let summaries: Vec<SessionSummary> = {
            let sessions = self.sessions.lock();
            sessions.values().map(|h| SessionSummary::of(&h.lock())).collect()
        };
        self.telemetry.snapshot(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::session::Transfer;

    fn registry(max: usize, idle: Duration) -> ConnectionRegistry {
        ConnectionRegistry::new(max, idle, Arc::new(Telemetry::new()), Arc::new(NoopLogger))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_capacity_enforced() {
        let reg = registry(2, Duration::from_secs(120));
        reg.admit(addr(1)).unwrap();
        reg.admit(addr(2)).unwrap();
        assert_eq!(
            reg.admit(addr(3)).unwrap_err(),
            ErrorKind::TooManyConnections
        );
        assert_eq!(reg.active_count(), 2);

        // A freed slot can be taken again
        reg.remove(addr(1), "disconnect");
        reg.admit(addr(3)).unwrap();
        assert_eq!(reg.active_count(), 2);
    }

    #[test]
    fn test_inbound_accounting() {
        let telemetry = Arc::new(Telemetry::new());
        let reg = ConnectionRegistry::new(
            4,
            Duration::from_secs(120),
            telemetry.clone(),
            Arc::new(NoopLogger),
        );
        let handle = reg.admit(addr(1)).unwrap();
        reg.record_inbound(&handle, 42);
        reg.record_inbound(&handle, 8);
        {
            let s = handle.lock();
            assert_eq!(s.message_count, 2);
            assert_eq!(s.bytes_received, 50);
        }
        assert_eq!(telemetry.snapshot(Vec::new()).total_bytes_received, 50);
    }

    #[test]
    fn test_evict_idle_removes_and_aborts() {
        let reg = registry(4, Duration::from_millis(1));
        let handle = reg.admit(addr(1)).unwrap();
        {
            let mut s = handle.lock();
            s.hello("alice".into(), crate::protocol::Role::Read);
            s.begin_transfer(Transfer::upload("a.bin", 100));
        }
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(reg.evict_idle(), 1);
        assert_eq!(reg.active_count(), 0);
        // The transfer was detached and the task signalled
        assert!(handle.lock().active_transfer().is_none());
    }

    #[test]
    fn test_evict_idle_spares_active_sessions() {
        let reg = registry(4, Duration::from_secs(120));
        let handle = reg.admit(addr(1)).unwrap();
        reg.record_inbound(&handle, 1);
        assert_eq!(reg.evict_idle(), 0);
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn test_snapshot_lists_sessions() {
        let reg = registry(4, Duration::from_secs(120));
        let handle = reg.admit(addr(7)).unwrap();
        handle
            .lock()
            .hello("carol".into(), crate::protocol::Role::Admin);
        let snap = reg.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.connected_addrs, vec!["127.0.0.1:7".to_string()]);
        assert_eq!(snap.sessions[0].username, "carol");
        assert_eq!(snap.sessions[0].role, "admin");
    }
}
