use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Event sink for the daemon. Implementations must never fail the caller:
/// a lost log line is logged nowhere, not propagated.
pub trait EventLog: Send + Sync {
    fn session_opened(&self, _addr: SocketAddr) {}
    fn hello(&self, _addr: SocketAddr, _username: &str, _role: &str) {}
    fn session_closed(&self, _addr: SocketAddr, _reason: &str) {}
    fn rejected(&self, _addr: SocketAddr, _active: usize) {}
    fn command(&self, _addr: SocketAddr, _username: &str, _command: &str) {}
    fn delete(&self, _username: &str, _filename: &str) {}
    fn transfer_started(&self, _addr: SocketAddr, _direction: &str, _filename: &str) {}
    fn transfer_finished(
        &self,
        _addr: SocketAddr,
        _direction: &str,
        _filename: &str,
        _bytes: u64,
        _status: &str,
    ) {
    }
    fn warn(&self, _context: &str, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl EventLog for NoopLogger {}

/// Append-only text log, one timestamped line per event
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl EventLog for TextLogger {
    fn session_opened(&self, addr: SocketAddr) {
        self.line(&format!("CONNECT addr={addr}"));
    }
    fn hello(&self, addr: SocketAddr, username: &str, role: &str) {
        self.line(&format!("HELLO addr={addr} user={username} role={role}"));
    }
    fn session_closed(&self, addr: SocketAddr, reason: &str) {
        self.line(&format!("CLOSE addr={addr} reason={reason}"));
    }
    fn rejected(&self, addr: SocketAddr, active: usize) {
        self.line(&format!("REJECT addr={addr} active={active}"));
    }
    fn command(&self, addr: SocketAddr, username: &str, command: &str) {
        self.line(&format!("COMMAND addr={addr} user={username} cmd={command}"));
    }
    fn delete(&self, username: &str, filename: &str) {
        self.line(&format!("DELETE user={username} file={filename}"));
    }
    fn transfer_started(&self, addr: SocketAddr, direction: &str, filename: &str) {
        self.line(&format!("XFER_START addr={addr} dir={direction} file={filename}"));
    }
    fn transfer_finished(
        &self,
        addr: SocketAddr,
        direction: &str,
        filename: &str,
        bytes: u64,
        status: &str,
    ) {
        self.line(&format!(
            "XFER_END addr={addr} dir={direction} file={filename} bytes={bytes} status={status}"
        ));
    }
    fn warn(&self, context: &str, msg: &str) {
        self.line(&format!("WARN ctx={context} msg={msg}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
}
