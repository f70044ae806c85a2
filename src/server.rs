//! Daemon core: accept loop, per-connection message pump, periodic work
//!
//! Each accepted connection gets its own task that reads wire lines in
//! arrival order, so one session's commands never reorder. Sessions are
//! independent tasks and only meet in the registry map and the telemetry
//! counters. Two interval tasks run alongside the accept loop: the idle
//! eviction sweep and the stats snapshot writer.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::dispatch::{Action, Dispatcher};
use crate::logger::EventLog;
use crate::protocol::{
    self, ErrorKind, FileData, Message, Response, DEFAULT_PORT, MAX_LINE_BYTES,
};
use crate::registry::ConnectionRegistry;
use crate::session::{SessionHandle, Transfer, TransferStatus};
use crate::storage::Storage;
use crate::telemetry::Telemetry;
use crate::transfer::{stream_download, UploadSink};

pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub stats_interval: Duration,
    pub stats_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(root: PathBuf) -> Self {
        ServerConfig {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            root,
            max_sessions: 6,
            idle_timeout: Duration::from_millis(120_000),
            stats_interval: Duration::from_secs(30),
            stats_path: None,
        }
    }
}

fn sweep_interval(idle: Duration) -> Duration {
    (idle / 2).max(Duration::from_millis(50))
}

pub struct Server {
    cfg: ServerConfig,
    storage: Arc<Storage>,
    telemetry: Arc<Telemetry>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    log: Arc<dyn EventLog>,
}

impl Server {
    pub fn new(cfg: ServerConfig, log: Arc<dyn EventLog>) -> Arc<Server> {
        let storage = Arc::new(Storage::new(cfg.root.clone()));
        let telemetry = Arc::new(Telemetry::new());
        let registry = Arc::new(ConnectionRegistry::new(
            cfg.max_sessions,
            cfg.idle_timeout,
            telemetry.clone(),
            log.clone(),
        ));
        let dispatcher = Dispatcher::new(storage.clone(), log.clone());
        Arc::new(Server {
            cfg,
            storage,
            telemetry,
            registry,
            dispatcher,
            log,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bind and serve until ctrl-c
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.bind)
            .await
            .with_context(|| format!("bind {}", self.cfg.bind))?;
        eprintln!(
            "skiffd listening on {} root={}",
            self.cfg.bind,
            self.storage.root().display()
        );
        let this = self.clone();
        tokio::select! {
            r = this.run_on(listener) => r,
            _ = tokio::signal::ctrl_c() => {
                self.log.warn("server", "shutdown signal received");
                self.persist_stats();
                Ok(())
            }
        }
    }

    /// Serve on an already-bound listener
    pub async fn run_on(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let sweeper = {
            let this = self.clone();
            let period = sweep_interval(this.registry.idle_timeout());
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    this.registry.evict_idle();
                }
            })
        };
        let stats = {
            let this = self.clone();
            let period = this.cfg.stats_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    this.persist_stats();
                }
            })
        };

        let result = loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_conn(stream, peer).await });
                }
                Err(e) => break Err(anyhow::Error::from(e).context("accept")),
            }
        };
        sweeper.abort();
        stats.abort();
        result
    }

    fn persist_stats(&self) {
        if let Some(path) = &self.cfg.stats_path {
            if let Err(e) = self.registry.snapshot().persist(path) {
                self.log.warn("stats", &format!("persist failed: {e:#}"));
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.clone().serve_conn(stream, peer).await {
            self.log.error("conn", &format!("{peer}: {e:#}"));
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true).ok();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let handle = match self.registry.admit(peer) {
            Ok(h) => h,
            Err(kind) => {
                // Refused at the door: one error line, then close
                let line = protocol::encode_line(&kind.into_message())?;
                writer.write_all(line.as_bytes()).await.ok();
                return Ok(());
            }
        };

        let mut upload: Option<UploadSink> = None;
        let mut evicted = false;
        let mut close_reason = "disconnect";
        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                biased;
                _ = handle.shutdown.notified() => {
                    evicted = true;
                    break;
                }
                r = reader.read_line(&mut line) => {
                    let n = match r {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            self.log.warn("conn", &format!("{peer} read: {e}"));
                            close_reason = "read error";
                            break;
                        }
                    };
                    if n > MAX_LINE_BYTES {
                        self.log.warn("protocol", &format!("{peer}: line of {n} bytes dropped"));
                        close_reason = "oversized line";
                        break;
                    }
                    self.registry.record_inbound(&handle, n as u64);
                    let msg = match protocol::decode_line(&line) {
                        Ok(m) => m,
                        Err(e) => {
                            // Malformed frame: logged and dropped, no reply
                            self.log.warn("protocol", &format!("{peer}: malformed message: {e}"));
                            continue;
                        }
                    };
                    if let Err(e) = self.process(peer, &handle, &mut writer, &mut upload, msg).await {
                        self.log.warn("conn", &format!("{peer} send: {e:#}"));
                        close_reason = "send error";
                        break;
                    }
                }
            }
        }
        // An evicted session is already out of the registry; the transfer
        // sink, if any, closes when this task drops it.
        if !evicted {
            self.registry.remove(peer, close_reason);
        }
        Ok(())
    }

    async fn process(
        &self,
        peer: SocketAddr,
        handle: &SessionHandle,
        writer: &mut OwnedWriteHalf,
        upload: &mut Option<UploadSink>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Hello { username, role } => {
                handle.lock().hello(username.clone(), role);
                self.telemetry.record_message(&username);
                self.log.hello(peer, &username, role.as_str());
                self.send(writer, handle, &Message::HelloAck { role }).await
            }
            Message::Command(cmd) => {
                self.note_message(handle);
                match self.dispatcher.dispatch(peer, handle, &cmd).await {
                    Action::Reply(reply) => self.send(writer, handle, &reply).await,
                    Action::BeginUpload {
                        filename,
                        expected_size,
                    } => {
                        self.begin_upload(peer, handle, writer, upload, filename, expected_size)
                            .await
                    }
                    Action::StreamDownload { filename } => {
                        self.run_download(peer, handle, writer, upload, filename).await
                    }
                }
            }
            Message::FileData(fd) => {
                self.note_message(handle);
                if let Some(reply) = self.handle_file_data(peer, handle, upload, fd).await {
                    self.send(writer, handle, &reply).await?;
                }
                Ok(())
            }
            Message::HelloAck { .. } | Message::Response(_) | Message::Error { .. } => {
                self.log
                    .warn("protocol", &format!("{peer}: unexpected message type"));
                Ok(())
            }
        }
    }

    fn note_message(&self, handle: &SessionHandle) {
        let username = {
            let session = handle.lock();
            session
                .is_authenticated()
                .then(|| session.username.clone())
        };
        if let Some(username) = username {
            self.telemetry.record_message(&username);
        }
    }

    async fn begin_upload(
        &self,
        peer: SocketAddr,
        handle: &SessionHandle,
        writer: &mut OwnedWriteHalf,
        upload: &mut Option<UploadSink>,
        filename: String,
        expected_size: u64,
    ) -> Result<()> {
        match UploadSink::create(&self.storage, &filename).await {
            Ok(sink) => {
                // Last command wins: the previous target closes where it is
                let _ = upload.take();
                let prior = handle
                    .lock()
                    .begin_transfer(Transfer::upload(&filename, expected_size));
                if let Some(t) = prior {
                    self.log.transfer_finished(
                        peer,
                        t.direction.as_str(),
                        &t.filename,
                        t.bytes_transferred,
                        t.status.as_str(),
                    );
                }
                self.log.transfer_started(peer, "upload", &filename);
                *upload = Some(sink);
                self.send(
                    writer,
                    handle,
                    &Message::Response(Response::upload_ready(filename)),
                )
                .await
            }
            Err(e) => {
                self.log.error("/upload", &format!("{e:#}"));
                self.send(writer, handle, &ErrorKind::Storage(e.to_string()).into_message())
                    .await
            }
        }
    }

    async fn run_download(
        &self,
        peer: SocketAddr,
        handle: &SessionHandle,
        writer: &mut OwnedWriteHalf,
        upload: &mut Option<UploadSink>,
        filename: String,
    ) -> Result<()> {
        match self.storage.open_read(&filename).await {
            Ok(Some((file, _))) => {
                let _ = upload.take();
                let prior = handle.lock().begin_transfer(Transfer::download(&filename));
                if let Some(t) = prior {
                    self.log.transfer_finished(
                        peer,
                        t.direction.as_str(),
                        &t.filename,
                        t.bytes_transferred,
                        t.status.as_str(),
                    );
                }
                self.log.transfer_started(peer, "download", &filename);
                match stream_download(writer, handle, &self.telemetry, &filename, file).await {
                    Ok(_) => {
                        if let Some(t) = handle.lock().end_transfer(TransferStatus::Complete) {
                            self.log.transfer_finished(
                                peer,
                                t.direction.as_str(),
                                &t.filename,
                                t.bytes_transferred,
                                t.status.as_str(),
                            );
                        }
                        Ok(())
                    }
                    Err(e) => {
                        if let Some(t) = handle.lock().end_transfer(TransferStatus::Aborted) {
                            self.log.transfer_finished(
                                peer,
                                t.direction.as_str(),
                                &t.filename,
                                t.bytes_transferred,
                                t.status.as_str(),
                            );
                        }
                        Err(e)
                    }
                }
            }
            Ok(None) => {
                self.send(writer, handle, &ErrorKind::NotFound.into_message())
                    .await
            }
            Err(e) => {
                self.log.error("/download", &format!("{e:#}"));
                self.send(writer, handle, &ErrorKind::Storage(e.to_string()).into_message())
                    .await
            }
        }
    }

    /// Sink one upload chunk. Returns an error reply when the write target
    /// fails; data-path noise (stray or undecodable chunks) is logged and
    /// dropped without one.
    async fn handle_file_data(
        &self,
        peer: SocketAddr,
        handle: &SessionHandle,
        upload: &mut Option<UploadSink>,
        fd: FileData,
    ) -> Option<Message> {
        if upload.is_none() {
            self.log
                .warn("upload", &format!("{peer}: FILE_DATA with no active upload"));
            return None;
        }
        let data = match protocol::decode_chunk(&fd.chunk) {
            Ok(d) => d,
            Err(e) => {
                self.log
                    .warn("upload", &format!("{peer}: undecodable chunk: {e}"));
                return None;
            }
        };
        if let Some(sink) = upload.as_mut() {
            if fd.filename != sink.filename() {
                self.log.warn(
                    "upload",
                    &format!(
                        "{peer}: chunk named {} while receiving {}",
                        fd.filename,
                        sink.filename()
                    ),
                );
            }
            if !data.is_empty() {
                if let Err(e) = sink.append(&data).await {
                    self.log.error("upload", &format!("{e:#}"));
                    let _ = upload.take();
                    return Some(self.abort_upload(peer, handle, e));
                }
                handle.lock().add_transfer_bytes(data.len() as u64);
            }
        }
        if fd.is_final {
            if let Some(sink) = upload.take() {
                if let Err(e) = sink.finish().await {
                    self.log.error("upload", &format!("{e:#}"));
                    return Some(self.abort_upload(peer, handle, e));
                }
                if let Some(t) = handle.lock().end_transfer(TransferStatus::Complete) {
                    if let Some(expected) = t.expected_size {
                        if expected != t.bytes_transferred {
                            self.log.warn(
                                "upload",
                                &format!(
                                    "{peer}: {} declared {expected} bytes, received {}",
                                    t.filename, t.bytes_transferred
                                ),
                            );
                        }
                    }
                    self.log.transfer_finished(
                        peer,
                        t.direction.as_str(),
                        &t.filename,
                        t.bytes_transferred,
                        t.status.as_str(),
                    );
                }
            }
        }
        None
    }

    fn abort_upload(&self, peer: SocketAddr, handle: &SessionHandle, e: anyhow::Error) -> Message {
        if let Some(t) = handle.lock().end_transfer(TransferStatus::Aborted) {
            self.log.transfer_finished(
                peer,
                t.direction.as_str(),
                &t.filename,
                t.bytes_transferred,
                t.status.as_str(),
            );
        }
        ErrorKind::Storage(e.to_string()).into_message()
    }

    async fn send(
        &self,
        writer: &mut OwnedWriteHalf,
        handle: &SessionHandle,
        msg: &Message,
    ) -> Result<()> {
        let line = protocol::encode_line(msg)?;
        writer
            .write_all(line.as_bytes())
            .await
            .context("write reply")?;
        handle.lock().bytes_sent += line.len() as u64;
        self.telemetry.record_sent(line.len() as u64);
        Ok(())
    }
}
