//! Command validation, authorization and routing
//!
//! The dispatcher lifts the free-form command envelope into a typed request,
//! checks the session's role, and either answers from storage directly or
//! hands the connection task a transfer to run.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::logger::EventLog;
use crate::protocol::{self, Command, ErrorKind, Message, Response, Role};
use crate::session::SessionHandle;
use crate::storage::{sanitize_name, Storage};

/// A command with its required fields present and typed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    List,
    Info { filename: String },
    Read { filename: String },
    Search { keyword: String },
    Delete { filename: String },
    Upload { filename: String, size: u64 },
    Download { filename: String },
}

impl Request {
    /// Validate field presence. Runs before any storage access so a missing
    /// field never touches the filesystem.
    pub fn parse(cmd: &Command) -> Result<Request, ErrorKind> {
        let filename = || {
            cmd.filename
                .clone()
                .filter(|f| !f.is_empty())
                .ok_or(ErrorKind::MissingFilename)
        };
        match cmd.command.as_str() {
            "/list" => Ok(Request::List),
            "/info" => Ok(Request::Info {
                filename: filename()?,
            }),
            "/read" => Ok(Request::Read {
                filename: filename()?,
            }),
            "/search" => match cmd.keyword.clone().filter(|k| !k.is_empty()) {
                Some(keyword) => Ok(Request::Search { keyword }),
                None => Err(ErrorKind::MissingKeyword),
            },
            "/delete" => Ok(Request::Delete {
                filename: filename()?,
            }),
            "/upload" => match (cmd.filename.clone().filter(|f| !f.is_empty()), cmd.size) {
                (Some(filename), Some(size)) => Ok(Request::Upload { filename, size }),
                _ => Err(ErrorKind::MissingFilenameOrSize),
            },
            "/download" => Ok(Request::Download {
                filename: filename()?,
            }),
            other => Err(ErrorKind::UnknownCommand(other.to_string())),
        }
    }
}

/// What the connection task should do after dispatch
#[derive(Debug)]
pub enum Action {
    Reply(Message),
    /// Open a write target and acknowledge READY; `filename` is sanitized
    BeginUpload {
        filename: String,
        expected_size: u64,
    },
    /// Stream the named file back; `filename` is sanitized
    StreamDownload { filename: String },
}

impl Action {
    fn err(kind: ErrorKind) -> Action {
        Action::Reply(kind.into_message())
    }
}

pub struct Dispatcher {
    storage: Arc<Storage>,
    log: Arc<dyn EventLog>,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>, log: Arc<dyn EventLog>) -> Self {
        Dispatcher { storage, log }
    }

    pub async fn dispatch(
        &self,
        addr: SocketAddr,
        handle: &SessionHandle,
        cmd: &Command,
    ) -> Action {
        let (authenticated, role, username) = {
            let session = handle.lock();
            (
                session.is_authenticated(),
                session.role,
                session.username.clone(),
            )
        };
        if !authenticated {
            return Action::err(ErrorKind::SendHelloFirst);
        }
        self.log.command(addr, &username, &cmd.command);

        let request = match Request::parse(cmd) {
            Ok(r) => r,
            Err(kind) => return Action::err(kind),
        };

        match request {
            Request::List => match self.storage.list().await {
                Ok(files) => Action::Reply(Message::Response(Response::List { files })),
                Err(e) => self.storage_failure("/list", e),
            },
            Request::Info { filename } => match self.storage.stat(&filename).await {
                Ok(Some(stat)) => Action::Reply(Message::Response(Response::Info {
                    filename,
                    size: stat.size,
                    created_at: stat.created_at,
                    modified_at: stat.modified_at,
                })),
                Ok(None) => Action::err(ErrorKind::NotFound),
                Err(e) => self.storage_failure("/info", e),
            },
            Request::Read { filename } => match self.storage.read(&filename).await {
                Ok(Some(bytes)) => Action::Reply(Message::Response(Response::Read {
                    filename,
                    content: protocol::encode_chunk(&bytes),
                })),
                Ok(None) => Action::err(ErrorKind::NotFound),
                Err(e) => self.storage_failure("/read", e),
            },
            Request::Search { keyword } => match self.storage.list().await {
                Ok(entries) => {
                    let files: Vec<String> = entries
                        .into_iter()
                        .map(|e| e.name)
                        .filter(|name| name.contains(&keyword))
                        .collect();
                    Action::Reply(Message::Response(Response::Search { files }))
                }
                Err(e) => self.storage_failure("/search", e),
            },
            Request::Delete { filename } => {
                // Role gate comes before any existence check
                if role != Role::Admin {
                    return Action::err(ErrorKind::Forbidden);
                }
                match self.storage.delete(&filename).await {
                    Ok(true) => {
                        self.log.delete(&username, &filename);
                        Action::Reply(Message::Response(Response::Delete { filename }))
                    }
                    Ok(false) => Action::err(ErrorKind::NotFound),
                    Err(e) => self.storage_failure("/delete", e),
                }
            }
            Request::Upload { filename, size } => match sanitize_name(&filename) {
                Ok(filename) => Action::BeginUpload {
                    filename,
                    expected_size: size,
                },
                Err(e) => self.storage_failure("/upload", e),
            },
            Request::Download { filename } => match sanitize_name(&filename) {
                Ok(filename) => Action::StreamDownload { filename },
                Err(e) => self.storage_failure("/download", e),
            },
        }
    }

    fn storage_failure(&self, context: &str, e: anyhow::Error) -> Action {
        self.log.error(context, &format!("{e:#}"));
        Action::err(ErrorKind::Storage(e.to_string()))
    }
}
