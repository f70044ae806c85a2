//! Wire protocol for the skiff line transport
//!
//! Every message is one JSON record per newline-terminated line. The unions
//! are internally tagged (`type` for messages, `command` for responses) so a
//! field combination the protocol does not allow cannot be constructed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default daemon port
pub const DEFAULT_PORT: u16 = 4000;

/// Raw file bytes carried per FILE_DATA chunk (before base64 expansion)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Maximum accepted wire line - prevents memory exhaustion from a hostile peer
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Read,
}

impl Role {
    /// Lenient parse used at the client edge: anything that is not "admin"
    /// downgrades to read.
    pub fn parse_loose(s: &str) -> Role {
        if s.eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::Read
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Read => "read",
        }
    }
}

/// One wire message, tagged by `type`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "HELLO")]
    Hello { username: String, role: Role },
    #[serde(rename = "HELLO_ACK")]
    HelloAck { role: Role },
    #[serde(rename = "COMMAND")]
    Command(Command),
    #[serde(rename = "RESPONSE")]
    Response(Response),
    #[serde(rename = "FILE_DATA")]
    FileData(FileData),
    #[serde(rename = "error")]
    Error { message: String },
}

/// Client command envelope. `command` stays a free string here; the dispatch
/// layer lifts it into a typed request and rejects unknown names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Per-command reply payloads, tagged by `command`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Response {
    #[serde(rename = "/list")]
    List { files: Vec<FileEntry> },
    #[serde(rename = "/info")]
    Info {
        filename: String,
        size: u64,
        created_at: String,
        modified_at: String,
    },
    #[serde(rename = "/read")]
    Read { filename: String, content: String },
    #[serde(rename = "/search")]
    Search { files: Vec<String> },
    #[serde(rename = "/delete")]
    Delete { filename: String },
    #[serde(rename = "/upload")]
    Upload { filename: String, status: String },
}

impl Response {
    pub fn upload_ready(filename: String) -> Response {
        Response::Upload {
            filename,
            status: "READY".to_string(),
        }
    }
}

/// One directory entry as returned by /list
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified_at: String,
}

/// One transfer chunk. `chunk` is base64; the terminal chunk of a stream has
/// `final = true` and an empty payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub chunk: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl FileData {
    pub fn chunk_of(filename: &str, bytes: &[u8]) -> FileData {
        FileData {
            filename: filename.to_string(),
            chunk: encode_chunk(bytes),
            is_final: false,
        }
    }

    pub fn terminal(filename: &str) -> FileData {
        FileData {
            filename: filename.to_string(),
            chunk: String::new(),
            is_final: true,
        }
    }
}

/// Error taxonomy. The display string is the canonical wire `message`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("SEND_HELLO_FIRST")]
    SendHelloFirst,
    #[error("FORBIDDEN")]
    Forbidden,
    #[error("MISSING_FILENAME")]
    MissingFilename,
    #[error("MISSING_KEYWORD")]
    MissingKeyword,
    #[error("MISSING_FILENAME_OR_SIZE")]
    MissingFilenameOrSize,
    #[error("NOT_FOUND")]
    NotFound,
    #[error("TOO_MANY_CONNECTIONS")]
    TooManyConnections,
    #[error("UNKNOWN_COMMAND {0}")]
    UnknownCommand(String),
    #[error("STORAGE_ERROR {0}")]
    Storage(String),
}

impl ErrorKind {
    pub fn into_message(self) -> Message {
        Message::Error {
            message: self.to_string(),
        }
    }
}

/// Serialize a message to its wire line, newline included
pub fn encode_line(msg: &Message) -> anyhow::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse one wire line (trailing newline tolerated)
pub fn decode_line(line: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

pub fn encode_chunk(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_chunk(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let msg = Message::Hello {
            username: "alice".into(),
            role: Role::Admin,
        };
        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "HELLO");
        assert_eq!(v["role"], "admin");
        match decode_line(&line).unwrap() {
            Message::Hello { username, role } => {
                assert_eq!(username, "alice");
                assert_eq!(role, Role::Admin);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_command_optional_fields_absent() {
        // The bare commands the interactive client sends carry no extras
        let msg = decode_line(r#"{"type":"COMMAND","command":"/list"}"#).unwrap();
        match msg {
            Message::Command(c) => {
                assert_eq!(c.command, "/list");
                assert!(c.filename.is_none());
                assert!(c.keyword.is_none());
                assert!(c.size.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_response_tagging() {
        let msg = Message::Response(Response::Search { files: vec![] });
        let v: serde_json::Value = serde_json::from_str(&encode_line(&msg).unwrap()).unwrap();
        assert_eq!(v["type"], "RESPONSE");
        assert_eq!(v["command"], "/search");
        assert_eq!(v["files"], serde_json::json!([]));
    }

    #[test]
    fn test_response_decodes_by_command() {
        let line = r#"{"type":"RESPONSE","command":"/info","filename":"a.txt","size":12,"created_at":"c","modified_at":"m"}"#;
        match decode_line(line).unwrap() {
            Message::Response(Response::Info { filename, size, .. }) => {
                assert_eq!(filename, "a.txt");
                assert_eq!(size, 12);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_file_data_final_rename() {
        let line = encode_line(&Message::FileData(FileData::terminal("a.txt"))).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["final"], true);
        assert_eq!(v["chunk"], "");
        match decode_line(&line).unwrap() {
            Message::FileData(fd) => assert!(fd.is_final && fd.chunk.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_chunk_codec_binary_safe() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let encoded = encode_chunk(&bytes);
        assert_eq!(decode_chunk(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_error_kind_messages() {
        assert_eq!(ErrorKind::SendHelloFirst.to_string(), "SEND_HELLO_FIRST");
        assert_eq!(ErrorKind::NotFound.to_string(), "NOT_FOUND");
        assert_eq!(
            ErrorKind::UnknownCommand("/frob".into()).to_string(),
            "UNKNOWN_COMMAND /frob"
        );
        match ErrorKind::TooManyConnections.into_message() {
            Message::Error { message } => assert_eq!(message, "TOO_MANY_CONNECTIONS"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_role_parse_loose() {
        assert_eq!(Role::parse_loose("ADMIN"), Role::Admin);
        assert_eq!(Role::parse_loose("read"), Role::Read);
        assert_eq!(Role::parse_loose("anything"), Role::Read);
    }

    #[test]
    fn test_malformed_line_is_error() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line(r#"{"type":"NOPE"}"#).is_err());
    }
}
