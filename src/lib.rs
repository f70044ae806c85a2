//! Skiff library
//!
//! Small file-sharing service: a TCP daemon serving one directory to remote
//! clients over a newline-delimited JSON protocol, with per-connection roles,
//! chunked transfers and traffic telemetry.

pub mod cli;
pub mod dispatch;
pub mod logger;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod transfer;
