//! proxyx logs
//!
//! Call sites use the macros of the `log` facade. This module provides the
//! backend behind it: one [`Logger`] per process, writing tagged lines to
//! stdout, stderr, a file, or a remote UDP or TCP collector.
//!
//! The target is given as a URL-like string:
//! `stdout`, `stderr`, `file:///var/log/proxyx.log`, `udp://127.0.0.1:514`,
//! `tcp://127.0.0.1:5140`.

pub mod logs;

use std::net::AddrParseError;

pub use crate::logging::logs::*;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid log target {0}: {1}")]
    InvalidLogTarget(String, &'static str),
    #[error("invalid log target {0}: {1}")]
    InvalidSocketAddress(String, AddrParseError),
    #[error("invalid log level {0}")]
    InvalidLogLevel(String),
    #[error("could not open log file {0}: {1}")]
    OpenFile(String, std::io::Error),
    #[error("could not connect to TCP socket {0}: {1}")]
    TcpConnect(String, std::io::Error),
    #[error("could not bind to UDP socket: {0}")]
    UdpBind(std::io::Error),
    #[error("a logger is already installed for this process")]
    AlreadyInstalled,
}
