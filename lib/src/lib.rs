//! # proxyx library
//!
//! An HTTP-aware TCP relay. Every accepted client connection becomes a
//! [`relay::handler::RelayHandler`]: the first request is parsed just enough
//! to find its destination, the destination is resolved without blocking,
//! then bytes are shuttled between the client and the upstream socket until
//! either side closes or the session stays idle for too long.
//!
//! Everything runs on one thread, around one `mio::Poll`:
//!
//! - [`server::Server`] owns the poll instance and the tick
//! - [`relay::Relay`] owns the listening socket, the sessions, the registry
//!   of tokens and the timeout sweep
//! - [`relay::handler::RelayHandler`] is the per-connection state machine
//! - [`protocol::header::HeaderParser`] is the streaming HTTP header parser
//! - [`resolver`] resolves host names off the loop thread
//!
//! Sessions never talk to mio directly: they go through the [`RelayProxy`]
//! trait, which the relay implements on top of the real event loop and tests
//! implement with in-memory doubles.

#[macro_use]
extern crate log;
pub extern crate proxyx_command_lib as proxyx_command;

pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod socket;
pub mod timer;

use std::{
    fmt, io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use mio::Token;

use crate::{proxyx_command::ready::Ready, resolver::ResolveToken, socket::SocketHandler};

/// Identifier of a session in the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub usize);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the two sockets of a session a token designates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Continue,
    Close,
}

/// `interest` is what the session wants to act on, `event` is what the
/// event loop reported since the last time the session handled it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub interest: Ready,
    pub event: Ready,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub const fn new() -> Readiness {
        Readiness {
            interest: Ready::EMPTY,
            event: Ready::EMPTY,
        }
    }

    pub fn reset(&mut self) {
        self.interest = Ready::EMPTY;
        self.event = Ready::EMPTY;
    }

    /// filters the events according to the interest
    pub fn filter_interest(&self) -> Ready {
        self.event & self.interest
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "I({})&E({})", self.interest, self.event)
    }
}

/// Byte counters of a session, reported in the access log
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub start: Instant,
    /// bytes read from the client
    pub bin: usize,
    /// bytes written to the client
    pub bout: usize,
    /// bytes read from the upstream
    pub backend_bin: usize,
    /// bytes written to the upstream
    pub backend_bout: usize,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetrics {
    pub fn new() -> SessionMetrics {
        SessionMetrics {
            start: Instant::now(),
            bin: 0,
            bout: 0,
            backend_bin: 0,
            backend_bout: 0,
        }
    }

    pub fn service_time(&self) -> Duration {
        self.start.elapsed()
    }
}

/// What a session needs from the relay that owns it
///
/// The relay implements it on top of mio and the resolver, tests implement
/// it with recording doubles.
pub trait RelayProxy {
    type Socket: SocketHandler;

    /// register the socket with the event loop and record that its token
    /// belongs to `side` of `session`
    fn register_socket(
        &mut self,
        socket: &mut Self::Socket,
        session: SessionId,
        side: Side,
    ) -> io::Result<Token>;

    /// remove the socket from the event loop and from the token registry.
    /// Must be called before the socket is closed
    fn deregister_socket(&mut self, socket: &mut Self::Socket, token: Token);

    /// open a non blocking connection, usually still in progress on return
    fn connect(&mut self, address: SocketAddr) -> io::Result<Self::Socket>;

    /// start resolving `host`. The result is delivered later through
    /// `RelayHandler::resolved`, unless the token is cancelled first
    fn resolve(&mut self, session: SessionId, host: &str, port: u16) -> ResolveToken;

    fn cancel_resolve(&mut self, token: ResolveToken);

    /// refresh the idle timeout of the session
    fn touch(&mut self, session: SessionId);

    /// the session is destroyed and must be dropped from the relay
    fn remove_session(&mut self, session: SessionId);
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("could not create the event loop: {0}")]
    CreatePoll(io::Error),
    #[error("could not poll events: {0}")]
    Poll(io::Error),
    #[error("could not bind to {address}: {error}")]
    Bind {
        address: SocketAddr,
        error: io::Error,
    },
    #[error("could not register the listener: {0}")]
    RegisterListener(io::Error),
    #[error("could not start the resolver: {0}")]
    Resolver(io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] proxyx_command::config::ConfigError),
}
