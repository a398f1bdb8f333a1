//! The listener side of the relay
//!
//! [`Relay`] accepts client connections, owns their sessions and routes the
//! events of the loop to them. What the sessions need from it goes through
//! [`RelayCore`], the part of the relay implementing [`RelayProxy`]: socket
//! registration, outbound connections, resolutions and idle timeouts.
pub mod handler;

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::{Shutdown, SocketAddr},
    time::{Duration, Instant},
};

use mio::{
    net::{TcpListener, TcpStream},
    Interest, Registry, Token,
};
use slab::Slab;

use crate::{
    proxyx_command::{config::Config, ready::Ready},
    relay::handler::RelayHandler,
    resolver::{ResolveToken, Resolver},
    server::LISTENER,
    socket::{connect_stream, server_bind},
    timer::TimeoutSlots,
    RelayProxy, ServerError, SessionId, Side,
};

/// Everything the sessions share
pub struct RelayCore<R: Resolver> {
    registry: Registry,
    /// token of every registered session socket, and whom it belongs to
    endpoints: Slab<(SessionId, Side)>,
    resolver: R,
    resolutions: HashMap<ResolveToken, SessionId>,
    timeouts: TimeoutSlots,
    /// sessions torn down since the last cleanup
    closed: Vec<SessionId>,
    /// deregistered tokens, kept in `endpoints` until the end of the event
    /// batch so a queued event never reaches the new owner of a reused token
    released: Vec<Token>,
    fast_open: bool,
}

impl<R: Resolver> RelayCore<R> {
    pub fn endpoint(&self, token: Token) -> Option<(SessionId, Side)> {
        self.endpoints.get(token.0).copied()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn pending_resolutions(&self) -> usize {
        self.resolutions.len()
    }

    pub fn timeouts(&self) -> &TimeoutSlots {
        &self.timeouts
    }
}

impl<R: Resolver> RelayProxy for RelayCore<R> {
    type Socket = TcpStream;

    fn register_socket(
        &mut self,
        socket: &mut TcpStream,
        session: SessionId,
        side: Side,
    ) -> io::Result<Token> {
        let entry = self.endpoints.vacant_entry();
        let token = Token(entry.key());
        // edge triggered: interest is filtered by the session itself
        self.registry
            .register(socket, token, Interest::READABLE | Interest::WRITABLE)?;
        entry.insert((session, side));
        Ok(token)
    }

    fn deregister_socket(&mut self, socket: &mut TcpStream, token: Token) {
        if let Err(e) = self.registry.deregister(socket) {
            error!("error deregistering socket({:?}): {:?}", token, e);
        }
        if self.endpoints.contains(token.0) {
            self.released.push(token);
        } else {
            warn!("deregistering an unknown token {:?}", token);
        }
    }

    fn connect(&mut self, address: SocketAddr) -> io::Result<TcpStream> {
        connect_stream(address, self.fast_open)
    }

    fn resolve(&mut self, session: SessionId, host: &str, port: u16) -> ResolveToken {
        let token = self.resolver.resolve(host, port);
        self.resolutions.insert(token, session);
        token
    }

    fn cancel_resolve(&mut self, token: ResolveToken) {
        self.resolutions.remove(&token);
        self.resolver.cancel(token);
    }

    fn touch(&mut self, session: SessionId) {
        self.timeouts.touch(session, Instant::now());
    }

    fn remove_session(&mut self, session: SessionId) {
        self.timeouts.remove(session);
        self.closed.push(session);
    }
}

pub struct Relay<R: Resolver> {
    listener: Option<TcpListener>,
    listen_address: SocketAddr,
    sessions: Slab<RelayHandler<TcpStream>>,
    core: RelayCore<R>,
    buffer_size: usize,
    max_header_size: usize,
    max_connections: usize,
    last_sweep: Instant,
}

impl<R: Resolver> Relay<R> {
    /// bind the listening socket and register it with `registry` under
    /// [`LISTENER`]
    pub fn new(config: &Config, registry: &Registry, resolver: R) -> Result<Relay<R>, ServerError> {
        let address = config.listen_socket_address()?;
        let (mut listener, fast_open) = server_bind(address, config.fast_open)
            .map_err(|error| ServerError::Bind { address, error })?;
        let listen_address = listener
            .local_addr()
            .map_err(|error| ServerError::Bind { address, error })?;

        registry
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::RegisterListener)?;
        let registry = registry.try_clone().map_err(ServerError::CreatePoll)?;

        if fast_open {
            info!("TCP fast open enabled on {}", listen_address);
        }

        Ok(Relay {
            listener: Some(listener),
            listen_address,
            sessions: Slab::with_capacity(config.max_connections.min(1024)),
            core: RelayCore {
                registry,
                endpoints: Slab::new(),
                resolver,
                resolutions: HashMap::new(),
                timeouts: TimeoutSlots::new(Duration::from_secs(config.timeout)),
                closed: Vec::new(),
                released: Vec::new(),
                fast_open: config.fast_open,
            },
            buffer_size: config.buffer_size,
            max_header_size: config.max_header_size,
            max_connections: config.max_connections,
            last_sweep: Instant::now(),
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.listen_address
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, session: SessionId) -> Option<&RelayHandler<TcpStream>> {
        self.sessions.get(session.0)
    }

    pub fn core(&self) -> &RelayCore<R> {
        &self.core
    }

    /// accept every connection available right now
    pub fn accept(&mut self) {
        loop {
            let listener = match &self.listener {
                Some(listener) => listener,
                None => return,
            };

            match listener.accept() {
                Ok((stream, address)) => self.create_session(stream, address),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept error: {:?}", e);
                    break;
                }
            }
        }
    }

    fn create_session(&mut self, mut stream: TcpStream, address: SocketAddr) {
        if self.sessions.len() >= self.max_connections {
            warn!(
                "too many connections ({}), refusing {}",
                self.sessions.len(),
                address
            );
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY on {}: {}", address, e);
        }

        let entry = self.sessions.vacant_entry();
        let id = SessionId(entry.key());
        let token = match self.core.register_socket(&mut stream, id, Side::Client) {
            Ok(token) => token,
            Err(e) => {
                error!("could not register the connection of {}: {}", address, e);
                return;
            }
        };

        entry.insert(RelayHandler::new(
            id,
            stream,
            token,
            self.buffer_size,
            self.max_header_size,
        ));
        self.core.touch(id);
        debug!("accepted {} as session {} with {:?}", address, id, token);
    }

    /// deliver the events reported for `token` to the session owning it
    pub fn dispatch(&mut self, token: Token, events: Ready) {
        let (session, side) = match self.core.endpoint(token) {
            Some(endpoint) => endpoint,
            None => {
                warn!("events {:?} for an unknown token {:?}", events, token);
                return;
            }
        };

        match self.sessions.get_mut(session.0) {
            Some(handler) if !handler.owns_token(side, token) => debug!(
                "events {:?} for the released token {:?} of session {}",
                events, token, session
            ),
            Some(handler) => {
                handler.ready(side, events, &mut self.core);
            }
            None => warn!(
                "events {:?} for token {:?} of the missing session {}",
                events, token, session
            ),
        }

        self.cleanup();
    }

    /// hand the completed resolutions to their sessions
    pub fn handle_resolutions(&mut self) {
        for (token, result) in self.core.resolver.poll_results() {
            let session = match self.core.resolutions.remove(&token) {
                Some(session) => session,
                None => {
                    debug!("resolution {:?} has no session anymore", token);
                    continue;
                }
            };

            if let Some(handler) = self.sessions.get_mut(session.0) {
                handler.resolved(result, &mut self.core);
            }
        }

        self.cleanup();
    }

    /// tear down the sessions idle for longer than the timeout, returns how
    /// many were closed
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired = self.core.timeouts.sweep_expired(now);
        for session in &expired {
            if let Some(handler) = self.sessions.get_mut(session.0) {
                handler.timeout(&mut self.core);
            }
        }

        self.cleanup();
        self.last_sweep = now;
        expired.len()
    }

    /// sweep at most once per timeout precision
    pub fn sweep_if_due(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_sweep) < self.core.timeouts.precision() {
            return 0;
        }
        self.sweep_expired(now)
    }

    /// stop accepting connections, the current sessions go on
    pub fn close_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.core.registry.deregister(&mut listener) {
                error!("error deregistering the listener: {:?}", e);
            }
            info!("stopped listening on {}", self.listen_address);
        }
    }

    /// free the tokens deregistered since the last call, once no event of the
    /// current batch can refer to them anymore
    pub fn release_tokens(&mut self) {
        for token in self.core.released.drain(..) {
            self.core.endpoints.try_remove(token.0);
        }
    }

    fn cleanup(&mut self) {
        for session in self.core.closed.drain(..) {
            if self.sessions.try_remove(session.0).is_none() {
                warn!("session {} was already removed", session);
            }
        }
    }
}
