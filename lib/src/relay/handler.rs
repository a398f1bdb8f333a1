//! Per connection state machine
//!
//! A session reads the client until the first request's header block is
//! complete, resolves the destination found in it, connects to the upstream,
//! then relays bytes in both directions without looking at them anymore.
//!
//! Flow control follows the readiness model used everywhere in the relay:
//! `interest` says what the session wants to do on a socket, `event` what the
//! event loop reported. A direction with pending bytes stops reading its
//! source and waits for its destination to be writable, so at most one read
//! worth of data is queued per direction once streaming.
use std::{io, net::SocketAddr};

use mio::Token;
use rusty_ulid::Ulid;

use crate::{
    protocol::{
        header::{HeaderParser, Kind},
        Route,
    },
    proxyx_command::{config::MAX_LOOP_ITERATIONS, ready::Ready},
    resolver::{ResolveResult, ResolveToken},
    socket::{SocketHandler, SocketResult},
    Readiness, RelayProxy, SessionId, SessionMetrics, SessionResult, Side,
};

macro_rules! log_context {
    ($self:expr) => {
        format!(
            "RELAY\t{}\tSession(id={}, state={:?}, client={}, readiness={}, upstream={}, readiness={})\t >>>",
            $self.request_id,
            $self.id,
            $self.state,
            $self.client_token.0,
            $self.client_readiness,
            $self
                .upstream_token
                .map(|token| token.0.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $self.upstream_readiness,
        )
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// reading the first request's header block
    Init,
    /// waiting for the resolver
    AwaitingRoute,
    /// upstream connection started, bytes flow in both directions
    Streaming,
    Destroyed,
}

/// Bytes waiting for their destination to be writable
#[derive(Debug, Default)]
pub struct PendingBuffer {
    data: Vec<u8>,
    position: usize,
}

impl PendingBuffer {
    pub fn len(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unwritten(&self) -> &[u8] {
        &self.data[self.position..]
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn consume(&mut self, size: usize) {
        self.position = (self.position + size).min(self.data.len());
        if self.position == self.data.len() {
            self.data.clear();
            self.position = 0;
        }
    }
}

pub struct RelayHandler<S: SocketHandler> {
    id: SessionId,
    request_id: Ulid,
    state: RelayState,

    client_socket: S,
    client_token: Token,
    client_address: Option<SocketAddr>,
    client_readiness: Readiness,

    upstream_socket: Option<S>,
    upstream_token: Option<Token>,
    upstream_address: Option<SocketAddr>,
    upstream_readiness: Readiness,
    upstream_connected: bool,

    to_client: PendingBuffer,
    to_upstream: PendingBuffer,
    read_buffer: Vec<u8>,

    route: Option<Route>,
    request_parser: HeaderParser,
    response_parser: HeaderParser,
    resolve_token: Option<ResolveToken>,
    max_header_size: usize,

    metrics: SessionMetrics,
}

impl<S: SocketHandler> RelayHandler<S> {
    /// `client_token` is the token the client socket was registered with
    pub fn new(
        id: SessionId,
        client_socket: S,
        client_token: Token,
        buffer_size: usize,
        max_header_size: usize,
    ) -> RelayHandler<S> {
        let client_address = client_socket.peer_address();

        RelayHandler {
            id,
            request_id: Ulid::generate(),
            state: RelayState::Init,
            client_socket,
            client_token,
            client_address,
            client_readiness: Readiness {
                interest: Ready::READABLE | Ready::ERROR,
                event: Ready::EMPTY,
            },
            upstream_socket: None,
            upstream_token: None,
            upstream_address: None,
            upstream_readiness: Readiness::new(),
            upstream_connected: false,
            to_client: PendingBuffer::default(),
            to_upstream: PendingBuffer::default(),
            read_buffer: vec![0; buffer_size],
            route: None,
            request_parser: HeaderParser::new(Kind::Request),
            response_parser: HeaderParser::new(Kind::Response),
            resolve_token: None,
            max_header_size,
            metrics: SessionMetrics::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn request_id(&self) -> Ulid {
        self.request_id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == RelayState::Destroyed
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn client_token(&self) -> Token {
        self.client_token
    }

    pub fn upstream_token(&self) -> Option<Token> {
        self.upstream_token
    }

    /// whether `token` is the current token of the socket on `side`
    pub fn owns_token(&self, side: Side, token: Token) -> bool {
        match side {
            Side::Client => self.client_token == token,
            Side::Upstream => self.upstream_token == Some(token),
        }
    }

    pub fn upstream_address(&self) -> Option<SocketAddr> {
        self.upstream_address
    }

    pub fn resolve_token(&self) -> Option<ResolveToken> {
        self.resolve_token
    }

    pub fn client_readiness(&self) -> &Readiness {
        &self.client_readiness
    }

    pub fn upstream_readiness(&self) -> &Readiness {
        &self.upstream_readiness
    }

    pub fn to_client_len(&self) -> usize {
        self.to_client.len()
    }

    pub fn to_upstream_len(&self) -> usize {
        self.to_upstream.len()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Handle the events the loop reported for one of the session's sockets.
    /// Returns `Close` once the session is destroyed, its sockets are then
    /// already deregistered and closed
    pub fn ready<P>(&mut self, side: Side, events: Ready, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        if self.state == RelayState::Destroyed {
            warn!(
                "{} dropping {:?} events on the {:?} socket of a destroyed session",
                log_context!(self),
                events,
                side
            );
            return SessionResult::Close;
        }

        match side {
            Side::Client => self.client_readiness.event |= events,
            Side::Upstream if self.upstream_socket.is_some() => {
                self.upstream_readiness.event |= events
            }
            Side::Upstream => {
                warn!(
                    "{} upstream events {:?} without an upstream socket",
                    log_context!(self),
                    events
                );
            }
        }

        let session_result = self.ready_inner(proxy);
        if session_result == SessionResult::Close {
            self.teardown(proxy);
        }
        session_result
    }

    fn ready_inner<P>(&mut self, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        if self.upstream_socket.is_some()
            && !self.upstream_connected
            && !self.upstream_readiness.event.is_empty()
        {
            if let Err(e) = self.check_upstream_connection() {
                error!(
                    "{} could not connect to {:?}: {}",
                    log_context!(self),
                    self.upstream_address,
                    e
                );
                return SessionResult::Close;
            }
        }

        let mut counter = 0;
        while counter < MAX_LOOP_ITERATIONS {
            let client_interest = self.client_readiness.filter_interest();
            let upstream_interest = self.upstream_readiness.filter_interest();
            let client_readable = can_read(&self.client_readiness);
            let upstream_readable = can_read(&self.upstream_readiness);

            trace!(
                "{} client interest({:?}) and upstream interest({:?})",
                log_context!(self),
                client_interest,
                upstream_interest,
            );

            if client_interest.is_empty()
                && upstream_interest.is_empty()
                && !client_readable
                && !upstream_readable
            {
                break;
            }

            if client_interest.is_error() {
                error!("{} client socket error, disconnecting", log_context!(self));
                return SessionResult::Close;
            }

            if upstream_interest.is_error() {
                error!("{} upstream socket error, disconnecting", log_context!(self));
                return SessionResult::Close;
            }

            if client_readable && self.readable(proxy) == SessionResult::Close {
                return SessionResult::Close;
            }

            if upstream_interest.is_writable() && self.upstream_writable(proxy) == SessionResult::Close
            {
                return SessionResult::Close;
            }

            if upstream_readable && self.upstream_readable(proxy) == SessionResult::Close {
                return SessionResult::Close;
            }

            if client_interest.is_writable() && self.writable(proxy) == SessionResult::Close {
                return SessionResult::Close;
            }

            counter += 1;
        }

        if counter >= MAX_LOOP_ITERATIONS {
            error!(
                "{}\tHandling session went through {} iterations, there's a probable infinite loop bug, closing the connection",
                log_context!(self),
                MAX_LOOP_ITERATIONS
            );
            return SessionResult::Close;
        }

        SessionResult::Continue
    }

    /// the first event on a connecting socket tells whether the connect
    /// succeeded
    fn check_upstream_connection(&mut self) -> io::Result<()> {
        let socket = self
            .upstream_socket
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no upstream socket"))?;

        if let Some(e) = socket.take_error() {
            return Err(e);
        }
        if self.upstream_readiness.event.is_error() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "error event on the upstream socket",
            ));
        }

        debug!("{} connected to {:?}", log_context!(self), self.upstream_address);
        self.upstream_connected = true;
        // the upstream may answer before the whole request is written
        self.upstream_readiness.interest.insert(Ready::READABLE);
        Ok(())
    }

    fn readable<P>(&mut self, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        trace!("{} ============== readable", log_context!(self));

        let (size, socket_state) = self.client_socket.socket_read(&mut self.read_buffer);
        debug!("{} Read {} bytes", log_context!(self), size);

        if size > 0 {
            proxy.touch(self.id);
            self.metrics.bin += size;
            self.to_upstream.push(&self.read_buffer[..size]);

            match self.state {
                RelayState::Init => self.request_parser.feed(&self.read_buffer[..size]),
                RelayState::Streaming => {
                    self.client_readiness.interest.remove(Ready::READABLE);
                    self.upstream_readiness.interest.insert(Ready::WRITABLE);
                }
                RelayState::AwaitingRoute | RelayState::Destroyed => {}
            }
        }

        match socket_state {
            SocketResult::Closed => {
                debug!("{} client closed the connection", log_context!(self));
                return SessionResult::Close;
            }
            SocketResult::Error => {
                error!(
                    "{} client socket read error, closing the session",
                    log_context!(self)
                );
                return SessionResult::Close;
            }
            SocketResult::WouldBlock => self.client_readiness.event.remove(Ready::READABLE | Ready::HUP),
            SocketResult::Continue => {}
        }

        if self.state == RelayState::Init && size > 0 {
            return self.route_request(proxy);
        }
        SessionResult::Continue
    }

    fn route_request<P>(&mut self, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        if !self.request_parser.is_header_complete() {
            if self.request_parser.buffered_len() > self.max_header_size {
                warn!(
                    "{} header block larger than {} bytes, closing",
                    log_context!(self),
                    self.max_header_size
                );
                return SessionResult::Close;
            }
            return SessionResult::Continue;
        }

        let route = match self.request_parser.extract_host() {
            Some(route) => route,
            None => {
                info!(
                    "{} no destination host in the request, closing",
                    log_context!(self)
                );
                return SessionResult::Close;
            }
        };

        debug!("{} routing to {}", log_context!(self), route);
        self.client_readiness.interest.remove(Ready::READABLE);
        self.resolve_token = Some(proxy.resolve(self.id, &route.host, route.port));
        self.route = Some(route);
        self.state = RelayState::AwaitingRoute;
        SessionResult::Continue
    }

    fn writable<P>(&mut self, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        trace!("{} ============== writable", log_context!(self));

        if self.to_client.is_empty() {
            self.client_readiness.interest.remove(Ready::WRITABLE);
            return SessionResult::Continue;
        }

        let (size, socket_state) = self.client_socket.socket_write(self.to_client.unwritten());
        debug!("{} Wrote {} bytes", log_context!(self), size);

        if size > 0 {
            proxy.touch(self.id);
            self.metrics.bout += size;
            self.to_client.consume(size);
        }

        match socket_state {
            SocketResult::Closed | SocketResult::Error => {
                error!(
                    "{} client socket write error, closing the session",
                    log_context!(self)
                );
                return SessionResult::Close;
            }
            SocketResult::WouldBlock => self.client_readiness.event.remove(Ready::WRITABLE),
            SocketResult::Continue => {}
        }

        if self.to_client.is_empty() {
            self.client_readiness.interest.remove(Ready::WRITABLE);
            if self.upstream_socket.is_some() {
                self.upstream_readiness.interest.insert(Ready::READABLE);
            }
        }
        SessionResult::Continue
    }

    fn upstream_readable<P>(&mut self, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        trace!("{} ============== upstream_readable", log_context!(self));

        let (size, socket_state) = match self.upstream_socket.as_mut() {
            Some(socket) => socket.socket_read(&mut self.read_buffer),
            None => {
                self.upstream_readiness.event.remove(Ready::READABLE | Ready::HUP);
                return SessionResult::Continue;
            }
        };
        debug!("{} Read {} bytes", log_context!(self), size);

        if size > 0 {
            proxy.touch(self.id);
            self.metrics.backend_bin += size;
            self.to_client.push(&self.read_buffer[..size]);

            // only the status line matters, for the access log
            if !self.response_parser.is_header_complete()
                && self.response_parser.buffered_len() < self.max_header_size
            {
                self.response_parser.feed(&self.read_buffer[..size]);
            }

            self.upstream_readiness.interest.remove(Ready::READABLE);
            self.client_readiness.interest.insert(Ready::WRITABLE);
        }

        match socket_state {
            SocketResult::Closed => {
                debug!("{} upstream closed the connection", log_context!(self));
                return SessionResult::Close;
            }
            SocketResult::Error => {
                error!(
                    "{} upstream socket read error, closing the session",
                    log_context!(self)
                );
                return SessionResult::Close;
            }
            SocketResult::WouldBlock => self
                .upstream_readiness
                .event
                .remove(Ready::READABLE | Ready::HUP),
            SocketResult::Continue => {}
        }
        SessionResult::Continue
    }

    fn upstream_writable<P>(&mut self, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        trace!("{} ============== upstream_writable", log_context!(self));

        if !self.upstream_connected {
            self.upstream_readiness.event.remove(Ready::WRITABLE);
            return SessionResult::Continue;
        }

        if self.to_upstream.is_empty() {
            self.upstream_readiness.interest.remove(Ready::WRITABLE);
            return SessionResult::Continue;
        }

        let (size, socket_state) = match self.upstream_socket.as_mut() {
            Some(socket) => socket.socket_write(self.to_upstream.unwritten()),
            None => {
                self.upstream_readiness.event.remove(Ready::WRITABLE);
                return SessionResult::Continue;
            }
        };
        debug!("{} Wrote {} bytes", log_context!(self), size);

        if size > 0 {
            proxy.touch(self.id);
            self.metrics.backend_bout += size;
            self.to_upstream.consume(size);
        }

        match socket_state {
            SocketResult::Closed | SocketResult::Error => {
                error!(
                    "{} upstream socket write error, closing the session",
                    log_context!(self)
                );
                return SessionResult::Close;
            }
            SocketResult::WouldBlock => self.upstream_readiness.event.remove(Ready::WRITABLE),
            SocketResult::Continue => {}
        }

        if self.to_upstream.is_empty() {
            self.upstream_readiness.interest.remove(Ready::WRITABLE);
            self.client_readiness.interest.insert(Ready::READABLE);
        }
        SessionResult::Continue
    }

    /// Outcome of the resolution started by this session. A result arriving
    /// in any other state than `AwaitingRoute` is ignored
    pub fn resolved<P>(&mut self, result: ResolveResult, proxy: &mut P) -> SessionResult
    where
        P: RelayProxy<Socket = S>,
    {
        match self.state {
            RelayState::AwaitingRoute => {}
            RelayState::Destroyed => return SessionResult::Close,
            RelayState::Init | RelayState::Streaming => {
                warn!(
                    "{} unexpected resolution result {:?}",
                    log_context!(self),
                    result
                );
                return SessionResult::Continue;
            }
        }

        self.resolve_token = None;
        let session_result = match result {
            Ok(address) => match self.connect_upstream(address, proxy) {
                Ok(()) => SessionResult::Continue,
                Err(e) => {
                    error!(
                        "{} could not connect to {}: {}",
                        log_context!(self),
                        address,
                        e
                    );
                    SessionResult::Close
                }
            },
            Err(e) => {
                warn!("{} {}", log_context!(self), e);
                SessionResult::Close
            }
        };

        if session_result == SessionResult::Close {
            self.teardown(proxy);
        }
        session_result
    }

    fn connect_upstream<P>(&mut self, address: SocketAddr, proxy: &mut P) -> io::Result<()>
    where
        P: RelayProxy<Socket = S>,
    {
        let mut socket = proxy.connect(address)?;
        let token = match proxy.register_socket(&mut socket, self.id, Side::Upstream) {
            Ok(token) => token,
            Err(e) => {
                socket.socket_close();
                return Err(e);
            }
        };

        self.upstream_socket = Some(socket);
        self.upstream_token = Some(token);
        self.upstream_address = Some(address);
        // a connecting socket becomes writable, or errors, once the
        // handshake is over
        self.upstream_readiness = Readiness {
            interest: Ready::WRITABLE | Ready::ERROR,
            event: Ready::EMPTY,
        };
        self.state = RelayState::Streaming;
        proxy.touch(self.id);

        debug!("{} connecting to {}", log_context!(self), address);
        Ok(())
    }

    pub fn timeout<P>(&mut self, proxy: &mut P)
    where
        P: RelayProxy<Socket = S>,
    {
        info!("{} idle for too long, closing", log_context!(self));
        self.teardown(proxy);
    }

    /// Release everything the session holds. Calling it again is a no-op
    pub fn teardown<P>(&mut self, proxy: &mut P)
    where
        P: RelayProxy<Socket = S>,
    {
        if self.state == RelayState::Destroyed {
            return;
        }
        let last_state = self.state;
        self.state = RelayState::Destroyed;

        if let Some(token) = self.resolve_token.take() {
            proxy.cancel_resolve(token);
        }

        if let Some(mut socket) = self.upstream_socket.take() {
            if let Some(token) = self.upstream_token {
                proxy.deregister_socket(&mut socket, token);
            }
            socket.socket_close();
        }

        proxy.deregister_socket(&mut self.client_socket, self.client_token);
        self.client_socket.socket_close();

        self.client_readiness.reset();
        self.upstream_readiness.reset();
        proxy.remove_session(self.id);

        self.log_access(last_state);
    }

    fn log_access(&self, last_state: RelayState) {
        let client = self
            .client_address
            .map(|address| address.to_string())
            .unwrap_or_else(|| String::from("-"));
        let route = self
            .route
            .as_ref()
            .map(|route| route.to_string())
            .unwrap_or_else(|| String::from("-"));
        let upstream = self
            .upstream_address
            .map(|address| address.to_string())
            .unwrap_or_else(|| String::from("-"));
        let status = self
            .response_parser
            .status_code()
            .map(|status| status.to_string())
            .unwrap_or_else(|| String::from("-"));

        info!(
            "RELAY\t{}\t{} -> {} ({})\tstatus={} bin={} bout={} backend_bin={} backend_bout={} duration={:?} last_state={:?}",
            self.request_id,
            client,
            route,
            upstream,
            status,
            self.metrics.bin,
            self.metrics.bout,
            self.metrics.backend_bin,
            self.metrics.backend_bout,
            self.metrics.service_time(),
            last_state,
        );
    }
}

/// a pending HUP is only acted on through a read, so end of stream waits
/// behind the read interest like data does
fn can_read(readiness: &Readiness) -> bool {
    readiness.interest.is_readable()
        && (readiness.event.is_readable() || readiness.event.is_hup())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        cell::RefCell,
        collections::{HashMap, VecDeque},
        io::ErrorKind,
        rc::Rc,
    };

    use crate::resolver::ResolveError;

    const BUFFER_SIZE: usize = 16 * 1024;
    const MAX_HEADER_SIZE: usize = 64 * 1024;

    #[derive(Debug)]
    enum ReadStep {
        Data(Vec<u8>),
        WouldBlock,
        Eof,
        Error,
    }

    #[derive(Debug, Default)]
    struct MockState {
        reads: VecDeque<ReadStep>,
        written: Vec<u8>,
        /// largest write accepted per call
        max_write: Option<usize>,
        /// every write would block
        blocked: bool,
        /// a short write is followed by a would block, like a full kernel
        /// buffer
        would_block_next: bool,
        closed: usize,
        connect_error: bool,
    }

    #[derive(Debug, Clone, Default)]
    struct MockSocket(Rc<RefCell<MockState>>);

    impl MockSocket {
        fn push_read(&self, step: ReadStep) {
            self.0.borrow_mut().reads.push_back(step);
        }

        fn push_data(&self, data: &[u8]) {
            self.push_read(ReadStep::Data(data.to_vec()));
        }

        fn written(&self) -> Vec<u8> {
            self.0.borrow().written.clone()
        }

        fn closed(&self) -> usize {
            self.0.borrow().closed
        }

        fn pending_reads(&self) -> usize {
            self.0.borrow().reads.len()
        }
    }

    impl SocketHandler for MockSocket {
        fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
            let mut state = self.0.borrow_mut();
            match state.reads.pop_front() {
                None | Some(ReadStep::WouldBlock) => (0, SocketResult::WouldBlock),
                Some(ReadStep::Eof) => (0, SocketResult::Closed),
                Some(ReadStep::Error) => (0, SocketResult::Error),
                Some(ReadStep::Data(data)) => {
                    let size = buf.len().min(data.len());
                    buf[..size].copy_from_slice(&data[..size]);
                    if size < data.len() {
                        state.reads.push_front(ReadStep::Data(data[size..].to_vec()));
                    }
                    (size, SocketResult::Continue)
                }
            }
        }

        fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
            let mut state = self.0.borrow_mut();
            if state.blocked || state.would_block_next {
                state.would_block_next = false;
                return (0, SocketResult::WouldBlock);
            }

            let size = state.max_write.map_or(buf.len(), |max| max.min(buf.len()));
            state.written.extend_from_slice(&buf[..size]);
            if size < buf.len() {
                state.would_block_next = true;
            }
            (size, SocketResult::Continue)
        }

        fn socket_close(&mut self) {
            self.0.borrow_mut().closed += 1;
        }

        fn take_error(&mut self) -> Option<io::Error> {
            if self.0.borrow().connect_error {
                Some(io::Error::from(ErrorKind::ConnectionRefused))
            } else {
                None
            }
        }

        fn peer_address(&self) -> Option<SocketAddr> {
            "127.0.0.1:50000".parse().ok()
        }
    }

    #[derive(Default)]
    struct MockProxy {
        next_token: usize,
        registered: HashMap<Token, Side>,
        deregistered: Vec<Token>,
        upstream: MockSocket,
        connect_fails: bool,
        connects: Vec<SocketAddr>,
        resolves: Vec<(SessionId, String, u16)>,
        cancelled: Vec<ResolveToken>,
        touched: usize,
        removed: Vec<SessionId>,
    }

    impl RelayProxy for MockProxy {
        type Socket = MockSocket;

        fn register_socket(
            &mut self,
            _socket: &mut MockSocket,
            _session: SessionId,
            side: Side,
        ) -> io::Result<Token> {
            self.next_token += 1;
            let token = Token(self.next_token);
            self.registered.insert(token, side);
            Ok(token)
        }

        fn deregister_socket(&mut self, _socket: &mut MockSocket, token: Token) {
            self.registered.remove(&token);
            self.deregistered.push(token);
        }

        fn connect(&mut self, address: SocketAddr) -> io::Result<MockSocket> {
            self.connects.push(address);
            if self.connect_fails {
                return Err(io::Error::from(ErrorKind::AddrNotAvailable));
            }
            Ok(self.upstream.clone())
        }

        fn resolve(&mut self, session: SessionId, host: &str, port: u16) -> ResolveToken {
            self.resolves.push((session, host.to_owned(), port));
            ResolveToken(self.resolves.len() as u64)
        }

        fn cancel_resolve(&mut self, token: ResolveToken) {
            self.cancelled.push(token);
        }

        fn touch(&mut self, _session: SessionId) {
            self.touched += 1;
        }

        fn remove_session(&mut self, session: SessionId) {
            self.removed.push(session);
        }
    }

    const CLIENT: Token = Token(0);

    fn session(buffer_size: usize) -> (RelayHandler<MockSocket>, MockSocket, MockProxy) {
        let client = MockSocket::default();
        let proxy = MockProxy::default();
        let handler = RelayHandler::new(
            SessionId(3),
            client.clone(),
            CLIENT,
            buffer_size,
            MAX_HEADER_SIZE,
        );
        (handler, client, proxy)
    }

    fn all() -> Ready {
        Ready::READABLE | Ready::WRITABLE
    }

    #[test]
    fn end_to_end_through_a_resolved_upstream() {
        let request = b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        let upstream = proxy.upstream.clone();

        client.push_data(request);
        assert_eq!(handler.ready(Side::Client, all(), &mut proxy), SessionResult::Continue);
        assert_eq!(handler.state(), RelayState::AwaitingRoute);
        assert_eq!(
            proxy.resolves,
            vec![(SessionId(3), String::from("example.com"), 80)]
        );
        assert_eq!(handler.to_upstream_len(), request.len());
        assert!(!handler.client_readiness().interest.is_readable());

        let address: SocketAddr = "93.184.216.34:80".parse().unwrap();
        assert_eq!(
            handler.resolved(Ok(address), &mut proxy),
            SessionResult::Continue
        );
        assert_eq!(handler.state(), RelayState::Streaming);
        assert_eq!(proxy.connects, vec![address]);
        let upstream_token = handler.upstream_token().expect("upstream registered");
        assert_eq!(proxy.registered.get(&upstream_token), Some(&Side::Upstream));
        assert_eq!(handler.resolve_token(), None);

        // connected: the request goes out verbatim
        assert_eq!(
            handler.ready(Side::Upstream, Ready::WRITABLE, &mut proxy),
            SessionResult::Continue
        );
        assert_eq!(upstream.written(), request.to_vec());
        assert_eq!(handler.to_upstream_len(), 0);
        assert!(handler.client_readiness().interest.is_readable());

        upstream.push_data(response);
        upstream.push_read(ReadStep::Eof);
        assert_eq!(
            handler.ready(Side::Upstream, Ready::READABLE, &mut proxy),
            SessionResult::Close
        );

        assert_eq!(client.written(), response.to_vec());
        assert_eq!(handler.state(), RelayState::Destroyed);
        assert_eq!(client.closed(), 1);
        assert_eq!(upstream.closed(), 1);
        assert!(proxy.registered.is_empty());
        assert_eq!(proxy.deregistered, vec![upstream_token, CLIENT]);
        assert_eq!(proxy.removed, vec![SessionId(3)]);
        assert!(proxy.touched > 0);

        let metrics = handler.metrics();
        assert_eq!(metrics.bin, request.len());
        assert_eq!(metrics.backend_bout, request.len());
        assert_eq!(metrics.backend_bin, response.len());
        assert_eq!(metrics.bout, response.len());
        assert_eq!(handler.response_parser.status_code(), Some(200));
    }

    #[test]
    fn missing_host_closes_without_upstream() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        client.push_data(b"GET / HTTP/1.1\r\n\r\n");

        assert_eq!(handler.ready(Side::Client, all(), &mut proxy), SessionResult::Close);
        assert_eq!(handler.state(), RelayState::Destroyed);
        assert!(proxy.resolves.is_empty());
        assert!(proxy.connects.is_empty());
        assert_eq!(client.closed(), 1);
        assert!(client.written().is_empty());
        assert_eq!(proxy.removed, vec![SessionId(3)]);
    }

    #[test]
    fn header_split_by_would_block() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        client.push_data(b"GET / HTTP/1.1\r\nHo");
        client.push_read(ReadStep::WouldBlock);
        client.push_data(b"st: localhost:3000\r\n\r\n");

        assert_eq!(handler.ready(Side::Client, all(), &mut proxy), SessionResult::Continue);
        assert_eq!(handler.state(), RelayState::Init);
        assert!(proxy.resolves.is_empty());

        assert_eq!(
            handler.ready(Side::Client, Ready::READABLE, &mut proxy),
            SessionResult::Continue
        );
        assert_eq!(handler.state(), RelayState::AwaitingRoute);
        assert_eq!(
            handler.route(),
            Some(&Route {
                host: String::from("localhost"),
                port: 3000
            })
        );
    }

    #[test]
    fn relay_is_byte_exact_through_fragmented_transports() {
        let mut request = b"POST /echo HTTP/1.1\r\nHost: 127.0.0.1:9000\r\n\r\n".to_vec();
        request.extend((0..5000u32).map(|i| (i % 251) as u8));

        let (mut handler, client, mut proxy) = session(64);
        let upstream = proxy.upstream.clone();
        client.0.borrow_mut().max_write = Some(7);
        upstream.0.borrow_mut().max_write = Some(13);

        for chunk in request.chunks(11) {
            client.push_data(chunk);
        }

        handler.ready(Side::Client, all(), &mut proxy);
        assert_eq!(handler.state(), RelayState::AwaitingRoute);
        handler.resolved(Ok("127.0.0.1:9000".parse().unwrap()), &mut proxy);

        // the upstream echoes everything it receives, in chunks of its own
        let mut echoed = 0;
        for _ in 0..10_000 {
            assert_eq!(
                handler.ready(Side::Upstream, all(), &mut proxy),
                SessionResult::Continue
            );
            let written = upstream.written();
            for chunk in written[echoed..].chunks(5) {
                upstream.push_data(chunk);
            }
            echoed = written.len();

            assert_eq!(
                handler.ready(Side::Client, all(), &mut proxy),
                SessionResult::Continue
            );
            if client.written().len() == request.len() {
                break;
            }
        }

        assert_eq!(upstream.written(), request);
        assert_eq!(client.written(), request);
        assert_eq!(handler.state(), RelayState::Streaming);
    }

    #[test]
    fn backpressure_bounds_the_pending_buffer() {
        let header = b"PUT /upload HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n";
        let buffer_size = 256;
        let (mut handler, client, mut proxy) = session(buffer_size);
        let upstream = proxy.upstream.clone();
        upstream.0.borrow_mut().max_write = Some(1);

        client.push_data(header);
        for _ in 0..100 {
            client.push_data(&[b'x'; 1000]);
        }

        handler.ready(Side::Client, all(), &mut proxy);
        handler.resolved(Ok("10.0.0.1:80".parse().unwrap()), &mut proxy);

        for _ in 0..500 {
            handler.ready(Side::Upstream, Ready::WRITABLE, &mut proxy);
            handler.ready(Side::Client, Ready::READABLE, &mut proxy);

            assert!(handler.to_upstream_len() <= buffer_size.max(header.len()));
            if handler.to_upstream_len() > 0 {
                assert!(!handler.client_readiness().interest.is_readable());
                assert!(handler.upstream_readiness().interest.is_writable());
            }
        }

        // a byte or two per round: most of the client data was never read
        let written = upstream.written().len();
        assert!((500..=1000).contains(&written), "{written} bytes written");
        assert!(client.pending_reads() > 90);
    }

    #[test]
    fn upstream_that_never_reads_stops_the_client() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        let upstream = proxy.upstream.clone();
        upstream.0.borrow_mut().blocked = true;

        client.push_data(b"GET / HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n");
        for _ in 0..10 {
            client.push_data(&[b'y'; 4096]);
        }
        handler.ready(Side::Client, all(), &mut proxy);
        handler.resolved(Ok("10.0.0.1:80".parse().unwrap()), &mut proxy);

        for _ in 0..50 {
            handler.ready(Side::Upstream, Ready::WRITABLE, &mut proxy);
            handler.ready(Side::Client, Ready::READABLE, &mut proxy);
        }
        assert_eq!(client.pending_reads(), 10);
        assert!(!handler.client_readiness().interest.is_readable());
        assert!(upstream.written().is_empty());
    }

    #[test]
    fn upstream_end_of_stream_waits_for_pending_bytes() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        let upstream = proxy.upstream.clone();

        client.push_data(b"GET / HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n");
        handler.ready(Side::Client, Ready::READABLE, &mut proxy);
        handler.resolved(Ok("10.0.0.1:80".parse().unwrap()), &mut proxy);

        client.0.borrow_mut().blocked = true;
        upstream.push_data(b"HTTP/1.1 204 No Content\r\n\r\n");
        upstream.push_read(ReadStep::Eof);
        assert_eq!(
            handler.ready(Side::Upstream, all(), &mut proxy),
            SessionResult::Continue
        );
        assert_eq!(handler.ready(Side::Client, all(), &mut proxy), SessionResult::Continue);
        assert_eq!(handler.state(), RelayState::Streaming);
        assert_eq!(handler.to_client_len(), 27);

        client.0.borrow_mut().blocked = false;
        assert_eq!(
            handler.ready(Side::Client, Ready::WRITABLE, &mut proxy),
            SessionResult::Close
        );
        assert_eq!(client.written(), b"HTTP/1.1 204 No Content\r\n\r\n".to_vec());
        assert_eq!(handler.state(), RelayState::Destroyed);
    }

    #[test]
    fn teardown_is_idempotent_and_late_events_are_ignored() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        client.push_data(b"GET / HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n");
        handler.ready(Side::Client, Ready::READABLE, &mut proxy);
        handler.resolved(Ok("10.0.0.1:80".parse().unwrap()), &mut proxy);
        let upstream = proxy.upstream.clone();

        handler.teardown(&mut proxy);
        handler.teardown(&mut proxy);
        assert_eq!(client.closed(), 1);
        assert_eq!(upstream.closed(), 1);
        assert_eq!(proxy.deregistered.len(), 2);
        assert_eq!(proxy.removed.len(), 1);

        client.push_data(b"late");
        assert_eq!(
            handler.ready(Side::Client, Ready::READABLE, &mut proxy),
            SessionResult::Close
        );
        assert_eq!(
            handler.ready(Side::Upstream, Ready::WRITABLE, &mut proxy),
            SessionResult::Close
        );
        handler.timeout(&mut proxy);
        assert_eq!(client.pending_reads(), 1);
        assert_eq!(client.closed(), 1);
        assert_eq!(upstream.closed(), 1);
        assert_eq!(proxy.removed.len(), 1);
    }

    #[test]
    fn resolution_failure_closes() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        client.push_data(b"GET / HTTP/1.1\r\nHost: nowhere.invalid\r\n\r\n");
        handler.ready(Side::Client, Ready::READABLE, &mut proxy);

        assert_eq!(
            handler.resolved(
                Err(ResolveError::NoAddress(String::from("nowhere.invalid"))),
                &mut proxy
            ),
            SessionResult::Close
        );
        assert_eq!(handler.state(), RelayState::Destroyed);
        assert!(proxy.connects.is_empty());
        assert!(proxy.cancelled.is_empty());
        assert_eq!(client.closed(), 1);
    }

    #[test]
    fn teardown_cancels_a_pending_resolution() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        client.push_data(b"GET / HTTP/1.1\r\nHost: slow.example\r\n\r\n");
        handler.ready(Side::Client, Ready::READABLE, &mut proxy);
        let token = handler.resolve_token().expect("resolution started");

        handler.timeout(&mut proxy);
        assert_eq!(proxy.cancelled, vec![token]);

        // a result that slipped through is a no-op
        assert_eq!(
            handler.resolved(Ok("10.0.0.1:80".parse().unwrap()), &mut proxy),
            SessionResult::Close
        );
        assert!(proxy.connects.is_empty());
    }

    #[test]
    fn oversized_header_block_closes() {
        let client = MockSocket::default();
        let mut proxy = MockProxy::default();
        let mut handler = RelayHandler::new(SessionId(1), client.clone(), CLIENT, 32, 64);

        client.push_data(b"GET / HTTP/1.1\r\n");
        client.push_data(&[b'a'; 100]);
        assert_eq!(
            handler.ready(Side::Client, Ready::READABLE, &mut proxy),
            SessionResult::Close
        );
        assert!(proxy.resolves.is_empty());
        assert_eq!(client.closed(), 1);
    }

    #[test]
    fn failed_connect_closes() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        let upstream = proxy.upstream.clone();
        upstream.0.borrow_mut().connect_error = true;

        client.push_data(b"GET / HTTP/1.1\r\nHost: 10.0.0.1:81\r\n\r\n");
        handler.ready(Side::Client, Ready::READABLE, &mut proxy);
        handler.resolved(Ok("10.0.0.1:81".parse().unwrap()), &mut proxy);

        assert_eq!(
            handler.ready(Side::Upstream, Ready::WRITABLE | Ready::HUP, &mut proxy),
            SessionResult::Close
        );
        assert!(upstream.written().is_empty());
        assert_eq!(upstream.closed(), 1);
        assert_eq!(client.closed(), 1);
    }

    #[test]
    fn connect_error_from_the_proxy_closes() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        proxy.connect_fails = true;

        client.push_data(b"GET / HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n");
        handler.ready(Side::Client, Ready::READABLE, &mut proxy);
        assert_eq!(
            handler.resolved(Ok("10.0.0.1:80".parse().unwrap()), &mut proxy),
            SessionResult::Close
        );
        assert_eq!(handler.upstream_token(), None);
        assert_eq!(client.closed(), 1);
        assert_eq!(proxy.deregistered, vec![CLIENT]);
    }

    #[test]
    fn client_error_event_closes() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        assert_eq!(
            handler.ready(Side::Client, Ready::ERROR, &mut proxy),
            SessionResult::Close
        );
        assert_eq!(client.closed(), 1);
    }

    #[test]
    fn client_read_error_closes() {
        let (mut handler, client, mut proxy) = session(BUFFER_SIZE);
        client.push_read(ReadStep::Error);
        assert_eq!(
            handler.ready(Side::Client, Ready::READABLE, &mut proxy),
            SessionResult::Close
        );
        assert_eq!(handler.state(), RelayState::Destroyed);
    }

    #[test]
    fn pending_buffer_keeps_the_remainder() {
        let mut buffer = PendingBuffer::default();
        buffer.push(b"hello ");
        buffer.push(b"world");
        buffer.consume(4);
        assert_eq!(buffer.unwritten(), b"o world");
        buffer.consume(7);
        assert!(buffer.is_empty());
        assert_eq!(buffer.unwritten(), b"");
    }
}
