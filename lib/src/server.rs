//! Event loop of the relay
//!
//! One `mio::Poll` carries the listening socket, every session socket and
//! the resolver's waker. The loop wakes up at least once per [`TICK`] to run
//! the timeout sweep and to look at the stop flag.
use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use mio::{event::Event, Events, Poll, Token};

use crate::{
    proxyx_command::{config::Config, ready::Ready},
    relay::Relay,
    resolver::{Resolver, ThreadedResolver},
    ServerError,
};

pub const LISTENER: Token = Token(usize::MAX - 1);
pub const RESOLVER: Token = Token(usize::MAX - 2);

const EVENTS_CAPACITY: usize = 1024;
pub const TICK: Duration = Duration::from_secs(1);

/// value of the stop flag once a graceful shutdown was requested
pub const SOFT_STOP: usize = 1;
/// value of the stop flag to leave right away
pub const HARD_STOP: usize = 2;

pub struct Server<R: Resolver = ThreadedResolver> {
    poll: Poll,
    events: Events,
    relay: Relay<R>,
}

impl Server<ThreadedResolver> {
    pub fn try_new_from_config(config: &Config) -> Result<Server<ThreadedResolver>, ServerError> {
        let poll = Poll::new().map_err(ServerError::CreatePoll)?;
        let resolver =
            ThreadedResolver::new(poll.registry(), RESOLVER).map_err(ServerError::Resolver)?;
        Server::new(poll, config, resolver)
    }
}

impl<R: Resolver> Server<R> {
    pub fn new(poll: Poll, config: &Config, resolver: R) -> Result<Server<R>, ServerError> {
        let relay = Relay::new(config, poll.registry(), resolver)?;

        Ok(Server {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            relay,
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.relay.local_address()
    }

    pub fn relay(&self) -> &Relay<R> {
        &self.relay
    }

    /// Run until `stop` says otherwise: [`SOFT_STOP`] closes the listener and
    /// waits for the current sessions to end, [`HARD_STOP`] returns at once
    pub fn run(&mut self, stop: &AtomicUsize) -> Result<(), ServerError> {
        info!("relay listening on {}", self.relay.local_address());

        loop {
            match stop.load(Ordering::SeqCst) {
                0 => {}
                SOFT_STOP => {
                    if self.relay.is_listening() {
                        info!(
                            "soft stop requested, waiting for {} sessions to end",
                            self.relay.session_count()
                        );
                        self.relay.close_listener();
                    }
                    if self.relay.session_count() == 0 {
                        info!("no more sessions, stopping");
                        return Ok(());
                    }
                }
                _ => {
                    info!(
                        "hard stop requested, dropping {} sessions",
                        self.relay.session_count()
                    );
                    return Ok(());
                }
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(TICK)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("error while polling events: {:?}", e);
                return Err(ServerError::Poll(e));
            }

            for event in self.events.iter() {
                match event.token() {
                    LISTENER => self.relay.accept(),
                    // results are collected below on every iteration
                    RESOLVER => {}
                    token => self.relay.dispatch(token, ready_from_event(event)),
                }
            }

            self.relay.handle_resolutions();
            self.relay.sweep_if_due(Instant::now());
            self.relay.release_tokens();
        }
    }
}

/// `read_closed` is reported as readable too: end of stream is found by
/// reading
pub fn ready_from_event(event: &Event) -> Ready {
    let mut ready = Ready::EMPTY;

    if event.is_readable() {
        ready |= Ready::READABLE;
    }

    if event.is_writable() {
        ready |= Ready::WRITABLE;
    }

    if event.is_error() {
        ready |= Ready::ERROR;
    }

    if event.is_read_closed() {
        ready |= Ready::READABLE | Ready::HUP;
    }

    if event.is_write_closed() {
        ready |= Ready::HUP;
    }

    ready
}
