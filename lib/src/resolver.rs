//! Host name resolution off the event loop
//!
//! Lookups block, so each one runs on its own short lived thread, at most
//! [`MAX_CONCURRENT_LOOKUPS`] at a time, the others wait in a queue. A slow
//! name only holds up the sessions waiting for that name. Results come back
//! over a channel and the lookup thread wakes the poll through a
//! [`mio::Waker`], the relay then collects them with
//! [`Resolver::poll_results`]. A cancelled token never shows up in the
//! results, and a cancelled lookup that did not start yet never runs.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use mio::{Registry, Token, Waker};

/// how long a successful lookup is reused
pub const CACHE_TTL: Duration = Duration::from_secs(300);
/// the cache is emptied when it reaches this size
pub const CACHE_MAX_ENTRIES: usize = 1024;
/// lookup threads running at the same time
pub const MAX_CONCURRENT_LOOKUPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolveToken(pub u64);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("could not resolve {host}: {message}")]
    Lookup { host: String, message: String },
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("could not start a lookup for {host}: {message}")]
    Spawn { host: String, message: String },
}

pub type ResolveResult = Result<SocketAddr, ResolveError>;

/// blocking name to address function run by the lookup threads
pub type LookupFn = Arc<dyn Fn(&str, u16) -> Result<IpAddr, ResolveError> + Send + Sync>;

pub trait Resolver {
    /// start a lookup, its result is returned by a later `poll_results`
    fn resolve(&mut self, host: &str, port: u16) -> ResolveToken;
    /// the result of this token will never be returned
    fn cancel(&mut self, token: ResolveToken);
    /// results of the lookups completed since the last call
    fn poll_results(&mut self) -> Vec<(ResolveToken, ResolveResult)>;
}

struct Query {
    token: ResolveToken,
    host: String,
    port: u16,
}

struct Answer {
    token: ResolveToken,
    host: String,
    port: u16,
    result: Result<IpAddr, ResolveError>,
}

pub struct ThreadedResolver {
    next_token: u64,
    pending: HashSet<ResolveToken>,
    ready: VecDeque<(ResolveToken, ResolveResult)>,
    cache: HashMap<String, (IpAddr, Instant)>,
    /// lookups waiting for a free thread
    queued: VecDeque<Query>,
    in_flight: usize,
    max_lookups: usize,
    lookup: LookupFn,
    answer_sender: mpsc::Sender<Answer>,
    answers: mpsc::Receiver<Answer>,
    waker: Arc<Waker>,
}

impl ThreadedResolver {
    /// `token` is the poll token the lookup threads wake when a result is
    /// available
    pub fn new(registry: &Registry, token: Token) -> io::Result<ThreadedResolver> {
        ThreadedResolver::with_lookup(registry, token, Arc::new(lookup), MAX_CONCURRENT_LOOKUPS)
    }

    pub fn with_lookup(
        registry: &Registry,
        token: Token,
        lookup: LookupFn,
        max_lookups: usize,
    ) -> io::Result<ThreadedResolver> {
        let waker = Arc::new(Waker::new(registry, token)?);
        let (answer_sender, answers) = mpsc::channel::<Answer>();

        Ok(ThreadedResolver {
            next_token: 0,
            pending: HashSet::new(),
            ready: VecDeque::new(),
            cache: HashMap::new(),
            queued: VecDeque::new(),
            in_flight: 0,
            max_lookups: max_lookups.max(1),
            lookup,
            answer_sender,
            answers,
            waker,
        })
    }

    /// number of lookups neither completed nor cancelled
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// number of lookup threads still running
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// number of lookups waiting for a free thread, cancelled ones included
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    fn answer_now(&mut self, token: ResolveToken, result: ResolveResult) {
        self.ready.push_back((token, result));
        if let Err(e) = self.waker.wake() {
            error!("RESOLVER\tcould not wake the event loop: {}", e);
        }
    }

    fn cached(&self, host: &str, now: Instant) -> Option<IpAddr> {
        self.cache
            .get(host)
            .filter(|(_, inserted)| now.saturating_duration_since(*inserted) < CACHE_TTL)
            .map(|(address, _)| *address)
    }

    fn store(&mut self, host: String, address: IpAddr, now: Instant) {
        if self.cache.len() >= CACHE_MAX_ENTRIES {
            self.cache.clear();
        }
        self.cache.insert(host, (address, now));
    }

    /// start queued lookups while threads are available, dropping the
    /// cancelled ones
    fn start_queued(&mut self) {
        while self.in_flight < self.max_lookups {
            let Some(query) = self.queued.pop_front() else {
                return;
            };
            if !self.pending.contains(&query.token) {
                trace!("RESOLVER\tskipping the lookup of cancelled token {:?}", query.token);
                continue;
            }
            self.start(query);
        }
    }

    fn start(&mut self, query: Query) {
        let Query { token, host, port } = query;
        let lookup = self.lookup.clone();
        let answer_sender = self.answer_sender.clone();
        let waker = self.waker.clone();
        let thread_host = host.clone();

        // the thread is detached: a lookup outliving the resolver ends on its own
        let spawned = thread::Builder::new()
            .name(String::from("resolver"))
            .spawn(move || {
                let result = lookup(&thread_host, port);
                trace!("RESOLVER\t{} -> {:?}", thread_host, result);

                let answer = Answer {
                    token,
                    host: thread_host,
                    port,
                    result,
                };
                if answer_sender.send(answer).is_ok() {
                    if let Err(e) = waker.wake() {
                        error!("RESOLVER\tcould not wake the event loop: {}", e);
                    }
                }
            });

        match spawned {
            Ok(_) => self.in_flight += 1,
            Err(e) => {
                error!("RESOLVER\tcould not start a lookup thread: {}", e);
                self.answer_now(
                    token,
                    Err(ResolveError::Spawn {
                        host,
                        message: e.to_string(),
                    }),
                );
            }
        }
    }
}

impl Resolver for ThreadedResolver {
    fn resolve(&mut self, host: &str, port: u16) -> ResolveToken {
        let token = ResolveToken(self.next_token);
        self.next_token += 1;
        self.pending.insert(token);

        if let Ok(address) = host.parse::<IpAddr>() {
            self.answer_now(token, Ok(SocketAddr::new(address, port)));
            return token;
        }

        if let Some(address) = self.cached(host, Instant::now()) {
            debug!("RESOLVER\tcache hit for {}", host);
            self.answer_now(token, Ok(SocketAddr::new(address, port)));
            return token;
        }

        self.queued.push_back(Query {
            token,
            host: host.to_owned(),
            port,
        });
        self.start_queued();
        token
    }

    fn cancel(&mut self, token: ResolveToken) {
        self.pending.remove(&token);
    }

    fn poll_results(&mut self) -> Vec<(ResolveToken, ResolveResult)> {
        let mut results = Vec::new();

        while let Some((token, result)) = self.ready.pop_front() {
            if self.pending.remove(&token) {
                results.push((token, result));
            }
        }

        let now = Instant::now();
        while let Ok(answer) = self.answers.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            let Answer {
                token,
                host,
                port,
                result,
            } = answer;

            if let Ok(address) = &result {
                self.store(host, *address, now);
            }

            if self.pending.remove(&token) {
                results.push((token, result.map(|address| SocketAddr::new(address, port))));
            } else {
                trace!("RESOLVER\tdropping the answer of cancelled token {:?}", token);
            }
        }

        self.start_queued();
        results
    }
}

/// blocking lookup, IPv4 addresses are preferred
fn lookup(host: &str, port: u16) -> Result<IpAddr, ResolveError> {
    let addresses: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ResolveError::Lookup {
            host: host.to_owned(),
            message: e.to_string(),
        })?
        .collect();

    addresses
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| addresses.first())
        .map(|address| address.ip())
        .ok_or_else(|| ResolveError::NoAddress(host.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use mio::{Events, Poll};

    const WAKE: Token = Token(1);
    const SLOW: &str = "slow.test";

    /// answers 127.0.0.1 for every name, the lookup of [`SLOW`] blocks until
    /// `gate` receives something. Every looked up name is recorded in `calls`
    fn gated_lookup(gate: mpsc::Receiver<()>, calls: Arc<Mutex<Vec<String>>>) -> LookupFn {
        let gate = Mutex::new(gate);
        Arc::new(move |host: &str, _port: u16| {
            calls.lock().expect("poisoned").push(host.to_owned());
            if host == SLOW {
                let _ = gate.lock().expect("poisoned").recv();
            }
            Ok(IpAddr::from([127, 0, 0, 1]))
        })
    }

    fn wait_for_results(
        poll: &mut Poll,
        resolver: &mut ThreadedResolver,
    ) -> Vec<(ResolveToken, ResolveResult)> {
        let mut events = Events::with_capacity(8);
        for _ in 0..100 {
            let results = resolver.poll_results();
            if !results.is_empty() {
                return results;
            }
            poll.poll(&mut events, Some(Duration::from_millis(100)))
                .expect("poll failed");
        }
        Vec::new()
    }

    #[test]
    fn ip_literals_are_answered_without_the_worker() {
        let poll = Poll::new().expect("could not create poll");
        let mut resolver = ThreadedResolver::new(poll.registry(), WAKE).expect("no resolver");

        let v4 = resolver.resolve("93.184.216.34", 80);
        let v6 = resolver.resolve("::1", 8080);
        assert_eq!(resolver.pending_count(), 2);

        assert_eq!(
            resolver.poll_results(),
            vec![
                (v4, Ok("93.184.216.34:80".parse().unwrap())),
                (v6, Ok("[::1]:8080".parse().unwrap())),
            ]
        );
        assert_eq!(resolver.pending_count(), 0);
        assert!(resolver.poll_results().is_empty());
    }

    #[test]
    fn cancelled_tokens_are_never_returned() {
        let poll = Poll::new().expect("could not create poll");
        let mut resolver = ThreadedResolver::new(poll.registry(), WAKE).expect("no resolver");

        let cancelled = resolver.resolve("127.0.0.1", 80);
        let kept = resolver.resolve("127.0.0.2", 80);
        resolver.cancel(cancelled);

        let results = resolver.poll_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, kept);
    }

    #[test]
    fn names_are_resolved_by_the_worker_and_cached() {
        let mut poll = Poll::new().expect("could not create poll");
        let mut resolver = ThreadedResolver::new(poll.registry(), WAKE).expect("no resolver");

        let token = resolver.resolve("localhost", 8080);
        let results = wait_for_results(&mut poll, &mut resolver);
        assert_eq!(results.len(), 1);
        let (answered, result) = &results[0];
        assert_eq!(*answered, token);
        let address = result.as_ref().expect("localhost should resolve");
        assert!(address.ip().is_loopback());
        assert_eq!(address.port(), 8080);

        // answered from the cache, no need to wait for the worker
        let again = resolver.resolve("localhost", 9090);
        let results = resolver.poll_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, again);
        assert_eq!(
            results[0].1.as_ref().map(|address| address.port()),
            Ok(9090)
        );
    }

    #[test]
    fn invalid_names_fail() {
        let mut poll = Poll::new().expect("could not create poll");
        let mut resolver = ThreadedResolver::new(poll.registry(), WAKE).expect("no resolver");

        let token = resolver.resolve("bad\0host", 80);
        let results = wait_for_results(&mut poll, &mut resolver);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, token);
        assert!(matches!(results[0].1, Err(ResolveError::Lookup { .. })));
    }

    #[test]
    fn a_slow_name_does_not_hold_up_the_others() {
        let mut poll = Poll::new().expect("could not create poll");
        let (release, gate) = mpsc::channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut resolver =
            ThreadedResolver::with_lookup(poll.registry(), WAKE, gated_lookup(gate, calls), 4)
                .expect("no resolver");

        let slow = resolver.resolve(SLOW, 80);
        let fast = resolver.resolve("fast.test", 8080);

        let results = wait_for_results(&mut poll, &mut resolver);
        assert_eq!(results, vec![(fast, Ok("127.0.0.1:8080".parse().unwrap()))]);
        assert_eq!(resolver.in_flight(), 1);
        assert_eq!(resolver.pending_count(), 1);

        release.send(()).expect("the slow lookup is gone");
        let results = wait_for_results(&mut poll, &mut resolver);
        assert_eq!(results, vec![(slow, Ok("127.0.0.1:80".parse().unwrap()))]);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn cancelled_lookups_waiting_for_a_thread_never_run() {
        let mut poll = Poll::new().expect("could not create poll");
        let (release, gate) = mpsc::channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut resolver = ThreadedResolver::with_lookup(
            poll.registry(),
            WAKE,
            gated_lookup(gate, calls.clone()),
            1,
        )
        .expect("no resolver");

        let slow = resolver.resolve(SLOW, 80);
        let cancelled = resolver.resolve("cancelled.test", 80);
        let queued = resolver.resolve("queued.test", 80);
        assert_eq!(resolver.in_flight(), 1);
        assert_eq!(resolver.queued_count(), 2);
        resolver.cancel(cancelled);

        release.send(()).expect("the slow lookup is gone");
        let results = wait_for_results(&mut poll, &mut resolver);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, slow);
        assert_eq!(resolver.queued_count(), 0);

        let results = wait_for_results(&mut poll, &mut resolver);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, queued);

        assert_eq!(
            *calls.lock().expect("poisoned"),
            vec![SLOW.to_owned(), String::from("queued.test")]
        );
    }

    #[test]
    fn dropping_the_resolver_does_not_wait_for_lookups() {
        let poll = Poll::new().expect("could not create poll");
        let (_release, gate) = mpsc::channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut resolver =
            ThreadedResolver::with_lookup(poll.registry(), WAKE, gated_lookup(gate, calls), 4)
                .expect("no resolver");

        resolver.resolve(SLOW, 80);
        let start = Instant::now();
        drop(resolver);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
