use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use proxyx_command_lib::config::Config;
use proxyx_lib::{
    server::{Server, HARD_STOP, SOFT_STOP},
    ServerError,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A relay event loop running on its own thread
pub struct RelayWorker {
    pub name: String,
    pub address: SocketAddr,
    stop: Arc<AtomicUsize>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl RelayWorker {
    /// Listening on an ephemeral loopback port
    pub fn empty_config() -> Config {
        Config {
            listen_address: String::from("127.0.0.1"),
            listen_port: 0,
            ..Config::default()
        }
    }

    pub fn start_new_relay<S: Into<String>>(name: S, config: Config) -> Self {
        let name = name.into();
        let stop = Arc::new(AtomicUsize::new(0));
        let (address_tx, address_rx) = mpsc::channel();

        let thread_stop = stop.clone();
        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut server = Server::try_new_from_config(&config)?;
                let _ = address_tx.send(server.local_address());
                println!("{thread_name}: relay started on {}", server.local_address());
                server.run(&thread_stop)
            })
            .expect("could not spawn the relay thread");

        let address = address_rx
            .recv()
            .expect("the relay could not start its listener");

        Self {
            name,
            address,
            stop,
            thread: Some(thread),
        }
    }

    /// Stop accepting, let the live sessions end
    pub fn soft_stop(&self) {
        self.stop.store(SOFT_STOP, Ordering::SeqCst);
    }

    pub fn hard_stop(&self) {
        self.stop.store(HARD_STOP, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// false if the relay failed or did not stop in time
    pub fn wait_for_server_stop(&mut self) -> bool {
        let start = Instant::now();
        while self.is_running() {
            if start.elapsed() > STOP_TIMEOUT {
                println!("{}: did not stop in time", self.name);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }

        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(Ok(()))) => true,
            Some(Ok(Err(e))) => {
                println!("{}: relay error: {e}", self.name);
                false
            }
            Some(Err(_)) => {
                println!("{}: relay thread panicked", self.name);
                false
            }
            None => true,
        }
    }
}

impl Drop for RelayWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.hard_stop();
            self.wait_for_server_stop();
        }
    }
}
