use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use crate::BUFFER_SIZE;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A backend driven step by step from the test thread
pub struct Backend {
    pub name: String,
    pub address: SocketAddr,
    pub listener: Option<TcpListener>,
    pub clients: HashMap<usize, TcpStream>,
    pub response: String,
    pub requests_received: usize,
    pub responses_sent: usize,
}

impl Backend {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        name: S1,
        address: SocketAddr,
        response: S2,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            listener: None,
            clients: HashMap::new(),
            response: response.into(),
            requests_received: 0,
            responses_sent: 0,
        }
    }

    /// Bind the listener, `address` is updated if it used port 0
    pub fn connect(&mut self) {
        let listener = TcpListener::bind(self.address).expect("could not bind");
        listener
            .set_nonblocking(true)
            .expect("could not set nonblocking on listener");
        self.address = listener.local_addr().expect("could not get local address");
        self.listener = Some(listener);
    }

    pub fn disconnect(&mut self) {
        self.listener = None;
        self.clients.clear();
    }

    /// Wait a bit for a connection, store it under `client_id`
    pub fn accept(&mut self, client_id: usize) -> bool {
        let Some(listener) = &self.listener else {
            return false;
        };
        let start = Instant::now();
        while start.elapsed() < ACCEPT_TIMEOUT {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .expect("could not set blocking on client");
                    stream
                        .set_read_timeout(Some(READ_TIMEOUT))
                        .expect("could not set read timeout");
                    self.clients.insert(client_id, stream);
                    return true;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => {
                    println!("{}: accept error: {e}", self.name);
                    return false;
                }
            }
        }
        false
    }

    /// `None` on timeout, error or end of stream
    pub fn receive(&mut self, client_id: usize) -> Option<String> {
        let stream = self.clients.get_mut(&client_id)?;
        let mut buf = [0u8; BUFFER_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                self.requests_received += 1;
                Some(String::from_utf8_lossy(&buf[..n]).into_owned())
            }
            Err(e) => {
                println!("{}: read error on client {client_id}: {e}", self.name);
                None
            }
        }
    }

    pub fn send(&mut self, client_id: usize) -> Option<usize> {
        let stream = self.clients.get_mut(&client_id)?;
        match stream.write_all(self.response.as_bytes()) {
            Ok(()) => {
                self.responses_sent += 1;
                Some(self.response.len())
            }
            Err(e) => {
                println!("{}: write error on client {client_id}: {e}", self.name);
                None
            }
        }
    }

    /// Close one accepted connection
    pub fn close(&mut self, client_id: usize) {
        self.clients.remove(&client_id);
    }
}
