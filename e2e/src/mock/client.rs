use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use crate::BUFFER_SIZE;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A blocking client connecting to the relay
pub struct Client {
    pub name: String,
    pub address: SocketAddr,
    pub stream: Option<TcpStream>,
    pub request: String,
    pub requests_sent: usize,
    pub responses_received: usize,
}

impl Client {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        name: S1,
        address: SocketAddr,
        request: S2,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            stream: None,
            request: request.into(),
            requests_sent: 0,
            responses_received: 0,
        }
    }

    pub fn set_request<S: Into<String>>(&mut self, request: S) {
        self.request = request.into();
    }

    pub fn connect(&mut self) {
        let stream = TcpStream::connect(self.address).expect("could not connect to the relay");
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("could not set read timeout");
        self.stream = Some(stream);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        if let Some(stream) = &self.stream {
            stream
                .set_read_timeout(Some(timeout))
                .expect("could not set read timeout");
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    pub fn send(&mut self) -> Option<usize> {
        let stream = self.stream.as_mut()?;
        match stream.write_all(self.request.as_bytes()) {
            Ok(()) => {
                self.requests_sent += 1;
                Some(self.request.len())
            }
            Err(e) => {
                println!("{}: write error: {e}", self.name);
                None
            }
        }
    }

    /// One read. `None` on timeout, error or end of stream
    pub fn receive(&mut self) -> Option<String> {
        let stream = self.stream.as_mut()?;
        let mut buf = [0u8; BUFFER_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => {
                println!("{}: connection closed", self.name);
                None
            }
            Ok(n) => {
                self.responses_received += 1;
                Some(String::from_utf8_lossy(&buf[..n]).into_owned())
            }
            Err(e) => {
                println!("{}: read error: {e}", self.name);
                None
            }
        }
    }

    /// Read until the peer closes the connection, false on timeout or error
    pub fn wait_for_close(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e) if e.kind() == ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }
}
