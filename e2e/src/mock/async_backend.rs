use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use futures::channel::mpsc;

use crate::{
    http_utils::{host_header, http_ok_response, start_line},
    mock::aggregator::{Aggregator, RecordingAggregator, SimpleAggregator},
    BUFFER_SIZE,
};

/// Handle to a detached thread where a Backend runs
/// (a thin wrapper around a TcpListener)
pub struct BackendHandle<T> {
    pub name: String,
    /// where the backend actually listens
    pub address: SocketAddr,
    /// Allows to stop the backend within the thread
    pub stop_tx: mpsc::Sender<()>,
    /// Receives data from the backend on the thread
    pub aggregator_rx: mpsc::Receiver<T>,
}

pub type RequestHandler<A> = Box<dyn Fn(&TcpStream, &str, A) -> A + Send + Sync>;

impl<A: Aggregator + Send + Sync + 'static> BackendHandle<A> {
    /// `address` may use port 0, the bound address is in [`BackendHandle::address`]
    pub fn spawn_detached_backend<S: Into<String>>(
        name: S,
        address: SocketAddr,
        mut aggregator: A,
        handler: RequestHandler<A>,
    ) -> Self {
        let name = name.into();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (mut aggregator_tx, aggregator_rx) = mpsc::channel::<A>(1);

        let listener = TcpListener::bind(address).expect("could not bind");
        let address = listener.local_addr().expect("could not get local address");
        let mut clients = Vec::new();
        let thread_name = name.to_owned();

        // The backend runs on this detached thread:
        // - accepts tcp connections
        // - calls handler on each live connections
        // - monitors stop_rx to stop itself
        thread::spawn(move || {
            listener
                .set_nonblocking(true)
                .expect("could not set nonblocking on listener");
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        println!("{thread_name}: new connection from {peer}");
                        stream
                            .set_nonblocking(true)
                            .expect("could not set nonblocking on client");
                        clients.push(stream);
                    }
                    Err(error) => {
                        if error.kind() != ErrorKind::WouldBlock {
                            println!("IO Error: {error:?}");
                        }
                    }
                }
                for client in &clients {
                    aggregator = handler(client, &thread_name, aggregator);
                }
                match stop_rx.try_next() {
                    Ok(Some(_)) | Ok(None) => break,
                    Err(_) => thread::sleep(Duration::from_millis(1)),
                }
            }
            drop(listener);
            drop(clients);
            aggregator_tx
                .try_send(aggregator)
                .expect("could not send aggregator");
        });

        Self {
            name,
            address,
            stop_tx,
            aggregator_rx,
        }
    }

    /// Stop the thread, closing every connection it accepted
    pub fn stop_and_get_aggregator(&mut self) -> Option<A> {
        self.stop_tx.try_send(()).expect("could not stop backend");
        loop {
            match self.aggregator_rx.try_next() {
                Ok(Some(aggregator)) => return Some(aggregator),
                // the backend thread panicked
                Ok(None) => return None,
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

impl BackendHandle<SimpleAggregator> {
    /// This creates a callback that listens on a TcpStream
    /// and returns HTTP OK responses with the given content in the body
    /// it returns an updated aggregator
    pub fn http_handler<S: Into<String>>(content: S) -> RequestHandler<SimpleAggregator> {
        let content = content.into();
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            match stream.read(&mut buf) {
                Ok(0) => return aggregator,
                Ok(_) => {
                    aggregator.add_request();
                    let response = http_ok_response(&content);
                    if let Err(e) = stream.write_all(response.as_bytes()) {
                        println!("{backend_name}: error writing response: {e}");
                        return aggregator;
                    }
                    aggregator.add_response();
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => println!("{backend_name}: read error: {e}"),
            }
            aggregator
        })
    }

    /// This creates a callback that sends back every byte it reads,
    /// one request per read
    pub fn echo_handler() -> RequestHandler<SimpleAggregator> {
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        aggregator.add_request();
                        // the relay may push back: block until it takes the bytes
                        let _ = stream.set_nonblocking(false);
                        let written = stream.write_all(&buf[..n]);
                        let _ = stream.set_nonblocking(true);
                        if let Err(e) = written {
                            println!("{backend_name}: error echoing: {e}");
                            break;
                        }
                        aggregator.add_response();
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        println!("{backend_name}: read error: {e}");
                        break;
                    }
                }
            }
            aggregator
        })
    }
}

impl BackendHandle<RecordingAggregator> {
    /// Like [`BackendHandle::http_handler`], remembering the start line and
    /// Host header of the last request
    pub fn recording_http_handler<S: Into<String>>(
        content: S,
    ) -> RequestHandler<RecordingAggregator> {
        let content = content.into();
        Box::new(move |mut stream, backend_name, mut aggregator| {
            let mut buf = [0u8; BUFFER_SIZE];
            match stream.read(&mut buf) {
                Ok(0) => return aggregator,
                Ok(n) => {
                    let request = String::from_utf8_lossy(&buf[..n]);
                    aggregator.add_request();
                    aggregator.bytes_received += n;
                    aggregator.last_start_line = start_line(&request).map(str::to_owned);
                    aggregator.last_host_header = host_header(&request).map(str::to_owned);

                    let response = http_ok_response(&content);
                    if let Err(e) = stream.write_all(response.as_bytes()) {
                        println!("{backend_name}: error writing response: {e}");
                        return aggregator;
                    }
                    aggregator.add_response();
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => println!("{backend_name}: read error: {e}"),
            }
            aggregator
        })
    }
}
