use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SocketResult {
    Continue,
    Closed,
    WouldBlock,
    Error,
}

/// Single attempt, non blocking socket operations
///
/// Each call performs at most one system call and reports how many bytes
/// went through along with the state of the socket.
pub trait SocketHandler {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult);
    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult);
    fn socket_close(&mut self);
    /// pending error on the socket, used to check an outbound connect
    fn take_error(&mut self) -> Option<io::Error>;
    fn peer_address(&self) -> Option<SocketAddr>;
}

impl SocketHandler for TcpStream {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        if buf.is_empty() {
            return (0, SocketResult::Continue);
        }

        match self.read(buf) {
            Ok(0) => (0, SocketResult::Closed),
            Ok(size) => (size, SocketResult::Continue),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::NotConnected => (0, SocketResult::WouldBlock),
                // retried by the next iteration of the session loop
                ErrorKind::Interrupted => (0, SocketResult::Continue),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => {
                    debug!("SOCKET\tread: peer closed abruptly: {:?}", e);
                    (0, SocketResult::Error)
                }
                _ => {
                    error!("SOCKET\tread: unexpected error: {:?}", e);
                    (0, SocketResult::Error)
                }
            },
        }
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        if buf.is_empty() {
            return (0, SocketResult::Continue);
        }

        match self.write(buf) {
            Ok(0) => (0, SocketResult::WouldBlock),
            Ok(size) => (size, SocketResult::Continue),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::NotConnected => (0, SocketResult::WouldBlock),
                ErrorKind::Interrupted => (0, SocketResult::Continue),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => {
                    debug!("SOCKET\twrite: peer closed abruptly: {:?}", e);
                    (0, SocketResult::Error)
                }
                _ => {
                    error!("SOCKET\twrite: unexpected error: {:?}", e);
                    (0, SocketResult::Error)
                }
            },
        }
    }

    fn socket_close(&mut self) {
        // NotConnected here only means the peer is already gone
        let _ = self.shutdown(Shutdown::Both);
    }

    fn take_error(&mut self) -> Option<io::Error> {
        match TcpStream::take_error(self) {
            Ok(error) => error,
            Err(e) => Some(e),
        }
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

/// Create the listening socket: reuse address, optional TCP fast open,
/// backlog of 1024, non blocking.
///
/// Returns the listener and whether fast open could be enabled.
pub fn server_bind(address: SocketAddr, fast_open: bool) -> io::Result<(TcpListener, bool)> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;

    // set so_reuseaddr, but only on unix (mirrors what libstd does)
    if cfg!(unix) {
        socket.set_reuse_address(true)?;
    }

    let mut fast_open_enabled = false;
    if fast_open {
        match set_tcp_option(&socket, TcpOption::FastOpen, 5) {
            Ok(()) => fast_open_enabled = true,
            Err(e) => error!("warning: fast open is not available: {}", e),
        }
    }

    socket.bind(&address.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    Ok((TcpListener::from_std(socket.into()), fast_open_enabled))
}

/// Start a non blocking connection to the upstream.
///
/// With `fast_open`, the first write carries the SYN when the platform
/// supports it; failing to set the option silently falls back to a normal
/// connect.
pub fn connect_stream(address: SocketAddr, fast_open: bool) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    if fast_open {
        if let Err(e) = set_tcp_option(&socket, TcpOption::FastOpenConnect, 1) {
            debug!("fast open connect unavailable for {}: {}", address, e);
        }
    }

    match socket.connect(&address.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from_std(socket.into()))
}

#[derive(Debug, Clone, Copy)]
enum TcpOption {
    FastOpen,
    FastOpenConnect,
}

#[cfg(target_os = "linux")]
fn set_tcp_option(socket: &Socket, option: TcpOption, value: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let name = match option {
        TcpOption::FastOpen => libc::TCP_FASTOPEN,
        TcpOption::FastOpenConnect => libc::TCP_FASTOPEN_CONNECT,
    };

    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_option(_socket: &Socket, option: TcpOption, _value: i32) -> io::Result<()> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        format!("{option:?} is only supported on linux"),
    ))
}
