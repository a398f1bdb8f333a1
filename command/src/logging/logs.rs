use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    sync::Mutex,
};

use log::{LevelFilter, Log, Metadata, Record};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::logging::LogError;

/// Where log lines go
#[derive(Debug)]
pub enum LoggerBackend {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(BufWriter<File>),
    Udp(UdpSocket, SocketAddr),
    Tcp(TcpStream),
}

impl LoggerBackend {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout(stdout) => stdout.lock().write_all(line),
            LoggerBackend::Stderr(stderr) => stderr.lock().write_all(line),
            LoggerBackend::File(file) => file.write_all(line),
            LoggerBackend::Udp(socket, address) => socket.send_to(line, *address).map(|_| ()),
            LoggerBackend::Tcp(stream) => stream.write_all(line),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout(stdout) => stdout.flush(),
            LoggerBackend::Stderr(stderr) => stderr.flush(),
            LoggerBackend::File(file) => file.flush(),
            LoggerBackend::Udp(..) => Ok(()),
            LoggerBackend::Tcp(stream) => stream.flush(),
        }
    }
}

pub struct Logger {
    tag: String,
    pid: u32,
    level: LevelFilter,
    backend: Mutex<LoggerBackend>,
}

impl Logger {
    pub fn new(backend: LoggerBackend, level: LevelFilter, tag: &str) -> Self {
        Logger {
            tag: tag.to_owned(),
            pid: std::process::id(),
            level,
            backend: Mutex::new(backend),
        }
    }

    /// `{timestamp} {pid} {tag} {LEVEL}\t{message}`
    pub fn format_line(&self, record: &Record) -> String {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("-"));

        format!(
            "{} {} {} {}\t{}\n",
            now,
            self.pid,
            self.tag,
            record.level(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.format_line(record);
        if let Ok(mut backend) = self.backend.lock() {
            // there is nowhere to report a failing log sink
            let _ = backend.write_line(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut backend) = self.backend.lock() {
            let _ = backend.flush();
        }
    }
}

pub fn parse_log_level(level: &str) -> Result<LevelFilter, LogError> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| LogError::InvalidLogLevel(level.to_owned()))
}

pub fn target_to_backend(target: &str) -> Result<LoggerBackend, LogError> {
    if target == "stdout" {
        return Ok(LoggerBackend::Stdout(io::stdout()));
    }

    if target == "stderr" {
        return Ok(LoggerBackend::Stderr(io::stderr()));
    }

    if let Some(path) = target.strip_prefix("file://") {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LogError::OpenFile(path.to_owned(), e))?;
        return Ok(LoggerBackend::File(BufWriter::new(file)));
    }

    if let Some(address) = target.strip_prefix("udp://") {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| LogError::InvalidSocketAddress(target.to_owned(), e))?;
        let bind_address = if address.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_address).map_err(LogError::UdpBind)?;
        return Ok(LoggerBackend::Udp(socket, address));
    }

    if let Some(address) = target.strip_prefix("tcp://") {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| LogError::InvalidSocketAddress(target.to_owned(), e))?;
        let stream =
            TcpStream::connect(address).map_err(|e| LogError::TcpConnect(target.to_owned(), e))?;
        return Ok(LoggerBackend::Tcp(stream));
    }

    Err(LogError::InvalidLogTarget(
        target.to_owned(),
        "expected stdout, stderr, file://, udp:// or tcp://",
    ))
}

/// install the process-wide logger
pub fn setup_logging(target: &str, level: &str, tag: &str) -> Result<(), LogError> {
    let level = parse_log_level(level)?;
    let backend = target_to_backend(target)?;

    log::set_boxed_logger(Box::new(Logger::new(backend, level, tag)))
        .map_err(|_| LogError::AlreadyInstalled)?;
    log::set_max_level(level);
    Ok(())
}

/// log to stdout, used by tests
pub fn setup_default_logging(level: &str, tag: &str) -> Result<(), LogError> {
    setup_logging("stdout", level, tag)
}
