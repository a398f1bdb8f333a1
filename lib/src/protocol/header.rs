//! Streaming HTTP/1 header parser
//!
//! The parser only splits the message into its start line, its header lines
//! and whatever comes after the blank line. It never validates, rewrites or
//! rejects anything: a message that never reaches the end of its header block
//! simply never completes, and bounding that is left to the caller through
//! [`HeaderParser::buffered_len`].
use std::net::Ipv6Addr;

use memchr::memmem;
use url::Url;

use crate::protocol::Route;

pub const DEFAULT_HTTP_PORT: u16 = 80;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Init,
    StartLineSeen,
    HeadersComplete,
}

#[derive(Debug, Clone)]
pub struct HeaderParser {
    kind: Kind,
    state: ParserState,
    start_line: Vec<u8>,
    headers: Vec<Vec<u8>>,
    /// beginning of a line whose terminator has not arrived yet
    partial: Vec<u8>,
    /// index in `partial` where the next terminator search starts
    scan_from: usize,
    /// body bytes, kept verbatim
    trailing: Vec<u8>,
}

impl HeaderParser {
    pub fn new(kind: Kind) -> HeaderParser {
        HeaderParser {
            kind,
            state: ParserState::Init,
            start_line: Vec::new(),
            headers: Vec::new(),
            partial: Vec::new(),
            scan_from: 0,
            trailing: Vec::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_header_complete(&self) -> bool {
        self.state == ParserState::HeadersComplete
    }

    pub fn start_line(&self) -> Option<&[u8]> {
        match self.state {
            ParserState::Init => None,
            _ => Some(&self.start_line),
        }
    }

    pub fn headers(&self) -> impl Iterator<Item = &[u8]> {
        self.headers.iter().map(|header| header.as_slice())
    }

    pub fn trailing(&self) -> &[u8] {
        &self.trailing
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if self.state == ParserState::HeadersComplete {
            self.trailing.extend_from_slice(chunk);
            return;
        }

        self.partial.extend_from_slice(chunk);

        let mut line_start = 0;
        let mut search_from = self.scan_from;
        while let Some(offset) = memmem::find(&self.partial[search_from..], CRLF) {
            let line_end = search_from + offset;
            let line = &self.partial[line_start..line_end];

            if self.state == ParserState::Init {
                self.start_line = line.to_vec();
                self.state = ParserState::StartLineSeen;
            } else if line.is_empty() {
                self.state = ParserState::HeadersComplete;
            } else {
                self.headers.push(line.to_vec());
            }

            line_start = line_end + CRLF.len();
            search_from = line_start;

            if self.state == ParserState::HeadersComplete {
                self.trailing.extend_from_slice(&self.partial[line_start..]);
                line_start = self.partial.len();
                break;
            }
        }

        self.partial.drain(..line_start);
        // the last byte may be the '\r' of a terminator split across chunks
        self.scan_from = self.partial.len().saturating_sub(1);
    }

    /// number of bytes held by the parser, terminators included
    pub fn buffered_len(&self) -> usize {
        let start_line = match self.state {
            ParserState::Init => 0,
            _ => self.start_line.len() + CRLF.len(),
        };
        let blank_line = match self.state {
            ParserState::HeadersComplete => CRLF.len(),
            _ => 0,
        };

        start_line
            + self
                .headers
                .iter()
                .map(|header| header.len() + CRLF.len())
                .sum::<usize>()
            + blank_line
            + self.partial.len()
            + self.trailing.len()
    }

    /// Destination of the request: the `Host` header first, then the
    /// authority of an absolute URI in the request line
    pub fn extract_host(&self) -> Option<Route> {
        if !self.is_header_complete() {
            return None;
        }

        let from_header = self
            .headers
            .iter()
            .find_map(|header| header.strip_prefix(b"Host:"))
            .and_then(|value| std::str::from_utf8(value).ok())
            .and_then(|value| parse_authority(value.trim(), DEFAULT_HTTP_PORT));

        from_header.or_else(|| self.host_from_start_line())
    }

    fn host_from_start_line(&self) -> Option<Route> {
        let target = self
            .start_line
            .split(|byte| *byte == b' ')
            .filter(|part| !part.is_empty())
            .nth(1)?;
        let target = std::str::from_utf8(target).ok()?;
        if !target.contains("://") {
            return None;
        }

        let url = Url::parse(target).ok()?;
        let host = url.host_str()?;
        let host = host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(host);
        let port = url.port_or_known_default()?;

        Some(Route {
            host: host.to_owned(),
            port,
        })
    }

    /// status code of a response, once the status line is known
    pub fn status_code(&self) -> Option<u16> {
        if self.kind != Kind::Response || self.state == ParserState::Init {
            return None;
        }

        let code = self
            .start_line
            .split(|byte| *byte == b' ')
            .filter(|part| !part.is_empty())
            .nth(1)?;
        std::str::from_utf8(code).ok()?.parse().ok()
    }

    /// Rebuild the message exactly as it was received, then get ready for
    /// the next one
    pub fn drain_message(&mut self) -> Option<Vec<u8>> {
        if !self.is_header_complete() {
            return None;
        }

        let mut message = Vec::with_capacity(self.buffered_len());
        message.extend_from_slice(&self.start_line);
        message.extend_from_slice(CRLF);
        for header in &self.headers {
            message.extend_from_slice(header);
            message.extend_from_slice(CRLF);
        }
        message.extend_from_slice(CRLF);
        message.extend_from_slice(&self.trailing);

        self.reset();
        Some(message)
    }

    pub fn reset(&mut self) {
        self.state = ParserState::Init;
        self.start_line.clear();
        self.headers.clear();
        self.partial.clear();
        self.scan_from = 0;
        self.trailing.clear();
    }
}

/// `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 address
fn parse_authority(authority: &str, default_port: u16) -> Option<Route> {
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some(Route {
            host: host.to_owned(),
            port,
        });
    }

    match authority.split_once(':') {
        None => Some(Route {
            host: authority.to_owned(),
            port: default_port,
        }),
        Some((host, port)) if !port.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some(Route {
                host: host.to_owned(),
                port: port.parse().ok()?,
            })
        }
        Some(_) => authority.parse::<Ipv6Addr>().ok().map(|_| Route {
            host: authority.to_owned(),
            port: default_port,
        }),
    }
}
