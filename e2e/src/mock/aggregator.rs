/// Counters a backend thread carries along and hands back when it stops
pub trait Aggregator {
    fn new() -> Self;
    fn add_request(&mut self);
    fn add_response(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleAggregator {
    pub requests_received: usize,
    pub responses_sent: usize,
}

impl Aggregator for SimpleAggregator {
    fn new() -> Self {
        Self::default()
    }
    fn add_request(&mut self) {
        self.requests_received += 1;
    }
    fn add_response(&mut self) {
        self.responses_sent += 1;
    }
}

/// Also remembers what the last request looked like
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingAggregator {
    pub requests_received: usize,
    pub responses_sent: usize,
    pub bytes_received: usize,
    pub last_start_line: Option<String>,
    pub last_host_header: Option<String>,
}

impl Aggregator for RecordingAggregator {
    fn new() -> Self {
        Self::default()
    }
    fn add_request(&mut self) {
        self.requests_received += 1;
    }
    fn add_response(&mut self) {
        self.responses_sent += 1;
    }
}
