//! End to end harness: a relay running on its own thread, mock clients and
//! mock upstreams talking to it over real loopback sockets.

pub mod http_utils;
pub mod mock;
pub mod relay;

#[cfg(test)]
mod tests;

pub const BUFFER_SIZE: usize = 4096;
