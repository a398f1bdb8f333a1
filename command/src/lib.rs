//! Shared building blocks of the proxyx relay: the configuration model,
//! the logging backend and the readiness bitmask exchanged with the event loop.

pub mod config;
pub mod logging;
pub mod ready;
