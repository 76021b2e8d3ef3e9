//! Single-threaded server runtime.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls (epoll on Linux, kqueue on
//! macOS, via mio). Shared pieces:
//! - `BufferPool`: per-connection frame buffer management
//! - `Connection` / `ConnectionRegistry`: connection state machine
//! - `Server`: the event loop itself

mod buffer;
mod connection;
mod event_loop;

pub use buffer::BufferPool;
pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use event_loop::Server;

use crate::config::ServerConfig;

/// Bind and run the echo server; returns only on a fatal I/O error.
pub fn run(config: ServerConfig) -> std::io::Result<()> {
    Server::bind(config)?.run()
}
