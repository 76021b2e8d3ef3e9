//! echomux: a framed echo server and RTT benchmark client.
//!
//! The server multiplexes many connections on a single-threaded,
//! readiness-based event loop (mio/epoll), reassembling length-prefixed
//! frames from partial reads and echoing each one back verbatim.
//! The client drives repeated send/echo exchanges over the same wire
//! format and reports per-exchange and mean round-trip times.
//!
//! Wire format (big-endian): a 2-byte total length (self-inclusive),
//! an 8-byte seconds + 8-byte microseconds timestamp, then payload.

pub mod bench;
pub mod config;
pub mod frame;
pub mod runtime;
