//! Client benchmark loop.
//!
//! Drives one blocking connection through repeated send-frame /
//! receive-echo exchanges and reports the round-trip time of each, plus
//! the arithmetic mean over the run. Any unrecoverable failure aborts
//! the whole run; there is no per-exchange isolation on the client.

use crate::config::ClientConfig;
use crate::frame::{self, FrameError, Timestamp};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Instant;
use tracing::{debug, info};

/// Per-exchange RTTs collected over a benchmark run.
#[derive(Debug)]
pub struct BenchReport {
    rtts_ms: Vec<f64>,
}

impl BenchReport {
    /// Round-trip times in milliseconds, one per exchange.
    pub fn rtts_ms(&self) -> &[f64] {
        &self.rtts_ms
    }

    /// Arithmetic mean RTT over the run.
    pub fn mean_ms(&self) -> f64 {
        if self.rtts_ms.is_empty() {
            return 0.0;
        }
        self.rtts_ms.iter().sum::<f64>() / self.rtts_ms.len() as f64
    }
}

/// Benchmark run errors.
#[derive(Debug)]
pub enum BenchError {
    /// Host name yielded no usable address.
    Resolve(String),
    /// Connect or mid-run I/O failure.
    Io(io::Error),
    /// Frame construction failure.
    Frame(FrameError),
}

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchError::Resolve(host) => write!(f, "no address found for host '{host}'"),
            BenchError::Io(e) => write!(f, "I/O failure: {e}"),
            BenchError::Frame(e) => write!(f, "frame error: {e}"),
        }
    }
}

impl std::error::Error for BenchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BenchError::Io(e) => Some(e),
            BenchError::Frame(e) => Some(e),
            BenchError::Resolve(_) => None,
        }
    }
}

impl From<io::Error> for BenchError {
    fn from(e: io::Error) -> Self {
        BenchError::Io(e)
    }
}

impl From<FrameError> for BenchError {
    fn from(e: FrameError) -> Self {
        BenchError::Frame(e)
    }
}

/// Run the benchmark: `count` exchanges of `size`-byte frames.
///
/// Prints one RTT line per exchange and a final mean line, and returns
/// the collected measurements.
pub fn run(config: &ClientConfig) -> Result<BenchReport, BenchError> {
    let addr = resolve(&config.host, config.port)?;
    debug!(addr = %addr, "Connecting");

    let mut stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    info!(
        addr = %addr,
        size = config.size,
        count = config.count,
        "Connected"
    );

    let payload = vec![0u8; config.size - frame::HEADER_LEN];
    let mut echo = vec![0u8; config.size];
    let mut rtts_ms = Vec::with_capacity(config.count);

    for exchange in 1..=config.count {
        let start = Instant::now();
        let request = frame::encode(Timestamp::now(), &payload)?;

        send_all(&mut stream, &request)?;
        recv_exact(&mut stream, &mut echo)?;

        let rtt = start.elapsed().as_secs_f64() * 1000.0;
        println!("Exchange {exchange}: RTT = {rtt:.3} ms");
        rtts_ms.push(rtt);
    }

    let report = BenchReport { rtts_ms };
    println!(
        "Average RTT over {} exchanges: {:.3} ms",
        config.count,
        report.mean_ms()
    );
    Ok(report)
}

/// Resolve a host/port pair, preferring an IPv4 address.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, BenchError> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .copied()
        .find(SocketAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
        .ok_or_else(|| BenchError::Resolve(host.to_string()))
}

/// Send the whole buffer, looping over partial sends.
fn send_all(stream: &mut TcpStream, data: &[u8]) -> Result<(), BenchError> {
    let mut sent = 0;
    while sent < data.len() {
        match stream.write(&data[sent..]) {
            Ok(0) => {
                return Err(BenchError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed mid-send",
                )));
            }
            Ok(n) => sent += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(BenchError::Io(e)),
        }
    }
    Ok(())
}

/// Receive exactly `buf.len()` bytes, looping over partial receives.
/// End-of-stream before the buffer is full is fatal.
fn recv_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), BenchError> {
    let mut got = 0;
    while got < buf.len() {
        match stream.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(BenchError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                )));
            }
            Ok(n) => got += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(BenchError::Io(e)),
        }
    }
    Ok(())
}
