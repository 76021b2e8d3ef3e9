//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. A single thread services
//! every connection, so the registry and buffers need no locking.
//!
//! Per connection the loop drives: accumulate a length-prefixed frame
//! (header may arrive split across deliveries), then echo the whole
//! frame back verbatim, then reset for the next frame. One frame is in
//! flight per connection at a time.

use crate::config::ServerConfig;
use crate::frame;
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const LISTEN_BACKLOG: i32 = 1024;
const EVENTS_CAPACITY: usize = 1024;

/// What to do with a connection after servicing it.
enum Action {
    Keep,
    Close,
}

/// The multiplexing echo server.
///
/// Owns the poll instance, the listener, the connection registry and the
/// buffer pool; everything is serviced from a single thread.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: ConnectionRegistry,
    buffers: BufferPool,
    config: ServerConfig,
}

impl Server {
    /// Bind the listening socket and set up the event loop.
    ///
    /// Setup failures (bad address, bind, listen) are fatal and surface
    /// to the caller.
    pub fn bind(config: ServerConfig) -> io::Result<Server> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let registry = ConnectionRegistry::new(config.max_connections);
        let buffers = BufferPool::new(config.max_connections, config.max_frame_size);

        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            max_frame_size = config.max_frame_size,
            "Listening"
        );

        Ok(Server {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            registry,
            buffers,
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Run the event loop until a fatal poll error.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            match self.poll_once() {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// One readiness-poll-then-dispatch pass.
    ///
    /// Polls with a bounded timeout so the loop stays live with no
    /// traffic. Within a pass the listener is drained before any
    /// connection I/O, and each ready connection is serviced once.
    pub fn poll_once(&mut self) -> io::Result<()> {
        self.poll
            .poll(&mut self.events, Some(self.config.poll_timeout))?;

        if self.events.is_empty() {
            trace!(connections = self.registry.len(), "Poll timeout");
            return Ok(());
        }

        let mut accept_ready = false;
        let mut ready: Vec<(usize, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_ready = true,
                Token(conn_id) => {
                    ready.push((conn_id, event.is_readable(), event.is_writable()))
                }
            }
        }

        if accept_ready {
            self.accept_connections();
        }

        for (conn_id, readable, writable) in ready {
            self.dispatch(conn_id, readable, writable);
        }

        Ok(())
    }

    /// Drain the listener, registering each new connection for reads.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let buf_idx = match self.buffers.alloc() {
                        Some(idx) => idx,
                        None => {
                            warn!(peer = %peer, "Buffer pool exhausted, rejecting connection");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(peer = %peer, error = %e, "set_nodelay failed");
                    }

                    let conn_id = match self.registry.insert(Connection::new(stream, peer, buf_idx))
                    {
                        Some(id) => id,
                        None => {
                            warn!(peer = %peer, "Connection limit reached, rejecting connection");
                            self.buffers.free(buf_idx);
                            continue;
                        }
                    };

                    // Re-borrow after insert
                    let registered = match self.registry.get_mut(conn_id) {
                        Some(conn) => self.poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        ),
                        None => Ok(()),
                    };

                    match registered {
                        Ok(()) => debug!(conn_id, peer = %peer, "Accepted connection"),
                        Err(e) => {
                            debug!(conn_id, peer = %peer, error = %e, "Failed to register connection");
                            self.close_connection(conn_id);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Service one connection's reported readiness.
    fn dispatch(&mut self, conn_id: usize, readable: bool, writable: bool) {
        // The connection may have been closed earlier in this pass.
        if !self.registry.contains(conn_id) {
            return;
        }

        if readable {
            match self.handle_readable(conn_id) {
                Ok(Action::Keep) => {}
                Ok(Action::Close) => {
                    self.close_connection(conn_id);
                    return;
                }
                Err(e) => {
                    debug!(conn_id, error = %e, "Read failed");
                    self.close_connection(conn_id);
                    return;
                }
            }
        }

        if !self.registry.contains(conn_id) {
            return;
        }

        if writable {
            if let Err(e) = self.handle_writable(conn_id) {
                debug!(conn_id, error = %e, "Write failed");
                self.close_connection(conn_id);
            }
        }
    }

    /// One best-effort partial receive plus frame-completion bookkeeping.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<Action> {
        let conn = match self.registry.get_mut(conn_id) {
            Some(c) => c,
            None => return Ok(Action::Keep),
        };
        if conn.state != ConnState::Reading {
            return Ok(Action::Keep);
        }

        let buf = self.buffers.get_mut(conn.buf_idx);
        // Cap the read at the declared total once the header is in, so a
        // next frame's bytes are never pulled into this one.
        let limit = conn.declared_len.unwrap_or(buf.len());
        let n = match conn.stream.read(&mut buf[conn.filled..limit]) {
            Ok(0) => {
                debug!(conn_id, peer = %conn.peer, "Peer closed connection");
                return Ok(Action::Close);
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Action::Keep),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Action::Keep),
            Err(e) => return Err(e),
        };
        conn.filled += n;

        if conn.declared_len.is_none() {
            if let Some(declared) = frame::try_extract_header(&buf[..conn.filled]) {
                let declared = usize::from(declared);
                if declared < frame::HEADER_LEN || declared > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("declared frame length {declared} out of range"),
                    ));
                }
                conn.declared_len = Some(declared);
            }
        }

        if let Some(total) = conn.declared_len {
            if conn.filled > total {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bytes past the declared frame on a one-frame connection",
                ));
            }
            if frame::is_complete(&buf[..conn.filled], total as u16) {
                if let Some(ts) = frame::peek_timestamp(&buf[..conn.filled]) {
                    debug!(
                        conn_id,
                        len = total,
                        secs = ts.secs,
                        micros = ts.micros,
                        "Frame received"
                    );
                }
                conn.begin_echo();
                self.poll.registry().reregister(
                    &mut conn.stream,
                    Token(conn_id),
                    Interest::WRITABLE,
                )?;
            }
        }

        Ok(Action::Keep)
    }

    /// One best-effort partial send of the pending echo.
    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.registry.get_mut(conn_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        let written = match conn.state {
            ConnState::Writing { written } => written,
            _ => return Ok(()),
        };

        let buf = self.buffers.get(conn.buf_idx);
        let n = match conn.stream.write(&buf[written..conn.filled]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };

        let new_written = written + n;
        if new_written == conn.filled {
            debug!(conn_id, bytes = conn.filled, "Echo complete");
            conn.reset_for_next_frame();
            self.poll.registry().reregister(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE,
            )?;
        } else {
            conn.state = ConnState::Writing {
                written: new_written,
            };
            // A short write without EAGAIN does not re-fire on its own.
            self.poll.registry().reregister(
                &mut conn.stream,
                Token(conn_id),
                Interest::WRITABLE,
            )?;
        }

        Ok(())
    }

    /// The single teardown path: remove, deregister, free, drop.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.registry.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.buffers.free(conn.buf_idx);
            debug!(
                conn_id,
                peer = %conn.peer,
                active = self.registry.len(),
                "Connection closed"
            );
        }
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Timestamp;
    use std::time::Duration;

    fn test_server(max_frame_size: usize) -> Server {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 8,
            max_frame_size,
            poll_timeout: Duration::from_millis(10),
            log_level: "info".to_string(),
        };
        Server::bind(config).unwrap()
    }

    fn connect(server: &Server) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream
    }

    fn pump(server: &mut Server, passes: usize) {
        for _ in 0..passes {
            server.poll_once().unwrap();
        }
    }

    /// Non-blocking send interleaved with server passes, so large frames
    /// cannot deadlock a single-threaded test.
    fn send_all(server: &mut Server, stream: &mut std::net::TcpStream, data: &[u8]) {
        let mut sent = 0;
        while sent < data.len() {
            match stream.write(&data[sent..]) {
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => pump(server, 1),
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    fn recv_exact(server: &mut Server, stream: &mut std::net::TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut got = 0;
        let mut idle_passes = 0;
        while got < len {
            match stream.read(&mut buf[got..]) {
                Ok(0) => panic!("peer closed after {got} of {len} bytes"),
                Ok(n) => {
                    got += n;
                    idle_passes = 0;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    pump(server, 1);
                    idle_passes += 1;
                    assert!(idle_passes < 500, "no echo after {got} of {len} bytes");
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        buf
    }

    /// Drive the server until the client observes end-of-stream.
    fn wait_closed(server: &mut Server, stream: &mut std::net::TcpStream) {
        let mut buf = [0u8; 64];
        for _ in 0..500 {
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => panic!("unexpected {n} bytes instead of close"),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => pump(server, 1),
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => return,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        panic!("server did not close the connection");
    }

    fn patterned_frame(size: usize, seed: u8) -> Vec<u8> {
        let payload: Vec<u8> = (0..size - frame::HEADER_LEN)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        frame::encode(Timestamp::now(), &payload).unwrap()
    }

    #[test]
    fn test_echo_idempotence_across_sizes() {
        let mut server = test_server(frame::MAX_FRAME_LEN);
        let mut client = connect(&server);

        // One connection, several frames back to back: also exercises
        // the reset back to reading after each echo.
        for (i, size) in [18usize, 19, 1000, 65535].into_iter().enumerate() {
            let sent = patterned_frame(size, i as u8);
            send_all(&mut server, &mut client, &sent);
            let echoed = recv_exact(&mut server, &mut client, size);
            assert_eq!(echoed, sent, "echo mismatch at size {size}");
        }
    }

    #[test]
    fn test_partial_header_delivery() {
        let mut server = test_server(frame::MAX_FRAME_LEN);
        let mut client = connect(&server);

        let sent = patterned_frame(32, 7);

        // First byte of the 2-byte length prefix alone, then the rest.
        send_all(&mut server, &mut client, &sent[..1]);
        pump(&mut server, 5);
        assert_eq!(server.connection_count(), 1);

        send_all(&mut server, &mut client, &sent[1..]);
        let echoed = recv_exact(&mut server, &mut client, sent.len());
        assert_eq!(echoed, sent);
    }

    #[test]
    fn test_two_connections_are_isolated() {
        let mut server = test_server(frame::MAX_FRAME_LEN);
        let mut first = connect(&server);
        let mut second = connect(&server);

        let frame_a = patterned_frame(100, 0xa0);
        let frame_b = patterned_frame(64, 0x0b);

        // Interleave: half of A, all of B, then the rest of A.
        send_all(&mut server, &mut first, &frame_a[..50]);
        send_all(&mut server, &mut second, &frame_b);

        let echoed_b = recv_exact(&mut server, &mut second, frame_b.len());
        assert_eq!(echoed_b, frame_b);

        send_all(&mut server, &mut first, &frame_a[50..]);
        let echoed_a = recv_exact(&mut server, &mut first, frame_a.len());
        assert_eq!(echoed_a, frame_a);
    }

    #[test]
    fn test_declared_length_below_minimum_closes() {
        let mut server = test_server(frame::MAX_FRAME_LEN);
        let mut client = connect(&server);

        // Declared length 17, one below the header size.
        send_all(&mut server, &mut client, &[0x00, 0x11, 0xde, 0xad]);
        wait_closed(&mut server, &mut client);

        pump(&mut server, 5);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_declared_length_above_configured_max_closes() {
        let mut server = test_server(1024);
        let mut client = connect(&server);

        // Declared length 2000 against a 1024-byte frame limit.
        send_all(&mut server, &mut client, &[0x07, 0xd0]);
        wait_closed(&mut server, &mut client);
    }

    #[test]
    fn test_bytes_past_frame_close_connection() {
        let mut server = test_server(frame::MAX_FRAME_LEN);
        let mut client = connect(&server);

        // A minimal frame with trailing junk whose own prefix (0x0005)
        // is also invalid, so the connection dies on either read split.
        let mut data = patterned_frame(18, 1);
        data.extend_from_slice(&[0x00, 0x05, 0x01]);
        send_all(&mut server, &mut client, &data);

        // Depending on how the kernel splits the delivery, the first
        // frame may or may not be echoed before the violation lands.
        let mut echoed = 0;
        let mut buf = [0u8; 64];
        for _ in 0..500 {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    echoed += n;
                    assert!(echoed <= 18, "more than one frame echoed");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => pump(&mut server, 1),
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }

        pump(&mut server, 5);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_peer_close_removes_entry_once() {
        let mut server = test_server(frame::MAX_FRAME_LEN);
        let client = connect(&server);

        let mut passes = 0;
        while server.connection_count() != 1 {
            pump(&mut server, 1);
            passes += 1;
            assert!(passes < 500, "connection never registered");
        }

        drop(client);

        passes = 0;
        while server.connection_count() != 0 {
            pump(&mut server, 1);
            passes += 1;
            assert!(passes < 500, "connection never removed");
        }
        assert_eq!(server.connection_count(), 0);
    }
}
