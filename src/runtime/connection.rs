//! Connection state machine and registry.
//!
//! Each connection tracks where it is in the receive/echo cycle and the
//! reassembly state of the frame in flight. The registry owns the
//! connections; removal hands the connection back out by value, so a
//! connection can only ever be torn down once.

use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating a frame: header, then body.
    Reading,
    /// Echoing the completed frame back.
    Writing {
        /// Bytes already flushed.
        written: usize,
    },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking socket.
    pub stream: TcpStream,
    /// Peer address, kept for logging.
    pub peer: SocketAddr,
    /// Index of this connection's buffer in the pool.
    pub buf_idx: usize,
    /// Bytes of the current frame accumulated so far.
    pub filled: usize,
    /// Declared total length, once the 2-byte prefix has arrived.
    pub declared_len: Option<usize>,
    /// Current connection state.
    pub state: ConnState,
}

impl Connection {
    /// Create a new connection with empty receive state.
    pub fn new(stream: TcpStream, peer: SocketAddr, buf_idx: usize) -> Self {
        Self {
            stream,
            peer,
            buf_idx,
            filled: 0,
            declared_len: None,
            state: ConnState::Reading,
        }
    }

    /// The frame is complete; start echoing it back.
    pub fn begin_echo(&mut self) {
        self.state = ConnState::Writing { written: 0 };
    }

    /// The echo is fully flushed; reset for the next frame.
    pub fn reset_for_next_frame(&mut self) {
        self.filled = 0;
        self.declared_len = None;
        self.state = ConnState::Reading;
    }

    /// Whether the accumulated bytes make up the whole declared frame.
    pub fn frame_complete(&self) -> bool {
        self.declared_len == Some(self.filled)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove; the slab key doubles as the
/// connection's poll token.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, transferring ownership to the caller.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
