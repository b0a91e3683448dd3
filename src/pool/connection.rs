use std::{fmt, net::SocketAddr};

use super::RequestId;

/// Identifies one transport-level connection opened by a client.
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of a pooled connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ConnState {
    /// The slot is reserved while the address resolves and the transport opens.
    Connecting,
    /// Open and waiting for a request.
    Idle,
    /// Serving exactly one request.
    Busy,
}

#[derive(Debug)]
pub(super) struct Connection {
    pub(super) id: ConnectionId,
    /// Address the transport was opened with. Fixed for the lifetime of the
    /// connection, whatever the resolver answers later.
    pub(super) bound: Option<SocketAddr>,
    pub(super) state: ConnState,
    pub(super) request: Option<RequestId>,
}

/// Result of asking the pool for a connection.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Acquired {
    /// An idle connection was taken and is now busy.
    Idle(ConnectionId),
    /// A new slot was reserved and must be opened.
    New(ConnectionId),
    /// Every slot is in use.
    Exhausted,
}

/// The connections open (or opening) for one destination key.
///
/// Closed connections are never kept: destroying one removes it.
#[derive(Debug)]
pub(super) struct ConnectionPool {
    max_size: usize,
    connections: Vec<Connection>,
}

impl ConnectionPool {
    pub(super) fn new(max_size: usize) -> ConnectionPool {
        ConnectionPool {
            max_size,
            connections: Vec::new(),
        }
    }

    /// Hands out the most recently idled connection, or reserves a new slot
    /// while the pool is below its maximum size.
    pub(super) fn acquire(&mut self, next_id: &mut u64) -> Acquired {
        if let Some(conn) = self
            .connections
            .iter_mut()
            .rev()
            .find(|conn| conn.state == ConnState::Idle)
        {
            conn.state = ConnState::Busy;
            return Acquired::Idle(conn.id);
        }

        if self.connections.len() < self.max_size {
            let id = ConnectionId(*next_id);
            *next_id += 1;
            self.connections.push(Connection {
                id,
                bound: None,
                state: ConnState::Connecting,
                request: None,
            });
            return Acquired::New(id);
        }

        Acquired::Exhausted
    }

    pub(super) fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|conn| conn.id == id)
    }

    pub(super) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|conn| conn.id == id)
    }

    /// Removes the connection. Destroying a connection that is already gone
    /// is a no-op and returns `None`.
    pub(super) fn destroy(&mut self, id: ConnectionId) -> Option<Connection> {
        let idx = self.connections.iter().position(|conn| conn.id == id)?;
        Some(self.connections.remove(idx))
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain(..)
    }

    pub(super) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub(super) fn idle_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|conn| conn.state == ConnState::Idle)
            .count()
    }
}
