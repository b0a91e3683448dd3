//! Per-destination request queues and connection pools.
//!
//! [`QueueManager`] is a plain state machine: every operation mutates the
//! table synchronously and returns the [`Action`]s the caller must carry out
//! (open a connection, start or abort an exchange, close a transport). It is
//! owned by a single dispatcher task, so none of it is locked.
//!
//! Every way a request can end, whether completion, failure, reset or
//! timeout, goes through [`QueueManager::release`] for its connection, which
//! is what keeps the per-key counters exact.

mod connection;
mod key;
mod queue;
mod request;

use std::{collections::HashMap, net::SocketAddr};

use log::{debug, trace};

use self::{
    connection::{Acquired, ConnState, Connection, ConnectionPool},
    queue::RequestQueue,
    request::Request,
};
pub use self::{
    connection::ConnectionId,
    key::{DestinationKey, IntoUrl},
    request::{RequestId, State},
};
pub(crate) use self::request::Cancel;

/// Limits applied to every destination key.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolConfig {
    /// Maximum connections (opening, idle or busy) per key.
    pub(crate) max_size: usize,
    /// Idle connections kept per key once nobody is waiting.
    pub(crate) max_idle: usize,
}

/// Counters for one destination key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Requests waiting for a connection.
    pub queue_length: usize,
    /// Connections that are opening or serving a request.
    pub active_connections: usize,
    /// Connections waiting for a request.
    pub idle_connections: usize,
}

/// Work the owner of a [`QueueManager`] must perform.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Action {
    /// Resolve `key` and open a transport for `connection`.
    Connect {
        key: DestinationKey,
        connection: ConnectionId,
    },
    /// Send `request` on the open `connection`.
    Start {
        connection: ConnectionId,
        request: RequestId,
    },
    /// Stop the exchange of `request` running on `connection`.
    Abort {
        connection: ConnectionId,
        request: RequestId,
    },
    /// Drop whatever transport is still held for `connection`.
    Close { connection: ConnectionId },
}

/// How a connection comes back from a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// The exchange finished cleanly, the connection can serve another request.
    Reuse,
    /// The exchange was aborted or failed, the connection must be destroyed.
    Discard,
}

struct Entry {
    queue: RequestQueue,
    pool: ConnectionPool,
}

/// Maps destination keys to their request queue and connection pool.
pub(crate) struct QueueManager {
    config: PoolConfig,
    table: HashMap<DestinationKey, Entry>,
    requests: HashMap<RequestId, Request>,
    owners: HashMap<ConnectionId, DestinationKey>,
    next_connection: u64,
}

impl QueueManager {
    pub(crate) fn new(config: PoolConfig) -> QueueManager {
        QueueManager {
            config,
            table: HashMap::new(),
            requests: HashMap::new(),
            owners: HashMap::new(),
            next_connection: 0,
        }
    }

    /// Accepts a new request. It is assigned a connection right away when one
    /// is idle or a slot is free, otherwise it waits at the back of its key's
    /// queue.
    pub(crate) fn enqueue(&mut self, id: RequestId, key: DestinationKey) -> Vec<Action> {
        if self.requests.contains_key(&id) {
            debug!("{:?} already enqueued", id);
            return Vec::new();
        }

        let max_size = self.config.max_size;
        let entry = self.table.entry(key.clone()).or_insert_with(|| {
            trace!("tracking destination {}", key);
            Entry {
                queue: RequestQueue::default(),
                pool: ConnectionPool::new(max_size),
            }
        });

        // Waiting requests are served first, a newcomer never jumps the queue.
        let acquired = if entry.queue.is_empty() {
            entry.pool.acquire(&mut self.next_connection)
        } else {
            Acquired::Exhausted
        };

        let mut request = Request::new(id, key.clone());
        if acquired == Acquired::Exhausted {
            entry.queue.push_back(id);
            request.advance(State::Queued);
            trace!(
                "{:?} queued for {} (queue length {})",
                id,
                key,
                entry.queue.len()
            );
        }
        self.requests.insert(id, request);

        self.attach(&key, acquired, id).into_iter().collect()
    }

    /// A connection finished opening and is bound to `addr` for its lifetime.
    pub(crate) fn connected(&mut self, connection: ConnectionId, addr: SocketAddr) -> Vec<Action> {
        let Some(conn) = self.connection_mut(connection) else {
            // Destroyed while opening, the transport has nowhere to go.
            return vec![Action::Close { connection }];
        };
        if conn.state != ConnState::Connecting {
            debug!("{:?} reported connected twice", connection);
            return Vec::new();
        }

        debug!("{:?} connected to {}", connection, addr);
        conn.bound = Some(addr);
        conn.state = ConnState::Busy;
        let request = conn.request;

        match request {
            Some(request) => {
                if let Some(req) = self.requests.get_mut(&request) {
                    req.advance(State::InFlight);
                }
                vec![Action::Start {
                    connection,
                    request,
                }]
            }
            None => self.release(connection, Disposition::Reuse),
        }
    }

    /// Opening a connection failed. The request waiting on it fails with it;
    /// that is the request which was at the head of the queue when the
    /// connection was handed over.
    pub(crate) fn connect_failed(
        &mut self,
        connection: ConnectionId,
    ) -> (Option<RequestId>, Vec<Action>) {
        let Some(key) = self.owners.remove(&connection) else {
            return (None, Vec::new());
        };
        let Some(entry) = self.table.get_mut(&key) else {
            return (None, Vec::new());
        };

        let failed = entry.pool.destroy(connection).and_then(|conn| conn.request);
        if let Some(id) = failed {
            debug!("{:?} failed: could not open {:?}", id, connection);
            self.finish(id, State::Failed);
        }

        let actions = self.fill(&key);
        self.tidy(&key);
        (failed, actions)
    }

    /// The exchange of `request` produced a full response. The request
    /// completes whatever `disposition` says about the connection; a
    /// connection the peer closed is discarded.
    ///
    /// Returns `None` when the request was reset or timed out before this was
    /// observed; the cancellation won and the response must be dropped.
    pub(crate) fn complete(
        &mut self,
        connection: ConnectionId,
        request: RequestId,
        disposition: Disposition,
    ) -> Option<Vec<Action>> {
        if !self.is_in_flight_on(request, connection) {
            trace!("{:?} completed after it was cancelled", request);
            return None;
        }

        self.finish(request, State::Completed);
        Some(self.release(connection, disposition))
    }

    /// The transport of an idle connection was closed by the peer. The
    /// connection is destroyed so it is never handed out again.
    ///
    /// Connections that are opening or busy are left alone; their exchange
    /// reports the outcome.
    pub(crate) fn closed(&mut self, connection: ConnectionId) -> Vec<Action> {
        let Some(key) = self.owners.get(&connection).cloned() else {
            return Vec::new();
        };
        let Some(entry) = self.table.get_mut(&key) else {
            return Vec::new();
        };
        let idle = entry
            .pool
            .get(connection)
            .map_or(false, |conn| conn.state == ConnState::Idle);
        if !idle {
            return Vec::new();
        }

        debug!("idle {:?} closed by peer", connection);
        entry.pool.destroy(connection);
        self.owners.remove(&connection);
        self.tidy(&key);
        vec![Action::Close { connection }]
    }

    /// The transport failed during the exchange. The connection is destroyed.
    ///
    /// Returns `None` for a request that was already cancelled.
    pub(crate) fn fail(
        &mut self,
        connection: ConnectionId,
        request: RequestId,
    ) -> Option<Vec<Action>> {
        if !self.is_in_flight_on(request, connection) {
            return None;
        }

        self.finish(request, State::Failed);
        Some(self.release(connection, Disposition::Discard))
    }

    /// Pulls a request out of the pool before it completes.
    ///
    /// A queued request is simply removed. A request whose connection is
    /// still opening releases it: the opening connection passes to the head
    /// of the queue, or is destroyed when nobody waits. A request in flight
    /// has its exchange aborted and its connection destroyed. Both go through
    /// [`release`](Self::release).
    ///
    /// Returns false when the request had already reached a terminal state.
    pub(crate) fn cancel(&mut self, id: RequestId, cause: Cancel) -> (bool, Vec<Action>) {
        let Some(request) = self.requests.get(&id) else {
            return (false, Vec::new());
        };
        let key = request.key.clone();
        let state = request.state;
        let connection = request.connection;

        let mut actions = Vec::new();
        match (state, connection) {
            (State::Queued, _) => {
                if let Some(entry) = self.table.get_mut(&key) {
                    entry.queue.remove(id);
                }
                self.finish(id, cause.state());
                self.tidy(&key);
            }
            (State::Assigned, Some(connection)) => {
                self.finish(id, cause.state());
                actions.extend(self.release(connection, Disposition::Reuse));
            }
            (State::InFlight, Some(connection)) => {
                self.finish(id, cause.state());
                actions.push(Action::Abort {
                    connection,
                    request: id,
                });
                actions.extend(self.release(connection, Disposition::Discard));
            }
            _ => return (false, actions),
        }

        debug!("{:?} {:?} while {:?}", id, cause.state(), state);
        (true, actions)
    }

    /// Returns a connection to circulation once its request is done with it.
    ///
    /// A reusable connection goes to the head of the queue first; with nobody
    /// waiting it idles, unless the key already keeps enough idle connections.
    /// A connection that is still opening is handed over the same way, but
    /// is destroyed rather than idled. A discarded connection is destroyed
    /// and its slot used to open a new connection for the head of the queue.
    /// Releasing a connection that was already destroyed does nothing.
    pub(crate) fn release(
        &mut self,
        connection: ConnectionId,
        disposition: Disposition,
    ) -> Vec<Action> {
        let Some(key) = self.owners.get(&connection).cloned() else {
            return Vec::new();
        };
        let Some(entry) = self.table.get_mut(&key) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        match disposition {
            Disposition::Reuse => {
                let idle = entry.pool.idle_count();
                let opening = entry
                    .pool
                    .get(connection)
                    .map_or(false, |conn| conn.state == ConnState::Connecting);

                if opening {
                    if let Some(next) = entry.queue.pop_front() {
                        if let Some(conn) = entry.pool.get_mut(connection) {
                            conn.request = Some(next);
                        }
                        if let Some(req) = self.requests.get_mut(&next) {
                            req.connection = Some(connection);
                            req.advance(State::Assigned);
                        }
                        trace!("opening {:?} handed to queued {:?}", connection, next);
                    } else {
                        trace!("opening {:?} no longer needed", connection);
                        entry.pool.destroy(connection);
                        self.owners.remove(&connection);
                        actions.push(Action::Close { connection });
                    }
                } else if let Some(next) = entry.queue.pop_front() {
                    if let Some(conn) = entry.pool.get_mut(connection) {
                        conn.state = ConnState::Busy;
                    }
                    trace!("{:?} handed to queued {:?}", connection, next);
                    actions.extend(self.attach(&key, Acquired::Idle(connection), next));
                } else if idle >= self.config.max_idle {
                    trace!("{:?} over the idle limit for {}", connection, key);
                    entry.pool.destroy(connection);
                    self.owners.remove(&connection);
                    actions.push(Action::Close { connection });
                } else if let Some(conn) = entry.pool.get_mut(connection) {
                    trace!("{:?} idle", connection);
                    conn.state = ConnState::Idle;
                    conn.request = None;
                }
            }
            Disposition::Discard => {
                if entry.pool.destroy(connection).is_some() {
                    debug!("{:?} destroyed", connection);
                }
                self.owners.remove(&connection);
                actions.push(Action::Close { connection });
                actions.extend(self.fill(&key));
            }
        }

        self.tidy(&key);
        actions
    }

    /// Stops everything: pending requests are returned so their callers can
    /// be told, running exchanges are aborted and every connection is closed.
    pub(crate) fn shutdown(&mut self) -> (Vec<RequestId>, Vec<Action>) {
        let mut actions = Vec::new();
        for (_, mut entry) in self.table.drain() {
            entry.queue.drain().for_each(drop);
            for conn in entry.pool.drain() {
                match (conn.state, conn.request) {
                    (ConnState::Busy, Some(request)) => actions.push(Action::Abort {
                        connection: conn.id,
                        request,
                    }),
                    _ => actions.push(Action::Close {
                        connection: conn.id,
                    }),
                }
            }
        }
        self.owners.clear();

        let mut failed: Vec<RequestId> = self.requests.keys().copied().collect();
        failed.sort();
        for id in &failed {
            self.finish(*id, State::Failed);
        }
        (failed, actions)
    }

    /// Counters for `key`; a key that is not tracked reports all zeros.
    pub(crate) fn stats(&self, key: &DestinationKey) -> PoolStats {
        self.table
            .get(key)
            .map(|entry| PoolStats {
                queue_length: entry.queue.len(),
                active_connections: entry.pool.len() - entry.pool.idle_count(),
                idle_connections: entry.pool.idle_count(),
            })
            .unwrap_or_default()
    }

    /// Number of destination keys with a non-empty queue or pool.
    pub(crate) fn tracked_keys(&self) -> usize {
        self.table.len()
    }

    /// Number of requests that have not reached a terminal state.
    pub(crate) fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Current state of a request that has not finished yet.
    pub(crate) fn state(&self, id: RequestId) -> Option<State> {
        self.requests.get(&id).map(|request| request.state)
    }

    /// The address `connection` was opened with.
    pub(crate) fn bound_address(&self, connection: ConnectionId) -> Option<SocketAddr> {
        let key = self.owners.get(&connection)?;
        self.table.get(key)?.pool.get(connection)?.bound
    }

    // ===== internals =====

    /// Binds `id` to the connection `acquired` yielded.
    fn attach(&mut self, key: &DestinationKey, acquired: Acquired, id: RequestId) -> Option<Action> {
        let (connection, fresh) = match acquired {
            Acquired::Idle(connection) => (connection, false),
            Acquired::New(connection) => (connection, true),
            Acquired::Exhausted => return None,
        };

        let conn = self.table.get_mut(key)?.pool.get_mut(connection)?;
        conn.request = Some(id);
        let request = self.requests.get_mut(&id)?;
        request.connection = Some(connection);
        request.advance(State::Assigned);

        if fresh {
            trace!("{:?} opening {:?} to {}", id, connection, key);
            self.owners.insert(connection, key.clone());
            Some(Action::Connect {
                key: key.clone(),
                connection,
            })
        } else {
            trace!("{:?} reusing {:?}", id, connection);
            request.advance(State::InFlight);
            Some(Action::Start {
                connection,
                request: id,
            })
        }
    }

    /// Opens connections for queued requests while the pool has room.
    fn fill(&mut self, key: &DestinationKey) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let Some(entry) = self.table.get_mut(key) else {
                break;
            };
            if entry.queue.is_empty() {
                break;
            }
            let acquired = entry.pool.acquire(&mut self.next_connection);
            if acquired == Acquired::Exhausted {
                break;
            }
            let Some(next) = entry.queue.pop_front() else {
                break;
            };
            actions.extend(self.attach(key, acquired, next));
        }
        actions
    }

    /// Moves a request to its terminal state and forgets it.
    fn finish(&mut self, id: RequestId, state: State) {
        if let Some(mut request) = self.requests.remove(&id) {
            request.advance(state);
            request.connection = None;
            trace!("{:?} finished as {:?}", id, request.state);
        }
    }

    /// Drops the table entry for `key` once its queue and pool are empty.
    fn tidy(&mut self, key: &DestinationKey) {
        let empty = self
            .table
            .get(key)
            .map_or(false, |entry| entry.queue.is_empty() && entry.pool.is_empty());
        if empty {
            trace!("untracking destination {}", key);
            self.table.remove(key);
        }
    }

    fn connection_mut(&mut self, connection: ConnectionId) -> Option<&mut Connection> {
        let key = self.owners.get(&connection)?;
        self.table.get_mut(key)?.pool.get_mut(connection)
    }

    fn is_in_flight_on(&self, request: RequestId, connection: ConnectionId) -> bool {
        self.requests.get(&request).map_or(false, |req| {
            req.state == State::InFlight && req.connection == Some(connection)
        })
    }
}
