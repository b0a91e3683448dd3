//! The task that owns a client's [`QueueManager`].
//!
//! Everything that touches pool state happens here, one message at a time.
//! Resolution, connecting, exchanges and deadlines run on their own tasks and
//! report back as [`Event`]s; callers talk to the dispatcher with
//! [`Command`]s. Events are drained before commands, so an outcome that was
//! already reported wins over a reset that arrives after it.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::response::Exchange;
use crate::{
    dns::{Name, Resolve},
    error::{BoxError, Error},
    pool::{
        Action, Cancel, ConnectionId, DestinationKey, Disposition, PoolConfig, PoolStats,
        QueueManager, RequestId, State,
    },
    timer::{ArcTimer, Timer},
    transport::Transport,
};

pub(super) type Responder = oneshot::Sender<crate::Result<Exchange>>;

/// Requests from client handles.
pub(super) enum Command {
    Enqueue {
        id: RequestId,
        key: DestinationKey,
        request: http::Request<Bytes>,
        timeout: Option<Duration>,
        tx: Responder,
    },
    Reset {
        id: RequestId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Stats {
        key: DestinationKey,
        reply: oneshot::Sender<PoolStats>,
    },
    Totals {
        reply: oneshot::Sender<(usize, usize)>,
    },
    State {
        id: RequestId,
        reply: oneshot::Sender<Option<State>>,
    },
}

/// Outcomes reported by the tasks the dispatcher spawned.
enum Event<Io> {
    Opened {
        connection: ConnectionId,
        result: crate::Result<(SocketAddr, Io)>,
    },
    Exchanged {
        connection: ConnectionId,
        request: RequestId,
        result: Result<(Io, http::Response<Bytes>), BoxError>,
    },
    Deadline {
        request: RequestId,
    },
}

/// A request the caller is still waiting on.
struct Waiting {
    /// Taken when the exchange starts.
    request: Option<http::Request<Bytes>>,
    tx: Responder,
    deadline: Option<JoinHandle<()>>,
}

pub(super) struct Dispatcher<T: Transport> {
    manager: QueueManager,
    transport: Arc<T>,
    resolver: Arc<dyn Resolve>,
    timer: ArcTimer,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<Event<T::Io>>,
    events_tx: mpsc::UnboundedSender<Event<T::Io>>,
    waiting: HashMap<RequestId, Waiting>,
    /// Open transports that are not inside an exchange.
    held: HashMap<ConnectionId, T::Io>,
    opening: HashMap<ConnectionId, JoinHandle<()>>,
    exchanges: HashMap<ConnectionId, oneshot::Sender<()>>,
}

impl<T: Transport> Dispatcher<T> {
    pub(super) fn new(
        config: PoolConfig,
        transport: T,
        resolver: Arc<dyn Resolve>,
        timer: ArcTimer,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Dispatcher<T> {
        let (events_tx, events) = mpsc::unbounded_channel();
        Dispatcher {
            manager: QueueManager::new(config),
            transport: Arc::new(transport),
            resolver,
            timer,
            commands,
            events,
            events_tx,
            waiting: HashMap::new(),
            held: HashMap::new(),
            opening: HashMap::new(),
            exchanges: HashMap::new(),
        }
    }

    /// Runs until every client handle and pending request is gone.
    pub(super) async fn run(mut self) {
        trace!("dispatcher started");
        loop {
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => self.on_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        self.shutdown();
        trace!("dispatcher stopped");
    }

    fn on_command(&mut self, command: Command) {
        if matches!(
            command,
            Command::Enqueue { .. } | Command::Stats { .. } | Command::Totals { .. }
        ) {
            self.prune();
        }

        match command {
            Command::Enqueue {
                id,
                key,
                request,
                timeout,
                tx,
            } => {
                let deadline = timeout.map(|timeout| self.schedule_deadline(id, timeout));
                self.waiting.insert(
                    id,
                    Waiting {
                        request: Some(request),
                        tx,
                        deadline,
                    },
                );
                let actions = self.manager.enqueue(id, key);
                self.execute(actions);
            }
            Command::Reset { id, reply } => {
                trace!("reset {:?} while {:?}", id, self.manager.state(id));
                let (reached, actions) = self.manager.cancel(id, Cancel::Reset);
                if reached {
                    self.respond(id, Err(Error::reset()));
                }
                self.execute(actions);
                if let Some(reply) = reply {
                    let _ = reply.send(reached);
                }
            }
            Command::Stats { key, reply } => {
                let _ = reply.send(self.manager.stats(&key));
            }
            Command::Totals { reply } => {
                let _ = reply.send((self.manager.tracked_keys(), self.manager.pending_requests()));
            }
            Command::State { id, reply } => {
                let _ = reply.send(self.manager.state(id));
            }
        }
    }

    fn on_event(&mut self, event: Event<T::Io>) {
        match event {
            Event::Opened { connection, result } => {
                self.opening.remove(&connection);
                match result {
                    Ok((addr, io)) => {
                        self.held.insert(connection, io);
                        let actions = self.manager.connected(connection, addr);
                        self.execute(actions);
                    }
                    Err(err) => {
                        debug!("{:?} failed to open: {}", connection, err);
                        let (failed, actions) = self.manager.connect_failed(connection);
                        if let Some(id) = failed {
                            self.respond(id, Err(err));
                        }
                        self.execute(actions);
                    }
                }
            }
            Event::Exchanged {
                connection,
                request,
                result,
            } => {
                self.exchanges.remove(&connection);
                match result {
                    Ok((io, response)) => {
                        let remote_addr = self.manager.bound_address(connection);
                        let disposition = if self.transport.is_open(&io) {
                            Disposition::Reuse
                        } else {
                            debug!("{:?} closed after {:?}", connection, request);
                            Disposition::Discard
                        };
                        let Some(actions) = self.manager.complete(connection, request, disposition)
                        else {
                            trace!("dropping response for {:?}", request);
                            return;
                        };
                        if disposition == Disposition::Reuse {
                            self.held.insert(connection, io);
                        }
                        self.respond(
                            request,
                            Ok(Exchange {
                                response,
                                remote_addr,
                                connection,
                            }),
                        );
                        self.execute(actions);
                    }
                    Err(err) => {
                        let Some(actions) = self.manager.fail(connection, request) else {
                            return;
                        };
                        debug!("{:?} failed on {:?}: {}", request, connection, err);
                        self.respond(request, Err(Error::transport(err)));
                        self.execute(actions);
                    }
                }
            }
            Event::Deadline { request } => {
                let (reached, actions) = self.manager.cancel(request, Cancel::Timeout);
                if reached {
                    self.respond(request, Err(Error::timeout()));
                }
                self.execute(actions);
            }
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { key, connection } => self.connect(key, connection),
                Action::Start {
                    connection,
                    request,
                } => self.start(connection, request),
                Action::Abort {
                    connection,
                    request,
                } => {
                    trace!("aborting {:?} on {:?}", request, connection);
                    if let Some(abort) = self.exchanges.remove(&connection) {
                        let _ = abort.send(());
                    }
                }
                Action::Close { connection } => {
                    trace!("closing {:?}", connection);
                    if let Some(task) = self.opening.remove(&connection) {
                        task.abort();
                    }
                    if let Some(abort) = self.exchanges.remove(&connection) {
                        let _ = abort.send(());
                    }
                    self.held.remove(&connection);
                }
            }
        }
    }

    fn connect(&mut self, key: DestinationKey, connection: ConnectionId) {
        let resolver = self.resolver.clone();
        let transport = self.transport.clone();
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let result = open(resolver, transport, key).await;
            let _ = events.send(Event::Opened { connection, result });
        });
        self.opening.insert(connection, task);
    }

    fn start(&mut self, connection: ConnectionId, request: RequestId) {
        let io = self.held.remove(&connection);
        let req = self
            .waiting
            .get_mut(&request)
            .and_then(|waiting| waiting.request.take());

        let (io, req) = match (io, req) {
            (Some(io), Some(req)) => (io, req),
            _ => {
                warn!("{:?} cannot start on {:?}", request, connection);
                let actions = self.manager.fail(connection, request).unwrap_or_default();
                self.respond(request, Err(Error::transport("connection is not available")));
                self.execute(actions);
                return;
            }
        };

        trace!("{:?} sending on {:?}", request, connection);
        let (abort_tx, abort) = oneshot::channel::<()>();
        let exchange = self.transport.send(io, req);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = exchange => {
                    let _ = events.send(Event::Exchanged {
                        connection,
                        request,
                        result,
                    });
                }
                _ = abort => {
                    trace!("{:?} exchange dropped", request);
                }
            }
        });
        self.exchanges.insert(connection, abort_tx);
    }

    /// Destroys idle connections whose transport the peer has closed, so
    /// they are neither handed out nor counted.
    fn prune(&mut self) {
        let closed: Vec<ConnectionId> = self
            .held
            .iter()
            .filter(|(_, io)| !self.transport.is_open(io))
            .map(|(connection, _)| *connection)
            .collect();
        for connection in closed {
            let actions = self.manager.closed(connection);
            self.execute(actions);
        }
    }

    fn schedule_deadline(&self, request: RequestId, timeout: Duration) -> JoinHandle<()> {
        let sleep = self.timer.sleep(timeout);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            sleep.await;
            let _ = events.send(Event::Deadline { request });
        })
    }

    /// Hands the outcome to the caller and cancels the request deadline.
    fn respond(&mut self, request: RequestId, result: crate::Result<Exchange>) {
        if let Some(waiting) = self.waiting.remove(&request) {
            if let Some(deadline) = waiting.deadline {
                deadline.abort();
            }
            let _ = waiting.tx.send(result);
        }
    }

    fn shutdown(&mut self) {
        let (failed, actions) = self.manager.shutdown();
        for id in failed {
            self.respond(id, Err(Error::closed()));
        }
        self.execute(actions);

        for (_, task) in self.opening.drain() {
            task.abort();
        }
        self.held.clear();
        let remaining: Vec<RequestId> = self.waiting.keys().copied().collect();
        for id in remaining {
            self.respond(id, Err(Error::closed()));
        }
    }
}

/// Resolves `key` and opens a transport to the first address returned, on
/// the key's port.
async fn open<T: Transport>(
    resolver: Arc<dyn Resolve>,
    transport: Arc<T>,
    key: DestinationKey,
) -> crate::Result<(SocketAddr, T::Io)> {
    let mut addrs = resolver
        .resolve(Name::from(key.host()))
        .await
        .map_err(Error::resolve)?;
    let mut addr = addrs.next().ok_or_else(|| Error::no_addresses(&key))?;
    addr.set_port(key.port());
    debug!("{} resolved to {}", key, addr);

    let io = transport.open(addr).await.map_err(Error::transport)?;
    Ok((addr, io))
}
