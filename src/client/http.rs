use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_core::ready;
use http::Method;
use log::{debug, trace};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::{
    dispatch::{Command, Dispatcher},
    request::{Request, RequestBuilder},
    response::{Exchange, Response},
};
#[cfg(feature = "http1")]
use crate::transport::HttpTransport;
use crate::{
    dns::{DnsResolverWithOverrides, GaiResolver, IntoResolve, Resolve},
    error::Error,
    pool::{DestinationKey, PoolConfig, PoolStats, RequestId, State},
    timer::{ArcTimer, Timer, TokioTimer},
    transport::Transport,
    IntoUrl,
};

/// A `Client` to make requests with.
///
/// The Client keeps one request queue and one connection pool per
/// destination (host and port). Requests to a destination are served in the
/// order they were sent, and never use more than
/// [`max_connections_per_key`](ClientBuilder::max_connections_per_key)
/// connections at once.
///
/// The pool lives on a background task spawned on the tokio runtime the
/// client was built on. It runs until every clone of the `Client` and every
/// [`Pending`] request is dropped.
///
/// You do **not** have to wrap the `Client` in an [`Rc`] or [`Arc`] to **reuse** it,
/// because it already uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    timeout: Option<Duration>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    // NOTE: When adding a new field, update `fmt::Debug for ClientBuilder`
    max_connections_per_key: usize,
    pool_max_idle_per_key: usize,
    timeout: Option<Duration>,
    dns_overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    dns_resolver: Option<Arc<dyn Resolve>>,
    timer: Option<ArcTimer>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                max_connections_per_key: 8,
                pool_max_idle_per_key: usize::MAX,
                timeout: None,
                dns_overrides: HashMap::new(),
                dns_resolver: None,
                timer: None,
            },
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration and
    /// the HTTP/1.1 transport.
    ///
    /// # Errors
    ///
    /// This method fails if the builder was misconfigured, or if it is not
    /// called from within a tokio runtime.
    #[cfg(feature = "http1")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http1")))]
    pub fn build(self) -> crate::Result<Client> {
        self.build_with(HttpTransport::new())
    }

    /// Returns a `Client` that sends its requests over `transport`.
    ///
    /// # Errors
    ///
    /// This method fails if the builder was misconfigured, or if it is not
    /// called from within a tokio runtime.
    pub fn build_with<T: Transport>(self, transport: T) -> crate::Result<Client> {
        let config = self.config;

        if config.max_connections_per_key == 0 {
            return Err(Error::builder(
                "max_connections_per_key must be greater than zero",
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(Error::builder)?;

        let resolver = config
            .dns_resolver
            .unwrap_or_else(|| GaiResolver::new().into_resolve());
        let resolver = if config.dns_overrides.is_empty() {
            resolver
        } else {
            DnsResolverWithOverrides::new(resolver, config.dns_overrides).into_resolve()
        };
        let timer = config
            .timer
            .unwrap_or_else(|| ArcTimer::new(TokioTimer::new()));

        let pool = PoolConfig {
            max_size: config.max_connections_per_key,
            max_idle: config.pool_max_idle_per_key,
        };
        debug!("building client with {:?}", pool);

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(Dispatcher::new(pool, transport, resolver, timer, rx).run());

        Ok(Client {
            inner: Arc::new(ClientRef {
                tx,
                next_id: AtomicU64::new(1),
                timeout: config.timeout,
            }),
        })
    }

    // Pool options

    /// Sets the maximum number of connections, opening, busy or idle, kept
    /// for a single destination.
    ///
    /// Requests beyond that wait in the destination's queue. Default is 8.
    pub fn max_connections_per_key(mut self, max: usize) -> ClientBuilder {
        self.config.max_connections_per_key = max;
        self
    }

    /// Sets the maximum idle connection per destination allowed in the pool.
    pub fn pool_max_idle_per_key(mut self, max: usize) -> ClientBuilder {
        self.config.pool_max_idle_per_key = max;
        self
    }

    // Timeout options

    /// Enables a request timeout.
    ///
    /// The timeout is applied from when the request is sent until the
    /// response body has been received. A request that times out is taken
    /// out of the pool exactly as if it had been reset.
    ///
    /// Default is no timeout.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeout = Some(timeout);
        self
    }

    /// Provide a timer to be used for request deadlines.
    ///
    /// Default is [`TokioTimer`].
    pub fn timer<M>(mut self, timer: M) -> ClientBuilder
    where
        M: Timer + Send + Sync + 'static,
    {
        self.config.timer = Some(ArcTimer::new(timer));
        self
    }

    // DNS options

    /// Override DNS resolution for specific domains to a particular IP address.
    ///
    /// Warning
    ///
    /// Since the DNS protocol has no notion of ports, if you wish to send
    /// traffic to a particular port you must include this port in the URL
    /// itself, any port in the overridden addr will be ignored and traffic sent
    /// to the conventional port for the given scheme (e.g. 80 for http).
    pub fn resolve(self, domain: &str, addr: SocketAddr) -> ClientBuilder {
        self.resolve_to_addrs(domain, &[addr])
    }

    /// Override DNS resolution for specific domains to particular IP addresses.
    ///
    /// Warning
    ///
    /// Since the DNS protocol has no notion of ports, if you wish to send
    /// traffic to a particular port you must include this port in the URL
    /// itself, any port in the overridden addresses will be ignored and traffic sent
    /// to the conventional port for the given scheme (e.g. 80 for http).
    pub fn resolve_to_addrs(mut self, domain: &str, addrs: &[SocketAddr]) -> ClientBuilder {
        self.config
            .dns_overrides
            .insert(Cow::Owned(domain.to_ascii_lowercase()), addrs.to_vec());
        self
    }

    /// Override the DNS resolver implementation.
    ///
    /// Pass an `Arc` wrapping a trait object implementing `Resolve`.
    /// Overrides for specific names passed to `resolve` and `resolve_to_addrs` will
    /// still be applied on top of this resolver.
    pub fn dns_resolver<R: IntoResolve>(mut self, resolver: R) -> ClientBuilder {
        self.config.dns_resolver = Some(resolver.into_resolve());
        self
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("ClientBuilder");
        builder
            .field("max_connections_per_key", &self.config.max_connections_per_key)
            .field("pool_max_idle_per_key", &self.config.pool_max_idle_per_key);

        if let Some(ref d) = self.config.timeout {
            builder.field("timeout", d);
        }

        if !self.config.dns_overrides.is_empty() {
            builder.field("dns_overrides", &self.config.dns_overrides);
        }

        if self.config.dns_resolver.is_some() {
            builder.field("dns_resolver", &true);
        }

        builder.finish()
    }
}

impl Client {
    /// Constructs a new `Client`.
    ///
    /// # Panics
    ///
    /// This method panics if called outside of a tokio runtime.
    ///
    /// Use `Client::builder()` if you wish to handle the failure as an `Error`
    /// instead of panicking.
    #[cfg(feature = "http1")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http1")))]
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    /// Creates a `ClientBuilder` to configure a `Client`.
    ///
    /// This is the same as `ClientBuilder::new()`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(move |url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    pub(super) fn execute_request(&self, req: Request) -> Pending {
        let key = match req.key() {
            Ok(key) => key,
            Err(err) => return Pending::new_err(err),
        };
        let timeout = req.timeout().or(self.inner.timeout);
        let (url, request) = match req.into_http() {
            Ok(parts) => parts,
            Err(err) => return Pending::new_err(err),
        };

        let id = RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let command = Command::Enqueue {
            id,
            key: key.clone(),
            request,
            timeout,
            tx,
        };
        if self.inner.tx.send(command).is_err() {
            return Pending::new_err(Error::closed().with_url(url));
        }
        trace!("{:?} sent to {}", id, key);

        Pending {
            inner: PendingInner::Request(PendingRequest {
                id,
                key,
                url,
                rx,
                commands: self.inner.tx.clone(),
                done: false,
            }),
        }
    }

    /// Counters for the pool serving `key`.
    ///
    /// A destination with no queued requests and no connections reports all
    /// zeros.
    pub async fn stats(&self, key: &DestinationKey) -> crate::Result<PoolStats> {
        let key = key.clone();
        self.query(|reply| Command::Stats { key, reply }).await
    }

    /// Number of requests waiting for a connection to `key`.
    pub async fn queue_length(&self, key: &DestinationKey) -> crate::Result<usize> {
        self.stats(key).await.map(|stats| stats.queue_length)
    }

    /// Number of connections to `key` that are opening or serving a request.
    pub async fn active_connection_count(&self, key: &DestinationKey) -> crate::Result<usize> {
        self.stats(key).await.map(|stats| stats.active_connections)
    }

    /// Number of destinations that still have queued requests or
    /// connections.
    pub async fn tracked_keys(&self) -> crate::Result<usize> {
        self.query(|reply| Command::Totals { reply })
            .await
            .map(|(keys, _)| keys)
    }

    /// Number of requests that have not finished yet.
    pub async fn pending_requests(&self) -> crate::Result<usize> {
        self.query(|reply| Command::Totals { reply })
            .await
            .map(|(_, requests)| requests)
    }

    /// Where the request `id` is in its lifecycle.
    ///
    /// Returns `None` for a request that has finished, whatever the outcome,
    /// or that this client never issued.
    pub async fn request_state(&self, id: RequestId) -> crate::Result<Option<State>> {
        self.query(|reply| Command::State { id, reply }).await
    }

    async fn query<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> crate::Result<R> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(command(reply))
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Client");
        if let Some(ref d) = self.inner.timeout {
            builder.field("timeout", d);
        }
        builder.finish()
    }
}

/// A request that has been handed to the pool.
///
/// Resolves to the [`Response`] once the exchange completes. The request is
/// queued as soon as it is sent, not when this future is first polled.
/// Dropping a `Pending` before it resolves resets the request.
#[must_use = "dropping a Pending resets the request"]
pub struct Pending {
    inner: PendingInner,
}

enum PendingInner {
    Request(PendingRequest),
    Error(Option<Error>),
}

struct PendingRequest {
    id: RequestId,
    key: DestinationKey,
    url: Url,
    rx: oneshot::Receiver<crate::Result<Exchange>>,
    commands: mpsc::UnboundedSender<Command>,
    done: bool,
}

impl Pending {
    pub(super) fn new_err(err: Error) -> Pending {
        Pending {
            inner: PendingInner::Error(Some(err)),
        }
    }

    /// The id the pool tracks this request under, if it reached the pool.
    pub fn id(&self) -> Option<RequestId> {
        match self.inner {
            PendingInner::Request(ref req) => Some(req.id),
            PendingInner::Error(_) => None,
        }
    }

    /// The destination this request is queued for, if it reached the pool.
    pub fn key(&self) -> Option<&DestinationKey> {
        match self.inner {
            PendingInner::Request(ref req) => Some(&req.key),
            PendingInner::Error(_) => None,
        }
    }

    /// Resets the request.
    ///
    /// A queued request leaves the queue; a request whose exchange is running
    /// has it aborted and its connection closed. Either way the request then
    /// resolves with an error for which [`Error::is_reset`] is true.
    ///
    /// Returns `false` if the request had already completed, failed or timed
    /// out, in which case nothing changes.
    pub async fn reset(&self) -> bool {
        let PendingInner::Request(ref req) = self.inner else {
            return false;
        };
        if req.done {
            return false;
        }

        let (reply, rx) = oneshot::channel();
        let command = Command::Reset {
            id: req.id,
            reply: Some(reply),
        };
        if req.commands.send(command).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl Future for Pending {
    type Output = crate::Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().inner {
            PendingInner::Request(ref mut req) => {
                let result = ready!(Pin::new(&mut req.rx).poll(cx));
                req.done = true;
                let url = req.url.clone();
                Poll::Ready(match result {
                    Ok(Ok(exchange)) => Ok(Response::new(exchange, url)),
                    Ok(Err(err)) => Err(err.with_url(url)),
                    Err(_) => Err(Error::closed().with_url(url)),
                })
            }
            PendingInner::Error(ref mut err) => Poll::Ready(Err(err
                .take()
                .expect("Pending error polled more than once"))),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.done {
            trace!("{:?} dropped before completing", self.id);
            let _ = self.commands.send(Command::Reset {
                id: self.id,
                reply: None,
            });
        }
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            PendingInner::Request(ref req) => f
                .debug_struct("Pending")
                .field("id", &req.id)
                .field("key", &req.key)
                .field("url", &req.url.as_str())
                .finish(),
            PendingInner::Error(ref err) => f.debug_struct("Pending").field("error", err).finish(),
        }
    }
}

#[cfg(all(test, feature = "http1"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_connections_is_a_builder_error() {
        let err = Client::builder()
            .max_connections_per_key(0)
            .build()
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn build_outside_runtime_fails() {
        let err = Client::builder().build().unwrap_err();
        assert!(err.is_builder());
    }

    #[tokio::test]
    async fn bad_scheme_fails_without_reaching_the_pool() {
        let client = Client::new();
        let pending = client.get("ftp://fakehost/").send();
        assert_eq!(pending.id(), None);

        let err = pending.await.unwrap_err();
        assert!(err.is_builder());
        assert_eq!(err.url().map(Url::as_str), Some("ftp://fakehost/"));
        assert_eq!(client.pending_requests().await.unwrap(), 0);
    }
}
