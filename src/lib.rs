#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # destpool
//!
//! The `destpool` crate provides an HTTP [`Client`] built around a
//! per-destination request queue and connection pool.
//!
//! - One queue and one pool per destination (host and port); a destination
//!   whose DNS answer changes keeps the same queue and pool
//! - First come, first served: queued requests are handed connections in
//!   the order they were sent
//! - At most [`max_connections_per_key`][max] connections per destination
//! - Per-request deadlines and explicit [resets](Pending::reset), which
//!   release pool resources the same way
//! - Pluggable [DNS resolution](dns), [timers](Timer) and
//!   [transports](transport)
//!
//! ## Making a GET request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), destpool::Error> {
//! let client = destpool::Client::new();
//! let body = client
//!     .get("http://fakehost:8080/")
//!     .send()
//!     .await?
//!     .text();
//!
//! println!("body = {:?}", body);
//! # Ok(())
//! # }
//! ```
//!
//! ## Timeouts and resets
//!
//! A request can be reset while it is queued, while its connection is
//! opening, or while its exchange is running. A timeout is a reset the
//! client issues itself when the deadline fires. Either way the request's
//! connection is closed if an exchange was running on it, and the next
//! queued request gets the freed slot.
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # async fn run() -> Result<(), destpool::Error> {
//! let client = destpool::Client::builder()
//!     .max_connections_per_key(1)
//!     .timeout(Duration::from_secs(2))
//!     .build()?;
//!
//! let pending = client.get("http://fakehost:8080/slow").send();
//! assert!(pending.reset().await);
//! assert!(pending.await.unwrap_err().is_reset());
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! The following are a list of [Cargo features][cargo-features] that can be
//! enabled or disabled:
//!
//! - **http1** *(enabled by default)*: Provides [`HttpTransport`], HTTP/1.1
//!   over TCP.
//!
//! [max]: ClientBuilder::max_connections_per_key
//! [cargo-features]: https://doc.rust-lang.org/stable/cargo/reference/manifest.html#the-features-section

pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use url::Url;

mod error;

pub use self::client::{Client, ClientBuilder, Pending, RequestBuilder, Response};
pub use self::error::{Error, Result};
pub use self::pool::{ConnectionId, DestinationKey, IntoUrl, PoolStats, RequestId, State};
pub use self::timer::{Sleep, Timer, TokioTimer};
#[cfg(feature = "http1")]
pub use self::transport::HttpTransport;

/// Shortcut method to quickly make a `GET` request.
///
/// **NOTE**: This function creates a new internal `Client` on each call,
/// and so should not be used if making many requests. Create a
/// [`Client`](./struct.Client.html) instead.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn run() -> Result<(), destpool::Error> {
/// let body = destpool::get("http://fakehost:8080/").await?.text();
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// This function fails if:
///
/// - it is not called from within a tokio runtime
/// - supplied `Url` cannot be parsed
/// - the destination could not be resolved
/// - there was an error while sending request
#[cfg(feature = "http1")]
#[cfg_attr(docsrs, doc(cfg(feature = "http1")))]
pub async fn get<T: IntoUrl>(url: T) -> crate::Result<Response> {
    Client::builder().build()?.get(url).send().await
}

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Client>();
    assert_sync::<Client>();
    assert_clone::<Client>();

    assert_send::<RequestBuilder>();
    assert_send::<Pending>();
    assert_send::<Response>();

    assert_send::<Error>();
    assert_sync::<Error>();
}

mod client;
pub mod dns;
mod pool;
mod timer;
pub mod transport;
