//! Transports carry a single exchange at a time over an opened connection.
//!
//! The pool never looks inside a transport: it opens one per connection at
//! the address the resolver answered, sends one request on it at a time, and
//! gets it back once the response is fully buffered.

#[cfg(feature = "http1")]
mod http1;

use std::{future::Future, net::SocketAddr, pin::Pin};

use bytes::Bytes;

#[cfg(feature = "http1")]
pub use self::http1::{HttpIo, HttpTransport};
use crate::error::BoxError;

/// Alias for the future returned by [`Transport::open`].
pub type Opening<Io> = Pin<Box<dyn Future<Output = Result<Io, BoxError>> + Send>>;

/// Alias for the future returned by [`Transport::send`].
///
/// Once the response is fully buffered the connection comes back with it,
/// whether or not it can be reused. On error the connection is gone.
pub type Exchanging<Io> =
    Pin<Box<dyn Future<Output = Result<(Io, http::Response<Bytes>), BoxError>> + Send>>;

/// Opens connections and runs exchanges over them.
///
/// Aborting an exchange drops its [`Exchanging`] future, and the connection
/// inside it. Implementations must release the underlying socket on drop.
pub trait Transport: Send + Sync + 'static {
    /// An open connection.
    type Io: Send + 'static;

    /// Opens a connection to `addr`.
    fn open(&self, addr: SocketAddr) -> Opening<Self::Io>;

    /// Sends `request` over `io` and buffers the full response.
    fn send(&self, io: Self::Io, request: http::Request<Bytes>) -> Exchanging<Self::Io>;

    /// Whether `io` can carry another exchange.
    ///
    /// Checked when an exchange ends and before idle connections are handed
    /// out; a connection that is not open is destroyed.
    fn is_open(&self, io: &Self::Io) -> bool;
}
