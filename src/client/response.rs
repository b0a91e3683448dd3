use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::pool::ConnectionId;

/// A Response to a submitted request.
///
/// The body has already been read in full by the time a `Response` is handed
/// out, and the connection it came over is back in the pool.
pub struct Response {
    res: http::Response<Bytes>,
    url: Url,
    remote_addr: Option<SocketAddr>,
    connection: ConnectionId,
}

/// What the dispatcher hands back for a completed exchange.
pub(crate) struct Exchange {
    pub(crate) response: http::Response<Bytes>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) connection: ConnectionId,
}

impl Response {
    pub(super) fn new(exchange: Exchange, url: Url) -> Response {
        Response {
            res: exchange.response,
            url,
            remote_addr: exchange.remote_addr,
            connection: exchange.connection,
        }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.res.version()
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.res.headers()
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.res.headers_mut()
    }

    /// Get the length of the response body.
    #[inline]
    pub fn content_length(&self) -> u64 {
        self.res.body().len() as u64
    }

    /// Get the `Url` the request was sent to.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the address the connection serving this `Response` was opened with.
    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Get the pooled connection this `Response` was received on.
    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Get the full response body as `Bytes`.
    pub fn bytes(self) -> Bytes {
        self.res.into_body()
    }

    /// Get the full response text.
    ///
    /// Invalid UTF-8 sequences are replaced with
    /// [`U+FFFD REPLACEMENT CHARACTER`](std::char::REPLACEMENT_CHARACTER).
    pub fn text(self) -> String {
        String::from_utf8_lossy(self.res.body()).into_owned()
    }

    /// Turn a response into an error if the server returned an error.
    pub fn error_for_status(self) -> crate::Result<Self> {
        let status = self.status();
        if status.is_client_error() || status.is_server_error() {
            Err(crate::Error::status_code(self.url, status))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .field("remote_addr", &self.remote_addr)
            .field("connection", &self.connection)
            .finish()
    }
}

impl From<Response> for http::Response<Bytes> {
    fn from(r: Response) -> http::Response<Bytes> {
        r.res
    }
}
