use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use futures_util::future::poll_fn;
use hyper::{client::conn, Body};
use log::{debug, trace};
use tokio::{net::TcpStream, task::JoinHandle};

use super::{Exchanging, Opening, Transport};

/// HTTP/1.1 over plain TCP.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    nodelay: bool,
}

/// An open HTTP/1.1 connection.
///
/// Dropping it tears the connection down, including in the middle of an
/// exchange.
pub struct HttpIo {
    tx: conn::SendRequest<Body>,
    conn: JoinHandle<()>,
}

// ===== impl HttpTransport =====

impl HttpTransport {
    /// Creates a new [`HttpTransport`] with `TCP_NODELAY` enabled.
    pub fn new() -> Self {
        HttpTransport { nodelay: true }
    }

    /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    type Io = HttpIo;

    fn open(&self, addr: SocketAddr) -> Opening<HttpIo> {
        let nodelay = self.nodelay;
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(nodelay)?;

            let (tx, connection) = conn::handshake(stream).await?;
            trace!("http1 handshake complete with {}", addr);
            let conn = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("client connection error: {}", e);
                }
            });

            Ok(HttpIo { tx, conn })
        })
    }

    fn send(&self, mut io: HttpIo, request: http::Request<Bytes>) -> Exchanging<HttpIo> {
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let request = http::Request::from_parts(parts, Body::from(body));

            let response = io.tx.send_request(request).await?;
            let (parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body).await?;

            // The response is complete either way; a connection the server
            // closes only stops being reusable.
            if let Err(e) = poll_fn(|cx| io.tx.poll_ready(cx)).await {
                trace!("connection not reusable: {}", e);
            }

            Ok((io, http::Response::from_parts(parts, body)))
        })
    }

    fn is_open(&self, io: &HttpIo) -> bool {
        io.tx.is_ready()
    }
}

// ===== impl HttpIo =====

impl Drop for HttpIo {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

impl fmt::Debug for HttpIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIo").finish()
    }
}
