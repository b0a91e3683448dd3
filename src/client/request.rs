use std::{convert::TryFrom, fmt, time::Duration};

use bytes::Bytes;
use http::{
    header::{HeaderName, HeaderValue, HOST},
    HeaderMap, Method, Uri,
};
use url::{Position, Url};

use super::http::{Client, Pending};
use crate::{pool::DestinationKey, Error};

/// A request ready to be handed to the pool.
pub(crate) struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
}

/// A builder to construct the properties of a request.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

impl Request {
    pub(super) fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub(super) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The pool key this request is queued under.
    pub(super) fn key(&self) -> crate::Result<DestinationKey> {
        DestinationKey::from_url(&self.url)
    }

    /// Converts into the origin-form request a transport sends, with the
    /// `Host` header filled in from the url.
    pub(super) fn into_http(self) -> crate::Result<(Url, http::Request<Bytes>)> {
        let Request {
            method,
            url,
            mut headers,
            body,
            ..
        } = self;

        let uri = Uri::try_from(&url[Position::BeforePath..Position::AfterQuery])
            .map_err(|e| Error::builder(e).with_url(url.clone()))?;

        if !headers.contains_key(HOST) {
            let host = url.host_str().unwrap_or_default();
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            };
            let value = HeaderValue::try_from(host)
                .map_err(|e| Error::builder(e).with_url(url.clone()))?;
            headers.insert(HOST, value);
        }

        let mut req = http::Request::new(body);
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        *req.headers_mut() = headers;
        Ok((url, req))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestBuilder {
    pub(super) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Add a `Header` to this Request.
    ///
    /// If the header is already present, the value will be replaced.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers.insert(key, value);
                    }
                    Err(e) => error = Some(Error::builder::<http::Error>(e.into())),
                },
                Err(e) => error = Some(Error::builder::<http::Error>(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            for (key, value) in headers.iter() {
                req.headers.insert(key.clone(), value.clone());
            }
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Bytes>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.body = body.into();
        }
        self
    }

    /// Enables a request timeout.
    ///
    /// The timeout runs from the moment the request is sent, through queueing
    /// and connecting, until the response body has been received. It
    /// overrides the timeout configured using `ClientBuilder::timeout()`.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.timeout = Some(timeout);
        }
        self
    }

    /// Constructs the Request and sends it to the target URL, returning a
    /// future Response.
    ///
    /// The request enters its destination's queue immediately, so requests
    /// sent one after the other are served in that order.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// the deadline fired, or the request was reset.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use destpool::Error;
    /// #
    /// # async fn run() -> Result<(), Error> {
    /// let response = destpool::Client::new()
    ///     .get("http://fakehost:8080/")
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn send(self) -> Pending {
        match self.request {
            Ok(req) => self.client.execute_request(req),
            Err(err) => Pending::new_err(err),
        }
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder.field("request", req).finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}
