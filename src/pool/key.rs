use std::fmt;

use url::Url;

use crate::Error;

/// The logical target of a request: a host and a port.
///
/// Requests to the same key may share connections, requests to different
/// keys never do. The key is never derived from a resolved address, so a
/// destination whose DNS answer changes keeps a single queue and pool.
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct DestinationKey {
    host: Box<str>,
    port: u16,
}

impl DestinationKey {
    /// Creates a new key for `host:port`.
    pub fn new(host: impl Into<Box<str>>, port: u16) -> DestinationKey {
        DestinationKey {
            host: host.into(),
            port,
        }
    }

    /// The host name, as it will be handed to the resolver.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The destination port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Derives the key from a request URL, using the scheme's default port
    /// when none is given. Only `http` and `https` URLs with a host map onto
    /// a key.
    pub(crate) fn from_url(url: &Url) -> crate::Result<DestinationKey> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::url_bad_scheme(url.clone()));
        }
        // http and https URLs always carry a host.
        let host = url
            .host_str()
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::url_bad_scheme(url.clone()))?;
        // Bracketed IPv6 literals resolve without the brackets.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(DestinationKey::new(host, port))
    }
}

/// Something a request can be sent to: a [`Url`] or a string that parses
/// as one.
///
/// The URL is checked against its destination key when the request is
/// sent. This trait is sealed.
pub trait IntoUrl: sealed::Sealed {
    #[doc(hidden)]
    fn into_url(self) -> crate::Result<Url>;
}

impl IntoUrl for Url {
    fn into_url(self) -> crate::Result<Url> {
        Ok(self)
    }
}

impl IntoUrl for &Url {
    fn into_url(self) -> crate::Result<Url> {
        Ok(self.clone())
    }
}

impl IntoUrl for &str {
    fn into_url(self) -> crate::Result<Url> {
        Url::parse(self).map_err(Error::builder)
    }
}

impl IntoUrl for &String {
    fn into_url(self) -> crate::Result<Url> {
        self.as_str().into_url()
    }
}

impl IntoUrl for String {
    fn into_url(self) -> crate::Result<Url> {
        self.as_str().into_url()
    }
}

mod sealed {
    use url::Url;

    pub trait Sealed {}

    impl Sealed for Url {}
    impl Sealed for &Url {}
    impl Sealed for &str {}
    impl Sealed for &String {}
    impl Sealed for String {}
}

impl fmt::Debug for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
