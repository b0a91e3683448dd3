//! DNS resolution

pub(crate) mod gai;
pub(crate) mod resolve;

pub use gai::GaiResolver;
pub use resolve::{Addrs, IntoResolve, Name, Resolve, Resolving};
pub(crate) use resolve::DnsResolverWithOverrides;
