use http::header::HeaderName;
use http::Request;
use std::net::SocketAddr;

/// Transport peer address, inserted into request extensions by the host's
/// accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Derives the rate-limit identity of a request.
pub trait IdentityResolver: Send + Sync {
    /// `None` only when the request carries nothing to identify the client.
    fn resolve<B>(&self, request: &Request<B>) -> Option<String>;
}

/// Identity from a forwarding header, falling back to the peer address.
///
/// The header is trusted as sent. Any client that can reach the service
/// directly can pick its own bucket by forging it; deploy behind a proxy that
/// overwrites the header if that matters.
#[derive(Debug, Clone)]
pub struct ForwardedForResolver {
    header: HeaderName,
}

impl Default for ForwardedForResolver {
    fn default() -> Self {
        Self { header: HeaderName::from_static("x-forwarded-for") }
    }
}

impl ForwardedForResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the client address from `header` instead of `X-Forwarded-For`.
    pub fn with_header(header: HeaderName) -> Self {
        Self { header }
    }

    fn from_header<B>(&self, request: &Request<B>) -> Option<String> {
        let value = request.headers().get(&self.header)?.to_str().ok()?;
        // Comma-separated hop list; the first entry is the originating client.
        let first = value.split(',').next()?.trim();
        (!first.is_empty()).then(|| first.to_string())
    }
}

impl IdentityResolver for ForwardedForResolver {
    fn resolve<B>(&self, request: &Request<B>) -> Option<String> {
        self.from_header(request)
            .or_else(|| request.extensions().get::<PeerAddr>().map(|peer| peer.0.ip().to_string()))
    }
}
