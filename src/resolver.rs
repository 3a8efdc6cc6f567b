//! Hostname resolution
//!
//! Resolution sits behind a trait so a fault-injecting resolver can be
//! swapped in for tests; the default implementation asks the system
//! resolver through tokio.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// Asynchronous hostname resolver.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` for the given port.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` when the name cannot be resolved.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system (via `tokio::net::lookup_host`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(addrs)
    }
}

/// Substitute names the resolver layer may not know.
///
/// `localhost` maps to `127.0.0.1` before the resolver is consulted.
#[must_use]
pub fn effective_host(host: &str) -> &str {
    if host == "localhost" {
        "127.0.0.1"
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_host_substitutes_localhost() {
        assert_eq!(effective_host("localhost"), "127.0.0.1");
        assert_eq!(effective_host("example.test"), "example.test");
        assert_eq!(effective_host("127.0.0.1"), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_system_resolver_ip_literal() {
        let addrs = SystemResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8080".parse().unwrap());
    }
}
