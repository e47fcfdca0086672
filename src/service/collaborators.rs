//! Interfaces to the services the ICP engine depends on but does not own.
//!
//! The host daemon supplies implementations. Closures implement
//! [`Authorizer`] and [`CacheLookup`] directly, which keeps tests and small
//! embeddings short.

use crate::error::Result;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::warn;

/// Decides whether a peer may query this cache.
pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, remote: IpAddr) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(IpAddr) -> bool + Send + Sync,
{
    fn is_allowed(&self, remote: IpAddr) -> bool {
        self(remote)
    }
}

/// Answers whether a URL is cached with content.
pub trait CacheLookup: Send + Sync {
    fn has_content(&self, url: &str) -> bool;
}

impl<F> CacheLookup for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn has_content(&self, url: &str) -> bool {
        self(url)
    }
}

/// Arbitrates UDP port ownership between subsystems of the host.
pub trait ResourceManager: Send + Sync {
    /// Returns false if the port is already held by someone else.
    fn reserve_udp_port(&self, port: u16, owner: &str) -> bool;
    fn release_udp_port(&self, port: u16, owner: &str);
}

/// Admits or refuses the next event.
pub trait RateLimiter: Send + Sync {
    /// Record an event and return whether it is within the limit.
    fn allow_now(&self) -> bool;

    /// Replace the limit with a spec such as `"50/1s"`.
    fn reconfigure(&self, spec: &str) -> Result<()>;
}

/// External liveness monitor for the listener task.
pub trait Watchdog: Send + Sync {
    fn pet(&self);
}

/// Watchdog that nobody watches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn pet(&self) {}
}

/// In-process [`ResourceManager`] for hosts without their own.
#[derive(Debug, Default)]
pub struct PortRegistry {
    reserved: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .map(|ports| ports.contains(&port))
            .unwrap_or(false)
    }
}

impl ResourceManager for PortRegistry {
    fn reserve_udp_port(&self, port: u16, owner: &str) -> bool {
        match self.reserved.lock() {
            Ok(mut ports) => ports.insert(port),
            Err(_) => {
                warn!(port, owner, "Port registry lock poisoned, refusing reservation");
                false
            }
        }
    }

    fn release_udp_port(&self, port: u16, owner: &str) {
        match self.reserved.lock() {
            Ok(mut ports) => {
                ports.remove(&port);
            }
            Err(_) => warn!(port, owner, "Port registry lock poisoned, release skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_registry_is_exclusive() {
        let ports = PortRegistry::new();
        assert!(ports.reserve_udp_port(3130, "icp"));
        assert!(!ports.reserve_udp_port(3130, "other"));
        assert!(ports.is_reserved(3130));
        ports.release_udp_port(3130, "icp");
        assert!(!ports.is_reserved(3130));
        assert!(ports.reserve_udp_port(3130, "other"));
    }

    #[test]
    fn test_closures_as_collaborators() {
        let only_loopback = |ip: IpAddr| ip.is_loopback();
        assert!(only_loopback.is_allowed(IpAddr::from([127, 0, 0, 1])));
        assert!(!only_loopback.is_allowed(IpAddr::from([10, 0, 0, 1])));

        let cached = |url: &str| url.ends_with(".pdf");
        assert!(cached.has_content("http://x/a.pdf"));
    }
}
