//! DNS resolution seam (§4.3 step 5, §9 expansion): kept external to the compiler so the compiler
//! itself never links a concrete DNS client, mirroring the teacher's `FileSystem`/`RealFs`/`MockFs`
//! trait seam used to keep `Collector` testable off-Linux.

use crate::error::FlowError;
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, FlowError>;
}

/// Resolves via the standard library's system resolver. `timeout` is accepted for interface
/// parity with the spec but not enforced here: `ToSocketAddrs` offers no deadline, so a caller
/// needing a hard bound should wrap resolution in its own timed thread.
pub struct StdHostResolver;

impl HostResolver for StdHostResolver {
    fn resolve(&self, host: &str, _timeout: Duration) -> Result<Vec<IpAddr>, FlowError> {
        let target = format!("{host}:0");
        let addrs = target
            .to_socket_addrs()
            .map_err(|e| FlowError::invalid_argument(format!("failed to resolve '{host}': {e}")))?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort_by_key(|ip| match ip {
            IpAddr::V4(_) => 0,
            IpAddr::V6(_) => 1,
        });
        ips.dedup();
        if ips.is_empty() {
            return Err(FlowError::invalid_argument(format!("no addresses found for '{host}'")));
        }
        Ok(ips)
    }
}

/// Deterministic resolver for tests: a fixed hostname-to-addresses table.
#[derive(Default)]
pub struct StubHostResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StubHostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: impl Into<String>, ips: Vec<IpAddr>) -> Self {
        self.table.insert(host.into(), ips);
        self
    }
}

impl HostResolver for StubHostResolver {
    fn resolve(&self, host: &str, _timeout: Duration) -> Result<Vec<IpAddr>, FlowError> {
        self.table
            .get(host)
            .cloned()
            .ok_or_else(|| FlowError::invalid_argument(format!("stub resolver: unknown host '{host}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn stub_resolver_returns_configured_addresses() {
        let resolver = StubHostResolver::new().with("db.internal", vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
        let ips = resolver.resolve("db.internal", Duration::from_secs(1)).unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
    }

    #[test]
    fn stub_resolver_errors_on_unknown_host() {
        let resolver = StubHostResolver::new();
        assert!(resolver.resolve("nowhere.example", Duration::from_secs(1)).is_err());
    }
}
