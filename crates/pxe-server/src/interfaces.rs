//! Host interface addresses

use crate::error::Result;
use nix::ifaddrs::getifaddrs;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

/// Where the TFTP fleet learns the host's addresses.
pub trait InterfaceSource: Send + Sync {
    /// Every address currently configured on the host.
    fn addresses(&self) -> Result<BTreeSet<IpAddr>>;
}

/// Reads addresses from the kernel with `getifaddrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn addresses(&self) -> Result<BTreeSet<IpAddr>> {
        let mut addresses = BTreeSet::new();
        for ifaddr in getifaddrs().map_err(std::io::Error::from)? {
            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(v4) = address.as_sockaddr_in() {
                addresses.insert(IpAddr::V4(v4.ip()));
            } else if let Some(v6) = address.as_sockaddr_in6() {
                addresses.insert(IpAddr::V6(v6.ip()));
            }
        }
        Ok(addresses)
    }
}

/// A fixed, replaceable address set.
#[derive(Debug, Default)]
pub struct StaticInterfaces {
    addresses: Mutex<BTreeSet<IpAddr>>,
}

impl StaticInterfaces {
    /// Starts with `addresses`.
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: Mutex::new(addresses.into_iter().collect()),
        }
    }

    /// Replaces the address set.
    pub fn set(&self, addresses: impl IntoIterator<Item = IpAddr>) {
        *self.addresses.lock().unwrap_or_else(PoisonError::into_inner) =
            addresses.into_iter().collect();
    }
}

impl InterfaceSource for StaticInterfaces {
    fn addresses(&self) -> Result<BTreeSet<IpAddr>> {
        Ok(self
            .addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// `169.254.0.0/16` and `fe80::/10`.
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
