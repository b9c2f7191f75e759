use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;

use futures::future::pending;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::lookup_host;

use crate::core::{DeviceType, Error, PeerConfig, Result};

use super::arena::ConnId;

/// Advertised location of a peer device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host_num: i32,
    /// Central authority which advertised the entry
    pub centrald_num: i32,
    pub centrald_id: i32,
    /// Device name, unique per central authority
    pub name: String,
    pub host: String,
    pub port: u16,
    pub device_type: DeviceType,
}

impl Address {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        device_type: DeviceType,
    ) -> Self {
        Address {
            host_num: 0,
            centrald_num: 0,
            centrald_id: 0,
            name: name.into(),
            host: host.into(),
            port,
            device_type,
        }
    }

    /// Socket address when the host is a literal IP address
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolves the host and port without blocking the reactor
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.literal_addr() {
            return Ok(addr);
        }
        lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::network(format!("Cannot resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| Error::network(format!("No address for {}", self.host)))
    }

    /// Whether the entry matches `(centrald_num, name)`
    pub fn is(&self, centrald_num: i32, name: &str) -> bool {
        self.centrald_num == centrald_num && self.name == name
    }
}

impl From<&PeerConfig> for Address {
    fn from(peer: &PeerConfig) -> Self {
        Address {
            centrald_num: peer.centrald_num,
            ..Address::new(peer.name.clone(), peer.host.clone(), peer.port, peer.device_type)
        }
    }
}

type Lookup = Pin<Box<dyn Future<Output = (ConnId, Result<SocketAddr>)> + Send>>;

/// Host name lookups of connections waiting to dial
#[derive(Default)]
pub struct Lookups {
    pending: FuturesUnordered<Lookup>,
}

impl fmt::Debug for Lookups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookups")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Lookups {
    pub fn start(&mut self, id: ConnId, address: Address) {
        tracing::debug!(conn = %address.name, host = %address.host, "resolving");
        self.pending
            .push(Box::pin(async move { (id, address.resolve().await) }));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Next finished lookup; never completes while none is running
    pub async fn next(&mut self) -> (ConnId, Result<SocketAddr>) {
        match self.pending.next().await {
            Some(done) => done,
            None => pending().await,
        }
    }
}

/// Result of inserting into the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryUpdate {
    Added,
    Updated,
    Unchanged,
}

/// Known peer addresses, unique by `(centrald_num, name)`
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Vec<Address>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address) -> DirectoryUpdate {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.is(address.centrald_num, &address.name))
        {
            Some(entry) if *entry == address => {
                DirectoryUpdate::Unchanged
            }
            Some(entry) => {
                *entry = address;
                DirectoryUpdate::Updated
            }
            None => {
                self.entries.push(address);
                DirectoryUpdate::Added
            }
        }
    }

    pub fn remove(&mut self, centrald_num: i32, name: &str) -> Option<Address> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.is(centrald_num, name))?;
        Some(self.entries.remove(position))
    }

    /// Withdraws every entry advertised by one central authority
    pub fn remove_centrald(&mut self, centrald_num: i32) -> Vec<Address> {
        let (removed, kept) = self
            .entries
            .drain(..)
            .partition(|entry| entry.centrald_num == centrald_num);
        self.entries = kept;
        removed
    }

    /// First entry with the given device name
    pub fn find(&self, name: &str) -> Option<&Address> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn find_in(&self, centrald_num: i32, name: &str) -> Option<&Address> {
        self.entries
            .iter()
            .find(|entry| entry.is(centrald_num, name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ccd(centrald_num: i32, port: u16) -> Address {
        Address {
            centrald_num,
            ..Address::new("C0", "127.0.0.1", port, DeviceType::Ccd)
        }
    }

    #[test]
    fn test_unique_by_centrald_and_name() {
        let mut directory = Directory::new();
        assert_eq!(directory.insert(ccd(0, 6170)), DirectoryUpdate::Added);
        assert_eq!(directory.insert(ccd(0, 6170)), DirectoryUpdate::Unchanged);
        assert_eq!(directory.insert(ccd(0, 6171)), DirectoryUpdate::Updated);
        // same name under another central authority is a distinct entry
        assert_eq!(directory.insert(ccd(1, 6170)), DirectoryUpdate::Added);
        assert_eq!(directory.len(), 2);

        assert_eq!(directory.find_in(0, "C0").unwrap().port, 6171);
        assert!(directory.remove(0, "C0").is_some());
        assert!(directory.remove(0, "C0").is_none());
        assert_eq!(directory.find("C0").unwrap().centrald_num, 1);
    }

    #[test]
    fn test_remove_centrald() {
        let mut directory = Directory::new();
        directory.insert(ccd(0, 1));
        directory.insert(Address {
            centrald_num: 0,
            ..Address::new("T0", "127.0.0.1", 2, DeviceType::Mount)
        });
        directory.insert(ccd(1, 3));
        assert_eq!(directory.remove_centrald(0).len(), 2);
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_literal_addr() {
        let address = Address::new("C0", "127.0.0.1", 6170, DeviceType::Ccd);
        assert_eq!(
            address.literal_addr(),
            Some("127.0.0.1:6170".parse::<SocketAddr>().unwrap())
        );
        let peer = PeerConfig {
            name: "T0".to_string(),
            host: "::1".to_string(),
            port: 1,
            device_type: DeviceType::Mount,
            centrald_num: 2,
        };
        let address = Address::from(&peer);
        assert_eq!(address.centrald_num, 2);
        assert!(address.literal_addr().unwrap().ip().is_loopback());
        assert_eq!(
            Address::new("C0", "localhost", 1, DeviceType::Ccd).literal_addr(),
            None
        );
    }

    #[tokio::test]
    async fn test_resolve_host_name() {
        let address = Address::new("C0", "localhost", 6170, DeviceType::Ccd);
        let addr = tokio_test::assert_ok!(address.resolve().await);
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 6170);

        let mut lookups = Lookups::default();
        assert!(lookups.is_empty());
        let bad = Address::new("C1", "no-such-host.invalid", 6170, DeviceType::Ccd);
        lookups.start(ConnId::new(4, 0), bad);
        assert_eq!(lookups.len(), 1);
        let (id, result) = lookups.next().await;
        assert_eq!(id, ConnId::new(4, 0));
        assert!(matches!(result, Err(Error::Network(_))));
        assert!(lookups.is_empty());
    }
}
