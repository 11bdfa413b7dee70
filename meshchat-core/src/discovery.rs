//! Discovery exchange: known-peer set learned from handshakes and shared peer lists.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Consecutive dial failures after which an address is dropped.
pub const DEFAULT_MAX_DIAL_FAILURES: u32 = 3;

/// Listen addresses of other nodes, connected or not. Never contains this node's own address.
#[derive(Debug)]
pub struct KnownPeers {
    /// Address -> consecutive failed dials.
    peers: BTreeMap<SocketAddr, u32>,
    self_addrs: HashSet<SocketAddr>,
    listen_port: Option<u16>,
    max_dial_failures: u32,
}

impl KnownPeers {
    pub fn new(max_dial_failures: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            self_addrs: HashSet::new(),
            listen_port: None,
            max_dial_failures: max_dial_failures.max(1),
        }
    }

    /// Set the local listen port; 127.0.0.1, ::1 and unspecified addresses on it count as self.
    pub fn set_listen_port(&mut self, port: Option<u16>) {
        self.listen_port = port;
        self.peers.retain(|addr, _| {
            !(Some(addr.port()) == port && is_local_host(addr.ip()))
        });
    }

    /// Record an address under which other nodes may reach this one.
    pub fn note_self_address(&mut self, addr: SocketAddr) {
        self.peers.remove(&addr);
        self.self_addrs.insert(addr);
    }

    pub fn is_self(&self, addr: &SocketAddr) -> bool {
        if self.self_addrs.contains(addr) {
            return true;
        }
        Some(addr.port()) == self.listen_port && is_local_host(addr.ip())
    }

    /// Add one address. Returns true if it was not known before.
    pub fn insert(&mut self, addr: SocketAddr) -> bool {
        if self.is_self(&addr) || self.peers.contains_key(&addr) {
            return false;
        }
        self.peers.insert(addr, 0);
        true
    }

    /// Merge a received peer list; returns the addresses that were new.
    pub fn merge<I>(&mut self, addrs: I) -> Vec<SocketAddr>
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        addrs.into_iter().filter(|a| self.insert(*a)).collect()
    }

    /// Addresses to share with a peer, leaving out `exclude` (usually that peer's own address).
    pub fn snapshot(&self, exclude: Option<SocketAddr>) -> Vec<SocketAddr> {
        self.peers
            .keys()
            .filter(|a| Some(**a) != exclude)
            .copied()
            .collect()
    }

    /// Record a failed dial. Returns true if the address was pruned.
    pub fn record_dial_failure(&mut self, addr: SocketAddr) -> bool {
        let Some(failures) = self.peers.get_mut(&addr) else {
            return false;
        };
        *failures += 1;
        if *failures >= self.max_dial_failures {
            self.peers.remove(&addr);
            return true;
        }
        false
    }

    /// Record a successful connection: the address is known and its failure count reset.
    pub fn record_dial_success(&mut self, addr: SocketAddr) {
        if self.is_self(&addr) {
            return;
        }
        self.peers.insert(addr, 0);
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for KnownPeers {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIAL_FAILURES)
    }
}

/// Hosts that always mean this machine. Other 127/8 addresses may be separate nodes.
fn is_local_host(ip: IpAddr) -> bool {
    ip == IpAddr::V4(Ipv4Addr::LOCALHOST)
        || ip == IpAddr::V6(Ipv6Addr::LOCALHOST)
        || ip.is_unspecified()
}
