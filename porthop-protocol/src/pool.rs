//! Tunnel address allocation.
//!
//! A free-list over a configured IPv4 subnet. The network address, the
//! first host (the server's own tunnel address) and the broadcast address
//! are never handed out. Released addresses are reused before the scan
//! cursor advances.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Ipv4Pool {
    network: u32,
    mask: u8,
    cursor: u32,
    limit: u32,
    released: VecDeque<Ipv4Addr>,
    allocated: HashSet<Ipv4Addr>,
}

impl Ipv4Pool {
    /// Parses `a.b.c.d/len` notation.
    pub fn from_cidr(cidr: &str) -> Result<Ipv4Pool> {
        let (addr, len) = cidr
            .split_once('/')
            .ok_or_else(|| Error::InvalidNetwork(format!("missing prefix length: {cidr}")))?;
        let ip: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidNetwork(format!("bad address: {cidr}")))?;
        let mask: u8 = len
            .parse()
            .map_err(|_| Error::InvalidNetwork(format!("bad prefix length: {cidr}")))?;
        if mask < 8 || mask > 30 {
            return Err(Error::InvalidNetwork(format!(
                "prefix length {mask} out of range (8..=30)"
            )));
        }
        let netmask = u32::MAX << (32 - mask);
        let network = u32::from(ip) & netmask;
        let broadcast = network | !netmask;
        Ok(Ipv4Pool {
            network,
            mask,
            // network + 1 is reserved for the server side
            cursor: network + 2,
            limit: broadcast,
            released: VecDeque::new(),
            allocated: HashSet::new(),
        })
    }

    /// The server's own tunnel address.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Allocates the next free address.
    pub fn next(&mut self) -> Result<Ipv4Addr> {
        if let Some(addr) = self.released.pop_front() {
            self.allocated.insert(addr);
            return Ok(addr);
        }
        if self.cursor >= self.limit {
            return Err(Error::PoolExhausted);
        }
        let addr = Ipv4Addr::from(self.cursor);
        self.cursor += 1;
        self.allocated.insert(addr);
        Ok(addr)
    }

    /// Returns an address to the pool. Addresses this pool never handed out
    /// are ignored.
    pub fn release(&mut self, addr: Ipv4Addr) {
        if self.allocated.remove(&addr) {
            self.released.push_back(addr);
        }
    }

    pub fn in_use(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially_skipping_reserved() {
        let mut pool = Ipv4Pool::from_cidr("10.1.1.0/24").unwrap();
        assert_eq!(pool.gateway(), Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 1, 1, 2));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 1, 1, 3));
        assert_eq!(pool.mask(), 24);
    }

    #[test]
    fn released_addresses_are_reused() {
        let mut pool = Ipv4Pool::from_cidr("10.1.1.0/24").unwrap();
        let a = pool.next().unwrap();
        let _b = pool.next().unwrap();
        pool.release(a);
        assert_eq!(pool.next().unwrap(), a);
    }

    #[test]
    fn exhaustion_is_an_error() {
        // /30: hosts .1 (gateway) and .2 only, then broadcast
        let mut pool = Ipv4Pool::from_cidr("10.0.0.0/30").unwrap();
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(pool.next(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn foreign_release_is_ignored() {
        let mut pool = Ipv4Pool::from_cidr("10.1.1.0/24").unwrap();
        pool.release(Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(pool.next().unwrap(), Ipv4Addr::new(10, 1, 1, 2));
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!(Ipv4Pool::from_cidr("10.1.1.0").is_err());
        assert!(Ipv4Pool::from_cidr("10.1.1.0/33").is_err());
        assert!(Ipv4Pool::from_cidr("lorem/24").is_err());
    }
}
