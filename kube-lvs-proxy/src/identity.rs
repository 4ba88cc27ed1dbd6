//! Stable identities for virtual services and their backends.
//!
//! Normal services are keyed `"<ip>-<proto>-<port>"`; DSR services are keyed
//! by the decimal rendering of their firewall mark. A normal key always
//! contains at least two dashes and a mark key never contains one, which is
//! what lets the garbage collector recover the VIP from normal keys.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::types::Protocol;

pub fn ip_port_id(ip: Ipv4Addr, protocol: Protocol, port: u16) -> String {
    format!("{}-{}-{}", ip, protocol.as_str(), port)
}

pub fn endpoint_id(ip: Ipv4Addr, port: u16) -> String {
    format!("{ip}:{port}")
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MarkedService {
    pub ip: Ipv4Addr,
    pub protocol: Protocol,
    pub port: u16,
}

/// Allocates unique, non-zero 32-bit firewall marks for DSR services and
/// remembers the tuple each mark encodes. Derivation is deterministic so the
/// same tuple resolves to the same mark across engines, with linear probing
/// when two tuples hash onto the same slot.
#[derive(Debug, Default)]
pub struct FwMarkRegistry {
    by_mark: ahash::HashMap<u32, MarkedService>,
    by_service: ahash::HashMap<MarkedService, u32>,
}

impl FwMarkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, ip: Ipv4Addr, protocol: Protocol, port: u16) -> Result<u32> {
        let service = MarkedService { ip, protocol, port };
        if let Some(mark) = self.by_service.get(&service) {
            return Ok(*mark);
        }

        let start = hash_mark(&ip_port_id(ip, protocol, port));
        let mut mark = start;
        loop {
            match self.by_mark.get(&mark) {
                None => {
                    self.by_mark.insert(mark, service.clone());
                    self.by_service.insert(service, mark);
                    return Ok(mark);
                }
                Some(owner) if *owner == service => return Ok(mark),
                Some(_) => {
                    mark = next_mark(mark);
                    if mark == start {
                        return Err(Error::MarkExhausted);
                    }
                }
            }
        }
    }

    /// Returns 0 when the tuple has no mark; never errors.
    pub fn lookup(&self, ip: Ipv4Addr, protocol: Protocol, port: u16) -> u32 {
        self.by_service
            .get(&MarkedService { ip, protocol, port })
            .copied()
            .unwrap_or(0)
    }

    pub fn resolve(&self, mark: u32) -> Result<MarkedService> {
        self.by_mark
            .get(&mark)
            .cloned()
            .ok_or(Error::UnknownFwMark(mark))
    }

    pub fn release(&mut self, mark: u32) {
        if let Some(service) = self.by_mark.remove(&mark) {
            self.by_service.remove(&service);
        }
    }
}

/// FNV-1a, folded away from zero: a zero mark means "no mark" everywhere a
/// mark travels (mangle rules, ip rules, IPVS entries).
fn hash_mark(id: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    if hash == 0 { 1 } else { hash }
}

fn next_mark(mark: u32) -> u32 {
    let next = mark.wrapping_add(1);
    if next == 0 { 1 } else { next }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tuple() -> (Ipv4Addr, Protocol, u16) {
        (Ipv4Addr::new(203, 0, 113, 9), Protocol::Tcp, 443)
    }

    #[test]
    fn test_ip_port_id_shape() {
        let (ip, proto, port) = tuple();
        let key = ip_port_id(ip, proto, port);
        assert_eq!(key, "203.0.113.9-tcp-443");
        assert!(key.matches('-').count() >= 2);
        assert_eq!(endpoint_id(ip, 8443), "203.0.113.9:8443");
    }

    #[test]
    fn test_allocate_is_idempotent_and_deterministic() -> crate::Result<()> {
        let (ip, proto, port) = tuple();
        let mut registry = FwMarkRegistry::new();
        let first = registry.allocate(ip, proto, port)?;
        let second = registry.allocate(ip, proto, port)?;
        assert_eq!(first, second);
        assert_ne!(first, 0);

        // a fresh registry derives the same mark for the same tuple
        let mut other = FwMarkRegistry::new();
        assert_eq!(other.allocate(ip, proto, port)?, first);
        Ok(())
    }

    #[test]
    fn test_distinct_tuples_get_distinct_marks() -> crate::Result<()> {
        let (ip, proto, port) = tuple();
        let mut registry = FwMarkRegistry::new();
        let a = registry.allocate(ip, proto, port)?;
        let b = registry.allocate(ip, proto, port + 1)?;
        let c = registry.allocate(Ipv4Addr::new(203, 0, 113, 10), proto, port)?;
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        Ok(())
    }

    #[test]
    fn test_collision_probes_to_next_slot() -> crate::Result<()> {
        let (ip, proto, port) = tuple();
        let mut registry = FwMarkRegistry::new();
        let colliding = hash_mark(&ip_port_id(ip, proto, port));
        // squat on the derived slot with a different tuple
        registry.by_mark.insert(
            colliding,
            MarkedService {
                ip: Ipv4Addr::new(198, 51, 100, 1),
                protocol: Protocol::Udp,
                port: 53,
            },
        );
        let mark = registry.allocate(ip, proto, port)?;
        assert_eq!(mark, next_mark(colliding));
        Ok(())
    }

    #[test]
    fn test_resolve_and_release() -> crate::Result<()> {
        let (ip, proto, port) = tuple();
        let mut registry = FwMarkRegistry::new();
        let mark = registry.allocate(ip, proto, port)?;

        let service = registry.resolve(mark)?;
        assert_eq!(service.ip, ip);
        assert_eq!(service.protocol, proto);
        assert_eq!(service.port, port);

        registry.release(mark);
        assert_eq!(registry.lookup(ip, proto, port), 0);
        assert!(registry.resolve(mark).is_err());
        Ok(())
    }
}
