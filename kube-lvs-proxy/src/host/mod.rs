//! The single surface through which kernel state is read or mutated. The
//! sync engine is generic over [`HostAdapter`] so tests can run against an
//! in-memory model of IPVS, netlink and iptables.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::Result;
use crate::types::{Protocol, ServiceInfo};

pub mod linux;
#[cfg(test)]
pub(crate) mod memory;

/// Interface carrying every VIP the proxy owns on this node (DSR VIPs
/// excepted, which must stay off the host).
pub const KUBE_DUMMY_IF: &str = "kube-dummy-if";
/// IPIP interface created inside backend pods so they accept DSR traffic.
pub const KUBE_TUNNEL_IF: &str = "kube-tunnel-if";

/// `IP_VS_CONN_F_TUNNEL`: destination receives packets IPIP-encapsulated.
pub const CONN_F_TUNNEL: u32 = 0x0002;
/// `IP_VS_CONN_F_MASQ`: plain NAT forwarding, the default.
pub const CONN_F_MASQ: u32 = 0x0000;
/// `IP_VS_SVC_F_PERSISTENT`: session affinity.
pub const SVC_F_PERSISTENT: u32 = 0x0001;
/// `IP_VS_SVC_F_HASHED`: set by the kernel on every dumped service, so it
/// must not count when comparing desired flags against installed ones.
pub const SVC_F_HASHED: u32 = 0x0002;

/// Kernel traffic counters attached to a virtual service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub connections: u32,
    pub packets_in: u32,
    pub packets_out: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cps: u32,
    pub pps_in: u32,
    pub pps_out: u32,
    pub bps_in: u32,
    pub bps_out: u32,
}

/// One IPVS virtual service as the kernel reports it: keyed either by
/// (address, protocol, port) or by firewall mark.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualService {
    pub address: Option<Ipv4Addr>,
    /// Raw kernel protocol number; 0 on firewall-mark services.
    pub protocol: u16,
    pub port: u16,
    pub fwmark: u32,
    pub scheduler: String,
    pub flags: u32,
    pub timeout: u32,
    pub stats: ServiceStats,
}

impl VirtualService {
    pub fn is_fwmark(&self) -> bool {
        self.fwmark != 0
    }

    pub fn matches_addr(&self, ip: Ipv4Addr, protocol: Protocol, port: u16) -> bool {
        self.address == Some(ip) && self.protocol == protocol.number() && self.port == port
    }
}

impl fmt::Display for VirtualService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(ip) => {
                let protocol = Protocol::from_number(self.protocol)
                    .map(|p| p.as_str().to_owned())
                    .unwrap_or_else(|| self.protocol.to_string());
                write!(f, "{}:{}:{} ({})", ip, protocol, self.port, self.scheduler)
            }
            None => write!(f, "fwmark:{} ({})", self.fwmark, self.scheduler),
        }
    }
}

/// One IPVS real server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Destination {
    pub address: Ipv4Addr,
    pub port: u16,
    pub weight: i32,
    pub conn_flags: u32,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Scheduling shape a virtual service must carry, derived from the desired
/// service and compared against the kernel entry on every ensure.
#[derive(Clone, Debug, PartialEq)]
pub struct ServicePolicy {
    pub scheduler: String,
    pub flags: u32,
    pub session_affinity: bool,
    pub affinity_timeout_secs: u32,
}

impl ServicePolicy {
    pub fn for_service(svc: &ServiceInfo) -> Self {
        Self {
            scheduler: svc.scheduler.clone(),
            flags: svc.flags,
            session_affinity: svc.session_affinity,
            affinity_timeout_secs: svc.session_affinity_timeout_secs,
        }
    }

    pub fn kernel_flags(&self) -> u32 {
        if self.session_affinity {
            self.flags | SVC_F_PERSISTENT
        } else {
            self.flags
        }
    }

    pub fn kernel_timeout(&self) -> u32 {
        if self.session_affinity {
            self.affinity_timeout_secs
        } else {
            0
        }
    }

    /// Whether an installed service already carries this shape.
    pub fn matches(&self, service: &VirtualService) -> bool {
        service.scheduler == self.scheduler
            && service.flags & !SVC_F_HASHED == self.kernel_flags() & !SVC_F_HASHED
            && service.timeout == self.kernel_timeout()
    }
}

/// Handle to a network interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkRef {
    pub index: u32,
    pub name: String,
}

/// Outcome of an idempotent address mutation. "Already there" and "already
/// gone" are successes the caller may still want to distinguish.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrChange {
    Added,
    AlreadyPresent,
    Removed,
    NotPresent,
}

pub trait HostAdapter {
    // IPVS
    fn list_virtual_services(&self) -> Result<Vec<VirtualService>>;
    /// Create the (vip, protocol, port) service if absent; if present with a
    /// different scheduler/affinity shape, update it in place.
    fn ensure_virtual_service(
        &self,
        existing: &[VirtualService],
        vip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        policy: &ServicePolicy,
    ) -> Result<VirtualService>;
    /// Same ensure semantics, keyed by firewall mark instead of address.
    fn ensure_fwmark_service(
        &self,
        existing: &[VirtualService],
        fwmark: u32,
        protocol: Protocol,
        port: u16,
        policy: &ServicePolicy,
    ) -> Result<VirtualService>;
    fn delete_virtual_service(&self, service: &VirtualService) -> Result<()>;
    fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>>;
    /// Idempotent: a destination that already exists is updated, not an error.
    fn ensure_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()>;
    fn delete_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()>;
    fn flush_ipvs(&self) -> Result<()>;

    // Dummy interface and addresses
    fn ensure_dummy_interface(&self) -> Result<LinkRef>;
    fn delete_dummy_interface(&self) -> Result<()>;
    fn addresses(&self, link: &LinkRef) -> Result<Vec<Ipv4Addr>>;
    fn add_address(&self, link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange>;
    fn del_address(&self, link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange>;
    /// Addresses a node-port service binds to when binding on all local IPs.
    fn list_local_ips(&self) -> Result<Vec<Ipv4Addr>>;

    // iptables mangle (DSR packet marking)
    fn ensure_mangle_rule(
        &self,
        ip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        fwmark: u32,
        tcp_mss: u16,
    ) -> Result<()>;
    fn delete_mangle_rule(
        &self,
        ip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        fwmark: u32,
        tcp_mss: u16,
    ) -> Result<()>;
    /// `iptables-save` rendering of the mangle table; marks appear in hex.
    fn save_mangle_table(&self) -> Result<String>;

    // Policy routing (DSR delivery)
    fn ensure_dsr_policy_routing(&self) -> Result<()>;
    fn ensure_fwmark_rule(&self, fwmark: u32) -> Result<()>;
    fn ensure_external_ip_routes(&self, external_ips: &[Ipv4Addr]) -> Result<()>;
    /// Put the external IP on a tunnel interface inside the network namespace
    /// of the pod owning `pod_ip`, so the pod terminates DSR traffic.
    fn ensure_vip_in_pod_netns(&self, external_ip: Ipv4Addr, pod_ip: Ipv4Addr) -> Result<()>;
}
