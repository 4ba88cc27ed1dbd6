use std::fmt;
use std::net::Ipv4Addr;

use crate::error::Error;

/// Opaque handle keying the desired-state maps. Equality is all the engine
/// needs; the fields only exist so log lines can name the offending object.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port_name: String,
}

impl ServiceRef {
    pub fn new(namespace: &str, name: &str, port_name: &str) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port_name: port_name.into(),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port_name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Kernel protocol number as carried in the IPVS service entry.
    pub fn number(&self) -> u16 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    /// IPVS carries protocols beyond TCP/UDP (SCTP among them); those have
    /// no mapping here and the caller decides whether that is fatal.
    pub fn from_number(number: u16) -> Option<Protocol> {
        match number {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "TCP" => Ok(Protocol::Tcp),
            "udp" | "UDP" => Ok(Protocol::Udp),
            other => Err(Error::InvalidState(format!("unknown protocol {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DsrMethod {
    Tunnel,
}

/// Desired shape of one service port, immutable during a sync pass.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub namespace: String,
    pub name: String,
    pub protocol: Protocol,
    pub cluster_ip: Ipv4Addr,
    pub port: u16,
    /// 0 means the service has no node port.
    pub node_port: u16,
    pub external_ips: Vec<Ipv4Addr>,
    pub load_balancer_ips: Vec<Ipv4Addr>,
    pub skip_lb_ips: bool,
    /// externalTrafficPolicy=Local: only node-local backends receive traffic
    /// while any exist, preserving the client source IP.
    pub local: bool,
    pub session_affinity: bool,
    pub session_affinity_timeout_secs: u32,
    pub scheduler: String,
    /// Scheduling-flag bits passed through to the kernel unchanged.
    pub flags: u32,
    pub direct_server_return: bool,
    pub dsr_method: DsrMethod,
}

impl ServiceInfo {
    /// The external IPs this service answers on: configured external IPs
    /// joined with load-balancer ingress IPs unless those are opted out.
    pub fn external_ip_set(&self) -> Vec<Ipv4Addr> {
        let mut set = self.external_ips.clone();
        if !self.skip_lb_ips {
            for ip in &self.load_balancer_ips {
                if !set.contains(ip) {
                    set.push(*ip);
                }
            }
        }
        set
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// The backing pod runs on this node.
    pub is_local: bool,
}

pub type ServiceInfoMap = ahash::HashMap<ServiceRef, ServiceInfo>;
pub type EndpointsMap = ahash::HashMap<ServiceRef, Vec<EndpointInfo>>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_protocol_numbers_round_trip() {
        assert_eq!(Protocol::from_number(Protocol::Tcp.number()), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_number(Protocol::Udp.number()), Some(Protocol::Udp));
        // SCTP has no textual mapping here
        assert_eq!(Protocol::from_number(132), None);
    }

    #[test]
    fn test_external_ip_set_honors_skip_lb() {
        let mut svc = ServiceInfo {
            namespace: "default".into(),
            name: "web".into(),
            protocol: Protocol::Tcp,
            cluster_ip: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            node_port: 0,
            external_ips: vec![Ipv4Addr::new(203, 0, 113, 1)],
            load_balancer_ips: vec![Ipv4Addr::new(203, 0, 113, 2), Ipv4Addr::new(203, 0, 113, 1)],
            skip_lb_ips: false,
            local: false,
            session_affinity: false,
            session_affinity_timeout_secs: 0,
            scheduler: "rr".into(),
            flags: 0,
            direct_server_return: false,
            dsr_method: DsrMethod::Tunnel,
        };

        let mut set = svc.external_ip_set();
        set.sort();
        assert_eq!(
            set,
            vec![Ipv4Addr::new(203, 0, 113, 1), Ipv4Addr::new(203, 0, 113, 2)]
        );

        svc.skip_lb_ips = true;
        assert_eq!(svc.external_ip_set(), vec![Ipv4Addr::new(203, 0, 113, 1)]);
    }
}
