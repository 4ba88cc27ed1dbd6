//! In-memory [`HostAdapter`] modelling IPVS, the dummy interface, the mangle
//! table and policy routing symbolically, so engine tests can assert on the
//! exact host state a sync pass leaves behind.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::host::{
    AddrChange, Destination, HostAdapter, KUBE_DUMMY_IF, LinkRef, ServicePolicy, VirtualService,
};
use crate::types::Protocol;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MangleRule {
    pub ip: Ipv4Addr,
    pub protocol: Protocol,
    pub port: u16,
    pub fwmark: u32,
    pub tcp_mss: u16,
}

impl MangleRule {
    /// Render the rule the way `iptables-save` prints it: the mark in hex.
    fn save_line(&self) -> String {
        format!(
            "-A PREROUTING -d {}/32 -p {} -m {} --dport {} -j MARK --set-xmark 0x{:x}/0xffffffff",
            self.ip,
            self.protocol.as_str(),
            self.protocol.as_str(),
            self.port,
            self.fwmark
        )
    }
}

#[derive(Default)]
struct Inner {
    services: Vec<(VirtualService, Vec<Destination>)>,
    dummy: Option<LinkRef>,
    dummy_addresses: Vec<Ipv4Addr>,
    mangle_rules: Vec<MangleRule>,
    fwmark_rules: Vec<u32>,
    dsr_routing_ready: bool,
    external_ip_routes: Vec<Ipv4Addr>,
    /// (external ip, pod ip) pairs injected into pod namespaces.
    pod_vips: Vec<(Ipv4Addr, Ipv4Addr)>,
    local_ips: Vec<Ipv4Addr>,
}

#[derive(Clone, Default)]
pub struct MemoryHost {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_ips(ips: Vec<Ipv4Addr>) -> Self {
        let host = Self::new();
        host.inner.lock().unwrap().local_ips = ips;
        host
    }

    // test inspection helpers

    pub fn dummy_addresses(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().unwrap().dummy_addresses.clone()
    }

    pub fn services(&self) -> Vec<VirtualService> {
        let inner = self.inner.lock().unwrap();
        inner.services.iter().map(|(svc, _)| svc.clone()).collect()
    }

    pub fn destinations_of(&self, service: &VirtualService) -> Vec<Destination> {
        let inner = self.inner.lock().unwrap();
        inner
            .services
            .iter()
            .find(|(svc, _)| same_identity(svc, service))
            .map(|(_, dsts)| dsts.clone())
            .unwrap_or_default()
    }

    pub fn mangle_rules(&self) -> Vec<MangleRule> {
        self.inner.lock().unwrap().mangle_rules.clone()
    }

    pub fn fwmark_rules(&self) -> Vec<u32> {
        self.inner.lock().unwrap().fwmark_rules.clone()
    }

    pub fn pod_vips(&self) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        self.inner.lock().unwrap().pod_vips.clone()
    }

    pub fn external_ip_routes(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().unwrap().external_ip_routes.clone()
    }

    pub fn dsr_routing_ready(&self) -> bool {
        self.inner.lock().unwrap().dsr_routing_ready
    }

    // test seeding helpers

    pub fn seed_service(&self, service: VirtualService, destinations: Vec<Destination>) {
        self.inner
            .lock()
            .unwrap()
            .services
            .push((service, destinations));
    }

    pub fn seed_dummy_address(&self, ip: Ipv4Addr) {
        let mut inner = self.inner.lock().unwrap();
        ensure_dummy_link(&mut inner);
        if !inner.dummy_addresses.contains(&ip) {
            inner.dummy_addresses.push(ip);
        }
    }
}

fn ensure_dummy_link(inner: &mut Inner) -> LinkRef {
    inner
        .dummy
        .get_or_insert_with(|| LinkRef {
            index: 7,
            name: KUBE_DUMMY_IF.to_owned(),
        })
        .clone()
}

fn same_identity(a: &VirtualService, b: &VirtualService) -> bool {
    if a.fwmark != 0 || b.fwmark != 0 {
        return a.fwmark == b.fwmark;
    }
    a.address == b.address && a.protocol == b.protocol && a.port == b.port
}

impl HostAdapter for MemoryHost {
    fn list_virtual_services(&self) -> Result<Vec<VirtualService>> {
        Ok(self.services())
    }

    fn ensure_virtual_service(
        &self,
        _existing: &[VirtualService],
        vip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        policy: &ServicePolicy,
    ) -> Result<VirtualService> {
        let target = VirtualService {
            address: Some(vip),
            protocol: protocol.number(),
            port,
            fwmark: 0,
            scheduler: policy.scheduler.clone(),
            flags: policy.kernel_flags(),
            timeout: policy.kernel_timeout(),
            stats: Default::default(),
        };
        self.upsert(target.clone());
        Ok(target)
    }

    fn ensure_fwmark_service(
        &self,
        _existing: &[VirtualService],
        fwmark: u32,
        _protocol: Protocol,
        _port: u16,
        policy: &ServicePolicy,
    ) -> Result<VirtualService> {
        let target = VirtualService {
            address: None,
            protocol: 0,
            port: 0,
            fwmark,
            scheduler: policy.scheduler.clone(),
            flags: policy.kernel_flags(),
            timeout: policy.kernel_timeout(),
            stats: Default::default(),
        };
        self.upsert(target.clone());
        Ok(target)
    }

    fn delete_virtual_service(&self, service: &VirtualService) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.services.retain(|(svc, _)| !same_identity(svc, service));
        Ok(())
    }

    fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>> {
        Ok(self.destinations_of(service))
    }

    fn ensure_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some((_, destinations)) = inner
            .services
            .iter_mut()
            .find(|(svc, _)| same_identity(svc, service))
        else {
            return Err(Error::NoSuchAddress);
        };
        match destinations
            .iter_mut()
            .find(|d| d.address == dst.address && d.port == dst.port)
        {
            Some(existing) => *existing = *dst,
            None => destinations.push(*dst),
        }
        Ok(())
    }

    fn delete_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, destinations)) = inner
            .services
            .iter_mut()
            .find(|(svc, _)| same_identity(svc, service))
        {
            destinations.retain(|d| !(d.address == dst.address && d.port == dst.port));
        }
        Ok(())
    }

    fn flush_ipvs(&self) -> Result<()> {
        self.inner.lock().unwrap().services.clear();
        Ok(())
    }

    fn ensure_dummy_interface(&self) -> Result<LinkRef> {
        let mut inner = self.inner.lock().unwrap();
        Ok(ensure_dummy_link(&mut inner))
    }

    fn delete_dummy_interface(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dummy = None;
        inner.dummy_addresses.clear();
        Ok(())
    }

    fn addresses(&self, _link: &LinkRef) -> Result<Vec<Ipv4Addr>> {
        Ok(self.dummy_addresses())
    }

    fn add_address(&self, _link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dummy_addresses.contains(&ip) {
            return Ok(AddrChange::AlreadyPresent);
        }
        inner.dummy_addresses.push(ip);
        Ok(AddrChange::Added)
    }

    fn del_address(&self, _link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange> {
        let mut inner = self.inner.lock().unwrap();
        let had = inner.dummy_addresses.contains(&ip);
        inner.dummy_addresses.retain(|a| *a != ip);
        Ok(if had {
            AddrChange::Removed
        } else {
            AddrChange::NotPresent
        })
    }

    fn list_local_ips(&self) -> Result<Vec<Ipv4Addr>> {
        Ok(self.inner.lock().unwrap().local_ips.clone())
    }

    fn ensure_mangle_rule(
        &self,
        ip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        fwmark: u32,
        tcp_mss: u16,
    ) -> Result<()> {
        let rule = MangleRule {
            ip,
            protocol,
            port,
            fwmark,
            tcp_mss,
        };
        let mut inner = self.inner.lock().unwrap();
        if !inner.mangle_rules.contains(&rule) {
            inner.mangle_rules.push(rule);
        }
        Ok(())
    }

    fn delete_mangle_rule(
        &self,
        ip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        fwmark: u32,
        _tcp_mss: u16,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.mangle_rules.retain(|rule| {
            !(rule.ip == ip
                && rule.protocol == protocol
                && rule.port == port
                && rule.fwmark == fwmark)
        });
        Ok(())
    }

    fn save_mangle_table(&self) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        let mut out = String::from("*mangle\n:PREROUTING ACCEPT [0:0]\n");
        for rule in &inner.mangle_rules {
            out.push_str(&rule.save_line());
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        Ok(out)
    }

    fn ensure_dsr_policy_routing(&self) -> Result<()> {
        self.inner.lock().unwrap().dsr_routing_ready = true;
        Ok(())
    }

    fn ensure_fwmark_rule(&self, fwmark: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.fwmark_rules.contains(&fwmark) {
            inner.fwmark_rules.push(fwmark);
        }
        Ok(())
    }

    fn ensure_external_ip_routes(&self, external_ips: &[Ipv4Addr]) -> Result<()> {
        self.inner.lock().unwrap().external_ip_routes = external_ips.to_vec();
        Ok(())
    }

    fn ensure_vip_in_pod_netns(&self, external_ip: Ipv4Addr, pod_ip: Ipv4Addr) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.pod_vips.contains(&(external_ip, pod_ip)) {
            inner.pod_vips.push((external_ip, pod_ip));
        }
        Ok(())
    }
}

impl MemoryHost {
    fn upsert(&self, target: VirtualService) {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .services
            .iter_mut()
            .find(|(svc, _)| same_identity(svc, &target))
        {
            Some((svc, _)) => {
                svc.scheduler = target.scheduler;
                svc.flags = target.flags;
                svc.timeout = target.timeout;
            }
            None => inner.services.push((target, Vec::new())),
        }
    }
}
