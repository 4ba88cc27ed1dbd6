//! [`HostAdapter`] backed by the real kernel: IPVS over generic netlink,
//! link/address management over route netlink, and `iptables`/`ip` execs for
//! the mangle table and policy routing, which is how the rest of the node
//! tooling manages those tables too.

mod ipvs;
mod netlink;
mod route;

use std::fs;
use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{debug, warn};

use self::ipvs::IpvsClient;
use self::route::RouteClient;
use crate::error::{Error, Result};
use crate::host::{
    AddrChange, Destination, HostAdapter, KUBE_DUMMY_IF, KUBE_TUNNEL_IF, LinkRef, ServicePolicy,
    VirtualService,
};
use crate::types::Protocol;

const DSR_ROUTE_TABLE_ID: &str = "78";
const DSR_ROUTE_TABLE_NAME: &str = "kube-lvs-dsr";
const EXTERNAL_IP_ROUTE_TABLE_ID: &str = "79";
const EXTERNAL_IP_ROUTE_TABLE_NAME: &str = "external_ip";
const RT_TABLES_PATH: &str = "/etc/iproute2/rt_tables";
const NETNS_DIR: &str = "/var/run/netns";

/// Interface-name prefixes that never count as node addresses for node-port
/// binding.
const LOCAL_IP_EXCLUDED_PREFIXES: &[&str] =
    &["kube", "dummy", "veth", "docker", "cni", "flannel", "cali", "br-", "tun"];

pub struct LinuxHost {
    ipvs: IpvsClient,
    route: RouteClient,
    /// Device external-IP routes point at, the bridge into the pod network.
    pod_interface: String,
}

impl LinuxHost {
    pub fn new(pod_interface: impl Into<String>) -> Result<Self> {
        Ok(Self {
            ipvs: IpvsClient::new()?,
            route: RouteClient::new()?,
            pod_interface: pod_interface.into(),
        })
    }
}

impl HostAdapter for LinuxHost {
    fn list_virtual_services(&self) -> Result<Vec<VirtualService>> {
        self.ipvs.services()
    }

    fn ensure_virtual_service(
        &self,
        existing: &[VirtualService],
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
        match existing.iter().find(|svc| svc.matches_addr(vip, protocol, port)) {
            None => match self.ipvs.add_service(&target) {
                Ok(()) | Err(Error::AlreadyExists) => {}
                Err(e) => return Err(e),
            },
            Some(installed) if !policy.matches(installed) => {
                self.ipvs.update_service(&target)?;
            }
            Some(_) => {}
        }
        Ok(target)
    }

    fn ensure_fwmark_service(
        &self,
        existing: &[VirtualService],
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
        match existing.iter().find(|svc| svc.fwmark == fwmark) {
            None => match self.ipvs.add_service(&target) {
                Ok(()) | Err(Error::AlreadyExists) => {}
                Err(e) => return Err(e),
            },
            Some(installed) if !policy.matches(installed) => {
                self.ipvs.update_service(&target)?;
            }
            Some(_) => {}
        }
        Ok(target)
    }

    fn delete_virtual_service(&self, service: &VirtualService) -> Result<()> {
        self.ipvs.delete_service(service)
    }

    fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>> {
        self.ipvs.destinations(service)
    }

    fn ensure_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        match self.ipvs.add_destination(service, dst) {
            Ok(()) => Ok(()),
            Err(Error::AlreadyExists) => self.ipvs.update_destination(service, dst),
            Err(e) => Err(e),
        }
    }

    fn delete_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        match self.ipvs.delete_destination(service, dst) {
            Ok(()) | Err(Error::NoSuchAddress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn flush_ipvs(&self) -> Result<()> {
        self.ipvs.flush()
    }

    fn ensure_dummy_interface(&self) -> Result<LinkRef> {
        self.route.ensure_dummy(KUBE_DUMMY_IF)
    }

    fn delete_dummy_interface(&self) -> Result<()> {
        match self.route.find_link(KUBE_DUMMY_IF)? {
            Some(link) => self.route.delete_link(&link),
            None => Ok(()),
        }
    }

    fn addresses(&self, link: &LinkRef) -> Result<Vec<Ipv4Addr>> {
        self.route.addresses(link.index)
    }

    fn add_address(&self, link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange> {
        self.route.add_address(link, ip)
    }

    fn del_address(&self, link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange> {
        self.route.del_address(link, ip)
    }

    fn list_local_ips(&self) -> Result<Vec<Ipv4Addr>> {
        let mut ips = Vec::new();
        for (name, ip) in self.route.local_ipv4_addresses()? {
            if name == "lo"
                || LOCAL_IP_EXCLUDED_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
            {
                continue;
            }
            ips.push(ip);
        }
        Ok(ips)
    }

    fn ensure_mangle_rule(
        &self,
        ip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        fwmark: u32,
        tcp_mss: u16,
    ) -> Result<()> {
        for rule in mangle_rules(ip, protocol, port, fwmark, tcp_mss) {
            append_unique_mangle(&rule)?;
        }
        Ok(())
    }

    fn delete_mangle_rule(
        &self,
        ip: Ipv4Addr,
        protocol: Protocol,
        port: u16,
        fwmark: u32,
        tcp_mss: u16,
    ) -> Result<()> {
        for rule in mangle_rules(ip, protocol, port, fwmark, tcp_mss) {
            delete_mangle(&rule)?;
        }
        Ok(())
    }

    fn save_mangle_table(&self) -> Result<String> {
        run("iptables-save", &["-t", "mangle"])
    }

    fn ensure_dsr_policy_routing(&self) -> Result<()> {
        ensure_rt_table(DSR_ROUTE_TABLE_ID, DSR_ROUTE_TABLE_NAME)?;
        let routes = run("ip", &["route", "list", "table", DSR_ROUTE_TABLE_NAME])?;
        if !routes.contains("dev lo") {
            run_tolerating_exists(
                "ip",
                &[
                    "route",
                    "add",
                    "local",
                    "default",
                    "dev",
                    "lo",
                    "table",
                    DSR_ROUTE_TABLE_NAME,
                ],
            )?;
        }
        Ok(())
    }

    fn ensure_fwmark_rule(&self, fwmark: u32) -> Result<()> {
        // ip prints marks in hex, so the presence check must too
        let hex_mark = format!("0x{fwmark:x}");
        let rules = run("ip", &["rule", "list"])?;
        if rules.contains(&format!("fwmark {hex_mark}")) {
            return Ok(());
        }
        run(
            "ip",
            &[
                "rule",
                "add",
                "prio",
                "32764",
                "fwmark",
                &hex_mark,
                "table",
                DSR_ROUTE_TABLE_NAME,
            ],
        )?;
        Ok(())
    }

    fn ensure_external_ip_routes(&self, external_ips: &[Ipv4Addr]) -> Result<()> {
        ensure_rt_table(EXTERNAL_IP_ROUTE_TABLE_ID, EXTERNAL_IP_ROUTE_TABLE_NAME)?;

        let rules = run("ip", &["rule", "list"])?;
        if !rules.contains(&format!("lookup {EXTERNAL_IP_ROUTE_TABLE_NAME}")) {
            run(
                "ip",
                &[
                    "rule",
                    "add",
                    "prio",
                    "32765",
                    "from",
                    "all",
                    "lookup",
                    EXTERNAL_IP_ROUTE_TABLE_NAME,
                ],
            )?;
        }

        let routes = run(
            "ip",
            &["route", "list", "table", EXTERNAL_IP_ROUTE_TABLE_NAME],
        )?;
        let installed: Vec<&str> = routes
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .collect();

        for ip in external_ips {
            let ip = ip.to_string();
            if !installed.contains(&ip.as_str()) {
                run_tolerating_exists(
                    "ip",
                    &[
                        "route",
                        "add",
                        &ip,
                        "dev",
                        &self.pod_interface,
                        "table",
                        EXTERNAL_IP_ROUTE_TABLE_NAME,
                    ],
                )?;
            }
        }

        let desired: Vec<String> = external_ips.iter().map(|ip| ip.to_string()).collect();
        for destination in installed {
            if !desired.iter().any(|ip| ip == destination) {
                if let Err(e) = run(
                    "ip",
                    &[
                        "route",
                        "del",
                        destination,
                        "table",
                        EXTERNAL_IP_ROUTE_TABLE_NAME,
                    ],
                ) {
                    warn!("failed to remove stale external IP route {destination}: {e}");
                }
            }
        }
        Ok(())
    }

    fn ensure_vip_in_pod_netns(&self, external_ip: Ipv4Addr, pod_ip: Ipv4Addr) -> Result<()> {
        let netns = find_pod_netns(pod_ip)?.ok_or_else(|| Error::DsrSetupFailed {
            ip: external_ip,
            reason: format!("no network namespace holds pod ip {pod_ip}"),
        })?;
        debug!("pod {pod_ip} resolved to network namespace {netns}");

        run_tolerating_exists(
            "ip",
            &[
                "-netns",
                &netns,
                "link",
                "add",
                KUBE_TUNNEL_IF,
                "type",
                "ipip",
            ],
        )?;
        run(
            "ip",
            &["-netns", &netns, "link", "set", KUBE_TUNNEL_IF, "up"],
        )?;
        let vip = format!("{external_ip}/32");
        run_tolerating_exists(
            "ip",
            &["-netns", &netns, "addr", "add", &vip, "dev", KUBE_TUNNEL_IF],
        )?;
        Ok(())
    }
}

/// The mangle rules marking DSR ingress: the MARK rule, plus an MSS clamp
/// when the service speaks TCP. The mark is rendered decimal here;
/// iptables-save will print it back in hex.
fn mangle_rules(
    ip: Ipv4Addr,
    protocol: Protocol,
    port: u16,
    fwmark: u32,
    tcp_mss: u16,
) -> Vec<Vec<String>> {
    let proto = protocol.as_str();
    let mut rules = vec![
        vec![
            "PREROUTING".into(),
            "-d".into(),
            ip.to_string(),
            "-m".into(),
            proto.into(),
            "-p".into(),
            proto.into(),
            "--dport".into(),
            port.to_string(),
            "-j".into(),
            "MARK".into(),
            "--set-mark".into(),
            fwmark.to_string(),
        ],
    ];
    if protocol == Protocol::Tcp {
        rules.push(vec![
            "PREROUTING".into(),
            "-d".into(),
            ip.to_string(),
            "-m".into(),
            "tcp".into(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            port.to_string(),
            "-j".into(),
            "TCPMSS".into(),
            "--set-mss".into(),
            tcp_mss.to_string(),
        ]);
    }
    rules
}

fn append_unique_mangle(rule: &[String]) -> Result<()> {
    if iptables_mangle("-C", rule).is_ok() {
        return Ok(());
    }
    iptables_mangle("-A", rule)
}

fn delete_mangle(rule: &[String]) -> Result<()> {
    match iptables_mangle("-D", rule) {
        Ok(()) => Ok(()),
        Err(Error::CommandFailed { stderr, .. })
            if stderr.contains("does a matching rule exist")
                || stderr.contains("No chain/target/match") =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn iptables_mangle(op: &str, rule: &[String]) -> Result<()> {
    let mut args: Vec<&str> = vec!["-t", "mangle", op];
    args.extend(rule.iter().map(String::as_str));
    run("iptables", &args).map(|_| ())
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_tolerating_exists(program: &str, args: &[&str]) -> Result<()> {
    match run(program, args) {
        Ok(_) => Ok(()),
        Err(Error::CommandFailed { stderr, .. }) if stderr.contains("File exists") => Ok(()),
        Err(e) => Err(e),
    }
}

fn ensure_rt_table(id: &str, name: &str) -> Result<()> {
    let entry = format!("{id} {name}");
    let current = fs::read_to_string(RT_TABLES_PATH).unwrap_or_default();
    if current.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    let mut updated = current;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry);
    updated.push('\n');
    fs::write(RT_TABLES_PATH, updated)?;
    Ok(())
}

/// Walk the named network namespaces looking for the one that owns `pod_ip`.
fn find_pod_netns(pod_ip: Ipv4Addr) -> Result<Option<String>> {
    let entries = match fs::read_dir(NETNS_DIR) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let target = pod_ip.to_string();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        let Ok(out) = run("ip", &["-netns", &name, "-j", "addr", "show"]) else {
            continue;
        };
        if netns_holds_ip(&out, &target)? {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

fn netns_holds_ip(addr_json: &str, ip: &str) -> Result<bool> {
    let parsed: serde_json::Value = serde_json::from_str(addr_json)?;
    let Some(links) = parsed.as_array() else {
        return Ok(false);
    };
    for link in links {
        let Some(addr_infos) = link.get("addr_info").and_then(|v| v.as_array()) else {
            continue;
        };
        for info in addr_infos {
            if info.get("local").and_then(|v| v.as_str()) == Some(ip) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
