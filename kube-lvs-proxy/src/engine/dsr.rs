//! Direct server return. IPVS matches DSR traffic by firewall mark instead
//! of by owning the destination address: if the node held the external IP,
//! the kernel would consume the packet before IPVS ever saw it. The mangle
//! table marks ingress packets for the tuple, a policy-routing rule delivers
//! marked packets locally, destinations forward IPIP-encapsulated, and each
//! backend pod gets the external IP on an in-namespace tunnel interface so
//! it accepts the decapsulated packet.

use std::net::Ipv4Addr;

use tracing::debug;

use super::ProxyEngine;
use crate::error::{Error, Result};
use crate::firewall::VipFirewall;
use crate::host::{CONN_F_TUNNEL, Destination, HostAdapter, ServicePolicy, VirtualService};
use crate::types::{EndpointInfo, ServiceInfo, ServiceInfoMap};

impl<H, F> ProxyEngine<H, F>
where
    H: HostAdapter,
    F: VipFirewall,
{
    /// Set up one external IP for DSR and return the firewall mark that now
    /// identifies the service.
    pub(crate) fn setup_dsr_external_ip(
        &mut self,
        existing: &[VirtualService],
        svc: &ServiceInfo,
        external_ip: Ipv4Addr,
        endpoints: &[EndpointInfo],
    ) -> Result<u32> {
        let dsr_failed = |reason: String| Error::DsrSetupFailed {
            ip: external_ip,
            reason,
        };

        let dummy = self.host.ensure_dummy_interface()?;
        let fwmark = self.fwmarks.allocate(external_ip, svc.protocol, svc.port)?;

        let policy = ServicePolicy::for_service(svc);
        let service = self
            .host
            .ensure_fwmark_service(existing, fwmark, svc.protocol, svc.port, &policy)
            .map_err(|e| dsr_failed(format!("fwmark virtual service: {e}")))?;

        self.host
            .ensure_mangle_rule(
                external_ip,
                svc.protocol,
                svc.port,
                fwmark,
                self.config.dsr_tcp_mss,
            )
            .map_err(|e| dsr_failed(format!("mangle rule: {e}")))?;

        // VIP-less director: the node must not own the external IP
        self.host
            .del_address(&dummy, external_ip)
            .map_err(|e| dsr_failed(format!("removing {external_ip} from the dummy interface: {e}")))?;

        self.host
            .ensure_fwmark_rule(fwmark)
            .map_err(|e| dsr_failed(format!("policy rule for mark {fwmark}: {e}")))?;

        for endpoint in endpoints {
            if svc.local && !endpoint.is_local {
                continue;
            }
            let dst = Destination {
                address: endpoint.ip,
                port: endpoint.port,
                weight: 1,
                conn_flags: CONN_F_TUNNEL,
            };
            self.host
                .ensure_destination(&service, &dst)
                .map_err(|e| dsr_failed(format!("destination {dst}: {e}")))?;
            self.host
                .ensure_vip_in_pod_netns(external_ip, endpoint.ip)
                .map_err(|e| dsr_failed(format!("VIP inside pod {}: {e}", endpoint.ip)))?;
        }

        Ok(fwmark)
    }

    /// Remove the DSR leavings of a mark: the mangle rules for its tuple and
    /// the registry binding. The fwmark IPVS service itself falls to the
    /// normal stale-service sweep.
    pub(crate) fn teardown_dsr_mark(&mut self, fwmark: u32) -> Result<()> {
        let service = self.fwmarks.resolve(fwmark)?;

        let mangle_table = self.host.save_mangle_table()?;
        // iptables-save prints marks in hex, so the search has to as well
        let hex_mark = format!("{fwmark:x}");
        let ip = service.ip.to_string();
        for line in mangle_table.lines() {
            if line.contains(&ip) && line.contains(&hex_mark) {
                debug!("found mangle rule to clean up: {line}");
                self.host.delete_mangle_rule(
                    service.ip,
                    service.protocol,
                    service.port,
                    fwmark,
                    self.config.dsr_tcp_mss,
                )?;
                // one delete clears the rule and its MSS sibling
                break;
            }
        }

        self.fwmarks.release(fwmark);
        Ok(())
    }

    /// Node-wide routing DSR relies on: the local-delivery table marked
    /// packets resolve through, and the external-IP route table.
    pub(crate) fn setup_dsr_routing(&mut self, services: &ServiceInfoMap) -> Result<()> {
        self.host.ensure_dsr_policy_routing()?;

        let mut external_ips: Vec<Ipv4Addr> = Vec::new();
        for svc in services.values() {
            for ip in svc.external_ip_set() {
                if !external_ips.contains(&ip) {
                    external_ips.push(ip);
                }
            }
        }
        self.host.ensure_external_ip_routes(&external_ips)
    }
}
