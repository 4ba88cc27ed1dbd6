//! Garbage collection: everything on the node that the active map does not
//! claim is retired. Three sweeps, each driven solely by the map the
//! reconcile passes filled in.

use std::net::Ipv4Addr;

use tracing::{debug, error, info, warn};

use super::{ActiveServiceMap, ProxyEngine};
use crate::error::{Error, Result};
use crate::firewall::VipFirewall;
use crate::host::{HostAdapter, VirtualService};
use crate::identity::{endpoint_id, ip_port_id};
use crate::types::Protocol;

impl<H, F> ProxyEngine<H, F>
where
    H: HostAdapter,
    F: VipFirewall,
{
    /// Remove dummy-interface addresses no active key claims. Only normal
    /// keys contribute addresses: DSR keys are bare marks, which is correct
    /// because DSR requires its external IP to be absent from the node.
    pub(crate) fn cleanup_stale_vips(&mut self, active: &ActiveServiceMap) -> Result<()> {
        let mut active_addresses: Vec<Ipv4Addr> = Vec::new();
        for key in active.keys() {
            if !key.contains('-') {
                continue;
            }
            if let Some(first) = key.split('-').next()
                && let Ok(ip) = first.parse::<Ipv4Addr>()
            {
                active_addresses.push(ip);
            }
        }

        let dummy = self
            .host
            .ensure_dummy_interface()
            .map_err(|e| Error::KernelUnavailable(format!("failed creating dummy interface: {e}")))?;
        let addresses = self
            .host
            .addresses(&dummy)
            .map_err(|e| Error::KernelUnavailable(format!("failed to list dummy interface IPs: {e}")))?;

        for address in addresses {
            if active_addresses.contains(&address) {
                continue;
            }
            info!("found an IP {address} which is no longer needed so cleaning up");
            if let Err(e) = self.host.del_address(&dummy, address) {
                error!("failed to delete stale IP {address}: {e}");
            }
        }
        Ok(())
    }

    /// Remove IPVS services whose key is not active (DSR leavings first),
    /// and stale destinations of services that are.
    pub(crate) fn cleanup_stale_services(&mut self, active: &ActiveServiceMap) -> Result<()> {
        let services = self
            .host
            .list_virtual_services()
            .map_err(|e| Error::KernelUnavailable(format!("failed to list IPVS services: {e}")))?;

        for service in services {
            let Some(key) = service_key_of(&service) else {
                warn!(
                    "cannot map protocol {} of IPVS service {service} to a known protocol, skipping",
                    service.protocol
                );
                continue;
            };

            match active.get(&key) {
                None => {
                    if let Some(ip) = service.address
                        && self.config.is_excluded(ip)
                    {
                        debug!("ignoring deletion of IPVS service {service} in an excluded CIDR");
                        continue;
                    }
                    info!("found an IPVS service {service} which is no longer needed so cleaning up");
                    if service.fwmark != 0 {
                        match self.teardown_dsr_mark(service.fwmark) {
                            Ok(()) => {}
                            Err(Error::UnknownFwMark(mark)) => {
                                debug!("no tuple registered for firewall mark {mark}, nothing to clean up")
                            }
                            Err(e) => error!(
                                "failed DSR cleanup for firewall mark {}: {e}",
                                service.fwmark
                            ),
                        }
                    }
                    if let Err(e) = self.host.delete_virtual_service(&service) {
                        error!("failed to delete stale IPVS service {service}: {e}");
                    }
                }
                Some(endpoint_ids) => {
                    let destinations = match self.host.destinations(&service) {
                        Ok(destinations) => destinations,
                        Err(e) => {
                            error!("failed to list destinations of IPVS service {service}: {e}");
                            continue;
                        }
                    };
                    for dst in destinations {
                        if endpoint_ids.contains(&endpoint_id(dst.address, dst.port)) {
                            continue;
                        }
                        info!(
                            "found a destination {dst} in service {service} which is no longer needed so cleaning up"
                        );
                        if let Err(e) = self.host.delete_destination(&service, &dst) {
                            error!("failed to delete destination {dst} from service {service}: {e}");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop metric series for keys the pass no longer claims.
    pub(crate) fn cleanup_stale_metrics(&mut self, active: &ActiveServiceMap) {
        let metrics = &self.metrics;
        self.metric_labels.retain(|key, labels| {
            if active.contains_key(key) {
                return true;
            }
            debug!("removing stale metric series for service key {key}");
            metrics.remove_service(labels);
            false
        });
    }
}

/// The active-map key a kernel entry answers to: its decimal firewall mark,
/// or `ip-proto-port` for address services. `None` when the protocol has no
/// textual form and no mark backs the entry (SCTP and friends fail closed).
fn service_key_of(service: &VirtualService) -> Option<String> {
    if service.fwmark != 0 {
        return Some(service.fwmark.to_string());
    }
    let ip = service.address?;
    let protocol = Protocol::from_number(service.protocol)?;
    Some(ip_port_id(ip, protocol, service.port))
}
