//! The three reconcile passes: cluster IPs, node ports, external and load
//! balancer IPs. All three feed one shared active map so garbage collection
//! sees a unified view of what this pass wanted. Nothing here deletes kernel
//! objects; retirement is the collector's job.

use std::net::Ipv4Addr;

use tracing::{debug, error, warn};

use super::{ActiveServiceMap, ProxyEngine, has_local_endpoints};
use crate::error::{Error, Result};
use crate::firewall::VipFirewall;
use crate::host::{CONN_F_MASQ, Destination, HostAdapter, ServicePolicy, VirtualService};
use crate::identity::{endpoint_id, ip_port_id};
use crate::types::{DsrMethod, EndpointInfo, EndpointsMap, ServiceInfo, ServiceInfoMap};

impl<H, F> ProxyEngine<H, F>
where
    H: HostAdapter,
    F: VipFirewall,
{
    pub(crate) fn setup_cluster_ip_services(
        &mut self,
        services: &ServiceInfoMap,
        endpoints_map: &EndpointsMap,
        active: &mut ActiveServiceMap,
    ) -> Result<()> {
        let existing = self
            .host
            .list_virtual_services()
            .map_err(|e| Error::KernelUnavailable(format!("failed to list IPVS services: {e}")))?;
        let dummy = self
            .host
            .ensure_dummy_interface()
            .map_err(|e| Error::KernelUnavailable(format!("failed creating dummy interface: {e}")))?;

        for (service_ref, svc) in services {
            let endpoints = endpoints_map
                .get(service_ref)
                .map(Vec::as_slice)
                .unwrap_or_default();

            // the cluster IP must be routable from pods on this node before
            // IPVS can answer for it
            if let Err(e) = self.host.add_address(&dummy, svc.cluster_ip) {
                warn!(
                    "skipping service {service_ref}: failed to assign cluster IP {} to the dummy interface: {e}",
                    svc.cluster_ip
                );
                continue;
            }

            let policy = ServicePolicy::for_service(svc);
            let service = match self.host.ensure_virtual_service(
                &existing,
                svc.cluster_ip,
                svc.protocol,
                svc.port,
                &policy,
            ) {
                Ok(service) => service,
                Err(e) => {
                    error!("failed to create IPVS service for cluster IP {}: {e}", svc.cluster_ip);
                    continue;
                }
            };

            let key = ip_port_id(svc.cluster_ip, svc.protocol, svc.port);
            let installed = active.entry(key).or_default();
            for endpoint in endpoints {
                // a local service declines remote backends only while local
                // ones exist
                if svc.local && has_local_endpoints(endpoints) && !endpoint.is_local {
                    continue;
                }
                match self.host.ensure_destination(&service, &masq_destination(endpoint)) {
                    Ok(()) => installed.push(endpoint_id(endpoint.ip, endpoint.port)),
                    Err(e) => error!(
                        "failed to add destination {}:{} to service {service}: {e}",
                        endpoint.ip, endpoint.port
                    ),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn setup_node_port_services(
        &mut self,
        services: &ServiceInfoMap,
        endpoints_map: &EndpointsMap,
        active: &mut ActiveServiceMap,
    ) -> Result<()> {
        let existing = self
            .host
            .list_virtual_services()
            .map_err(|e| Error::KernelUnavailable(format!("failed to list IPVS services: {e}")))?;

        for (service_ref, svc) in services {
            if svc.node_port == 0 {
                continue;
            }
            let endpoints = endpoints_map
                .get(service_ref)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if svc.local && !has_local_endpoints(endpoints) {
                debug!(
                    "skipping node port service {}/{} without active local endpoints",
                    svc.namespace, svc.name
                );
                continue;
            }

            let policy = ServicePolicy::for_service(svc);
            let bind_addresses = if self.config.nodeport_bind_on_all_ip {
                match self.host.list_local_ips() {
                    Ok(addresses) if addresses.is_empty() => {
                        error!("no local addresses available for node port binding");
                        continue;
                    }
                    Ok(addresses) => addresses,
                    Err(e) => {
                        error!("could not list local addresses for node port services: {e}");
                        continue;
                    }
                }
            } else {
                vec![self.config.node_ip]
            };

            let mut nodeport_services: Vec<(VirtualService, String)> = Vec::new();
            for address in bind_addresses {
                match self.host.ensure_virtual_service(
                    &existing,
                    address,
                    svc.protocol,
                    svc.node_port,
                    &policy,
                ) {
                    Ok(service) => {
                        let key = ip_port_id(address, svc.protocol, svc.node_port);
                        active.insert(key.clone(), Vec::new());
                        nodeport_services.push((service, key));
                    }
                    Err(e) => error!("failed to create IPVS service for node port on {address}: {e}"),
                }
            }

            for endpoint in endpoints {
                if svc.local && !endpoint.is_local {
                    continue;
                }
                let dst = masq_destination(endpoint);
                for (service, key) in &nodeport_services {
                    match self.host.ensure_destination(service, &dst) {
                        Ok(()) => {
                            if let Some(installed) = active.get_mut(key) {
                                installed.push(endpoint_id(endpoint.ip, endpoint.port));
                            }
                        }
                        Err(e) => error!("failed to add destination {dst} to service {service}: {e}"),
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn setup_external_ip_services(
        &mut self,
        services: &ServiceInfoMap,
        endpoints_map: &EndpointsMap,
        active: &mut ActiveServiceMap,
    ) -> Result<()> {
        let existing = self
            .host
            .list_virtual_services()
            .map_err(|e| Error::KernelUnavailable(format!("failed to list IPVS services: {e}")))?;

        for (service_ref, svc) in services {
            let endpoints = endpoints_map
                .get(service_ref)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let external_ips = svc.external_ip_set();
            if external_ips.is_empty() {
                continue;
            }
            if svc.local && !has_local_endpoints(endpoints) {
                debug!(
                    "skipping external IPs of service {}/{} without active local endpoints",
                    svc.namespace, svc.name
                );
                continue;
            }

            for external_ip in external_ips {
                // a failure on one external IP must not stop the rest
                let key = if svc.direct_server_return && svc.dsr_method == DsrMethod::Tunnel {
                    match self.setup_dsr_external_ip(&existing, svc, external_ip, endpoints) {
                        Ok(fwmark) => fwmark.to_string(),
                        Err(e) => {
                            error!(
                                "failed to set up DSR external IP {external_ip} for {service_ref}: {e}"
                            );
                            continue;
                        }
                    }
                } else {
                    match self.setup_external_ip(&existing, svc, external_ip, endpoints) {
                        Ok(()) => ip_port_id(external_ip, svc.protocol, svc.port),
                        Err(e) => {
                            error!(
                                "failed to set up external IP {external_ip} for {service_ref}: {e}"
                            );
                            continue;
                        }
                    }
                };

                let installed = active.entry(key).or_default();
                for endpoint in endpoints {
                    if !svc.local || endpoint.is_local {
                        installed.push(endpoint_id(endpoint.ip, endpoint.port));
                    }
                }
            }
        }
        Ok(())
    }

    /// Non-DSR external IP: the node owns the address on the dummy interface
    /// and IPVS answers for it directly. Any mark a previous DSR deployment
    /// of this tuple left behind is torn down.
    fn setup_external_ip(
        &mut self,
        existing: &[VirtualService],
        svc: &ServiceInfo,
        external_ip: Ipv4Addr,
        endpoints: &[EndpointInfo],
    ) -> Result<()> {
        let dummy = self.host.ensure_dummy_interface()?;
        self.host.add_address(&dummy, external_ip)?;

        let policy = ServicePolicy::for_service(svc);
        let service =
            self.host
                .ensure_virtual_service(existing, external_ip, svc.protocol, svc.port, &policy)?;

        let fwmark = self.fwmarks.lookup(external_ip, svc.protocol, svc.port);
        if fwmark != 0 {
            debug!(
                "external IP {external_ip}:{}:{} still had firewall mark {fwmark}, cleaning up",
                svc.protocol, svc.port
            );
            self.teardown_dsr_mark(fwmark)?;
        }

        for endpoint in endpoints {
            if svc.local && !endpoint.is_local {
                continue;
            }
            self.host
                .ensure_destination(&service, &masq_destination(endpoint))?;
        }
        Ok(())
    }
}

fn masq_destination(endpoint: &EndpointInfo) -> Destination {
    Destination {
        address: endpoint.ip,
        port: endpoint.port,
        weight: 1,
        conn_flags: CONN_F_MASQ,
    }
}
