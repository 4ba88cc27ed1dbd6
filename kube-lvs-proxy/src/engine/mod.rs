//! The sync engine: drives kernel IPVS, the dummy VIP interface and the DSR
//! marking/routing machinery toward one snapshot of desired services and
//! endpoints, then retires whatever the snapshot no longer wants.

mod cleanup;
mod dsr;
mod services;

use std::net::Ipv4Addr;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::firewall::VipFirewall;
use crate::host::HostAdapter;
use crate::identity::{FwMarkRegistry, ip_port_id};
use crate::metrics::{ProxyMetrics, ServiceLabels};
use crate::types::{EndpointInfo, EndpointsMap, ServiceInfoMap};

/// Per-pass desired state: service key to the endpoint ids installed for it.
/// An empty list means "desired, but nothing to install here"; a missing key
/// means "not desired" and is what the garbage collector acts on.
pub(crate) type ActiveServiceMap = ahash::HashMap<String, Vec<String>>;

pub struct ProxyEngine<H, F>
where
    H: HostAdapter,
    F: VipFirewall,
{
    pub(crate) host: H,
    firewall: F,
    pub(crate) config: ProxyConfig,
    pub(crate) fwmarks: FwMarkRegistry,
    pub(crate) metrics: ProxyMetrics,
    /// Service key to the label tuple published for it; pruned alongside the
    /// kernel state so metric series do not outlive their service.
    pub(crate) metric_labels: ahash::HashMap<String, ServiceLabels>,
}

impl<H, F> ProxyEngine<H, F>
where
    H: HostAdapter,
    F: VipFirewall,
{
    pub fn new(host: H, firewall: F, config: ProxyConfig, metrics: ProxyMetrics) -> Self {
        Self {
            host,
            firewall,
            config,
            fwmarks: FwMarkRegistry::new(),
            metrics,
            metric_labels: ahash::HashMap::default(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// One reconciliation pass. Every step runs regardless of earlier
    /// failures; errors surface through logs and metrics so the caller keeps
    /// scheduling passes even when the node only partially converged.
    pub fn sync(&mut self, services: &ServiceInfoMap, endpoints: &EndpointsMap) {
        let start = Instant::now();
        let mut active = ActiveServiceMap::default();
        let mut had_errors = false;

        if let Err(e) = self.setup_cluster_ip_services(services, endpoints, &mut active) {
            had_errors = true;
            error!("error setting up IPVS services for cluster IPs: {e}");
        }
        if let Err(e) = self.setup_node_port_services(services, endpoints, &mut active) {
            had_errors = true;
            error!("error setting up IPVS services for node ports: {e}");
        }
        if let Err(e) = self.setup_external_ip_services(services, endpoints, &mut active) {
            had_errors = true;
            error!("error setting up IPVS services for external and load balancer IPs: {e}");
        }
        if let Err(e) = self.cleanup_stale_vips(&active) {
            had_errors = true;
            error!("error cleaning up stale VIPs on the dummy interface: {e}");
        }
        if let Err(e) = self.cleanup_stale_services(&active) {
            had_errors = true;
            error!("error cleaning up stale IPVS services and destinations: {e}");
        }
        self.cleanup_stale_metrics(&active);
        if let Err(e) = self
            .firewall
            .ensure_vip_traffic_allowed(&service_vips(services))
        {
            had_errors = true;
            error!("error syncing firewall rules for service VIPs: {e}");
        }
        if let Err(e) = self.setup_dsr_routing(services) {
            had_errors = true;
            error!("error setting up policy routing for direct server return: {e}");
        }

        let elapsed = start.elapsed();
        if self.config.metrics_enabled {
            self.metrics.sync_duration.observe(elapsed.as_secs_f64());
        }
        debug!("sync of IPVS services took {elapsed:?}");
        if had_errors {
            info!("one or more errors encountered during sync of IPVS services to desired state");
        } else {
            info!("IPVS services are synced to desired state");
        }
    }

    /// Publish kernel traffic counters for every desired service the IPVS
    /// table knows, and remember the label tuples for later pruning.
    pub fn publish_metrics(&mut self, services: &ServiceInfoMap) -> Result<()> {
        if !self.config.metrics_enabled {
            return Ok(());
        }
        let installed = self
            .host
            .list_virtual_services()
            .map_err(|e| Error::KernelUnavailable(e.to_string()))?;

        for svc in services.values() {
            for entry in &installed {
                let Some(address) = entry.address else {
                    // fwmark services carry no address to label by
                    continue;
                };
                let port = if entry.matches_addr(svc.cluster_ip, svc.protocol, svc.port)
                    || (svc.external_ip_set().contains(&address)
                        && entry.matches_addr(address, svc.protocol, svc.port))
                {
                    svc.port
                } else if svc.node_port != 0
                    && entry.matches_addr(self.config.node_ip, svc.protocol, svc.node_port)
                {
                    svc.node_port
                } else {
                    continue;
                };

                let labels = ServiceLabels {
                    namespace: svc.namespace.clone(),
                    service_name: svc.name.clone(),
                    service_vip: address.to_string(),
                    protocol: svc.protocol.as_str().to_owned(),
                    port: port.to_string(),
                };
                let stats = &entry.stats;
                self.metrics
                    .service_bps_in
                    .get_or_create(&labels)
                    .set(f64::from(stats.bps_in));
                self.metrics
                    .service_bps_out
                    .get_or_create(&labels)
                    .set(f64::from(stats.bps_out));
                self.metrics
                    .service_bytes_in
                    .get_or_create(&labels)
                    .set(stats.bytes_in as f64);
                self.metrics
                    .service_bytes_out
                    .get_or_create(&labels)
                    .set(stats.bytes_out as f64);
                self.metrics
                    .service_cps
                    .get_or_create(&labels)
                    .set(f64::from(stats.cps));
                self.metrics
                    .service_packets_in
                    .get_or_create(&labels)
                    .set(f64::from(stats.packets_in));
                self.metrics
                    .service_packets_out
                    .get_or_create(&labels)
                    .set(f64::from(stats.packets_out));
                self.metrics
                    .service_pps_in
                    .get_or_create(&labels)
                    .set(f64::from(stats.pps_in));
                self.metrics
                    .service_pps_out
                    .get_or_create(&labels)
                    .set(f64::from(stats.pps_out));
                self.metrics
                    .service_total_connections
                    .get_or_create(&labels)
                    .set(f64::from(stats.connections));

                let key = ip_port_id(address, svc.protocol, port);
                self.metric_labels.insert(key, labels);
            }
        }
        self.metrics.ipvs_services.set(installed.len() as i64);
        Ok(())
    }
}

/// Any backend pod of the service runs on this node.
pub(crate) fn has_local_endpoints(endpoints: &[EndpointInfo]) -> bool {
    endpoints.iter().any(|endpoint| endpoint.is_local)
}

fn service_vips(services: &ServiceInfoMap) -> Vec<Ipv4Addr> {
    let mut vips = Vec::new();
    for svc in services.values() {
        if !vips.contains(&svc.cluster_ip) {
            vips.push(svc.cluster_ip);
        }
        for ip in svc.external_ip_set() {
            if !vips.contains(&ip) {
                vips.push(ip);
            }
        }
    }
    vips
}
