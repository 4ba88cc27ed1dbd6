use std::sync::atomic::AtomicU64;
use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};

/// Process-wide registry the daemon exposes; the engine itself only holds
/// metric handles.
pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("kube_lvs")));

/// Label tuple attached to every per-service metric and remembered per
/// service key so stale series can be dropped when the service goes away.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub namespace: String,
    pub service_name: String,
    pub service_vip: String,
    pub protocol: String,
    pub port: String,
}

type ServiceGauge = Family<ServiceLabels, Gauge<f64, AtomicU64>>;

#[derive(Clone)]
pub struct ProxyMetrics {
    pub service_bps_in: ServiceGauge,
    pub service_bps_out: ServiceGauge,
    pub service_bytes_in: ServiceGauge,
    pub service_bytes_out: ServiceGauge,
    pub service_cps: ServiceGauge,
    pub service_packets_in: ServiceGauge,
    pub service_packets_out: ServiceGauge,
    pub service_pps_in: ServiceGauge,
    pub service_pps_out: ServiceGauge,
    pub service_total_connections: ServiceGauge,
    pub ipvs_services: Gauge,
    pub sync_duration: Histogram,
}

impl ProxyMetrics {
    /// Register against the process-wide registry.
    pub fn new() -> Self {
        let mut guard = REGISTRY.write().unwrap();
        Self::register(&mut guard)
    }

    /// Register against an injected registry so tests stay isolated.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self {
            service_bps_in: ServiceGauge::default(),
            service_bps_out: ServiceGauge::default(),
            service_bytes_in: ServiceGauge::default(),
            service_bytes_out: ServiceGauge::default(),
            service_cps: ServiceGauge::default(),
            service_packets_in: ServiceGauge::default(),
            service_packets_out: ServiceGauge::default(),
            service_pps_in: ServiceGauge::default(),
            service_pps_out: ServiceGauge::default(),
            service_total_connections: ServiceGauge::default(),
            ipvs_services: Gauge::default(),
            sync_duration: Histogram::new(
                [0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter(),
            ),
        };

        registry.register(
            "service_bps_in",
            "Incoming bytes per second for a service",
            metrics.service_bps_in.clone(),
        );
        registry.register(
            "service_bps_out",
            "Outgoing bytes per second for a service",
            metrics.service_bps_out.clone(),
        );
        registry.register(
            "service_bytes_in",
            "Total incoming bytes for a service",
            metrics.service_bytes_in.clone(),
        );
        registry.register(
            "service_bytes_out",
            "Total outgoing bytes for a service",
            metrics.service_bytes_out.clone(),
        );
        registry.register(
            "service_cps",
            "Connections per second for a service",
            metrics.service_cps.clone(),
        );
        registry.register(
            "service_packets_in",
            "Total incoming packets for a service",
            metrics.service_packets_in.clone(),
        );
        registry.register(
            "service_packets_out",
            "Total outgoing packets for a service",
            metrics.service_packets_out.clone(),
        );
        registry.register(
            "service_pps_in",
            "Incoming packets per second for a service",
            metrics.service_pps_in.clone(),
        );
        registry.register(
            "service_pps_out",
            "Outgoing packets per second for a service",
            metrics.service_pps_out.clone(),
        );
        registry.register(
            "service_total_connections",
            "Total connections made to a service",
            metrics.service_total_connections.clone(),
        );
        registry.register(
            "ipvs_services",
            "Number of IPVS services the proxy publishes metrics for",
            metrics.ipvs_services.clone(),
        );
        registry.register_with_unit(
            "sync_duration",
            "Time taken by one sync of IPVS services and servers",
            Unit::Seconds,
            metrics.sync_duration.clone(),
        );
        metrics
    }

    /// Drop every series carrying this label tuple.
    pub fn remove_service(&self, labels: &ServiceLabels) {
        self.service_bps_in.remove(labels);
        self.service_bps_out.remove(labels);
        self.service_bytes_in.remove(labels);
        self.service_bytes_out.remove(labels);
        self.service_cps.remove(labels);
        self.service_packets_in.remove(labels);
        self.service_packets_out.remove(labels);
        self.service_pps_in.remove(labels);
        self.service_pps_out.remove(labels);
        self.service_total_connections.remove(labels);
        self.ipvs_services.dec();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_remove_service_drops_all_series() {
        let mut registry = Registry::default();
        let metrics = ProxyMetrics::register(&mut registry);
        let labels = ServiceLabels {
            namespace: "default".into(),
            service_name: "web".into(),
            service_vip: "10.0.0.1".into(),
            protocol: "tcp".into(),
            port: "80".into(),
        };

        metrics.service_bps_in.get_or_create(&labels).set(42.0);
        metrics.ipvs_services.inc();
        metrics.remove_service(&labels);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(!out.contains("10.0.0.1"));
    }
}
