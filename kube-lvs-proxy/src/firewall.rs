use std::net::Ipv4Addr;

use crate::error::Result;

/// Firewall-wide rule generation lives outside the sync engine; the engine
/// only asks its collaborator to keep traffic to the service VIPs permitted
/// once per pass.
pub trait VipFirewall {
    fn ensure_vip_traffic_allowed(&self, vips: &[Ipv4Addr]) -> Result<()>;
}

/// Stand-in for deployments where something else owns the filter table.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopFirewall;

impl VipFirewall for NoopFirewall {
    fn ensure_vip_traffic_allowed(&self, _vips: &[Ipv4Addr]) -> Result<()> {
        Ok(())
    }
}
