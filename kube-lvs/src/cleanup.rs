use kube_lvs_proxy::host::HostAdapter;
use kube_lvs_proxy::host::linux::LinuxHost;
use tracing::info;

use crate::cli::HostArgs;

/// Remove the node state the proxy owns so the host comes back pristine.
pub(crate) fn run(args: HostArgs) -> anyhow::Result<()> {
    let host = LinuxHost::new(args.pod_interface)?;

    info!("flushing IPVS services and destinations");
    host.flush_ipvs()?;

    info!("removing the dummy VIP interface");
    host.delete_dummy_interface()?;

    info!("node state cleaned up");
    Ok(())
}
