use kube_lvs_proxy::host::linux::LinuxHost;
use kube_lvs_proxy::host::{CONN_F_TUNNEL, HostAdapter};
use tabled::Table;
use tabled::Tabled;
use tabled::settings::Style;

use crate::cli::HostArgs;

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "DESTINATION")]
    destination: String,
    #[tabled(rename = "FORWARD")]
    forward: String,
    #[tabled(rename = "WEIGHT")]
    weight: String,
}

pub(crate) fn run(args: HostArgs) -> anyhow::Result<()> {
    let host = LinuxHost::new(args.pod_interface)?;
    let services = host.list_virtual_services()?;

    let mut rows = Vec::new();
    for service in &services {
        let destinations = host.destinations(service)?;
        if destinations.is_empty() {
            rows.push(StateRow {
                service: service.to_string(),
                destination: "-".into(),
                forward: "-".into(),
                weight: "-".into(),
            });
        }
        for dst in destinations {
            rows.push(StateRow {
                service: service.to_string(),
                destination: dst.to_string(),
                forward: if dst.conn_flags & 0x7 == CONN_F_TUNNEL {
                    "tunnel".into()
                } else {
                    "masq".into()
                },
                weight: dst.weight.to_string(),
            });
        }
    }

    let table = Table::new(rows).with(Style::modern()).to_string();
    println!("{table}");
    Ok(())
}
