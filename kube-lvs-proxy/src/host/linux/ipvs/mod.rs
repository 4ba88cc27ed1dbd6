//! Blocking generic-netlink client for the kernel IPVS table.

mod constants;
mod message;
mod nlas;

use std::sync::atomic::{AtomicU32, Ordering};

use netlink_packet_core::{NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST, NetlinkMessage};
use netlink_packet_generic::GenlMessage;
use netlink_packet_generic::ctrl::nlas::GenlCtrlAttrs;
use netlink_packet_generic::ctrl::{GenlCtrl, GenlCtrlCmd};
use netlink_sys::protocols::NETLINK_GENERIC;
use netlink_sys::{Socket, SocketAddr};

use self::constants::{AF_INET, IP_VS_CONN_F_FWD_MASK};
use self::message::{IpvsCmd, IpvsCtrl};
use self::nlas::{DestAttr, IpvsNla, SvcAttr, destination_from_attrs, service_from_attrs};
use super::netlink;
use crate::error::{Error, Result};
use crate::host::{Destination, VirtualService};

pub struct IpvsClient {
    socket: Socket,
    family_id: u16,
    sequence: AtomicU32,
}

impl IpvsClient {
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_GENERIC)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        let mut client = Self {
            socket,
            family_id: 0,
            sequence: AtomicU32::new(1),
        };
        client.family_id = client.resolve_family()?;
        Ok(client)
    }

    /// Ask the generic-netlink controller for the IPVS family id; its
    /// absence means the ip_vs module is not loaded.
    fn resolve_family(&self) -> Result<u16> {
        let mut genl = GenlMessage::from_payload(GenlCtrl {
            cmd: GenlCtrlCmd::GetFamily,
            nlas: vec![GenlCtrlAttrs::FamilyName(
                constants::IPVS_GENL_NAME.to_owned(),
            )],
        });
        genl.finalize();
        let mut message = NetlinkMessage::from(genl);
        message.header.flags = NLM_F_REQUEST;
        message.header.sequence_number = self.next_sequence();

        let replies = netlink::request(&self.socket, message)?;
        for reply in replies {
            for nla in reply.payload.nlas {
                if let GenlCtrlAttrs::FamilyId(id) = nla {
                    return Ok(id);
                }
            }
        }
        Err(Error::KernelUnavailable(
            "generic netlink did not resolve the IPVS family; is ip_vs loaded?".into(),
        ))
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn call(
        &self,
        cmd: IpvsCmd,
        nlas: Vec<IpvsNla>,
        flags: u16,
    ) -> Result<Vec<GenlMessage<IpvsCtrl>>> {
        let mut genl = GenlMessage::from_payload(IpvsCtrl { cmd, nlas });
        genl.set_resolved_family_id(self.family_id);
        genl.finalize();
        let mut message = NetlinkMessage::from(genl);
        message.header.flags = flags;
        message.header.sequence_number = self.next_sequence();
        netlink::request(&self.socket, message)
    }

    pub fn services(&self) -> Result<Vec<VirtualService>> {
        let replies = self.call(IpvsCmd::GetService, vec![], NLM_F_REQUEST | NLM_F_DUMP)?;
        let mut services = Vec::new();
        for reply in replies {
            for nla in &reply.payload.nlas {
                if let IpvsNla::Service(attrs) = nla {
                    services.push(service_from_attrs(attrs));
                }
            }
        }
        Ok(services)
    }

    pub fn add_service(&self, service: &VirtualService) -> Result<()> {
        self.call(
            IpvsCmd::NewService,
            vec![IpvsNla::Service(full_service_attrs(service))],
            NLM_F_REQUEST | NLM_F_ACK,
        )?;
        Ok(())
    }

    pub fn update_service(&self, service: &VirtualService) -> Result<()> {
        self.call(
            IpvsCmd::SetService,
            vec![IpvsNla::Service(full_service_attrs(service))],
            NLM_F_REQUEST | NLM_F_ACK,
        )?;
        Ok(())
    }

    pub fn delete_service(&self, service: &VirtualService) -> Result<()> {
        self.call(
            IpvsCmd::DelService,
            vec![IpvsNla::Service(ident_service_attrs(service))],
            NLM_F_REQUEST | NLM_F_ACK,
        )?;
        Ok(())
    }

    pub fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>> {
        let replies = self.call(
            IpvsCmd::GetDest,
            vec![IpvsNla::Service(ident_service_attrs(service))],
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut destinations = Vec::new();
        for reply in replies {
            for nla in &reply.payload.nlas {
                if let IpvsNla::Dest(attrs) = nla
                    && let Some(dst) = destination_from_attrs(attrs)
                {
                    destinations.push(dst);
                }
            }
        }
        Ok(destinations)
    }

    pub fn add_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        self.destination_call(IpvsCmd::NewDest, service, dst)
    }

    pub fn update_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        self.destination_call(IpvsCmd::SetDest, service, dst)
    }

    pub fn delete_destination(&self, service: &VirtualService, dst: &Destination) -> Result<()> {
        self.destination_call(IpvsCmd::DelDest, service, dst)
    }

    pub fn flush(&self) -> Result<()> {
        self.call(IpvsCmd::Flush, vec![], NLM_F_REQUEST | NLM_F_ACK)?;
        Ok(())
    }

    fn destination_call(
        &self,
        cmd: IpvsCmd,
        service: &VirtualService,
        dst: &Destination,
    ) -> Result<()> {
        self.call(
            cmd,
            vec![
                IpvsNla::Service(ident_service_attrs(service)),
                IpvsNla::Dest(destination_attrs(dst)),
            ],
            NLM_F_REQUEST | NLM_F_ACK,
        )?;
        Ok(())
    }
}

/// Attributes identifying a service: (af, protocol, addr, port) for address
/// services, (af, fwmark) for mark services.
fn ident_service_attrs(service: &VirtualService) -> Vec<SvcAttr> {
    if service.fwmark != 0 {
        return vec![
            SvcAttr::AddressFamily(AF_INET),
            SvcAttr::FwMark(service.fwmark),
        ];
    }
    let mut attrs = vec![SvcAttr::AddressFamily(AF_INET)];
    if let Some(ip) = service.address {
        attrs.push(SvcAttr::Protocol(service.protocol));
        attrs.push(SvcAttr::Address(ip));
        attrs.push(SvcAttr::Port(service.port));
    }
    attrs
}

fn full_service_attrs(service: &VirtualService) -> Vec<SvcAttr> {
    let mut attrs = ident_service_attrs(service);
    attrs.push(SvcAttr::Scheduler(service.scheduler.clone()));
    attrs.push(SvcAttr::Flags {
        flags: service.flags,
        mask: u32::MAX,
    });
    attrs.push(SvcAttr::Timeout(service.timeout));
    attrs.push(SvcAttr::Netmask(u32::MAX));
    attrs
}

fn destination_attrs(dst: &Destination) -> Vec<DestAttr> {
    vec![
        DestAttr::Address(dst.address),
        DestAttr::Port(dst.port),
        DestAttr::FwdMethod(dst.conn_flags & IP_VS_CONN_F_FWD_MASK),
        DestAttr::Weight(dst.weight as u32),
        DestAttr::UpperThreshold(0),
        DestAttr::LowerThreshold(0),
    ]
}
