//! Blocking route-netlink client: the dummy VIP interface, its addresses,
//! and local-address enumeration.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};

use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::protocols::NETLINK_ROUTE;
use netlink_sys::{Socket, SocketAddr};

use super::netlink;
use crate::error::{Error, Result};
use crate::host::{AddrChange, LinkRef};

pub struct RouteClient {
    socket: Socket,
    sequence: AtomicU32,
}

impl RouteClient {
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(Self {
            socket,
            sequence: AtomicU32::new(1),
        })
    }

    fn call(
        &self,
        message: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<Vec<RouteNetlinkMessage>> {
        let mut nl_message = NetlinkMessage::from(message);
        nl_message.header.flags = flags;
        nl_message.header.sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed);
        netlink::request(&self.socket, nl_message)
    }

    /// (index, name) of every link on the host.
    pub fn links(&self) -> Result<Vec<(u32, String)>> {
        let replies = self.call(
            RouteNetlinkMessage::GetLink(LinkMessage::default()),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut links = Vec::new();
        for reply in replies {
            if let RouteNetlinkMessage::NewLink(link) = reply {
                let name = link.attributes.iter().find_map(|attr| match attr {
                    LinkAttribute::IfName(name) => Some(name.clone()),
                    _ => None,
                });
                if let Some(name) = name {
                    links.push((link.header.index, name));
                }
            }
        }
        Ok(links)
    }

    pub fn find_link(&self, name: &str) -> Result<Option<LinkRef>> {
        Ok(self.links()?.into_iter().find_map(|(index, link_name)| {
            (link_name == name).then(|| LinkRef {
                index,
                name: link_name,
            })
        }))
    }

    /// Create the named dummy link if missing and bring it up.
    pub fn ensure_dummy(&self, name: &str) -> Result<LinkRef> {
        if self.find_link(name)?.is_none() {
            let mut link = LinkMessage::default();
            link.attributes.push(LinkAttribute::IfName(name.to_owned()));
            link.attributes
                .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(
                    InfoKind::Dummy,
                )]));
            match self.call(
                RouteNetlinkMessage::NewLink(link),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            ) {
                Ok(_) | Err(Error::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }

        let link = self
            .find_link(name)?
            .ok_or_else(|| Error::KernelUnavailable(format!("link {name} did not appear")))?;

        let mut up = LinkMessage::default();
        up.header.index = link.index;
        up.header.flags = LinkFlags::Up;
        up.header.change_mask = LinkFlags::Up;
        self.call(RouteNetlinkMessage::SetLink(up), NLM_F_REQUEST | NLM_F_ACK)?;
        Ok(link)
    }

    pub fn delete_link(&self, link: &LinkRef) -> Result<()> {
        let mut message = LinkMessage::default();
        message.header.index = link.index;
        match self.call(
            RouteNetlinkMessage::DelLink(message),
            NLM_F_REQUEST | NLM_F_ACK,
        ) {
            Ok(_) | Err(Error::NoSuchAddress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// IPv4 addresses currently assigned to the link.
    pub fn addresses(&self, index: u32) -> Result<Vec<Ipv4Addr>> {
        let replies = self.call(
            RouteNetlinkMessage::GetAddress(AddressMessage::default()),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut addresses = Vec::new();
        for reply in replies {
            if let RouteNetlinkMessage::NewAddress(message) = reply {
                if message.header.index != index
                    || message.header.family != AddressFamily::Inet
                {
                    continue;
                }
                if let Some(ip) = ipv4_of(&message) {
                    addresses.push(ip);
                }
            }
        }
        Ok(addresses)
    }

    pub fn add_address(&self, link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange> {
        match self.call(
            RouteNetlinkMessage::NewAddress(address_message(link.index, ip)),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        ) {
            Ok(_) => Ok(AddrChange::Added),
            Err(Error::AlreadyExists) => Ok(AddrChange::AlreadyPresent),
            Err(e) => Err(e),
        }
    }

    pub fn del_address(&self, link: &LinkRef, ip: Ipv4Addr) -> Result<AddrChange> {
        match self.call(
            RouteNetlinkMessage::DelAddress(address_message(link.index, ip)),
            NLM_F_REQUEST | NLM_F_ACK,
        ) {
            Ok(_) => Ok(AddrChange::Removed),
            Err(Error::NoSuchAddress) => Ok(AddrChange::NotPresent),
            Err(e) => Err(e),
        }
    }

    /// Every (interface name, IPv4 address) pair on the host.
    pub fn local_ipv4_addresses(&self) -> Result<Vec<(String, Ipv4Addr)>> {
        let links = self.links()?;
        let name_of = |index: u32| {
            links
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, name)| name.clone())
        };

        let replies = self.call(
            RouteNetlinkMessage::GetAddress(AddressMessage::default()),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut addresses = Vec::new();
        for reply in replies {
            if let RouteNetlinkMessage::NewAddress(message) = reply {
                if message.header.family != AddressFamily::Inet {
                    continue;
                }
                if let (Some(name), Some(ip)) = (name_of(message.header.index), ipv4_of(&message))
                {
                    addresses.push((name, ip));
                }
            }
        }
        Ok(addresses)
    }
}

fn address_message(index: u32, ip: Ipv4Addr) -> AddressMessage {
    let mut message = AddressMessage::default();
    message.header.family = AddressFamily::Inet;
    message.header.prefix_len = 32;
    message.header.index = index;
    message
        .attributes
        .push(AddressAttribute::Local(IpAddr::V4(ip)));
    message
        .attributes
        .push(AddressAttribute::Address(IpAddr::V4(ip)));
    message
}

fn ipv4_of(message: &AddressMessage) -> Option<Ipv4Addr> {
    let mut address = None;
    for attr in &message.attributes {
        match attr {
            // IFA_LOCAL is the interface address; IFA_ADDRESS falls back for
            // links that only report the peer form
            AddressAttribute::Local(IpAddr::V4(ip)) => return Some(*ip),
            AddressAttribute::Address(IpAddr::V4(ip)) => address = Some(*ip),
            _ => {}
        }
    }
    address
}
