//! Attribute codec for IPVS generic-netlink messages.

use std::net::Ipv4Addr;

use netlink_packet_utils::DecodeError;
use netlink_packet_utils::nla::{DefaultNla, Nla, NlaBuffer, NlasIterator};
use netlink_packet_utils::parsers::{parse_string, parse_u16, parse_u16_be, parse_u32, parse_u64};
use netlink_packet_utils::traits::{Emitable, Parseable};

use super::constants::*;
use crate::host::{Destination, ServiceStats, VirtualService};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpvsNla {
    Service(Vec<SvcAttr>),
    Dest(Vec<DestAttr>),
    Other(DefaultNla),
}

impl Nla for IpvsNla {
    fn value_len(&self) -> usize {
        match self {
            IpvsNla::Service(attrs) => attrs.as_slice().buffer_len(),
            IpvsNla::Dest(attrs) => attrs.as_slice().buffer_len(),
            IpvsNla::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            IpvsNla::Service(_) => IPVS_CMD_ATTR_SERVICE,
            IpvsNla::Dest(_) => IPVS_CMD_ATTR_DEST,
            IpvsNla::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            IpvsNla::Service(attrs) => attrs.as_slice().emit(buffer),
            IpvsNla::Dest(attrs) => attrs.as_slice().emit(buffer),
            IpvsNla::Other(nla) => nla.emit_value(buffer),
        }
    }

    fn is_nested(&self) -> bool {
        !matches!(self, IpvsNla::Other(_))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for IpvsNla {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_CMD_ATTR_SERVICE => {
                let mut attrs = Vec::new();
                for nla in NlasIterator::new(payload) {
                    attrs.push(SvcAttr::parse(&nla?)?);
                }
                IpvsNla::Service(attrs)
            }
            IPVS_CMD_ATTR_DEST => {
                let mut attrs = Vec::new();
                for nla in NlasIterator::new(payload) {
                    attrs.push(DestAttr::parse(&nla?)?);
                }
                IpvsNla::Dest(attrs)
            }
            _ => IpvsNla::Other(DefaultNla::parse(buf)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SvcAttr {
    AddressFamily(u16),
    Protocol(u16),
    Address(Ipv4Addr),
    Port(u16),
    FwMark(u32),
    Scheduler(String),
    Flags { flags: u32, mask: u32 },
    Timeout(u32),
    Netmask(u32),
    Stats(Vec<StatsAttr>),
    Other(DefaultNla),
}

impl Nla for SvcAttr {
    fn value_len(&self) -> usize {
        match self {
            SvcAttr::AddressFamily(_) | SvcAttr::Protocol(_) | SvcAttr::Port(_) => 2,
            SvcAttr::Address(_) => 4,
            SvcAttr::FwMark(_) | SvcAttr::Timeout(_) | SvcAttr::Netmask(_) => 4,
            SvcAttr::Scheduler(name) => name.len() + 1,
            SvcAttr::Flags { .. } => 8,
            SvcAttr::Stats(attrs) => attrs.as_slice().buffer_len(),
            SvcAttr::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            SvcAttr::AddressFamily(_) => IPVS_SVC_ATTR_AF,
            SvcAttr::Protocol(_) => IPVS_SVC_ATTR_PROTOCOL,
            SvcAttr::Address(_) => IPVS_SVC_ATTR_ADDR,
            SvcAttr::Port(_) => IPVS_SVC_ATTR_PORT,
            SvcAttr::FwMark(_) => IPVS_SVC_ATTR_FWMARK,
            SvcAttr::Scheduler(_) => IPVS_SVC_ATTR_SCHED_NAME,
            SvcAttr::Flags { .. } => IPVS_SVC_ATTR_FLAGS,
            SvcAttr::Timeout(_) => IPVS_SVC_ATTR_TIMEOUT,
            SvcAttr::Netmask(_) => IPVS_SVC_ATTR_NETMASK,
            SvcAttr::Stats(_) => IPVS_SVC_ATTR_STATS,
            SvcAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            SvcAttr::AddressFamily(v) | SvcAttr::Protocol(v) => {
                buffer[..2].copy_from_slice(&v.to_ne_bytes());
            }
            // ports travel in network byte order
            SvcAttr::Port(v) => buffer[..2].copy_from_slice(&v.to_be_bytes()),
            SvcAttr::Address(ip) => buffer[..4].copy_from_slice(&ip.octets()),
            SvcAttr::FwMark(v) | SvcAttr::Timeout(v) | SvcAttr::Netmask(v) => {
                buffer[..4].copy_from_slice(&v.to_ne_bytes());
            }
            SvcAttr::Scheduler(name) => {
                buffer[..name.len()].copy_from_slice(name.as_bytes());
                buffer[name.len()] = 0;
            }
            // struct ip_vs_flags { __u32 flags; __u32 mask; }
            SvcAttr::Flags { flags, mask } => {
                buffer[..4].copy_from_slice(&flags.to_ne_bytes());
                buffer[4..8].copy_from_slice(&mask.to_ne_bytes());
            }
            SvcAttr::Stats(attrs) => attrs.as_slice().emit(buffer),
            SvcAttr::Other(nla) => nla.emit_value(buffer),
        }
    }

    fn is_nested(&self) -> bool {
        matches!(self, SvcAttr::Stats(_))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for SvcAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_SVC_ATTR_AF => SvcAttr::AddressFamily(parse_u16(payload)?),
            IPVS_SVC_ATTR_PROTOCOL => SvcAttr::Protocol(parse_u16(payload)?),
            IPVS_SVC_ATTR_ADDR => SvcAttr::Address(parse_inet_addr(payload)?),
            IPVS_SVC_ATTR_PORT => SvcAttr::Port(parse_u16_be(payload)?),
            IPVS_SVC_ATTR_FWMARK => SvcAttr::FwMark(parse_u32(payload)?),
            IPVS_SVC_ATTR_SCHED_NAME => SvcAttr::Scheduler(parse_string(payload)?),
            IPVS_SVC_ATTR_FLAGS => {
                if payload.len() < 8 {
                    return Err(DecodeError::from(format!(
                        "service flags attribute too short: {} bytes",
                        payload.len()
                    )));
                }
                SvcAttr::Flags {
                    flags: parse_u32(&payload[..4])?,
                    mask: parse_u32(&payload[4..8])?,
                }
            }
            IPVS_SVC_ATTR_TIMEOUT => SvcAttr::Timeout(parse_u32(payload)?),
            IPVS_SVC_ATTR_NETMASK => SvcAttr::Netmask(parse_u32(payload)?),
            IPVS_SVC_ATTR_STATS => {
                let mut attrs = Vec::new();
                for nla in NlasIterator::new(payload) {
                    attrs.push(StatsAttr::parse(&nla?)?);
                }
                SvcAttr::Stats(attrs)
            }
            _ => SvcAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestAttr {
    Address(Ipv4Addr),
    Port(u16),
    FwdMethod(u32),
    Weight(u32),
    UpperThreshold(u32),
    LowerThreshold(u32),
    AddressFamily(u16),
    Other(DefaultNla),
}

impl Nla for DestAttr {
    fn value_len(&self) -> usize {
        match self {
            DestAttr::Address(_) => 4,
            DestAttr::Port(_) | DestAttr::AddressFamily(_) => 2,
            DestAttr::FwdMethod(_)
            | DestAttr::Weight(_)
            | DestAttr::UpperThreshold(_)
            | DestAttr::LowerThreshold(_) => 4,
            DestAttr::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            DestAttr::Address(_) => IPVS_DEST_ATTR_ADDR,
            DestAttr::Port(_) => IPVS_DEST_ATTR_PORT,
            DestAttr::FwdMethod(_) => IPVS_DEST_ATTR_FWD_METHOD,
            DestAttr::Weight(_) => IPVS_DEST_ATTR_WEIGHT,
            DestAttr::UpperThreshold(_) => IPVS_DEST_ATTR_U_THRESH,
            DestAttr::LowerThreshold(_) => IPVS_DEST_ATTR_L_THRESH,
            DestAttr::AddressFamily(_) => IPVS_DEST_ATTR_ADDR_FAMILY,
            DestAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            DestAttr::Address(ip) => buffer[..4].copy_from_slice(&ip.octets()),
            DestAttr::Port(v) => buffer[..2].copy_from_slice(&v.to_be_bytes()),
            DestAttr::AddressFamily(v) => buffer[..2].copy_from_slice(&v.to_ne_bytes()),
            DestAttr::FwdMethod(v)
            | DestAttr::Weight(v)
            | DestAttr::UpperThreshold(v)
            | DestAttr::LowerThreshold(v) => buffer[..4].copy_from_slice(&v.to_ne_bytes()),
            DestAttr::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for DestAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_DEST_ATTR_ADDR => DestAttr::Address(parse_inet_addr(payload)?),
            IPVS_DEST_ATTR_PORT => DestAttr::Port(parse_u16_be(payload)?),
            IPVS_DEST_ATTR_FWD_METHOD => DestAttr::FwdMethod(parse_u32(payload)?),
            IPVS_DEST_ATTR_WEIGHT => DestAttr::Weight(parse_u32(payload)?),
            IPVS_DEST_ATTR_U_THRESH => DestAttr::UpperThreshold(parse_u32(payload)?),
            IPVS_DEST_ATTR_L_THRESH => DestAttr::LowerThreshold(parse_u32(payload)?),
            IPVS_DEST_ATTR_ADDR_FAMILY => DestAttr::AddressFamily(parse_u16(payload)?),
            _ => DestAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatsAttr {
    Connections(u32),
    PacketsIn(u32),
    PacketsOut(u32),
    BytesIn(u64),
    BytesOut(u64),
    Cps(u32),
    PpsIn(u32),
    PpsOut(u32),
    BpsIn(u32),
    BpsOut(u32),
    Other(DefaultNla),
}

impl Nla for StatsAttr {
    fn value_len(&self) -> usize {
        match self {
            StatsAttr::BytesIn(_) | StatsAttr::BytesOut(_) => 8,
            StatsAttr::Other(nla) => nla.value_len(),
            _ => 4,
        }
    }

    fn kind(&self) -> u16 {
        match self {
            StatsAttr::Connections(_) => IPVS_STATS_ATTR_CONNS,
            StatsAttr::PacketsIn(_) => IPVS_STATS_ATTR_INPKTS,
            StatsAttr::PacketsOut(_) => IPVS_STATS_ATTR_OUTPKTS,
            StatsAttr::BytesIn(_) => IPVS_STATS_ATTR_INBYTES,
            StatsAttr::BytesOut(_) => IPVS_STATS_ATTR_OUTBYTES,
            StatsAttr::Cps(_) => IPVS_STATS_ATTR_CPS,
            StatsAttr::PpsIn(_) => IPVS_STATS_ATTR_INPPS,
            StatsAttr::PpsOut(_) => IPVS_STATS_ATTR_OUTPPS,
            StatsAttr::BpsIn(_) => IPVS_STATS_ATTR_INBPS,
            StatsAttr::BpsOut(_) => IPVS_STATS_ATTR_OUTBPS,
            StatsAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            StatsAttr::BytesIn(v) | StatsAttr::BytesOut(v) => {
                buffer[..8].copy_from_slice(&v.to_ne_bytes());
            }
            StatsAttr::Connections(v)
            | StatsAttr::PacketsIn(v)
            | StatsAttr::PacketsOut(v)
            | StatsAttr::Cps(v)
            | StatsAttr::PpsIn(v)
            | StatsAttr::PpsOut(v)
            | StatsAttr::BpsIn(v)
            | StatsAttr::BpsOut(v) => buffer[..4].copy_from_slice(&v.to_ne_bytes()),
            StatsAttr::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for StatsAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_STATS_ATTR_CONNS => StatsAttr::Connections(parse_u32(payload)?),
            IPVS_STATS_ATTR_INPKTS => StatsAttr::PacketsIn(parse_u32(payload)?),
            IPVS_STATS_ATTR_OUTPKTS => StatsAttr::PacketsOut(parse_u32(payload)?),
            IPVS_STATS_ATTR_INBYTES => StatsAttr::BytesIn(parse_u64(payload)?),
            IPVS_STATS_ATTR_OUTBYTES => StatsAttr::BytesOut(parse_u64(payload)?),
            IPVS_STATS_ATTR_CPS => StatsAttr::Cps(parse_u32(payload)?),
            IPVS_STATS_ATTR_INPPS => StatsAttr::PpsIn(parse_u32(payload)?),
            IPVS_STATS_ATTR_OUTPPS => StatsAttr::PpsOut(parse_u32(payload)?),
            IPVS_STATS_ATTR_INBPS => StatsAttr::BpsIn(parse_u32(payload)?),
            IPVS_STATS_ATTR_OUTBPS => StatsAttr::BpsOut(parse_u32(payload)?),
            _ => StatsAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

/// The kernel emits the 16-byte `nf_inet_addr` union; AF_INET occupies the
/// first four bytes. Requests may carry just the four.
fn parse_inet_addr(payload: &[u8]) -> Result<Ipv4Addr, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::from(format!(
            "address attribute too short: {} bytes",
            payload.len()
        )));
    }
    Ok(Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]))
}

/// Build a [`VirtualService`] out of a parsed service attribute list.
pub fn service_from_attrs(attrs: &[SvcAttr]) -> VirtualService {
    let mut service = VirtualService {
        address: None,
        protocol: 0,
        port: 0,
        fwmark: 0,
        scheduler: String::new(),
        flags: 0,
        timeout: 0,
        stats: ServiceStats::default(),
    };
    for attr in attrs {
        match attr {
            SvcAttr::Address(ip) => service.address = Some(*ip),
            SvcAttr::Protocol(proto) => service.protocol = *proto,
            SvcAttr::Port(port) => service.port = *port,
            SvcAttr::FwMark(mark) => service.fwmark = *mark,
            SvcAttr::Scheduler(name) => service.scheduler = name.clone(),
            SvcAttr::Flags { flags, .. } => service.flags = *flags,
            SvcAttr::Timeout(timeout) => service.timeout = *timeout,
            SvcAttr::Stats(stats) => service.stats = stats_from_attrs(stats),
            _ => {}
        }
    }
    // fwmark services carry an all-zero address attribute
    if service.fwmark != 0 {
        service.address = None;
        service.protocol = 0;
    }
    service
}

pub fn destination_from_attrs(attrs: &[DestAttr]) -> Option<Destination> {
    let mut address = None;
    let mut port = 0;
    let mut weight = 1;
    let mut conn_flags = 0;
    for attr in attrs {
        match attr {
            DestAttr::Address(ip) => address = Some(*ip),
            DestAttr::Port(p) => port = *p,
            DestAttr::Weight(w) => weight = *w as i32,
            DestAttr::FwdMethod(flags) => conn_flags = *flags,
            _ => {}
        }
    }
    Some(Destination {
        address: address?,
        port,
        weight,
        conn_flags,
    })
}

fn stats_from_attrs(attrs: &[StatsAttr]) -> ServiceStats {
    let mut stats = ServiceStats::default();
    for attr in attrs {
        match attr {
            StatsAttr::Connections(v) => stats.connections = *v,
            StatsAttr::PacketsIn(v) => stats.packets_in = *v,
            StatsAttr::PacketsOut(v) => stats.packets_out = *v,
            StatsAttr::BytesIn(v) => stats.bytes_in = *v,
            StatsAttr::BytesOut(v) => stats.bytes_out = *v,
            StatsAttr::Cps(v) => stats.cps = *v,
            StatsAttr::PpsIn(v) => stats.pps_in = *v,
            StatsAttr::PpsOut(v) => stats.pps_out = *v,
            StatsAttr::BpsIn(v) => stats.bps_in = *v,
            StatsAttr::BpsOut(v) => stats.bps_out = *v,
            StatsAttr::Other(_) => {}
        }
    }
    stats
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_service_attrs_emit_and_parse() {
        let attrs = vec![
            SvcAttr::AddressFamily(AF_INET),
            SvcAttr::Protocol(6),
            SvcAttr::Address(Ipv4Addr::new(10, 0, 0, 1)),
            SvcAttr::Port(80),
            SvcAttr::Scheduler("rr".into()),
            SvcAttr::Flags {
                flags: 0,
                mask: u32::MAX,
            },
            SvcAttr::Timeout(0),
            SvcAttr::Netmask(u32::MAX),
        ];
        let mut buf = vec![0u8; attrs.as_slice().buffer_len()];
        attrs.as_slice().emit(&mut buf);

        let mut parsed = Vec::new();
        for nla in NlasIterator::new(&buf[..]) {
            parsed.push(SvcAttr::parse(&nla.unwrap()).unwrap());
        }
        assert_eq!(parsed, attrs);

        let service = service_from_attrs(&parsed);
        assert_eq!(service.address, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(service.protocol, 6);
        assert_eq!(service.port, 80);
        assert_eq!(service.scheduler, "rr");
        assert_eq!(service.fwmark, 0);
    }

    #[test]
    fn test_fwmark_service_drops_zero_address() {
        let attrs = vec![
            SvcAttr::AddressFamily(AF_INET),
            SvcAttr::Address(Ipv4Addr::UNSPECIFIED),
            SvcAttr::FwMark(1234),
            SvcAttr::Scheduler("rr".into()),
        ];
        let service = service_from_attrs(&attrs);
        assert_eq!(service.fwmark, 1234);
        assert_eq!(service.address, None);
        assert_eq!(service.protocol, 0);
    }

    #[test]
    fn test_destination_tunnel_flags_round_trip() {
        let attrs = vec![
            DestAttr::Address(Ipv4Addr::new(10, 1, 0, 2)),
            DestAttr::Port(8443),
            DestAttr::FwdMethod(crate::host::CONN_F_TUNNEL),
            DestAttr::Weight(1),
        ];
        let mut buf = vec![0u8; attrs.as_slice().buffer_len()];
        attrs.as_slice().emit(&mut buf);

        let mut parsed = Vec::new();
        for nla in NlasIterator::new(&buf[..]) {
            parsed.push(DestAttr::parse(&nla.unwrap()).unwrap());
        }
        let dst = destination_from_attrs(&parsed).unwrap();
        assert_eq!(dst.address, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!(dst.port, 8443);
        assert_eq!(dst.conn_flags, crate::host::CONN_F_TUNNEL);
    }
}
