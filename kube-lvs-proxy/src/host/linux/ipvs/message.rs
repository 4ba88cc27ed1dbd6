//! IPVS as a generic-netlink family.

use netlink_packet_generic::{GenlFamily, GenlHeader};
use netlink_packet_utils::DecodeError;
use netlink_packet_utils::nla::NlasIterator;
use netlink_packet_utils::traits::{Emitable, Parseable, ParseableParametrized};

use super::constants::{IPVS_GENL_NAME, IPVS_GENL_VERSION};
use super::nlas::IpvsNla;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IpvsCmd {
    NewService = 1,
    SetService = 2,
    DelService = 3,
    GetService = 4,
    NewDest = 5,
    SetDest = 6,
    DelDest = 7,
    GetDest = 8,
    Flush = 17,
}

impl TryFrom<u8> for IpvsCmd {
    type Error = DecodeError;

    fn try_from(cmd: u8) -> Result<Self, Self::Error> {
        Ok(match cmd {
            1 => IpvsCmd::NewService,
            2 => IpvsCmd::SetService,
            3 => IpvsCmd::DelService,
            4 => IpvsCmd::GetService,
            5 => IpvsCmd::NewDest,
            6 => IpvsCmd::SetDest,
            7 => IpvsCmd::DelDest,
            8 => IpvsCmd::GetDest,
            17 => IpvsCmd::Flush,
            other => {
                return Err(DecodeError::from(format!(
                    "unknown IPVS command: {other}"
                )));
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpvsCtrl {
    pub cmd: IpvsCmd,
    pub nlas: Vec<IpvsNla>,
}

impl GenlFamily for IpvsCtrl {
    fn family_name() -> &'static str {
        IPVS_GENL_NAME
    }

    fn command(&self) -> u8 {
        self.cmd as u8
    }

    fn version(&self) -> u8 {
        IPVS_GENL_VERSION
    }
}

impl Emitable for IpvsCtrl {
    fn buffer_len(&self) -> usize {
        self.nlas.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.nlas.as_slice().emit(buffer)
    }
}

impl ParseableParametrized<[u8], GenlHeader> for IpvsCtrl {
    fn parse_with_param(buf: &[u8], header: GenlHeader) -> Result<Self, DecodeError> {
        let mut nlas = Vec::new();
        for nla in NlasIterator::new(buf) {
            nlas.push(IpvsNla::parse(&nla?)?);
        }
        Ok(Self {
            cmd: IpvsCmd::try_from(header.cmd)?,
            nlas,
        })
    }
}
