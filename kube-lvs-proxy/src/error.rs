use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Listing IPVS, netlink or iptables itself failed; the current sync
    /// sub-step is abandoned but later steps still run.
    #[error("kernel state unavailable: {0}")]
    KernelUnavailable(String),

    #[error("object already exists")]
    AlreadyExists,

    #[error("no such address")]
    NoSuchAddress,

    #[error("DSR setup failed for {ip}: {reason}")]
    DsrSetupFailed { ip: Ipv4Addr, reason: String },

    #[error("firewall mark space exhausted")]
    MarkExhausted,

    #[error("no service registered for firewall mark {0}")]
    UnknownFwMark(u32),

    /// A kernel object cannot be reconciled, e.g. an IPVS protocol number
    /// with no textual mapping.
    #[error("invalid kernel state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("addr parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<netlink_packet_utils::DecodeError> for Error {
    fn from(err: netlink_packet_utils::DecodeError) -> Self {
        Self::Netlink(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
