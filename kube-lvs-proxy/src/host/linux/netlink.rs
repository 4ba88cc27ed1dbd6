//! Blocking request/response plumbing shared by the IPVS and route netlink
//! clients.

use std::fmt::Debug;

use netlink_packet_core::{
    NLM_F_MULTIPART, NetlinkDeserializable, NetlinkMessage, NetlinkPayload, NetlinkSerializable,
};
use netlink_sys::Socket;

use crate::error::{Error, Result};

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const ESRCH: i32 = 3;
const EEXIST: i32 = 17;
const ENODEV: i32 = 19;
const EADDRNOTAVAIL: i32 = 99;

/// Send one finalized message and drain the kernel's reply. Returns the
/// inner messages of a dump, or an empty vec for a plain ack.
pub(crate) fn request<T>(socket: &Socket, mut message: NetlinkMessage<T>) -> Result<Vec<T>>
where
    T: NetlinkSerializable + NetlinkDeserializable + Debug,
{
    message.finalize();
    let mut send_buf = vec![0u8; message.buffer_len()];
    message.serialize(&mut send_buf);
    socket.send(&send_buf, 0)?;

    let mut inner = Vec::new();
    let mut recv_buf = vec![0u8; 64 * 1024];
    loop {
        let len = socket.recv(&mut &mut recv_buf[..], 0)?;
        if len == 0 {
            return Ok(inner);
        }
        let mut offset = 0;
        while offset < len {
            let reply = NetlinkMessage::<T>::deserialize(&recv_buf[offset..len])
                .map_err(|e| Error::Netlink(e.to_string()))?;
            let reply_len = reply.header.length as usize;
            let multipart = reply.header.flags & NLM_F_MULTIPART != 0;
            match reply.payload {
                NetlinkPayload::Done(_) => return Ok(inner),
                NetlinkPayload::Error(err) => {
                    return match err.code {
                        // code 0 is the ack
                        None => Ok(inner),
                        Some(code) => Err(errno_to_error(-code.get())),
                    };
                }
                NetlinkPayload::Overrun(_) => {
                    return Err(Error::Netlink("receive buffer overrun".into()));
                }
                NetlinkPayload::InnerMessage(msg) => {
                    inner.push(msg);
                    if !multipart {
                        return Ok(inner);
                    }
                }
                _ => {}
            }
            if reply_len == 0 {
                return Ok(inner);
            }
            offset += reply_len;
        }
    }
}

/// Map the errnos that carry meaning for idempotent convergence onto typed
/// errors; everything else stays an opaque netlink failure.
fn errno_to_error(errno: i32) -> Error {
    match errno {
        EEXIST => Error::AlreadyExists,
        ENOENT | ESRCH | ENODEV | EADDRNOTAVAIL => Error::NoSuchAddress,
        EPERM => Error::Netlink("operation not permitted (need CAP_NET_ADMIN)".into()),
        other => Error::Netlink(format!("kernel returned errno {other}")),
    }
}
