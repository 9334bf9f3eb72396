use std::fmt::Write;

use crate::neth::{NetHeader, PacketFlags, PutHeader, NETH_LEN};

const PAYLOAD_PREVIEW: usize = 16;

/// Renders a one-line description of a datagram starting at its network
/// header, for packet trace logs.
pub fn dump_packet(packet: &[u8]) -> String {
    let neth = match NetHeader::decode(packet) {
        Ok(neth) => neth,
        Err(err) => return format!("<malformed: {err}>"),
    };
    let mut out = format!(
        "ep {} psn {} ack_psn {}",
        neth.dest_ep_id.0, neth.psn, neth.ack_psn
    );
    let body = &packet[NETH_LEN..];
    if neth.flags.contains(PacketFlags::AM) {
        let _ = write!(out, " am {}", neth.am_id);
    } else if neth.flags.contains(PacketFlags::PUT) {
        match PutHeader::decode(body) {
            Ok(put) => {
                let _ = write!(out, " put 0x{:x} rkey {}", put.remote_addr, put.rkey);
            }
            Err(_) => out.push_str(" put <truncated>"),
        }
    } else {
        out.push_str(" ctl");
    }
    if neth.flags.contains(PacketFlags::ACK_REQ) {
        out.push_str(" ack_req");
    }
    if !body.is_empty() {
        let preview = &body[..body.len().min(PAYLOAD_PREVIEW)];
        let _ = write!(out, " len {} [{}]", body.len(), hex::encode(preview));
    }
    out
}
