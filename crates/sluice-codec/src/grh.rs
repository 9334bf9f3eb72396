use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ensure_len, CodecError};

/// Routing-header area reserved at the start of every receive buffer.
pub const GRH_LEN: usize = 40;
/// Value seeded into byte 0 of every receive buffer before posting.
pub const RX_SENTINEL: u8 = 0xff;
pub const IPV6_GID_LEN: usize = 16;
pub const IPV4_GID_LEN: usize = 4;

const IPV4_HDR_OFFSET: usize = 20;
const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// 128-bit global identifier of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// IPv4-mapped gid (`::ffff:a.b.c.d`).
    pub fn from_ipv4(addr: [u8; 4]) -> Self {
        let mut raw = [0u8; 16];
        raw[..12].copy_from_slice(&IPV4_MAPPED_PREFIX);
        raw[12..].copy_from_slice(&addr);
        Self(raw)
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        self.0[..12] == IPV4_MAPPED_PREFIX
    }

    pub fn ipv4_octets(&self) -> [u8; 4] {
        [self.0[12], self.0[13], self.0[14], self.0[15]]
    }

    /// Compares against a destination gid read from a routing header, which
    /// is either a full 16-byte gid or the 4-byte IPv4 address.
    pub fn matches(&self, dgid: &[u8]) -> bool {
        match dgid.len() {
            IPV6_GID_LEN => self.0[..] == *dgid,
            IPV4_GID_LEN => self.is_ipv4_mapped() && self.0[12..] == *dgid,
            _ => false,
        }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, pair) in self.0.chunks(2).enumerate() {
            if idx > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}", hex::encode(pair))?;
        }
        Ok(())
    }
}

/// Length of the destination gid implied by the first byte of a receive
/// buffer.
///
/// An IPv6 routing header starts with version nibble `0x6` at offset 0. An
/// IPv4 header starts at offset 20 and leaves byte 0 untouched, so the posted
/// sentinel survives and selects the IPv4 length.
pub fn gid_len(packet: &[u8]) -> usize {
    match packet.first() {
        Some(byte) if byte & 0xf0 == 0x60 => IPV6_GID_LEN,
        _ => IPV4_GID_LEN,
    }
}

/// Destination gid bytes, which end exactly at the routing-header boundary.
pub fn destination_gid(packet: &[u8], gid_len: usize) -> Result<&[u8], CodecError> {
    ensure_len("grh", packet, GRH_LEN)?;
    if gid_len != IPV6_GID_LEN && gid_len != IPV4_GID_LEN {
        return Err(CodecError::InvalidHeader("unsupported gid length"));
    }
    Ok(&packet[GRH_LEN - gid_len..GRH_LEN])
}

/// Writes an IPv6-style routing header into the first `GRH_LEN` bytes.
pub fn write_ipv6_grh(out: &mut [u8], sgid: &Gid, dgid: &Gid, payload_len: u16) {
    out[..GRH_LEN].fill(0);
    out[0] = 0x60;
    out[4..6].copy_from_slice(&payload_len.to_be_bytes());
    out[6] = 0x1b;
    out[7] = 0x40;
    out[8..24].copy_from_slice(&sgid.0);
    out[24..40].copy_from_slice(&dgid.0);
}

/// Writes an IPv4 header at offset 20, leaving bytes `0..20` as posted.
pub fn write_ipv4_grh(out: &mut [u8], sgid: &Gid, dgid: &Gid, payload_len: u16) {
    let hdr = &mut out[IPV4_HDR_OFFSET..GRH_LEN];
    hdr.fill(0);
    hdr[0] = 0x45;
    let total = payload_len.saturating_add(20);
    hdr[2..4].copy_from_slice(&total.to_be_bytes());
    hdr[8] = 0x40;
    hdr[9] = 0x11;
    hdr[12..16].copy_from_slice(&sgid.ipv4_octets());
    hdr[16..20].copy_from_slice(&dgid.ipv4_octets());
}

#[cfg(test)]
mod tests {
    use super::{
        destination_gid, gid_len, write_ipv4_grh, write_ipv6_grh, Gid, GRH_LEN, IPV4_GID_LEN,
        IPV6_GID_LEN, RX_SENTINEL,
    };

    fn gid(last: u8) -> Gid {
        let mut raw = [0xfe; 16];
        raw[15] = last;
        Gid(raw)
    }

    #[test]
    fn sentinel_selects_ipv4_length() {
        let mut buf = [0u8; GRH_LEN];
        buf[0] = RX_SENTINEL;
        assert_eq!(gid_len(&buf), IPV4_GID_LEN);
        buf[0] = 0x6f;
        assert_eq!(gid_len(&buf), IPV6_GID_LEN);
        assert_eq!(gid_len(&[]), IPV4_GID_LEN);
    }

    #[test]
    fn ipv6_grh_exposes_destination_gid() {
        let mut buf = [RX_SENTINEL; GRH_LEN + 4];
        write_ipv6_grh(&mut buf, &gid(1), &gid(2), 4);
        let len = gid_len(&buf);
        assert_eq!(len, IPV6_GID_LEN);
        let dgid = destination_gid(&buf, len).expect("dgid");
        assert!(gid(2).matches(dgid));
        assert!(!gid(1).matches(dgid));
    }

    #[test]
    fn ipv4_grh_keeps_sentinel_and_matches_mapped_gid() {
        let mut buf = [RX_SENTINEL; GRH_LEN];
        let local = Gid::from_ipv4([10, 0, 0, 2]);
        write_ipv4_grh(&mut buf, &Gid::from_ipv4([10, 0, 0, 1]), &local, 0);
        assert_eq!(buf[0], RX_SENTINEL);
        assert_eq!(buf[20], 0x45);
        let len = gid_len(&buf);
        let dgid = destination_gid(&buf, len).expect("dgid");
        assert_eq!(dgid, &[10, 0, 0, 2]);
        assert!(local.matches(dgid));
        assert!(!gid(2).matches(dgid));
    }

    #[test]
    fn destination_gid_requires_full_grh() {
        assert!(destination_gid(&[0u8; 39], IPV6_GID_LEN).is_err());
        assert!(destination_gid(&[0u8; 40], 8).is_err());
    }

    #[test]
    fn gid_display_groups_hex_pairs() {
        let text = Gid::from_ipv4([192, 168, 0, 1]).to_string();
        assert_eq!(text, "0000:0000:0000:0000:0000:ffff:c0a8:0001");
    }
}
