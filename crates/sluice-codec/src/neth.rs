use sluice_core::{EndpointId, Psn, ENDPOINT_ID_MAX};

use crate::error::{ensure_len, CodecError};

/// Serialized network header length in bytes.
pub const NETH_LEN: usize = 4 + 1 + 1 + 2 + 2;
/// Serialized active-message short header length in bytes.
pub const AM_SHORT_HDR_LEN: usize = 8;
/// Serialized put header length in bytes (remote address + remote key).
pub const PUT_HDR_LEN: usize = 8 + 4;

const FLAGS_SHIFT: u32 = 24;

/// Packet flags carried in the top byte of the packet type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Packet carries an active message for `am_id`.
    pub const AM: PacketFlags = PacketFlags(0x01);
    /// Sender asks the peer to acknowledge promptly.
    pub const ACK_REQ: PacketFlags = PacketFlags(0x02);
    /// Packet carries a one-sided put.
    pub const PUT: PacketFlags = PacketFlags(0x04);

    const KNOWN: u8 = 0x07;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }

    /// True for data packets, which consume a sequence number.
    pub fn is_data(self) -> bool {
        self.contains(Self::AM) || self.contains(Self::PUT)
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// Network header stamped at the start of every datagram.
///
/// Layout (big-endian): `packet_type u32` holding the destination endpoint
/// id in the low 24 bits and flags in the high 8, then `am_id u8`, a
/// reserved byte, `psn u16`, and the piggybacked `ack_psn u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHeader {
    pub dest_ep_id: EndpointId,
    pub flags: PacketFlags,
    pub am_id: u8,
    pub psn: Psn,
    pub ack_psn: Psn,
}

impl NetHeader {
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), CodecError> {
        if out.len() < NETH_LEN {
            return Err(CodecError::Truncated {
                what: "neth",
                need: NETH_LEN,
                have: out.len(),
            });
        }
        let packet_type = (u32::from(self.flags.bits()) << FLAGS_SHIFT)
            | (self.dest_ep_id.0 & ENDPOINT_ID_MAX);
        out[0..4].copy_from_slice(&packet_type.to_be_bytes());
        out[4] = self.am_id;
        out[5] = 0;
        out[6..8].copy_from_slice(&self.psn.0.to_be_bytes());
        out[8..10].copy_from_slice(&self.ack_psn.0.to_be_bytes());
        Ok(())
    }

    pub fn encode(&self) -> [u8; NETH_LEN] {
        let mut out = [0u8; NETH_LEN];
        // The array is exactly NETH_LEN long.
        let _ = self.write_to(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len("neth", bytes, NETH_LEN)?;
        let packet_type = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flags = (packet_type >> FLAGS_SHIFT) as u8;
        if flags & !PacketFlags::KNOWN != 0 {
            return Err(CodecError::InvalidHeader("unknown packet flags"));
        }
        let flags = PacketFlags(flags);
        if flags.contains(PacketFlags::AM) && flags.contains(PacketFlags::PUT) {
            return Err(CodecError::InvalidHeader("packet is both am and put"));
        }
        Ok(Self {
            dest_ep_id: EndpointId(packet_type & ENDPOINT_ID_MAX),
            flags,
            am_id: bytes[4],
            psn: Psn(u16::from_be_bytes([bytes[6], bytes[7]])),
            ack_psn: Psn(u16::from_be_bytes([bytes[8], bytes[9]])),
        })
    }
}

/// 8-byte user header carried by short active messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmShortHeader(pub u64);

impl AmShortHeader {
    pub fn encode(&self) -> [u8; AM_SHORT_HDR_LEN] {
        self.0.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len("am short header", bytes, AM_SHORT_HDR_LEN)?;
        let mut raw = [0u8; AM_SHORT_HDR_LEN];
        raw.copy_from_slice(&bytes[..AM_SHORT_HDR_LEN]);
        Ok(Self(u64::from_be_bytes(raw)))
    }
}

/// Target of a one-sided put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutHeader {
    pub remote_addr: u64,
    pub rkey: u32,
}

impl PutHeader {
    pub fn encode(&self) -> [u8; PUT_HDR_LEN] {
        let mut out = [0u8; PUT_HDR_LEN];
        out[..8].copy_from_slice(&self.remote_addr.to_be_bytes());
        out[8..].copy_from_slice(&self.rkey.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len("put header", bytes, PUT_HDR_LEN)?;
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[..8]);
        Ok(Self {
            remote_addr: u64::from_be_bytes(addr),
            rkey: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::{EndpointId, Psn};

    use super::{AmShortHeader, NetHeader, PacketFlags, PutHeader, NETH_LEN};
    use crate::error::CodecError;

    fn am_header() -> NetHeader {
        NetHeader {
            dest_ep_id: EndpointId(0x00ab_cdef),
            flags: PacketFlags::AM | PacketFlags::ACK_REQ,
            am_id: 7,
            psn: Psn(0x1234),
            ack_psn: Psn(0xfffe),
        }
    }

    #[test]
    fn neth_layout_is_big_endian() {
        let bytes = am_header().encode();
        assert_eq!(bytes.len(), NETH_LEN);
        assert_eq!(&bytes[0..4], &[0x03, 0xab, 0xcd, 0xef]);
        assert_eq!(bytes[4], 7);
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[6..8], &[0x12, 0x34]);
        assert_eq!(&bytes[8..10], &[0xff, 0xfe]);
        assert_eq!(NetHeader::decode(&bytes).expect("decode"), am_header());
    }

    #[test]
    fn neth_rejects_short_and_contradictory_input() {
        let err = NetHeader::decode(&[0u8; 9]).expect_err("short neth must fail");
        assert_eq!(
            err,
            CodecError::Truncated {
                what: "neth",
                need: 10,
                have: 9
            }
        );

        let mut bytes = am_header().encode();
        bytes[0] = 0x05;
        assert_eq!(
            NetHeader::decode(&bytes).expect_err("am+put must fail"),
            CodecError::InvalidHeader("packet is both am and put")
        );
        bytes[0] = 0x80;
        assert!(NetHeader::decode(&bytes).is_err());
    }

    #[test]
    fn control_packets_are_not_data() {
        assert!(!PacketFlags::ACK_REQ.is_data());
        assert!(!PacketFlags::NONE.is_data());
        assert!(PacketFlags::PUT.is_data());
        let mut flags = PacketFlags::AM;
        flags.insert(PacketFlags::ACK_REQ);
        flags.remove(PacketFlags::AM);
        assert_eq!(flags, PacketFlags::ACK_REQ);
    }

    #[test]
    fn sub_headers_decode_what_they_encode() {
        let am = AmShortHeader(0x0102_0304_0506_0708);
        assert_eq!(am.encode()[0], 0x01);
        assert_eq!(AmShortHeader::decode(&am.encode()).expect("am hdr"), am);

        let put = PutHeader {
            remote_addr: 0x1000,
            rkey: 42,
        };
        assert_eq!(PutHeader::decode(&put.encode()).expect("put hdr"), put);
        assert!(PutHeader::decode(&[0u8; 11]).is_err());
    }
}
