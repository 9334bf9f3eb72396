use sluice_core::{EndpointId, QpNumber, ENDPOINT_ID_MAX};

use crate::error::{ensure_len, CodecError};
use crate::grh::Gid;

/// Packed device address length: `lid u16`, flags `u8`, gid.
pub const DEVICE_ADDRESS_LEN: usize = 2 + 1 + 16;
/// Packed interface address length: 24-bit QP number.
pub const IFACE_ADDRESS_LEN: usize = 3;
/// Packed endpoint address length: 24-bit QP number + 24-bit endpoint id.
pub const ENDPOINT_ADDRESS_LEN: usize = 3 + 3;

const DEVICE_FLAG_GLOBAL: u8 = 0x01;

/// Packs the low 24 bits of `value` big-endian.
pub fn pack_uint24(value: u32) -> [u8; 3] {
    let bytes = value.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

pub fn unpack_uint24(bytes: &[u8]) -> Result<u32, CodecError> {
    ensure_len("uint24", bytes, 3)?;
    Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
}

/// Routing information of a port: local id plus optional global id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub lid: u16,
    pub gid: Option<Gid>,
}

impl DeviceAddress {
    pub fn is_global(&self) -> bool {
        self.gid.is_some()
    }

    pub fn encode(&self) -> [u8; DEVICE_ADDRESS_LEN] {
        let mut out = [0u8; DEVICE_ADDRESS_LEN];
        out[..2].copy_from_slice(&self.lid.to_be_bytes());
        if let Some(gid) = &self.gid {
            out[2] = DEVICE_FLAG_GLOBAL;
            out[3..].copy_from_slice(&gid.0);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len("device address", bytes, DEVICE_ADDRESS_LEN)?;
        let flags = bytes[2];
        if flags & !DEVICE_FLAG_GLOBAL != 0 {
            return Err(CodecError::InvalidAddress("unknown device address flags"));
        }
        let gid = if flags & DEVICE_FLAG_GLOBAL != 0 {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes[3..DEVICE_ADDRESS_LEN]);
            Some(Gid(raw))
        } else {
            None
        };
        Ok(Self {
            lid: u16::from_be_bytes([bytes[0], bytes[1]]),
            gid,
        })
    }
}

/// Address of a remote interface's datagram queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceAddress {
    pub qpn: QpNumber,
}

impl IfaceAddress {
    pub fn encode(&self) -> [u8; IFACE_ADDRESS_LEN] {
        pack_uint24(self.qpn.0)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let qpn = unpack_uint24(bytes)?;
        Ok(Self { qpn: QpNumber(qpn) })
    }
}

/// Address of one endpoint on a remote interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    pub iface: IfaceAddress,
    pub ep_id: EndpointId,
}

impl EndpointAddress {
    pub fn encode(&self) -> [u8; ENDPOINT_ADDRESS_LEN] {
        let mut out = [0u8; ENDPOINT_ADDRESS_LEN];
        out[..3].copy_from_slice(&self.iface.encode());
        out[3..].copy_from_slice(&pack_uint24(self.ep_id.0 & ENDPOINT_ID_MAX));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len("endpoint address", bytes, ENDPOINT_ADDRESS_LEN)?;
        Ok(Self {
            iface: IfaceAddress::decode(&bytes[..3])?,
            ep_id: EndpointId(unpack_uint24(&bytes[3..])?),
        })
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::{EndpointId, QpNumber};

    use super::{pack_uint24, unpack_uint24, DeviceAddress, EndpointAddress, IfaceAddress};
    use crate::grh::Gid;

    #[test]
    fn uint24_drops_high_byte() {
        assert_eq!(pack_uint24(0x7f12_3456), [0x12, 0x34, 0x56]);
        assert_eq!(unpack_uint24(&[0x12, 0x34, 0x56]).expect("uint24"), 0x12_3456);
        assert!(unpack_uint24(&[1, 2]).is_err());
    }

    #[test]
    fn device_address_encodes_global_flag() {
        let local = DeviceAddress { lid: 9, gid: None };
        let bytes = local.encode();
        assert_eq!(bytes[2], 0);
        assert_eq!(DeviceAddress::decode(&bytes).expect("local"), local);

        let global = DeviceAddress {
            lid: 0,
            gid: Some(Gid::from_ipv4([10, 1, 2, 3])),
        };
        let decoded = DeviceAddress::decode(&global.encode()).expect("global");
        assert!(decoded.is_global());
        assert_eq!(decoded, global);
    }

    #[test]
    fn device_address_rejects_unknown_flags() {
        let mut bytes = DeviceAddress { lid: 1, gid: None }.encode();
        bytes[2] = 0x80;
        assert!(DeviceAddress::decode(&bytes).is_err());
    }

    #[test]
    fn endpoint_address_packs_two_uint24_fields() {
        let addr = EndpointAddress {
            iface: IfaceAddress { qpn: QpNumber(0x0a0b0c) },
            ep_id: EndpointId(5),
        };
        assert_eq!(addr.encode(), [0x0a, 0x0b, 0x0c, 0, 0, 5]);
        assert_eq!(EndpointAddress::decode(&addr.encode()).expect("ep addr"), addr);
    }
}
