//! sluice wire codec primitives.
//!
//! Defines the network header stamped on every datagram, the fixed
//! active-message and put sub-headers, routing-header detection for receive
//! buffers, and the packed address records exchanged between peers.

pub mod address;
pub mod dump;
pub mod error;
pub mod grh;
pub mod neth;

pub use address::{
    pack_uint24, unpack_uint24, DeviceAddress, EndpointAddress, IfaceAddress,
    DEVICE_ADDRESS_LEN, ENDPOINT_ADDRESS_LEN, IFACE_ADDRESS_LEN,
};
pub use dump::dump_packet;
pub use error::CodecError;
pub use grh::{
    destination_gid, gid_len, write_ipv4_grh, write_ipv6_grh, Gid, GRH_LEN, IPV4_GID_LEN,
    IPV6_GID_LEN, RX_SENTINEL,
};
pub use neth::{
    AmShortHeader, NetHeader, PacketFlags, PutHeader, AM_SHORT_HDR_LEN, NETH_LEN, PUT_HDR_LEN,
};
