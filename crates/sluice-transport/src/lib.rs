//! Datagram substrate seams for sluice.
//!
//! `DatagramDevice` is the submission/poll/arm contract the engine drives,
//! `MemoryDomain` supplies registration keys and one-sided landing zones, and
//! `LoopbackFabric` implements both in memory for tests and tooling.

pub mod device;
pub mod error;
pub mod loopback;
pub mod memory;

pub use device::{
    AddressHandle, AhAttr, DatagramDevice, DeviceCaps, DeviceHealthSnapshot, Direction,
    RecvBuffer, RxCompletion, SendRequest, Sge, TxCompletion, WcStatus,
};
pub use error::DeviceError;
pub use loopback::{DeviceOptions, FabricStats, GidFormat, LoopbackDevice, LoopbackFabric};
pub use memory::{HeapDomain, MemoryDomain, RemoteRegion};
