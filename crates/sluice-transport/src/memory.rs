use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use sluice_core::MemoryKey;

use crate::error::DeviceError;

/// Remotely writable region published to a peer for one-sided puts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub addr: u64,
    pub rkey: MemoryKey,
    pub len: usize,
}

/// Memory registration capability backing send buffers and put targets.
pub trait MemoryDomain: Send {
    /// Registers a local buffer of `len` bytes and returns its key.
    fn register(&mut self, len: usize) -> Result<MemoryKey, DeviceError>;
    fn deregister(&mut self, key: MemoryKey) -> Result<(), DeviceError>;
    /// True if `key` covers at least `len` bytes.
    fn is_registered(&self, key: MemoryKey, len: usize) -> bool;

    /// Allocates a zeroed region that remote puts may target.
    fn alloc_region(&mut self, len: usize) -> Result<RemoteRegion, DeviceError>;
    fn write(&mut self, rkey: MemoryKey, addr: u64, data: &[u8]) -> Result<(), DeviceError>;
    fn read(&self, rkey: MemoryKey, addr: u64, len: usize) -> Result<Vec<u8>, DeviceError>;
}

const REGION_BASE: u64 = 0x1000;
const REGION_ALIGN: u64 = 64;

#[derive(Debug)]
struct Registration {
    len: usize,
    region: Option<(u64, Vec<u8>)>,
}

#[derive(Debug)]
struct HeapState {
    next_key: u32,
    next_addr: u64,
    registrations: HashMap<u32, Registration>,
}

/// Heap-backed memory domain; clones share one registration table.
#[derive(Debug, Clone)]
pub struct HeapDomain {
    state: Arc<Mutex<HeapState>>,
}

impl Default for HeapDomain {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(HeapState {
                next_key: 1,
                next_addr: REGION_BASE,
                registrations: HashMap::new(),
            })),
        }
    }
}

impl HeapDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registrations
            .len()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HeapState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl HeapState {
    fn insert(&mut self, registration: Registration) -> MemoryKey {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        self.registrations.insert(key, registration);
        MemoryKey(key)
    }

    fn region_slice(
        &mut self,
        rkey: MemoryKey,
        addr: u64,
        len: usize,
    ) -> Result<&mut [u8], DeviceError> {
        let registration = self
            .registrations
            .get_mut(&rkey.0)
            .ok_or(DeviceError::InvalidKey(rkey.0))?;
        let (base, bytes) = registration
            .region
            .as_mut()
            .ok_or(DeviceError::InvalidKey(rkey.0))?;
        let offset = addr
            .checked_sub(*base)
            .ok_or(DeviceError::OutOfBounds { addr, len })? as usize;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or(DeviceError::OutOfBounds { addr, len })?;
        Ok(&mut bytes[offset..end])
    }
}

impl MemoryDomain for HeapDomain {
    fn register(&mut self, len: usize) -> Result<MemoryKey, DeviceError> {
        Ok(self.with_state(|state| state.insert(Registration { len, region: None })))
    }

    fn deregister(&mut self, key: MemoryKey) -> Result<(), DeviceError> {
        self.with_state(|state| {
            state
                .registrations
                .remove(&key.0)
                .map(|_| ())
                .ok_or(DeviceError::InvalidKey(key.0))
        })
    }

    fn is_registered(&self, key: MemoryKey, len: usize) -> bool {
        self.with_state(|state| {
            state
                .registrations
                .get(&key.0)
                .is_some_and(|registration| registration.len >= len)
        })
    }

    fn alloc_region(&mut self, len: usize) -> Result<RemoteRegion, DeviceError> {
        if len == 0 {
            return Err(DeviceError::InvalidRequest("empty region"));
        }
        Ok(self.with_state(|state| {
            let addr = state.next_addr;
            let span = (len as u64).div_ceil(REGION_ALIGN) * REGION_ALIGN;
            state.next_addr = addr + span;
            let rkey = state.insert(Registration {
                len,
                region: Some((addr, vec![0u8; len])),
            });
            RemoteRegion { addr, rkey, len }
        }))
    }

    fn write(&mut self, rkey: MemoryKey, addr: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.with_state(|state| {
            state
                .region_slice(rkey, addr, data.len())?
                .copy_from_slice(data);
            Ok(())
        })
    }

    fn read(&self, rkey: MemoryKey, addr: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.with_state(|state| Ok(state.region_slice(rkey, addr, len)?.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::MemoryKey;

    use super::{HeapDomain, MemoryDomain};
    use crate::error::DeviceError;

    #[test]
    fn registration_checks_length_and_key() {
        let mut domain = HeapDomain::new();
        let key = domain.register(64).expect("register");
        assert!(key.is_registered());
        assert!(domain.is_registered(key, 64));
        assert!(!domain.is_registered(key, 65));
        assert!(!domain.is_registered(MemoryKey(999), 1));

        domain.deregister(key).expect("deregister");
        assert!(!domain.is_registered(key, 1));
        assert_eq!(
            domain.deregister(key).expect_err("double deregister"),
            DeviceError::InvalidKey(key.0)
        );
    }

    #[test]
    fn region_writes_are_bounds_checked() {
        let mut domain = HeapDomain::new();
        let region = domain.alloc_region(16).expect("region");
        domain
            .write(region.rkey, region.addr + 4, b"abcd")
            .expect("write inside region");
        assert_eq!(
            domain.read(region.rkey, region.addr + 4, 4).expect("read"),
            b"abcd".to_vec()
        );
        assert!(matches!(
            domain.write(region.rkey, region.addr + 14, b"abcd"),
            Err(DeviceError::OutOfBounds { .. })
        ));
        assert!(domain.write(region.rkey, region.addr - 1, b"a").is_err());
    }

    #[test]
    fn clones_share_registrations() {
        let mut domain = HeapDomain::new();
        let shared = domain.clone();
        let key = domain.register(8).expect("register");
        assert!(shared.is_registered(key, 8));
        assert_eq!(shared.registered_keys(), 1);
    }

    #[test]
    fn plain_registration_is_not_a_put_target() {
        let mut domain = HeapDomain::new();
        let key = domain.register(8).expect("register");
        assert_eq!(
            domain.write(key, 0x1000, b"x").expect_err("no region"),
            DeviceError::InvalidKey(key.0)
        );
    }
}
