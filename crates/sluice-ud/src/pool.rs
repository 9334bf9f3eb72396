use sluice_codec::RX_SENTINEL;
use sluice_core::{MemoryKey, Psn};
use sluice_transport::RecvBuffer;

use crate::error::fatal;
use crate::types::ZcopyDesc;

/// Index of a send buffer in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkbId(usize);

/// Send buffer descriptor. Holds the whole packet from the network header
/// on; zero-copy sends keep their payload in `zcopy` instead.
#[derive(Debug)]
pub(crate) struct Skb {
    pub(crate) data: Vec<u8>,
    pub(crate) len: usize,
    pub(crate) psn: Psn,
    /// Submission sequence number of the latest post of this packet.
    pub(crate) sn: u64,
    pub(crate) inline: bool,
    pub(crate) zcopy: Option<ZcopyDesc>,
}

impl Skb {
    pub(crate) fn packet(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Fixed arena of send buffers behind a free list.
#[derive(Debug)]
pub(crate) struct SkbPool {
    slots: Vec<Skb>,
    checked_out: Vec<bool>,
    free: Vec<SkbId>,
    lkey: MemoryKey,
}

impl SkbPool {
    pub(crate) fn new(count: usize, seg_size: usize, lkey: MemoryKey) -> Self {
        let slots = (0..count)
            .map(|_| Skb {
                data: vec![0u8; seg_size],
                len: 0,
                psn: Psn::default(),
                sn: 0,
                inline: false,
                zcopy: None,
            })
            .collect();
        Self {
            slots,
            checked_out: vec![false; count],
            free: (0..count).rev().map(SkbId).collect(),
            lkey,
        }
    }

    pub(crate) fn lkey(&self) -> MemoryKey {
        self.lkey
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn acquire(&mut self) -> Option<SkbId> {
        let id = self.free.pop()?;
        self.checked_out[id.0] = true;
        let skb = &mut self.slots[id.0];
        skb.len = 0;
        skb.inline = false;
        skb.zcopy = None;
        Some(id)
    }

    pub(crate) fn release(&mut self, id: SkbId) {
        if !self.checked_out[id.0] {
            fatal(format_args!("send buffer {} released twice", id.0));
        }
        self.checked_out[id.0] = false;
        self.slots[id.0].zcopy = None;
        self.free.push(id);
    }

    pub(crate) fn get(&self, id: SkbId) -> &Skb {
        &self.slots[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: SkbId) -> &mut Skb {
        &mut self.slots[id.0]
    }
}

/// Receive buffers and the count of posting slots not yet filled.
#[derive(Debug)]
pub(crate) struct RecvPool {
    free: Vec<Vec<u8>>,
    buf_len: usize,
    available: usize,
    next_id: usize,
}

impl RecvPool {
    pub(crate) fn new(queue_len: usize, buf_len: usize) -> Self {
        Self {
            free: Vec::with_capacity(queue_len),
            buf_len,
            available: queue_len,
            next_id: 0,
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.available
    }

    pub(crate) fn add_available(&mut self, n: usize) {
        self.available += n;
    }

    /// Takes up to `max` buffers for posting, each seeded with the sentinel.
    pub(crate) fn take_batch(&mut self, max: usize) -> Vec<RecvBuffer> {
        let count = max.min(self.available);
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            let mut data = self
                .free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.buf_len]);
            data[0] = RX_SENTINEL;
            batch.push(RecvBuffer {
                id: self.next_id,
                data,
            });
            self.next_id = self.next_id.wrapping_add(1);
        }
        self.available -= count;
        batch
    }

    /// Buffers returned and waiting to be posted again.
    #[cfg(test)]
    pub(crate) fn recycled(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn recycle(&mut self, buffer: RecvBuffer) {
        if buffer.data.len() == self.buf_len {
            self.free.push(buffer.data);
        }
    }
}
