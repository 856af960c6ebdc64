// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-endpoint buffer-pair records and the arena that owns them.
//!
//! One record exists per physical endpoint number. OUT endpoints carry a
//! byte queue plus a packet-sized staging buffer -- the staging area
//! exists because the transport primitive can only receive one whole
//! packet into a contiguous area no smaller than the maximum packet
//! size. IN endpoints carry a block queue. Endpoints may instead be
//! configured unbuffered, in which case foreground calls drive the
//! transport directly and block for completion.
//!
//! The arena is a plain fixed-capacity array owned by the device object
//! and indexed by endpoint number; there are no process-wide endpoint
//! tables.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::descriptor::UsbTransferType;
use crate::fifo::{BlockFifo, ByteFifo};
use crate::setup::UsbDir;
use crate::{USB_ENDPOINTS, USB_EP_SIZE, USB_RX_SIZE, USB_TX_BLOCKS};

/// Endpoint number of an address byte.
pub const fn ep_number(ep_addr: u8) -> u8 {
    ep_addr & 0xF
}

/// Composition-time description of one endpoint. Immutable once the
/// device is built.
#[derive(Copy, Clone, Debug)]
pub struct EndpointConfig {
    /// Endpoint number, 1..USB_ENDPOINTS. Endpoint 0 is implicit.
    pub number: u8,
    pub direction: UsbDir,
    pub kind: UsbTransferType,
    /// Buffered endpoints get the queue described above; unbuffered
    /// endpoints perform direct blocking transfers with no intermediate
    /// copy.
    pub buffered: bool,
}

impl EndpointConfig {
    pub const fn bulk_in(number: u8) -> Self {
        EndpointConfig {
            number,
            direction: UsbDir::In,
            kind: UsbTransferType::Bulk,
            buffered: true,
        }
    }

    pub const fn bulk_out(number: u8) -> Self {
        EndpointConfig {
            number,
            direction: UsbDir::Out,
            kind: UsbTransferType::Bulk,
            buffered: true,
        }
    }

    pub const fn interrupt_in(number: u8) -> Self {
        EndpointConfig {
            number,
            direction: UsbDir::In,
            kind: UsbTransferType::Interrupt,
            buffered: true,
        }
    }

    /// The endpoint address byte.
    pub const fn address(&self) -> u8 {
        self.direction.endpoint(self.number)
    }
}

/// Byte storage handed back and forth between the completion context and
/// foreground code: the staging area a received packet is copied into,
/// or the control-side assembly buffers. Exactly one side owns the
/// contents at any given time; ownership is tracked externally by the
/// endpoint's pending bit and remainder counters.
pub(crate) struct HandoffBuffer<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

// Safety: accesses are serialized by the owning record's state, see the
// type documentation. The accessors are unsafe and each call site states
// why it is the owner at that point.
unsafe impl<const N: usize> Sync for HandoffBuffer<N> {}

impl<const N: usize> HandoffBuffer<N> {
    pub fn new() -> Self {
        HandoffBuffer {
            bytes: UnsafeCell::new([0; N]),
        }
    }

    /// # Safety
    /// The caller must be the current owner per the record's state and
    /// must not let the reference escape the ownership window.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut [u8; N] {
        &mut *self.bytes.get()
    }

    /// # Safety
    /// The caller must know that no writer owns the buffer right now.
    pub unsafe fn get(&self) -> &[u8; N] {
        &*self.bytes.get()
    }
}

/// Receive side of a buffered OUT endpoint.
pub(crate) struct RxRecord {
    /// Arrival-ordered bytes for the foreground consumer. The completion
    /// context is the producer.
    pub queue: ByteFifo<USB_RX_SIZE>,
    /// The transport's reception target.
    pub staging: HandoffBuffer<USB_EP_SIZE>,
    /// Read offset of a packet remainder parked in `staging` because the
    /// queue was too full to absorb it. While a remainder is parked the
    /// endpoint is deliberately left un-armed so the host gets NAKed.
    pub staged_off: AtomicUsize,
    /// Remaining parked bytes.
    pub staged_len: AtomicUsize,
}

impl RxRecord {
    fn new() -> Self {
        RxRecord {
            queue: ByteFifo::new(),
            staging: HandoffBuffer::new(),
            staged_off: AtomicUsize::new(0),
            staged_len: AtomicUsize::new(0),
        }
    }

    pub fn reset(&self) {
        self.queue.clear();
        self.staged_off.store(0, Ordering::Release);
        self.staged_len.store(0, Ordering::Release);
    }
}

/// Transmit side of a buffered IN endpoint.
pub(crate) struct TxRecord {
    /// Sealed blocks waiting for the wire. Foreground is the producer;
    /// the completion context consumes.
    pub queue: BlockFifo<USB_TX_BLOCKS, USB_EP_SIZE>,
    /// Set while foreground code is mid-append; the completion path must
    /// not auto-seal the head block during that window.
    pub commit_lock: AtomicBool,
    /// Total length of the in-flight submission (may span two coalesced
    /// blocks).
    pub inflight_len: AtomicUsize,
    /// Bytes of the in-flight submission already handed to the driver.
    pub inflight_off: AtomicUsize,
    /// Size of the most recent chunk the driver accepted; decides the
    /// trailing zero-length packet.
    pub inflight_chunk: AtomicUsize,
    /// Sealed blocks covered by the in-flight submission (1 or 2).
    pub inflight_blocks: AtomicUsize,
}

impl TxRecord {
    fn new() -> Self {
        TxRecord {
            queue: BlockFifo::new(),
            commit_lock: AtomicBool::new(false),
            inflight_len: AtomicUsize::new(0),
            inflight_off: AtomicUsize::new(0),
            inflight_chunk: AtomicUsize::new(0),
            inflight_blocks: AtomicUsize::new(0),
        }
    }

    pub fn reset(&self) {
        self.queue.clear();
        self.commit_lock.store(false, Ordering::Release);
        self.inflight_len.store(0, Ordering::Release);
        self.inflight_off.store(0, Ordering::Release);
        self.inflight_chunk.store(0, Ordering::Release);
        self.inflight_blocks.store(0, Ordering::Release);
    }
}

/// State for an unbuffered endpoint: the only thing to remember is the
/// size of the packet the transport last completed, which the blocked
/// foreground call picks up.
pub(crate) struct DirectRecord {
    pub pending_bytes: AtomicUsize,
}

impl DirectRecord {
    fn new() -> Self {
        DirectRecord {
            pending_bytes: AtomicUsize::new(0),
        }
    }

    pub fn reset(&self) {
        self.pending_bytes.store(0, Ordering::Release);
    }
}

pub(crate) enum SlotBuffer {
    /// No endpoint configured at this number.
    Unused,
    Rx(RxRecord),
    Tx(TxRecord),
    Direct(DirectRecord),
}

pub(crate) struct EndpointSlot {
    pub config: Option<EndpointConfig>,
    pub buffer: SlotBuffer,
}

/// Fixed-capacity arena of endpoint records, indexed by endpoint number.
pub(crate) struct EndpointArena {
    pub slots: [EndpointSlot; USB_ENDPOINTS],
}

impl EndpointArena {
    /// Builds the arena from the composition-time endpoint table.
    /// Returns `None` for an endpoint number out of range, a duplicate,
    /// or an attempt to configure endpoint 0.
    pub fn new(configs: &[EndpointConfig]) -> Option<Self> {
        let mut slots: [EndpointSlot; USB_ENDPOINTS] = core::array::from_fn(|_| EndpointSlot {
            config: None,
            buffer: SlotBuffer::Unused,
        });
        for &config in configs {
            let n = config.number as usize;
            if n == 0 || n >= USB_ENDPOINTS {
                return None;
            }
            if slots[n].config.is_some() {
                return None;
            }
            slots[n].buffer = match (config.buffered, config.direction) {
                (true, UsbDir::Out) => SlotBuffer::Rx(RxRecord::new()),
                (true, UsbDir::In) => SlotBuffer::Tx(TxRecord::new()),
                (false, _) => SlotBuffer::Direct(DirectRecord::new()),
            };
            slots[n].config = Some(config);
        }
        Some(EndpointArena { slots })
    }

    pub fn config(&self, ep_num: u8) -> Option<&EndpointConfig> {
        self.slots
            .get(ep_num as usize)
            .and_then(|s| s.config.as_ref())
    }

    pub fn rx(&self, ep_num: u8) -> Option<&RxRecord> {
        match &self.slots.get(ep_num as usize)?.buffer {
            SlotBuffer::Rx(rx) => Some(rx),
            _ => None,
        }
    }

    pub fn tx(&self, ep_num: u8) -> Option<&TxRecord> {
        match &self.slots.get(ep_num as usize)?.buffer {
            SlotBuffer::Tx(tx) => Some(tx),
            _ => None,
        }
    }

    pub fn direct(&self, ep_num: u8) -> Option<&DirectRecord> {
        match &self.slots.get(ep_num as usize)?.buffer {
            SlotBuffer::Direct(d) => Some(d),
            _ => None,
        }
    }

    /// Clears every record's queues and counters; used on detach and
    /// reconfiguration.
    pub fn reset_all(&self) {
        for slot in &self.slots {
            match &slot.buffer {
                SlotBuffer::Rx(rx) => rx.reset(),
                SlotBuffer::Tx(tx) => tx.reset(),
                SlotBuffer::Direct(d) => d.reset(),
                SlotBuffer::Unused => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_rejects_bad_tables() {
        assert!(EndpointArena::new(&[EndpointConfig::bulk_in(0)]).is_none());
        assert!(EndpointArena::new(&[EndpointConfig::bulk_in(USB_ENDPOINTS as u8)]).is_none());
        assert!(EndpointArena::new(&[
            EndpointConfig::bulk_in(1),
            EndpointConfig::bulk_out(1),
        ])
        .is_none());
    }

    #[test]
    fn arena_places_records_by_direction() {
        let arena = EndpointArena::new(&[
            EndpointConfig::bulk_out(1),
            EndpointConfig::bulk_in(2),
            EndpointConfig {
                number: 3,
                direction: UsbDir::Out,
                kind: UsbTransferType::Bulk,
                buffered: false,
            },
        ])
        .unwrap();
        assert!(arena.rx(1).is_some());
        assert!(arena.tx(1).is_none());
        assert!(arena.tx(2).is_some());
        assert!(arena.direct(3).is_some());
        assert!(arena.config(4).is_none());
        assert_eq!(arena.config(2).unwrap().address(), 0x82);
    }
}
