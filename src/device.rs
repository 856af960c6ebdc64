// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device object: enumeration state, the per-endpoint Idle/Pending
//! synchronization rules, and the foreground stream API.
//!
//! Exactly two logical actors touch this state: the transport's
//! completion context (through [`UsbDevice::handle_setup`],
//! [`UsbDevice::ep_out_complete`], [`UsbDevice::ep_in_complete`] and
//! [`UsbDevice::handle_reset`]) and everything else (the stream API).
//! Each endpoint is either `Idle` or `Pending`, tracked by one bit in a
//! direction-specific mask. A foreground call that wants the transport
//! takes the bit and submits; the completion path gives it back. A
//! foreground call that finds the bit taken either returns a zero/short
//! result (non-blocking API) or busy-waits -- but only when the execution
//! context says the completion interrupt can actually run, and never for
//! longer than the configured bound. A wait that expires detaches and
//! reattaches the whole device rather than leaving a wedged endpoint
//! behind.

use core::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU8, Ordering};

use crate::control::{ControlPipe, UsbFunction};
use crate::descriptor::{UsbDeviceDescriptor, UsbTransferType};
use crate::endpoint::{ep_number, DirectRecord, EndpointArena, EndpointConfig, TxRecord};
use crate::fmt::usb_warn;
use crate::setup::UsbDir;
use crate::transport::{ExecutionContext, PacketTransport};
use crate::{
    Result, UsbError, USB_EP_SIZE, USB_IO_TIMEOUT_MS, USB_WFI_TIMEOUT_MS,
};

/// Flags accepted by [`UsbDevice::write`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// Ignore the source contents and send that many zero bytes.
    pub zero: bool,
    /// Seal the current block and get the data onto the wire now.
    pub release: bool,
}

impl TransferFlags {
    pub const NONE: TransferFlags = TransferFlags { zero: false, release: false };
    pub const RELEASE: TransferFlags = TransferFlags { zero: false, release: true };
    pub const ZERO: TransferFlags = TransferFlags { zero: true, release: false };
}

/// Composition-time device identity and endpoint layout.
#[derive(Copy, Clone)]
pub struct DeviceConfig<'a> {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice value.
    pub device_version: u16,
    pub manufacturer: &'a str,
    pub product: &'a str,
    /// Serial number string; when absent, one is assembled from the
    /// functions' short-name fragments.
    pub serial: Option<&'a str>,
    pub max_power_ma: u16,
    /// Non-control endpoints. Endpoint 0 is implicit.
    pub endpoints: &'a [EndpointConfig],
}

impl<'a> DeviceConfig<'a> {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceConfig {
            vendor_id,
            product_id,
            device_version: 0x0100,
            manufacturer: "Unknown",
            product: "USB IO Board",
            serial: None,
            max_power_ma: 500,
            endpoints: &[],
        }
    }
}

/// The composition root: owns the endpoint arena and the control pipe,
/// borrows the transport, the execution context and the function table.
pub struct UsbDevice<'a, T: PacketTransport> {
    pub(crate) transport: &'a T,
    pub(crate) context: &'a dyn ExecutionContext,
    pub(crate) functions: &'a [&'a dyn UsbFunction],
    pub(crate) config: DeviceConfig<'a>,
    pub(crate) device_descriptor: UsbDeviceDescriptor,
    pub(crate) arena: EndpointArena,
    pub(crate) ctrl: ControlPipe,

    /// IN endpoints with a submission in flight, one bit per endpoint
    /// number. Bit set = `Pending`.
    pub(crate) tx_pending: AtomicU16,
    /// OUT endpoints with an armed reception, one bit per endpoint
    /// number.
    pub(crate) rx_pending: AtomicU16,

    /// Selected configuration value; 0 while unconfigured.
    pub(crate) configuration: AtomicU8,
    /// Alternate setting selected with SET_INTERFACE.
    pub(crate) alt_interface: AtomicU8,
    /// Per-endpoint-number halt flags.
    pub(crate) halted: AtomicU16,
    pub(crate) remote_wakeup: AtomicBool,
}

impl<'a, T: PacketTransport> UsbDevice<'a, T> {
    /// Builds the device. Fails if the endpoint table names endpoint 0,
    /// an out-of-range number or a duplicate.
    pub fn new(
        transport: &'a T,
        context: &'a dyn ExecutionContext,
        config: DeviceConfig<'a>,
        functions: &'a [&'a dyn UsbFunction],
    ) -> Result<Self> {
        let arena = EndpointArena::new(config.endpoints).ok_or(UsbError::InvalidEndpoint)?;
        let has_serial = config.serial.is_some() || !functions.is_empty();
        let device_descriptor = UsbDeviceDescriptor::composite(
            config.vendor_id,
            config.product_id,
            config.device_version,
            has_serial,
        );
        Ok(UsbDevice {
            transport,
            context,
            functions,
            config,
            device_descriptor,
            arena,
            ctrl: ControlPipe::new(),
            tx_pending: AtomicU16::new(0),
            rx_pending: AtomicU16::new(0),
            configuration: AtomicU8::new(0),
            alt_interface: AtomicU8::new(0),
            halted: AtomicU16::new(0),
            remote_wakeup: AtomicBool::new(false),
        })
    }

    //
    // Lifecycle.
    //

    /// Connects to the bus. The host will notice and start enumeration
    /// with a bus reset.
    pub fn attach(&self) {
        self.tx_pending.store(0, Ordering::Release);
        self.rx_pending.store(0, Ordering::Release);
        self.configuration.store(0, Ordering::Release);
        self.transport.attach();
    }

    /// Disconnects from the bus, discarding all in-flight transfers and
    /// queued data. This is the only cancellation primitive.
    pub fn detach(&self) {
        self.transport.detach();
        self.arena.reset_all();
        self.ctrl.reset();
        self.tx_pending.store(0, Ordering::Release);
        self.rx_pending.store(0, Ordering::Release);
        self.configuration.store(0, Ordering::Release);
    }

    /// Soft reset after a wedged transfer: the host sees the device
    /// disappear and re-enumerate.
    pub(crate) fn recover_from_timeout(&self) {
        usb_warn!("transport wait expired, reattaching");
        self.detach();
        self.attach();
    }

    /// Bus-reset event from the driver: reopen the control endpoint and
    /// drop all enumeration state.
    pub fn handle_reset(&self) {
        self.tx_pending.store(0, Ordering::Release);
        self.rx_pending.store(0, Ordering::Release);
        // OUT side first; some peripherals derive the IN layout from it.
        self.transport
            .open_endpoint(UsbDir::Out.endpoint(0), UsbTransferType::Control, USB_EP_SIZE as u16);
        self.transport
            .open_endpoint(UsbDir::In.endpoint(0), UsbTransferType::Control, USB_EP_SIZE as u16);
        self.configuration.store(0, Ordering::Release);
        self.alt_interface.store(0, Ordering::Release);
        self.halted.store(0, Ordering::Release);
        self.remote_wakeup.store(false, Ordering::Release);
        self.ctrl.reset();
    }

    /// True once the host has selected a configuration.
    pub fn configured(&self) -> bool {
        self.configuration.load(Ordering::Acquire) != 0
    }

    /// The selected configuration value.
    pub fn configuration(&self) -> u8 {
        self.configuration.load(Ordering::Acquire)
    }

    /// Probes for an active host by watching the start-of-frame counter,
    /// which only advances while a host drives the bus.
    pub fn connected(&self) -> bool {
        let frame = self.transport.frame_number();
        let start = self.context.now_ms();
        // One frame per millisecond in the connected state; three is
        // enough margin for clock skew.
        while self.context.now_ms().wrapping_sub(start) < 3 {
            self.context.wait_for_event();
        }
        frame != self.transport.frame_number()
    }

    /// Opens every configured endpoint and resets its queues; called
    /// when the host selects a configuration.
    pub(crate) fn init_endpoints(&self) {
        for slot in self.arena.slots.iter() {
            let Some(cfg) = slot.config else { continue };
            self.transport
                .open_endpoint(cfg.address(), cfg.kind, USB_EP_SIZE as u16);
            let n = cfg.number;
            match &slot.buffer {
                crate::endpoint::SlotBuffer::Rx(rx) => {
                    rx.reset();
                    self.clear_rx_pending(n);
                    self.arm_receive(n);
                }
                crate::endpoint::SlotBuffer::Tx(tx) => {
                    tx.reset();
                    self.clear_tx_pending(n);
                }
                crate::endpoint::SlotBuffer::Direct(d) => {
                    d.reset();
                    self.clear_tx_pending(n);
                    self.clear_rx_pending(n);
                }
                crate::endpoint::SlotBuffer::Unused => {}
            }
        }
    }

    //
    // Pending-state bookkeeping.
    //

    pub(crate) fn tx_is_pending(&self, ep_num: u8) -> bool {
        self.tx_pending.load(Ordering::Acquire) & (1 << ep_num) != 0
    }

    pub(crate) fn rx_is_pending(&self, ep_num: u8) -> bool {
        self.rx_pending.load(Ordering::Acquire) & (1 << ep_num) != 0
    }

    pub(crate) fn set_tx_pending(&self, ep_num: u8) {
        self.tx_pending.fetch_or(1 << ep_num, Ordering::AcqRel);
    }

    pub(crate) fn clear_tx_pending(&self, ep_num: u8) {
        self.tx_pending.fetch_and(!(1 << ep_num), Ordering::AcqRel);
    }

    pub(crate) fn set_rx_pending(&self, ep_num: u8) {
        self.rx_pending.fetch_or(1 << ep_num, Ordering::AcqRel);
    }

    pub(crate) fn clear_rx_pending(&self, ep_num: u8) {
        self.rx_pending.fetch_and(!(1 << ep_num), Ordering::AcqRel);
    }

    /// Bounded busy-wait for the completion path to make progress.
    /// Returns false when the bound expired.
    fn wait_until(&self, timeout_ms: u32, cond: &mut dyn FnMut() -> bool) -> bool {
        let start = self.context.now_ms();
        loop {
            if cond() {
                return true;
            }
            if self.context.now_ms().wrapping_sub(start) >= timeout_ms {
                return false;
            }
            self.context.wait_for_event();
        }
    }

    //
    // Transmit path.
    //

    /// Hands the oldest eligible block (or two coalesced ones) to the
    /// transport. Foreground entry point; masks the completion interrupt
    /// around the queue inspection and submission so the completion path
    /// cannot interleave.
    pub(crate) fn trigger_send(&self, ep_num: u8, allow_empty: bool) {
        let Some(tx) = self.arena.tx(ep_num) else { return };
        self.context.masked(&mut || {
            fence(Ordering::SeqCst);
            if self.tx_is_pending(ep_num) {
                return;
            }
            match tx.queue.peek_coalesced() {
                Some((block, nblocks)) => self.submit_tx(ep_num, tx, block, nblocks),
                None => {
                    if allow_empty {
                        self.submit_tx(ep_num, tx, &[], 0);
                    }
                }
            }
            fence(Ordering::SeqCst);
        });
    }

    /// Starts one submission. The block `data` points into is sealed
    /// and stays valid until the completion path pops it.
    fn submit_tx(&self, ep_num: u8, tx: &TxRecord, data: &[u8], nblocks: usize) {
        self.set_tx_pending(ep_num);
        tx.inflight_len.store(data.len(), Ordering::Release);
        tx.inflight_blocks.store(nblocks, Ordering::Release);
        let accepted = self.transport.transmit(UsbDir::In.endpoint(ep_num), data);
        tx.inflight_off.store(accepted, Ordering::Release);
        tx.inflight_chunk.store(accepted, Ordering::Release);
    }

    /// Completion-path counterpart of `trigger_send`: chains the next
    /// eligible block, sealing a partial head block when the stream has
    /// gone quiet and no foreground append is in progress.
    fn send_next_packet(&self, ep_num: u8, tx: &TxRecord) -> bool {
        if let Some((block, nblocks)) = tx.queue.peek_coalesced() {
            self.submit_tx(ep_num, tx, block, nblocks);
            return true;
        }
        if !tx.commit_lock.load(Ordering::Acquire) && !tx.queue.is_fully_empty() {
            // The commit mutates producer-side state from the consumer
            // side; the masked region shuts out a producer running at
            // a higher interrupt priority.
            self.context.masked(&mut || {
                if !tx.commit_lock.load(Ordering::Acquire) {
                    tx.queue.commit();
                }
            });
            if let Some((block, nblocks)) = tx.queue.peek_coalesced() {
                self.submit_tx(ep_num, tx, block, nblocks);
                return true;
            }
        }
        false
    }

    /// Appends bytes to an IN endpoint's stream. Returns the number of
    /// bytes accepted, which is less than `data.len()` when the queue is
    /// full and the calling context cannot safely wait. A bounded wait
    /// that expires reattaches the device and reports the short count.
    pub fn write(&self, ep_num: u8, data: &[u8], flags: TransferFlags) -> Result<usize> {
        if !self.configured() {
            return Err(UsbError::NotConfigured);
        }
        let cfg = self.arena.config(ep_num).ok_or(UsbError::InvalidEndpoint)?;
        if ep_num == 0 || cfg.direction != UsbDir::In {
            return Err(UsbError::InvalidEndpoint);
        }
        let Some(tx) = self.arena.tx(ep_num) else {
            // Unbuffered endpoint: a direct, strictly blocking transfer.
            return self.write_direct(ep_num, data, flags);
        };

        let zlp = data.is_empty();
        let can_wait = self.context.can_block();

        // Block the completion path from sealing the head block while
        // this side is appending to it.
        tx.commit_lock.store(true, Ordering::Release);
        fence(Ordering::SeqCst);

        let mut written = 0;
        if can_wait {
            loop {
                let n = if flags.zero {
                    tx.queue.write_zeros(data.len() - written)
                } else {
                    tx.queue.write(&data[written..])
                };
                written += n;
                if written == data.len() {
                    break;
                }
                if !self.tx_is_pending(ep_num) {
                    // Nothing in flight but the queue is full: kick the
                    // transmitter in case something clogged up.
                    self.trigger_send(ep_num, false);
                    continue;
                }
                if !self.wait_until(USB_WFI_TIMEOUT_MS, &mut || {
                    tx.queue.available_for_write() > 0 || !self.tx_is_pending(ep_num)
                }) {
                    tx.commit_lock.store(false, Ordering::Release);
                    self.recover_from_timeout();
                    return Ok(written);
                }
            }
            if flags.release {
                loop {
                    if tx.queue.commit() {
                        break;
                    }
                    if !self.tx_is_pending(ep_num) {
                        self.trigger_send(ep_num, false);
                        break;
                    }
                    if !self.wait_until(USB_WFI_TIMEOUT_MS, &mut || {
                        !tx.queue.is_full() || !self.tx_is_pending(ep_num)
                    }) {
                        tx.commit_lock.store(false, Ordering::Release);
                        self.recover_from_timeout();
                        return Ok(written);
                    }
                }
            }
        } else {
            // No waiting allowed: take what fits or, for a release that
            // has no free block to seal into, nothing at all.
            if !tx.queue.is_full() || !flags.release {
                written = if flags.zero {
                    tx.queue.write_zeros(data.len())
                } else {
                    tx.queue.write(data)
                };
                if written < data.len() && !self.tx_is_pending(ep_num) {
                    self.trigger_send(ep_num, false);
                    written += if flags.zero {
                        tx.queue.write_zeros(data.len() - written)
                    } else {
                        tx.queue.write(&data[written..])
                    };
                }
                if flags.release {
                    tx.queue.commit();
                }
            }
        }

        tx.commit_lock.store(false, Ordering::Release);
        fence(Ordering::SeqCst);
        // The completion path may drain the queue from here on.
        if self.tx_is_pending(ep_num) {
            return Ok(written);
        }
        if flags.release || zlp {
            self.trigger_send(ep_num, zlp);
        }
        Ok(written)
    }

    /// `write` with commit-and-flush semantics, the common case.
    pub fn send(&self, ep_num: u8, data: &[u8]) -> Result<usize> {
        self.write(ep_num, data, TransferFlags::RELEASE)
    }

    /// Explicit zero-length packet, acknowledging on transaction level.
    pub fn send_zlp(&self, ep_num: u8) -> Result<()> {
        if ep_num == 0 {
            self.ctrl_send_zlp();
            return Ok(());
        }
        if self.tx_is_pending(ep_num) {
            return Err(UsbError::Busy);
        }
        match self.arena.tx(ep_num) {
            Some(tx) => self.submit_tx(ep_num, tx, &[], 0),
            None => {
                self.arena
                    .config(ep_num)
                    .filter(|c| c.direction == UsbDir::In)
                    .ok_or(UsbError::InvalidEndpoint)?;
                self.set_tx_pending(ep_num);
                self.transport.transmit(UsbDir::In.endpoint(ep_num), &[]);
            }
        }
        Ok(())
    }

    /// Direct blocking transmit for unbuffered endpoints. The caller's
    /// buffer is only handed to the driver in chunks from this call
    /// frame, so no reference outlives the call.
    fn write_direct(&self, ep_num: u8, data: &[u8], flags: TransferFlags) -> Result<usize> {
        if !self.context.can_block() {
            return Err(UsbError::WouldBlock);
        }
        let addr = UsbDir::In.endpoint(ep_num);
        if !self.wait_until(USB_IO_TIMEOUT_MS, &mut || !self.tx_is_pending(ep_num)) {
            self.recover_from_timeout();
            return Ok(0);
        }
        let zeros = [0u8; USB_EP_SIZE];
        let mut sent = 0;
        let mut last_chunk = 0;
        while sent < data.len() {
            self.set_tx_pending(ep_num);
            let chunk = if flags.zero {
                let n = (data.len() - sent).min(zeros.len());
                self.transport.transmit(addr, &zeros[..n])
            } else {
                self.transport.transmit(addr, &data[sent..])
            };
            if !self.wait_until(USB_WFI_TIMEOUT_MS, &mut || !self.tx_is_pending(ep_num)) {
                self.recover_from_timeout();
                return Ok(sent);
            }
            if chunk == 0 {
                break;
            }
            sent += chunk;
            last_chunk = chunk;
        }
        if last_chunk > 0 && last_chunk % USB_EP_SIZE == 0 {
            // Exact-multiple transfers need the explicit end-of-transfer
            // marker.
            self.set_tx_pending(ep_num);
            self.transport.transmit(addr, &[]);
            if !self.wait_until(USB_WFI_TIMEOUT_MS, &mut || !self.tx_is_pending(ep_num)) {
                self.recover_from_timeout();
            }
        }
        Ok(sent)
    }

    /// Bytes the stream can accept without refusing.
    pub fn available_for_write(&self, ep_num: u8) -> usize {
        match self.arena.tx(ep_num) {
            Some(tx) => tx.queue.available_for_write(),
            None => match self.arena.config(ep_num) {
                Some(c) if c.direction == UsbDir::In => {
                    if self.tx_is_pending(ep_num) {
                        0
                    } else {
                        USB_EP_SIZE
                    }
                }
                _ => 0,
            },
        }
    }

    //
    // Receive path.
    //

    /// Arms reception of the next packet into the staging buffer.
    pub(crate) fn arm_receive(&self, ep_num: u8) {
        self.set_rx_pending(ep_num);
        self.transport
            .receive(UsbDir::Out.endpoint(ep_num), USB_EP_SIZE);
    }

    /// Non-blocking read: returns whatever has already arrived, in
    /// arrival order, and re-arms reception once a whole packet fits in
    /// the queue again. Unbuffered endpoints instead perform one direct
    /// bounded blocking receive with no intermediate copy.
    pub fn read(&self, ep_num: u8, buf: &mut [u8]) -> Result<usize> {
        if !self.configured() {
            return Err(UsbError::NotConfigured);
        }
        let cfg = self.arena.config(ep_num).ok_or(UsbError::InvalidEndpoint)?;
        if ep_num == 0 || cfg.direction != UsbDir::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        if let Some(rx) = self.arena.rx(ep_num) {
            let mut copied = rx.queue.read(buf);
            fence(Ordering::SeqCst);
            if self.rx_is_pending(ep_num) {
                // A packet is still in flight; what we have is what
                // there is.
                return Ok(copied);
            }
            let len = rx.staged_len.load(Ordering::Acquire);
            if len > 0 {
                let off = rx.staged_off.load(Ordering::Acquire);
                // Safety: the endpoint is idle with a parked remainder,
                // so the completion path will not touch the staging
                // buffer until reception is re-armed below.
                let staging = unsafe { rx.staging.get() };
                let take = len.min(buf.len() - copied);
                buf[copied..copied + take].copy_from_slice(&staging[off..off + take]);
                copied += take;
                // Spill whatever the caller had no room for into the
                // queue; only a fully drained staging buffer lets the
                // host send more.
                let written = rx.queue.write(&staging[off + take..off + len]);
                let remaining = len - take - written;
                if remaining == 0 {
                    rx.staged_off.store(0, Ordering::Release);
                    rx.staged_len.store(0, Ordering::Release);
                    self.arm_receive(ep_num);
                } else {
                    rx.staged_off.store(off + take + written, Ordering::Release);
                    rx.staged_len.store(remaining, Ordering::Release);
                }
            } else {
                self.arm_receive(ep_num);
            }
            Ok(copied)
        } else if let Some(d) = self.arena.direct(ep_num) {
            self.read_direct(ep_num, d, buf)
        } else {
            Err(UsbError::InvalidEndpoint)
        }
    }

    fn read_direct(&self, ep_num: u8, d: &DirectRecord, buf: &mut [u8]) -> Result<usize> {
        if !self.context.can_block() {
            return Err(UsbError::WouldBlock);
        }
        if !self.wait_until(USB_IO_TIMEOUT_MS, &mut || !self.rx_is_pending(ep_num)) {
            self.recover_from_timeout();
            return Ok(0);
        }
        d.pending_bytes.store(0, Ordering::Release);
        self.arm_receive(ep_num);
        if !self.wait_until(USB_WFI_TIMEOUT_MS, &mut || !self.rx_is_pending(ep_num)) {
            self.recover_from_timeout();
            return Ok(0);
        }
        let n = d.pending_bytes.load(Ordering::Acquire).min(buf.len());
        Ok(self
            .transport
            .read_packet(UsbDir::Out.endpoint(ep_num), &mut buf[..n]))
    }

    /// Bytes queued and instantly readable.
    pub fn available(&self, ep_num: u8) -> usize {
        if ep_num == 0 {
            return self.ctrl_available();
        }
        match self.arena.config(ep_num) {
            Some(c) if c.direction == UsbDir::Out => match self.arena.rx(ep_num) {
                Some(rx) => rx.queue.len(),
                None => self
                    .arena
                    .direct(ep_num)
                    .map(|d| d.pending_bytes.load(Ordering::Acquire))
                    .unwrap_or(0),
            },
            Some(_) => {
                // Legacy IN-endpoint semantics: room for one packet when
                // idle, none while transmitting.
                if self.tx_is_pending(ep_num) {
                    0
                } else {
                    USB_EP_SIZE
                }
            }
            None => 0,
        }
    }

    //
    // Maintenance operations.
    //

    /// Blocks until the endpoint's hardware queue is drained. A partial
    /// head block is sealed first so buffered data actually leaves.
    pub fn flush(&self, ep_num: u8) -> Result<()> {
        if ep_num == 0 {
            self.clear_tx_pending(0);
            self.clear_rx_pending(0);
            self.ctrl.reset_transfer();
            return Ok(());
        }
        if !self.context.can_block() {
            return Err(UsbError::WouldBlock);
        }
        let cfg = self.arena.config(ep_num).ok_or(UsbError::InvalidEndpoint)?;
        match cfg.direction {
            UsbDir::In => {
                if let Some(tx) = self.arena.tx(ep_num) {
                    if !self.tx_is_pending(ep_num) {
                        self.context.masked(&mut || {
                            tx.queue.commit();
                        });
                        self.trigger_send(ep_num, false);
                    }
                }
                if !self.wait_until(USB_WFI_TIMEOUT_MS, &mut || !self.tx_is_pending(ep_num)) {
                    self.recover_from_timeout();
                    return Err(UsbError::Timeout);
                }
                Ok(())
            }
            // Nothing to drain towards the host on an OUT endpoint.
            UsbDir::Out => Ok(()),
        }
    }

    /// Discards the endpoint's in-flight bookkeeping: a parked receive
    /// remainder or an unfinished submission.
    pub fn clear(&self, ep_num: u8) {
        if ep_num == 0 {
            self.clear_tx_pending(0);
            self.clear_rx_pending(0);
            self.ctrl.reset_transfer();
            return;
        }
        if let Some(rx) = self.arena.rx(ep_num) {
            rx.staged_off.store(0, Ordering::Release);
            rx.staged_len.store(0, Ordering::Release);
            self.clear_rx_pending(ep_num);
        } else if let Some(tx) = self.arena.tx(ep_num) {
            tx.inflight_len.store(0, Ordering::Release);
            tx.inflight_off.store(0, Ordering::Release);
            tx.inflight_chunk.store(0, Ordering::Release);
            tx.inflight_blocks.store(0, Ordering::Release);
            self.clear_tx_pending(ep_num);
        } else if let Some(d) = self.arena.direct(ep_num) {
            d.reset();
            self.clear_tx_pending(ep_num);
            self.clear_rx_pending(ep_num);
        }
    }

    /// Signals a protocol error to the host on the given endpoint; for
    /// endpoint 0 both directions are stalled.
    pub fn stall(&self, ep_num: u8) {
        if ep_num == 0 {
            self.transport.stall(UsbDir::In.endpoint(0));
            self.transport.stall(UsbDir::Out.endpoint(0));
        } else if let Some(cfg) = self.arena.config(ep_num) {
            self.transport.stall(cfg.address());
        }
    }

    //
    // Completion events, called by the integrator's interrupt glue.
    //

    /// A transmit submission on `ep_addr`'s endpoint finished. Resubmits
    /// any driver-split remainder, then drains the sealed-block queue,
    /// appends the boundary zero-length packet where the host's framing
    /// needs one, and finally returns the endpoint to `Idle`.
    pub fn ep_in_complete(&self, ep_addr: u8) {
        let ep_num = ep_number(ep_addr);
        if ep_num == 0 {
            return self.ctrl_in_complete();
        }
        let addr = UsbDir::In.endpoint(ep_num);
        if let Some(tx) = self.arena.tx(ep_num) {
            let len = tx.inflight_len.load(Ordering::Acquire);
            let off = tx.inflight_off.load(Ordering::Acquire);
            if off < len {
                // The driver split the submission; push the remainder of
                // the same sealed block(s).
                if let Some((block, _)) = tx.queue.peek_coalesced() {
                    let accepted = self.transport.transmit(addr, &block[off..len]);
                    tx.inflight_off.store(off + accepted, Ordering::Release);
                    tx.inflight_chunk.store(accepted, Ordering::Release);
                    return;
                }
            }
            let chunk = tx.inflight_chunk.load(Ordering::Acquire);
            let blocks = tx.inflight_blocks.swap(0, Ordering::AcqRel);
            for _ in 0..blocks {
                tx.queue.pop();
            }
            if self.send_next_packet(ep_num, tx) {
                return;
            }
            tx.inflight_len.store(0, Ordering::Release);
            tx.inflight_off.store(0, Ordering::Release);
            if len > 0 && chunk > 0 && chunk % USB_EP_SIZE == 0 {
                // The last packet was full-sized and nothing follows:
                // terminate the host's transfer expectation explicitly.
                tx.inflight_chunk.store(0, Ordering::Release);
                self.transport.transmit(addr, &[]);
                return;
            }
            tx.inflight_chunk.store(0, Ordering::Release);
            self.clear_tx_pending(ep_num);
        } else {
            // Unbuffered endpoints are driven chunk-by-chunk from the
            // blocked foreground call.
            self.clear_tx_pending(ep_num);
        }
    }

    /// A reception on `ep_addr`'s endpoint completed with `bytes` bytes.
    /// Buffered endpoints absorb the packet into the byte queue and
    /// re-arm immediately when a whole further packet fits -- otherwise
    /// the endpoint stays un-armed and the host is throttled by NAKs
    /// until a foreground read drains space.
    pub fn ep_out_complete(&self, ep_addr: u8, bytes: usize) {
        let ep_num = ep_number(ep_addr);
        if ep_num == 0 {
            return self.ctrl_out_complete(bytes);
        }
        let addr = UsbDir::Out.endpoint(ep_num);
        if let Some(rx) = self.arena.rx(ep_num) {
            if bytes > 0 {
                // Safety: reception was armed, so the completion context
                // owns the staging buffer until it either re-arms or
                // parks a remainder.
                let staging = unsafe { rx.staging.get_mut() };
                let n = self.transport.read_packet(addr, staging);
                let written = rx.queue.write(&staging[..n]);
                if written >= n {
                    self.transport.receive(addr, USB_EP_SIZE);
                    return;
                }
                rx.staged_off.store(written, Ordering::Release);
                rx.staged_len.store(n - written, Ordering::Release);
            }
            self.clear_rx_pending(ep_num);
        } else if let Some(d) = self.arena.direct(ep_num) {
            d.pending_bytes.store(bytes, Ordering::Release);
            self.clear_rx_pending(ep_num);
        } else {
            self.clear_rx_pending(ep_num);
        }
    }
}
