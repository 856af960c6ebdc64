// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control-transfer dispatcher: consumes setup packets, stages
//! host-to-device data phases, answers the standard chapter-9 requests
//! and hands class/vendor requests to the registered functions.
//!
//! ```text
//!              Host                        Device
//!               |                            |
//!               |  EP0 OUT: SETUP (8 bytes)  |
//!               |--------------------------->|  handle_setup
//!               |  EP0 OUT: DATA (optional)  |
//!               |--------------------------->|  ctrl_out_complete
//!               |  EP0 IN: response / ZLP    |
//!               |<---------------------------|  ctrl_in_complete
//! ```
//!
//! Control transfers are strictly sequential on the wire, which is what
//! lets one shared staging buffer and one packing buffer serve every
//! transaction: a new setup packet resets the context, and nothing else
//! ever runs the dispatcher concurrently.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use num_traits::FromPrimitive;
use zerocopy::AsBytes;

use crate::descriptor::{
    CountingSink, DescriptorSink, UsbConfigurationDescriptor, UsbDescType, IMANUFACTURER,
    IPRODUCT, ISERIAL, LANG_DESCRIPTOR,
};
use crate::descriptor::write_string_descriptor;
use crate::device::UsbDevice;
use crate::endpoint::HandoffBuffer;
use crate::fmt::usb_debug;
use crate::setup::{
    Recipient, RequestKind, UsbDir, UsbFeature, UsbSetupPacket, UsbSetupRequest,
    FEATURE_REMOTE_WAKEUP_ENABLED,
};
use crate::transport::PacketTransport;
use crate::{Result, UsbError, USB_CTRL_RX_SIZE, USB_CTRL_TX_SIZE};

/// Longest serial-number string assembled from function name fragments.
pub const ISERIAL_MAX_LEN: usize = 32;

/// A function (interface contribution) plugged into the device: it
/// contributes interface descriptors to the composite configuration
/// descriptor and may handle class/vendor control requests addressed to
/// it. Implementations are registered as a fixed slice of trait objects
/// at composition time.
pub trait UsbFunction {
    /// Number of interfaces this function contributes.
    fn interface_count(&self) -> u8;

    /// Emits this function's interface, endpoint and class descriptors.
    /// Called twice per GET_DESCRIPTOR(CONFIGURATION): once against a
    /// counting sink to size the descriptor, once against the real one.
    /// Both passes must produce identical bytes.
    fn write_descriptors(&self, sink: &mut dyn DescriptorSink) -> Result<()>;

    /// Handles a class or vendor control request. Returning true claims
    /// the request; if the implementation did not itself respond through
    /// `pipe`, a zero-length acknowledgement is sent on its behalf.
    fn control_request(&self, pipe: &dyn ControlAccess, setup: &UsbSetupPacket) -> bool {
        let _ = (pipe, setup);
        false
    }

    /// Answers a class-specific GET_DESCRIPTOR (HID report descriptors
    /// and the like). Returning true claims the request.
    fn class_descriptor(&self, pipe: &dyn ControlAccess, setup: &UsbSetupPacket) -> bool {
        let _ = (pipe, setup);
        false
    }

    /// Appends a short identifying fragment for the assembled serial
    /// number; returns the number of bytes written.
    fn short_name(&self, out: &mut [u8]) -> usize {
        let _ = out;
        0
    }
}

/// The control-endpoint surface exposed to function implementations
/// while their request is being dispatched.
pub trait ControlAccess {
    /// Queues response data for the current control transfer.
    fn send_control(&self, data: &[u8]) -> Result<usize>;

    /// Copies out the data stage that arrived with the current request.
    fn recv_control(&self, buf: &mut [u8]) -> usize;

    /// Bytes available via `recv_control`.
    fn control_available(&self) -> usize;

    /// Acknowledges the current request with a zero-length packet.
    fn ack_control(&self);
}

/// Per-transaction control state. One process-wide instance lives in the
/// device; USB serializes control transfers, so it is never shared
/// between two logical transactions.
pub(crate) struct ControlPipe {
    /// The raw setup packet of the transaction being processed.
    setup: HandoffBuffer<8>,
    /// Staging buffer for host-to-device data phases.
    recv_buf: HandoffBuffer<USB_CTRL_RX_SIZE>,
    /// Declared data-stage length still being collected; 0 when no data
    /// stage is in progress.
    recv_expected: AtomicUsize,
    /// Data-stage bytes collected so far.
    recv_len: AtomicUsize,
    /// Assembly/transmit buffer for device-to-host responses.
    in_buf: HandoffBuffer<USB_CTRL_TX_SIZE>,
    /// Length of the in-flight response.
    in_len: AtomicUsize,
    /// Bytes of the in-flight response already handed to the driver.
    in_off: AtomicUsize,
    /// When packing is active, responses accumulate in `in_buf` instead
    /// of being transmitted one piece at a time.
    pack_active: AtomicBool,
    pack_len: AtomicUsize,
    /// `0x100 | address` once SET_ADDRESS has been acknowledged but the
    /// status stage has not completed yet.
    pending_address: AtomicU16,
    /// Set as soon as the current transaction produced any response, so
    /// the dispatcher knows whether a class handler still needs the
    /// automatic acknowledgement.
    responded: AtomicBool,
}

impl ControlPipe {
    pub fn new() -> Self {
        ControlPipe {
            setup: HandoffBuffer::new(),
            recv_buf: HandoffBuffer::new(),
            recv_expected: AtomicUsize::new(0),
            recv_len: AtomicUsize::new(0),
            in_buf: HandoffBuffer::new(),
            in_len: AtomicUsize::new(0),
            in_off: AtomicUsize::new(0),
            pack_active: AtomicBool::new(false),
            pack_len: AtomicUsize::new(0),
            pending_address: AtomicU16::new(0),
            responded: AtomicBool::new(false),
        }
    }

    /// Clears transfer progress but keeps enumeration-relevant state
    /// (the pending address) alone.
    pub fn reset_transfer(&self) {
        self.recv_expected.store(0, Ordering::Release);
        self.recv_len.store(0, Ordering::Release);
        self.in_len.store(0, Ordering::Release);
        self.in_off.store(0, Ordering::Release);
        self.pack_active.store(false, Ordering::Release);
        self.pack_len.store(0, Ordering::Release);
        self.responded.store(false, Ordering::Release);
    }

    pub fn reset(&self) {
        self.reset_transfer();
        self.pending_address.store(0, Ordering::Release);
    }
}

impl<'a, T: PacketTransport> UsbDevice<'a, T> {
    /// Entry point for the driver's setup-received event. `raw` is the
    /// 8-byte setup packet as captured by the hardware.
    pub fn handle_setup(&self, raw: &[u8; 8]) {
        // A setup packet aborts whatever the previous transaction was
        // still doing on either direction of endpoint 0.
        self.clear_rx_pending(0);
        self.clear_tx_pending(0);
        self.ctrl.reset_transfer();
        {
            // Safety: setup handling is serialized by the protocol; no
            // other path touches the stored packet between here and the
            // dispatch it leads to.
            let stored = unsafe { self.ctrl.setup.get_mut() };
            stored.copy_from_slice(raw);
        }
        let Ok(setup) = UsbSetupPacket::parse(raw) else {
            self.stall_ctrl();
            return;
        };
        if setup.has_data_out_stage() {
            let expected = setup.length.get() as usize;
            if expected > USB_CTRL_RX_SIZE {
                // The shared staging buffer bounds what any request may
                // deliver.
                self.stall_ctrl();
                return;
            }
            self.ctrl.recv_expected.store(expected, Ordering::Release);
            self.ctrl.recv_len.store(0, Ordering::Release);
            self.set_rx_pending(0);
            self.transport
                .receive(UsbDir::Out.endpoint(0), USB_CTRL_RX_SIZE);
            return;
        }
        self.dispatch();
    }

    /// EP0 OUT completion: collects data-stage bytes, re-arming until
    /// the declared length arrived, then dispatches. A data stage the
    /// driver terminates short is still dispatched with whatever made
    /// it here.
    pub(crate) fn ctrl_out_complete(&self, bytes: usize) {
        let expected = self.ctrl.recv_expected.load(Ordering::Acquire);
        if expected > 0 {
            let collected = self.ctrl.recv_len.load(Ordering::Acquire);
            let mut total = collected;
            if bytes > 0 {
                // Safety: a data stage is armed, so the completion
                // context owns the staging buffer.
                let buf = unsafe { self.ctrl.recv_buf.get_mut() };
                let n = self.transport.read_packet(UsbDir::Out.endpoint(0), &mut buf[collected..]);
                total = collected + n;
                self.ctrl.recv_len.store(total, Ordering::Release);
                if total < expected {
                    self.transport
                        .receive(UsbDir::Out.endpoint(0), USB_CTRL_RX_SIZE);
                    return;
                }
            }
            self.clear_rx_pending(0);
            self.ctrl.recv_expected.store(0, Ordering::Release);
            if total > 0 {
                self.dispatch();
            }
            return;
        }
        // Status-stage packet of a device-to-host transfer.
        self.clear_rx_pending(0);
    }

    /// EP0 IN completion: continues a chunked response, arms the
    /// deferred device address once the SET_ADDRESS status stage is out,
    /// and prepares for the host's status-out packet otherwise.
    pub(crate) fn ctrl_in_complete(&self) {
        let len = self.ctrl.in_len.load(Ordering::Acquire);
        let off = self.ctrl.in_off.load(Ordering::Acquire);
        if off < len {
            // Safety: the response stays parked in the in-buffer for
            // exactly this continuation.
            let buf = unsafe { self.ctrl.in_buf.get() };
            let accepted = self.transport.transmit(UsbDir::In.endpoint(0), &buf[off..len]);
            self.ctrl.in_off.store(off + accepted, Ordering::Release);
            return;
        }
        self.ctrl.in_len.store(0, Ordering::Release);
        self.ctrl.in_off.store(0, Ordering::Release);
        self.clear_tx_pending(0);
        let pending = self.ctrl.pending_address.swap(0, Ordering::AcqRel);
        if pending & 0x100 != 0 {
            // The zero-length status acknowledgement for SET_ADDRESS
            // went out at the old address; the new one may take effect
            // now.
            self.transport.set_address(pending as u8);
            return;
        }
        // Expect the host's zero-length status-out next.
        self.transport.receive(UsbDir::Out.endpoint(0), 0);
    }

    /// Classifies the stored setup packet and runs the matching handler.
    /// Anything unhandled stalls both directions of endpoint 0; the
    /// stall is released right away so it signals exactly one request.
    fn dispatch(&self) {
        let raw = {
            // Safety: dispatch is serialized; the stored packet is
            // stable for the duration of the transaction.
            *unsafe { self.ctrl.setup.get() }
        };
        let Ok(setup) = UsbSetupPacket::parse(&raw) else {
            self.stall_ctrl();
            return;
        };
        self.ctrl.responded.store(false, Ordering::Release);
        let ok = match setup.kind() {
            Some(RequestKind::Standard) => self.handle_standard_setup(setup),
            Some(RequestKind::Class) | Some(RequestKind::Vendor) => {
                self.handle_class_setup(setup)
            }
            None => false,
        };
        if !ok {
            self.stall_ctrl();
        }
    }

    /// Delegates to the registered functions. A claimed request that the
    /// handler did not answer itself gets the zero-length
    /// acknowledgement automatically.
    fn handle_class_setup(&self, setup: &UsbSetupPacket) -> bool {
        let mut claimed = false;
        for function in self.functions {
            if function.control_request(self, setup) {
                claimed = true;
                break;
            }
        }
        if claimed && !self.ctrl.responded.load(Ordering::Acquire) {
            self.ctrl_send_zlp();
        }
        claimed
    }

    /// The chapter-9 standard requests.
    fn handle_standard_setup(&self, setup: &UsbSetupPacket) -> bool {
        let value = setup.value.get();
        let ep = (setup.index.get() & 0xFF) as u8;
        let ep_num = ep & 0xF;
        match setup.standard_request() {
            Some(UsbSetupRequest::GetStatus) => match setup.recipient() {
                Some(Recipient::Device) => {
                    let status = [
                        if self.remote_wakeup.load(Ordering::Acquire) {
                            FEATURE_REMOTE_WAKEUP_ENABLED
                        } else {
                            0
                        },
                        0,
                    ];
                    self.send_control(&status).is_ok()
                }
                Some(Recipient::Endpoint) => {
                    let halted = self.halted.load(Ordering::Acquire) & (1 << ep_num) != 0;
                    let status = [halted as u8, 0];
                    self.send_control(&status).is_ok()
                }
                _ => false,
            },
            Some(UsbSetupRequest::ClearFeature) => {
                match UsbFeature::from_u16(value) {
                    Some(UsbFeature::EndpointHalt) => {
                        // Clearing an endpoint that is not halted is an
                        // acknowledged no-op.
                        self.halted
                            .fetch_and(!(1 << ep_num), Ordering::AcqRel);
                        if ep_num != 0 {
                            self.transport.clear_stall(ep);
                        }
                    }
                    Some(UsbFeature::DeviceRemoteWakeup) => {
                        self.remote_wakeup.store(false, Ordering::Release);
                    }
                    // Unknown selectors are ignored.
                    None => {}
                }
                self.ctrl_send_zlp();
                true
            }
            Some(UsbSetupRequest::SetFeature) => {
                match UsbFeature::from_u16(value) {
                    Some(UsbFeature::EndpointHalt) => {
                        self.halted.fetch_or(1 << ep_num, Ordering::AcqRel);
                        if ep_num != 0 && setup.length.get() == 0 {
                            self.transport.stall(ep);
                        }
                    }
                    Some(UsbFeature::DeviceRemoteWakeup) => {
                        self.remote_wakeup.store(true, Ordering::Release);
                    }
                    None => {}
                }
                self.ctrl_send_zlp();
                true
            }
            Some(UsbSetupRequest::SetAddress) => {
                // Acknowledge at the old address; the completion of that
                // acknowledgement arms the new one.
                self.ctrl
                    .pending_address
                    .store(0x100 | setup.value_low() as u16, Ordering::Release);
                self.ctrl_send_zlp();
                true
            }
            Some(UsbSetupRequest::GetDescriptor) => self.send_descriptor(setup),
            Some(UsbSetupRequest::SetDescriptor) => false,
            Some(UsbSetupRequest::GetConfiguration) => {
                let config = [self.configuration.load(Ordering::Acquire)];
                self.send_control(&config).is_ok()
            }
            Some(UsbSetupRequest::SetConfiguration) => {
                if setup.recipient() == Some(Recipient::Device) {
                    self.init_endpoints();
                    self.configuration
                        .store(setup.value_low(), Ordering::Release);
                    self.ctrl_send_zlp();
                    true
                } else {
                    false
                }
            }
            Some(UsbSetupRequest::GetInterface) => {
                let alt = [self.alt_interface.load(Ordering::Acquire)];
                self.send_control(&alt).is_ok()
            }
            Some(UsbSetupRequest::SetInterface) => {
                self.alt_interface.store(setup.value_low(), Ordering::Release);
                self.ctrl_send_zlp();
                true
            }
            None => false,
        }
    }

    /// GET_DESCRIPTOR: configuration descriptors run the two-pass
    /// assembly, class descriptors go to the functions, and device and
    /// string descriptors are answered from device state.
    fn send_descriptor(&self, setup: &UsbSetupPacket) -> bool {
        let requested = setup.length.get() as usize;
        if setup.value_high() == UsbDescType::Config as u8 {
            return self.send_configuration(requested);
        }
        for function in self.functions {
            if function.class_descriptor(self, setup) {
                return true;
            }
        }
        match UsbDescType::from_u8(setup.value_high()) {
            Some(UsbDescType::Device) if setup.value_low() == 0 => {
                let bytes = self.device_descriptor.as_bytes();
                let n = bytes.len().min(requested);
                self.send_control(&bytes[..n]).is_ok()
            }
            Some(UsbDescType::String) => match setup.value_low() {
                0 => {
                    let n = LANG_DESCRIPTOR.len().min(requested);
                    self.send_control(&LANG_DESCRIPTOR[..n]).is_ok()
                }
                IMANUFACTURER => self.send_string(self.config.manufacturer, requested),
                IPRODUCT => self.send_string(self.config.product, requested),
                ISERIAL => self.send_serial(requested),
                _ => false,
            },
            // Device qualifiers are refused: this is a full-speed-only
            // device. Everything else unrecognized stalls too.
            _ => false,
        }
    }

    /// Two-pass configuration descriptor assembly: measure every
    /// function's contribution, emit the header with the summed total
    /// length, then replay the contributions for real -- packed into one
    /// logical message so the host sees a single transfer no matter how
    /// many pieces were contributed.
    fn send_configuration(&self, requested: usize) -> bool {
        let mut counter = CountingSink::new();
        let interfaces = match self.emit_interfaces(&mut counter) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let header_len = core::mem::size_of::<UsbConfigurationDescriptor>();
        let total = header_len + counter.total();
        let header = UsbConfigurationDescriptor::new(
            total as u16,
            interfaces,
            self.config.max_power_ma,
        );
        if requested == header_len {
            // The host is sizing the descriptor; just the header.
            return self.send_control(header.as_bytes()).is_ok();
        }
        self.pack_messages(true);
        let ok = self.send_control(header.as_bytes()).is_ok() && {
            let mut sink = PackSink { device: self };
            self.emit_interfaces(&mut sink).is_ok()
        };
        if !ok {
            usb_debug!("configuration descriptor overflowed the packing buffer");
            self.ctrl.pack_active.store(false, Ordering::Release);
            self.ctrl.pack_len.store(0, Ordering::Release);
            return false;
        }
        self.pack_messages(false);
        true
    }

    fn emit_interfaces(&self, sink: &mut dyn DescriptorSink) -> Result<u8> {
        let mut interfaces = 0;
        for function in self.functions {
            function.write_descriptors(sink)?;
            interfaces += function.interface_count();
        }
        Ok(interfaces)
    }

    fn send_string(&self, text: &str, requested: usize) -> bool {
        if requested < 2 {
            return false;
        }
        let n = {
            // Safety: the dispatcher is composing the response; nothing
            // is in flight from the in-buffer until ctrl_submit below.
            let buf = unsafe { self.ctrl.in_buf.get_mut() };
            write_string_descriptor(buf, text, requested)
        };
        n > 0 && self.ctrl_submit(n).is_ok()
    }

    /// The serial string: configured verbatim, or assembled from the
    /// functions' short-name fragments.
    fn send_serial(&self, requested: usize) -> bool {
        if let Some(serial) = self.config.serial {
            return self.send_string(serial, requested);
        }
        let mut name = [0u8; ISERIAL_MAX_LEN];
        let mut used = 0;
        for function in self.functions {
            if used >= name.len() {
                break;
            }
            used += function.short_name(&mut name[used..]);
            used = used.min(name.len());
        }
        if used == 0 {
            return false;
        }
        match core::str::from_utf8(&name[..used]) {
            Ok(s) => self.send_string(s, requested),
            Err(_) => false,
        }
    }

    /// Activates or deactivates message packing. Deactivating transmits
    /// everything accumulated as one response.
    pub(crate) fn pack_messages(&self, active: bool) {
        if active {
            self.ctrl.pack_active.store(true, Ordering::Release);
            self.ctrl.pack_len.store(0, Ordering::Release);
        } else {
            self.ctrl.pack_active.store(false, Ordering::Release);
            let len = self.ctrl.pack_len.swap(0, Ordering::AcqRel);
            if len > 0 {
                let _ = self.ctrl_submit(len);
            }
        }
    }

    /// Starts transmitting `len` bytes out of the in-buffer. The
    /// completion path feeds the driver the rest if it splits the
    /// transfer.
    fn ctrl_submit(&self, len: usize) -> Result<()> {
        self.ctrl.responded.store(true, Ordering::Release);
        if self.tx_is_pending(0) {
            return Err(UsbError::Busy);
        }
        self.set_tx_pending(0);
        self.ctrl.in_len.store(len, Ordering::Release);
        // Safety: the response was composed by this same serialized
        // dispatch; it stays parked until the transfer completes.
        let buf = unsafe { self.ctrl.in_buf.get() };
        let accepted = self.transport.transmit(UsbDir::In.endpoint(0), &buf[..len]);
        self.ctrl.in_off.store(accepted, Ordering::Release);
        Ok(())
    }

    pub(crate) fn ctrl_send_zlp(&self) {
        self.ctrl.responded.store(true, Ordering::Release);
        if self.tx_is_pending(0) {
            return;
        }
        self.set_tx_pending(0);
        self.ctrl.in_len.store(0, Ordering::Release);
        self.ctrl.in_off.store(0, Ordering::Release);
        self.transport.transmit(UsbDir::In.endpoint(0), &[]);
    }

    pub(crate) fn ctrl_available(&self) -> usize {
        self.ctrl.recv_len.load(Ordering::Acquire)
    }

    /// Stalls both directions of endpoint 0 and immediately releases
    /// the condition again: the stall is a one-shot signal for the
    /// current request, not a sticky endpoint state.
    fn stall_ctrl(&self) {
        usb_debug!("stalling control endpoint");
        self.transport.stall(UsbDir::In.endpoint(0));
        self.transport.stall(UsbDir::Out.endpoint(0));
        self.transport.clear_stall(UsbDir::In.endpoint(0));
        self.transport.clear_stall(UsbDir::Out.endpoint(0));
    }
}

impl<'a, T: PacketTransport> ControlAccess for UsbDevice<'a, T> {
    /// Queues response data on the control endpoint. While packing is
    /// active the data accumulates; otherwise it is copied into the
    /// in-buffer and transmitted from there, so the caller's buffer may
    /// go away as soon as this returns.
    fn send_control(&self, data: &[u8]) -> Result<usize> {
        self.ctrl.responded.store(true, Ordering::Release);
        if self.ctrl.pack_active.load(Ordering::Acquire) {
            let off = self.ctrl.pack_len.load(Ordering::Acquire);
            if off + data.len() > USB_CTRL_TX_SIZE {
                return Err(UsbError::BufferOverflow);
            }
            // Safety: packing only happens inside the serialized
            // dispatch; nothing transmits from the buffer meanwhile.
            let buf = unsafe { self.ctrl.in_buf.get_mut() };
            buf[off..off + data.len()].copy_from_slice(data);
            self.ctrl.pack_len.store(off + data.len(), Ordering::Release);
            return Ok(data.len());
        }
        if data.len() > USB_CTRL_TX_SIZE {
            return Err(UsbError::BufferOverflow);
        }
        {
            // Safety: as above; the previous response, if any, has left
            // the buffer (ctrl_submit refuses while one is in flight).
            let buf = unsafe { self.ctrl.in_buf.get_mut() };
            buf[..data.len()].copy_from_slice(data);
        }
        self.ctrl_submit(data.len())?;
        Ok(data.len())
    }

    /// Copies out the data stage that arrived with the current request.
    fn recv_control(&self, buf: &mut [u8]) -> usize {
        let available = self.ctrl.recv_len.load(Ordering::Acquire);
        let n = available.min(buf.len());
        if n > 0 {
            // Safety: the data stage completed before dispatch; the
            // staging buffer is stable for the rest of the transaction.
            let staged = unsafe { self.ctrl.recv_buf.get() };
            buf[..n].copy_from_slice(&staged[..n]);
        }
        n
    }

    fn control_available(&self) -> usize {
        self.ctrl_available()
    }

    fn ack_control(&self) {
        self.ctrl_send_zlp();
    }
}

/// The emitting-pass sink: forwards every contribution to
/// `send_control`, which is packing into the in-buffer.
struct PackSink<'d, 'a, T: PacketTransport> {
    device: &'d UsbDevice<'a, T>,
}

impl<T: PacketTransport> DescriptorSink for PackSink<'_, '_, T> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.device.send_control(bytes).map(|_| ())
    }
}
