// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the two external collaborators the core depends on: the
//! vendor packet-transport driver and the execution environment.
//!
//! The driver moves exactly one packet per operation and signals
//! completion asynchronously; the core never touches wire-level
//! signaling. The execution context answers the questions that decide
//! whether a foreground call may busy-wait at all, and supplies the wall
//! clock that bounds every such wait.

use crate::descriptor::UsbTransferType;

/// The vendor peripheral driver, consumed by the core.
///
/// All submissions are asynchronous: `transmit` and `receive` start a
/// transfer and return; the integrator's interrupt glue reports
/// completion by calling [`UsbDevice::ep_in_complete`] /
/// [`UsbDevice::ep_out_complete`] on the device. The core never calls
/// `transmit` or `receive` again for the same endpoint while a prior
/// submission on that endpoint is outstanding.
///
/// [`UsbDevice::ep_in_complete`]: crate::device::UsbDevice::ep_in_complete
/// [`UsbDevice::ep_out_complete`]: crate::device::UsbDevice::ep_out_complete
pub trait PacketTransport {
    /// Begins transmitting on an IN endpoint and returns how many bytes
    /// of `data` this submission covers. A driver that can only move one
    /// packet per submission accepts at most the endpoint's maximum
    /// packet size; the core resubmits the remainder from the completion
    /// path. An empty `data` transmits a zero-length packet.
    fn transmit(&self, ep_addr: u8, data: &[u8]) -> usize;

    /// Arms reception of the next packet on an OUT endpoint. `capacity`
    /// must be at least the endpoint's maximum packet size except for
    /// zero-length status-stage receptions, where 0 is allowed.
    fn receive(&self, ep_addr: u8, capacity: usize);

    /// Copies the most recently completed packet on `ep_addr` into
    /// `buf`, returning the byte count. Only called from the completion
    /// path, after the driver reported the packet.
    fn read_packet(&self, ep_addr: u8, buf: &mut [u8]) -> usize;

    /// Signals a protocol error to the host on the given endpoint.
    fn stall(&self, ep_addr: u8);

    /// Removes a previously signalled stall condition.
    fn clear_stall(&self, ep_addr: u8);

    /// Loads the device address. Called only after the SET_ADDRESS
    /// status stage went out, per the USB ordering requirement.
    fn set_address(&self, address: u8);

    /// Opens an endpoint with the given transfer type and maximum packet
    /// size. Called for both directions of endpoint 0 after bus reset
    /// and for every configured endpoint when the host selects a
    /// configuration.
    fn open_endpoint(&self, ep_addr: u8, kind: UsbTransferType, max_packet: u16);

    /// Connects the device to the bus (D+ pullup on full-speed parts).
    fn attach(&self);

    /// Disconnects the device from the bus, abandoning all in-flight
    /// transfers. Together with `attach` this is the core's only
    /// cancellation primitive.
    fn detach(&self);

    /// Current start-of-frame counter. Advances once per millisecond
    /// while a host is actively driving the bus.
    fn frame_number(&self) -> u16;
}

/// The core's window on the world it executes in.
///
/// A blocking call may only busy-wait for the transport to make progress
/// when the completion interrupt is actually able to run; otherwise the
/// wait can never end. The integrator knows the interrupt layout, so the
/// integrator answers.
pub trait ExecutionContext {
    /// True when the current execution context may busy-wait on the
    /// transport: interrupts are enabled and the caller is not itself an
    /// interrupt handler at or above the transport interrupt's priority.
    fn can_block(&self) -> bool;

    /// Milliseconds from an arbitrary epoch; wraps. Bounds every
    /// busy-wait.
    fn now_ms(&self) -> u32;

    /// A pause inside a busy-wait loop. WFI on a Cortex-M, a spin hint
    /// elsewhere. The bounded-wait loops call this between polls.
    fn wait_for_event(&self);

    /// Runs `f` with the transport's completion interrupt masked, so a
    /// foreground sequence that reads queue state and hands a block to
    /// the driver cannot be interleaved with the completion path doing
    /// the same.
    fn masked(&self, f: &mut dyn FnMut());
}
