// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB full-speed device data-path core.
//!
//! This crate implements the device side of USB enumeration and data
//! transfer on top of a vendor packet-transport driver: the control
//! endpoint request/response protocol, on-the-fly descriptor assembly for
//! composite devices, and buffered byte streams over the remaining bulk
//! and interrupt endpoints, shared safely between the transport's
//! completion interrupt and foreground code.
//!
//! It deliberately does _not_ touch hardware. Everything the hardware
//! must do is expressed through two small traits:
//!
//! - [`transport::PacketTransport`] -- "send this buffer as one packet",
//!   "receive the next packet", stall, address and attach control. A
//!   vendor peripheral driver (an STM32 PCD, an RP2040 `USBCTRL`
//!   register block, a mock in tests) implements this.
//! - [`transport::ExecutionContext`] -- the few questions the core has to
//!   ask about the world it runs in: may I busy-wait here without
//!   deadlocking against the transport interrupt, what time is it, and
//!   how do I mask that interrupt for a few instructions.
//!
//! The integrator wires the driver's three completion callbacks (setup
//! received, packet received, packet transmitted) to
//! [`device::UsbDevice::handle_setup`], [`device::UsbDevice::ep_out_complete`]
//! and [`device::UsbDevice::ep_in_complete`], and calls the stream API
//! ([`device::UsbDevice::write`], [`device::UsbDevice::read`], ...) from
//! application code. Class and vendor behavior plugs in through
//! [`control::UsbFunction`].
//!
//! Isochronous endpoints can be declared and opened but carry no data
//! path here; high-speed signaling and DMA transfer are not supported.

#![cfg_attr(not(test), no_std)]

pub mod control;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod fifo;
pub mod setup;
pub mod transport;

pub(crate) mod fmt;

/// Highest endpoint number + 1 this core can manage. Endpoint 0 is the
/// control endpoint; the rest are available to functions.
pub const USB_ENDPOINTS: usize = 8;

/// Maximum packet size of every endpoint, in bytes. 64 is the full-speed
/// ceiling for control and bulk endpoints; using it uniformly keeps the
/// buffer layout simple.
pub const USB_EP_SIZE: usize = 64;

/// Capacity of a receive-side byte queue. Needs to be at least
/// `2 * USB_EP_SIZE` so that one full packet can be absorbed while the
/// previous one is still being drained.
pub const USB_RX_SIZE: usize = USB_EP_SIZE * 2;

/// Number of transmit blocks per IN endpoint. Each block holds up to one
/// packet; four blocks let the data-in path chain two full blocks into a
/// single transfer.
pub const USB_TX_BLOCKS: usize = 4;

/// Size of the shared staging buffer for host-to-device control data
/// stages. Control requests declaring a longer data stage are stalled.
pub const USB_CTRL_RX_SIZE: usize = USB_EP_SIZE;

/// Size of the control-side packing buffer that composite configuration
/// descriptors and string descriptors are assembled in.
pub const USB_CTRL_TX_SIZE: usize = 256;

/// Bound for blocking helper calls (sends, flushes) that wait on the
/// transport to make progress.
pub const USB_WFI_TIMEOUT_MS: u32 = 1000;

/// Bound for the short busy-waits used to grab an endpoint that is still
/// finishing its previous transfer.
pub const USB_IO_TIMEOUT_MS: u32 = 70;

/// Errors reported by the foreground API.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// The operation would need to wait and the caller's execution
    /// context cannot safely do so (see
    /// [`transport::ExecutionContext::can_block`]).
    WouldBlock,
    /// The endpoint still has a transfer in flight.
    Busy,
    /// The host has not selected a configuration yet.
    NotConfigured,
    /// No endpoint with that number and direction was configured.
    InvalidEndpoint,
    /// The 8 setup bytes did not parse as a setup packet.
    InvalidSetupPacket,
    /// Data did not fit the fixed staging or packing buffer.
    BufferOverflow,
    /// A bounded wait on the transport expired; the device has been
    /// detached and reattached.
    Timeout,
}

pub type Result<T> = core::result::Result<T, UsbError>;
