// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Setup-packet wire layout and request classification.
//!
//! Every control transfer starts with the host sending an 8-byte SETUP
//! packet. The layout is fixed by the USB 2.0 device framework and is
//! little-endian on the wire, which the `zerocopy` types encode directly
//! so a packet can be reinterpreted from the raw bytes the driver
//! captured, without a manual parse step.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

use crate::{Result, UsbError};

/// USB deals in two different transfer directions, called OUT
/// (host-to-device) and IN (device-to-host). OUT is represented by a 0
/// byte and IN by an `0x80` byte, both in endpoint addresses and in the
/// top bit of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    /// Forms the endpoint address for endpoint `num` in this direction.
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    /// Extracts the direction from an endpoint address or request type.
    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// The type field of `bmRequestType`, bits 5..6.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    /// Requests defined by the USB standard itself (chapter 9).
    Standard = 0,
    /// Requests defined by a device class specification (CDC, HID, ...).
    Class = 1,
    /// Requests defined by the vendor.
    Vendor = 2,
}

/// The recipient field of `bmRequestType`, bits 0..4.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// The standard SETUP requests handled in-line by the control dispatcher.
/// Class and vendor requests use the same 8-byte header but their request
/// codes live in a separate namespace selected by `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbSetupRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    /// Notifies the device that it's being moved to a different address
    /// on the bus. The new address must not take effect before the status
    /// stage of this very request has gone out.
    SetAddress = 5,
    /// Asks the device to send a certain descriptor back to the host.
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    /// Configures the device by choosing one of the options listed in its
    /// descriptors. Value 0 returns to the unconfigured state.
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
}

/// Standard feature selectors (usb_20.pdf table 9-6). Only the two the
/// data path acts on are decoded; unknown selectors are acknowledged and
/// ignored.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbFeature {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
}

/// GET_STATUS device response, bit 1: remote wakeup is enabled.
pub const FEATURE_REMOTE_WAKEUP_ENABLED: u8 = 1 << 1;

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Debug, AsBytes, FromBytes, Unaligned)]
pub struct UsbSetupPacket {
    /// Direction, type and recipient bits; see the accessors below.
    pub request_type: u8,
    /// Request code, interpreted according to `kind()`.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// A second argument; for endpoint requests the endpoint address,
    /// for interface requests the interface number.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction
    /// given by `request_type`), this gives the number of bytes (OUT) or
    /// maximum number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl UsbSetupPacket {
    /// Reinterprets the raw 8 bytes captured by the driver.
    pub fn parse(raw: &[u8; 8]) -> Result<&UsbSetupPacket> {
        LayoutVerified::<_, UsbSetupPacket>::new(&raw[..])
            .map(LayoutVerified::into_ref)
            .ok_or(UsbError::InvalidSetupPacket)
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_u8((self.request_type >> 5) & 0x3)
    }

    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }

    pub fn standard_request(&self) -> Option<UsbSetupRequest> {
        UsbSetupRequest::from_u8(self.request)
    }

    /// Low byte of `wValue`; carries the address for SET_ADDRESS, the
    /// configuration for SET_CONFIGURATION and the descriptor index for
    /// GET_DESCRIPTOR.
    pub fn value_low(&self) -> u8 {
        self.value.get() as u8
    }

    /// High byte of `wValue`; carries the descriptor type for
    /// GET_DESCRIPTOR.
    pub fn value_high(&self) -> u8 {
        (self.value.get() >> 8) as u8
    }

    /// True for a host-to-device request declaring a data stage, which
    /// must be fully received before the request may be dispatched.
    pub fn has_data_out_stage(&self) -> bool {
        self.direction() == UsbDir::Out && self.length.get() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get_descriptor() {
        // GET_DESCRIPTOR(DEVICE), wLength = 64.
        let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        let setup = UsbSetupPacket::parse(&raw).unwrap();
        assert_eq!(setup.direction(), UsbDir::In);
        assert_eq!(setup.kind(), Some(RequestKind::Standard));
        assert_eq!(setup.recipient(), Some(Recipient::Device));
        assert_eq!(setup.standard_request(), Some(UsbSetupRequest::GetDescriptor));
        assert_eq!(setup.value_high(), 1);
        assert_eq!(setup.value_low(), 0);
        assert_eq!(setup.length.get(), 64);
        assert!(!setup.has_data_out_stage());
    }

    #[test]
    fn parse_class_out_with_data_stage() {
        // CDC SET_LINE_CODING shape: host-to-device class interface, 7 bytes.
        let raw = [0x21, 0x20, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00];
        let setup = UsbSetupPacket::parse(&raw).unwrap();
        assert_eq!(setup.direction(), UsbDir::Out);
        assert_eq!(setup.kind(), Some(RequestKind::Class));
        assert_eq!(setup.recipient(), Some(Recipient::Interface));
        // 0x20 is a class request code, not a standard one.
        assert_eq!(setup.standard_request(), None);
        assert!(setup.has_data_out_stage());
    }

    #[test]
    fn wire_values_are_little_endian() {
        let raw = [0x00, 0x05, 0x13, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = UsbSetupPacket::parse(&raw).unwrap();
        assert_eq!(setup.standard_request(), Some(UsbSetupRequest::SetAddress));
        assert_eq!(setup.value.get(), 0x13);
    }
}
