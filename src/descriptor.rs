// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB descriptor wire structures and the sink-based assembly protocol.
//!
//! Descriptors are the self-describing records a host reads during
//! enumeration. All of them start with a length byte and a type byte and
//! are packed little-endian, so each one is declared as a `#[repr(C)]`
//! struct deriving `AsBytes` and sent straight off its memory
//! representation.
//!
//! The composite configuration descriptor is special: its total length
//! must be known up front (it's the third field) but its body is
//! contributed piecewise by an arbitrary set of functions. Assembly is
//! therefore two-pass: the same contribution calls run once against a
//! [`CountingSink`] to measure, and once against a real buffer sink to
//! emit. Passing the sink explicitly is what keeps the two passes
//! identical without any global "dry run" mode.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, U16};

use crate::{Result, UsbError};

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    /// Binds several interfaces into one function of a composite device.
    InterfaceAssociation = 0x0B,
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `UsbEndpointDescriptor` and in endpoint configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    /// Declarable but carries no data path in this core.
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Device class triple advertised for composite devices built from
/// interface association descriptors (the "IAD device class").
pub const DEVICE_CLASS: u8 = 0xEF;
pub const DEVICE_SUB_CLASS: u8 = 0x02;
pub const DEVICE_PROTOCOL: u8 = 0x01;

/// bcdUSB version reported in the device descriptor.
pub const USB_VERSION: u16 = 0x0200;

/// Configuration attribute bits.
pub const USB_CONFIG_BUS_POWERED: u8 = 0x80;
pub const USB_CONFIG_REMOTE_WAKEUP: u8 = 0x20;

/// String descriptor indices used by the device descriptor.
pub const IMANUFACTURER: u8 = 1;
pub const IPRODUCT: u8 = 2;
pub const ISERIAL: u8 = 3;

/// The index-0 "string" descriptor listing supported language IDs;
/// this one declares US English only.
pub const LANG_DESCRIPTOR: [u8; 4] = [4, 0x03, 0x09, 0x04];

/// Describes a device. This is the broadest description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// Version of the USB protocol, in binary-coded decimal.
    pub bcd_usb: U16<LittleEndian>,
    /// Class of device, giving a broad functional area.
    pub device_class: u8,
    /// Subclass of device, refining the class.
    pub device_subclass: u8,
    /// Protocol within the subclass.
    pub device_protocol: u8,
    /// Maximum packet size of endpoint 0.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    pub bcd_device: U16<LittleEndian>,
    /// Index of manufacturer name in the string descriptor table.
    pub manufacturer_s: u8,
    /// Index of product name in the string descriptor table.
    pub product_s: u8,
    /// Index of serial number in the string descriptor table.
    pub serial_s: u8,
    pub num_configurations: u8,
}

impl UsbDeviceDescriptor {
    /// Builds the composite-device descriptor the way the device
    /// enumeration state advertises it: IAD class triple, one
    /// configuration, strings at the fixed indices.
    pub fn composite(
        vendor: u16,
        product: u16,
        device_version: u16,
        has_serial: bool,
    ) -> UsbDeviceDescriptor {
        UsbDeviceDescriptor {
            length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
            descriptor_type: UsbDescType::Device,
            bcd_usb: U16::from_bytes(u16::to_le_bytes(USB_VERSION)),
            device_class: DEVICE_CLASS,
            device_subclass: DEVICE_SUB_CLASS,
            device_protocol: DEVICE_PROTOCOL,
            max_packet_size0: crate::USB_EP_SIZE as u8,
            vendor: U16::from_bytes(u16::to_le_bytes(vendor)),
            product: U16::from_bytes(u16::to_le_bytes(product)),
            bcd_device: U16::from_bytes(u16::to_le_bytes(device_version)),
            manufacturer_s: IMANUFACTURER,
            product_s: IPRODUCT,
            serial_s: if has_serial { ISERIAL } else { 0 },
            num_configurations: 1,
        }
    }
}

/// Description of a single available device configuration. On the wire
/// it is immediately followed by the interface and endpoint descriptors
/// it covers, and `total_length` spans all of them.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Config`.
    pub descriptor_type: UsbDescType,
    /// Total length of all descriptors in this configuration,
    /// concatenated.
    pub total_length: U16<LittleEndian>,
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit set of device attributes; bit 7 must be set, bit 6 means
    /// self-powered, bit 5 means remote wakeup capable.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2 mA.
    pub max_power: u8,
}

impl UsbConfigurationDescriptor {
    pub fn new(total_length: u16, num_interfaces: u8, max_power_ma: u16) -> Self {
        UsbConfigurationDescriptor {
            length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
            descriptor_type: UsbDescType::Config,
            total_length: U16::from_bytes(u16::to_le_bytes(total_length)),
            num_interfaces,
            configuration_value: 1,
            configuration_s: 0,
            attributes: USB_CONFIG_BUS_POWERED | USB_CONFIG_REMOTE_WAKEUP,
            max_power: (max_power_ma / 2) as u8,
        }
    }
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Interface`.
    pub descriptor_type: UsbDescType,
    pub interface_number: u8,
    /// Alternate setting index; normally 0.
    pub alternate_setting: u8,
    /// Number of endpoint descriptors in this interface.
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

impl UsbInterfaceDescriptor {
    pub fn new(number: u8, num_endpoints: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        UsbInterfaceDescriptor {
            length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
            descriptor_type: UsbDescType::Interface,
            interface_number: number,
            alternate_setting: 0,
            num_endpoints,
            interface_class: class,
            interface_subclass: subclass,
            interface_protocol: protocol,
            interface_s: 0,
        }
    }
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Type of this descriptor, must be `Endpoint`.
    pub descriptor_type: UsbDescType,
    /// Address of this endpoint: bottom 4 bits endpoint number, top bit
    /// IN (1) vs OUT (0).
    pub endpoint_address: u8,
    /// Bottom 2 bits select the transfer type per `UsbTransferType`.
    pub attributes: u8,
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval for interrupt endpoints, in milliseconds.
    pub interval: u8,
}

impl UsbEndpointDescriptor {
    pub fn new(address: u8, transfer: UsbTransferType, max_packet_size: u16, interval: u8) -> Self {
        UsbEndpointDescriptor {
            length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
            descriptor_type: UsbDescType::Endpoint,
            endpoint_address: address,
            attributes: transfer as u8,
            max_packet_size: U16::from_bytes(u16::to_le_bytes(max_packet_size)),
            interval,
        }
    }
}

/// Binds consecutive interfaces together into one function, required for
/// multi-interface functions on composite devices.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceAssociationDescriptor {
    /// Length of this struct, must be 8.
    pub length: u8,
    /// Type of this descriptor, must be `InterfaceAssociation`.
    pub descriptor_type: UsbDescType,
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
    pub function_s: u8,
}

impl UsbInterfaceAssociationDescriptor {
    pub fn new(first_interface: u8, count: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        UsbInterfaceAssociationDescriptor {
            length: core::mem::size_of::<UsbInterfaceAssociationDescriptor>() as u8,
            descriptor_type: UsbDescType::InterfaceAssociation,
            first_interface,
            interface_count: count,
            function_class: class,
            function_subclass: subclass,
            function_protocol: protocol,
            function_s: 0,
        }
    }
}

/// Receiver for descriptor bytes during configuration assembly. The
/// measuring pass and the emitting pass call the exact same contribution
/// code against different sinks.
pub trait DescriptorSink {
    /// Appends raw descriptor bytes.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Appends one descriptor struct off its wire representation.
    fn write_descriptor(&mut self, desc: &dyn AsDescriptorBytes) -> Result<()> {
        self.write(desc.descriptor_bytes())
    }
}

/// Object-safe bridge for passing any `AsBytes` descriptor struct
/// through a `&dyn DescriptorSink`.
pub trait AsDescriptorBytes {
    fn descriptor_bytes(&self) -> &[u8];
}

impl<T: AsBytes> AsDescriptorBytes for T {
    fn descriptor_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Measuring sink: counts bytes, emits nothing.
#[derive(Default)]
pub struct CountingSink {
    total: usize,
}

impl CountingSink {
    pub fn new() -> Self {
        CountingSink { total: 0 }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

impl DescriptorSink for CountingSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.total += bytes.len();
        Ok(())
    }
}

/// Emitting sink: packs bytes into a fixed buffer, failing (instead of
/// truncating) when the buffer is too small -- an oversized descriptor is
/// a capacity error that the dispatcher turns into a stall.
pub struct SliceSink<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> SliceSink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        SliceSink { buf, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl DescriptorSink for SliceSink<'_> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.used + bytes.len();
        if end > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        self.buf[self.used..end].copy_from_slice(bytes);
        self.used = end;
        Ok(())
    }
}

/// Transcodes `text` into a string descriptor in `out`: a 2-byte header
/// followed by UTF-16LE code units, truncated to the lesser of the
/// available text, `max_len` (the host's `wLength`) and the buffer.
/// Returns the number of bytes produced; 0 means `max_len` left no room
/// for the header.
pub fn write_string_descriptor(out: &mut [u8], text: &str, max_len: usize) -> usize {
    if max_len < 2 || out.len() < 2 {
        return 0;
    }
    let chars = text.chars().count();
    let mut len = (chars + 1) * 2;
    if len > max_len {
        len = max_len;
    }
    if len > out.len() {
        len = out.len();
    }
    out[0] = len as u8;
    out[1] = UsbDescType::String as u8;
    let mut i = 2;
    for c in text.chars() {
        if i + 1 >= len {
            break;
        }
        // Characters outside the BMP would need surrogate pairs; they
        // are replaced, matching the one-unit-per-character layout.
        let unit = if (c as u32) <= 0xFFFF { c as u32 as u16 } else { 0xFFFD };
        out[i..i + 2].copy_from_slice(&unit.to_le_bytes());
        i += 2;
    }
    // A requested length cutting a code unit in half shortens the
    // descriptor to whole units.
    out[0] = i as u8;
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_is_18_bytes() {
        let d = UsbDeviceDescriptor::composite(0x2341, 0x0001, 0x0100, true);
        let bytes = d.as_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0], 18);
        assert_eq!(bytes[1], 0x01);
        // Little-endian idVendor at offset 8.
        assert_eq!(&bytes[8..10], &[0x41, 0x23]);
        assert_eq!(bytes[16], ISERIAL);
    }

    #[test]
    fn config_descriptor_header() {
        let c = UsbConfigurationDescriptor::new(0x0041, 2, 500);
        let bytes = c.as_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[2..4], &[0x41, 0x00]);
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[8], 250);
    }

    #[test]
    fn endpoint_descriptor_layout() {
        let e = UsbEndpointDescriptor::new(0x81, UsbTransferType::Bulk, 64, 0);
        assert_eq!(e.as_bytes(), &[7, 5, 0x81, 2, 64, 0, 0]);
    }

    #[test]
    fn counting_and_slice_sinks_agree() {
        let iface = UsbInterfaceDescriptor::new(0, 2, 0xFF, 0, 0);
        let ep = UsbEndpointDescriptor::new(0x01, UsbTransferType::Bulk, 64, 0);

        let mut count = CountingSink::new();
        count.write_descriptor(&iface).unwrap();
        count.write_descriptor(&ep).unwrap();

        let mut buf = [0u8; 64];
        let mut slice = SliceSink::new(&mut buf);
        slice.write_descriptor(&iface).unwrap();
        slice.write_descriptor(&ep).unwrap();

        assert_eq!(count.total(), 16);
        assert_eq!(slice.used(), count.total());
    }

    #[test]
    fn slice_sink_overflow_is_an_error() {
        let mut buf = [0u8; 4];
        let mut sink = SliceSink::new(&mut buf);
        assert_eq!(sink.write(&[0; 5]), Err(UsbError::BufferOverflow));
    }

    #[test]
    fn string_descriptor_encoding() {
        let mut buf = [0u8; 64];
        let n = write_string_descriptor(&mut buf, "AB", 255);
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], &[6, 0x03, b'A', 0, b'B', 0]);
    }

    #[test]
    fn string_descriptor_truncates_to_request() {
        let mut buf = [0u8; 64];
        // Host allows only 4 bytes: header plus one code unit.
        let n = write_string_descriptor(&mut buf, "ABC", 4);
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[4, 0x03, b'A', 0]);

        // A 2-byte request yields just the header.
        let n = write_string_descriptor(&mut buf, "ABC", 2);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[2, 0x03]);
    }
}
