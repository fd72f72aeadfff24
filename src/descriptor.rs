//! Standard descriptor parsing
//!
//! Descriptors arrive as little-endian byte strings in the enumeration
//! buffer. These types pull out the fields the host needs.

use crate::error::{Error, Result};
use crate::pipe::TransferType;
use usb_device::endpoint::EndpointAddress;

/// `bDescriptorType` values
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const HUB: u8 = 0x29;
}

fn le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn check(buf: &[u8], len: usize, descriptor_type: u8) -> Result<()> {
    if buf.len() < len || (buf[0] as usize) < len || buf[1] != descriptor_type {
        Err(Error::InvalidDescriptor)
    } else {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::SIZE, descriptor_type::DEVICE)?;
        Ok(DeviceDescriptor {
            usb_release: le16(buf, 2),
            device_class: buf[4],
            device_sub_class: buf[5],
            device_protocol: buf[6],
            max_packet_size0: buf[7],
            vendor_id: le16(buf, 8),
            product_id: le16(buf, 10),
            device_release: le16(buf, 12),
            manufacturer_index: buf[14],
            product_index: buf[15],
            serial_number_index: buf[16],
            num_configurations: buf[17],
        })
    }

    /// Read `bMaxPacketSize0` from the first eight bytes of a device descriptor
    pub fn peek_max_packet_size0(buf: &[u8]) -> Result<u8> {
        if buf.len() < 8 || buf[1] != descriptor_type::DEVICE {
            return Err(Error::InvalidDescriptor);
        }
        match buf[7] {
            8 | 16 | 32 | 64 => Ok(buf[7]),
            _ => Err(Error::InvalidDescriptor),
        }
    }
}

/// The nine-byte configuration descriptor header
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const SIZE: usize = 9;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::SIZE, descriptor_type::CONFIGURATION)?;
        let total_length = le16(buf, 2);
        if (total_length as usize) < Self::SIZE {
            return Err(Error::InvalidDescriptor);
        }
        Ok(ConfigurationDescriptor {
            total_length,
            num_interfaces: buf[4],
            configuration_value: buf[5],
            attributes: buf[7],
            max_power: buf[8],
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::SIZE, descriptor_type::INTERFACE)?;
        Ok(InterfaceDescriptor {
            interface_number: buf[2],
            alternate_setting: buf[3],
            num_endpoints: buf[4],
            interface_class: buf[5],
            interface_sub_class: buf[6],
            interface_protocol: buf[7],
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub attributes: u8,
    /// Raw `wMaxPacketSize`, including the high-bandwidth bits
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check(buf, Self::SIZE, descriptor_type::ENDPOINT)?;
        Ok(EndpointDescriptor {
            address: EndpointAddress::from(buf[2]),
            attributes: buf[3],
            max_packet_size: le16(buf, 4),
            interval: buf[6],
        })
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    /// Bytes per packet, without the high-bandwidth multiplier
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }
}

/// Walks the descriptors in a buffer
///
/// Iteration stops at the end of the buffer, or at the first descriptor
/// whose length is too short or runs past the end.
pub struct Descriptors<'a> {
    buf: &'a [u8],
}

impl<'a> Descriptors<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Descriptors { buf }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<&'a [u8]> {
        let len = *self.buf.first()? as usize;
        if len < 2 || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let (desc, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(desc)
    }
}

/// Find the offset of the next interface descriptor at or after `from`
///
/// Returns `Ok(None)` when the buffer holds no more interfaces. A malformed
/// descriptor before the next interface is an error.
pub fn find_interface(buf: &[u8], from: usize) -> Result<Option<usize>> {
    let mut offset = from;
    while offset < buf.len() {
        let len = buf[offset] as usize;
        if len < 2 || offset + len > buf.len() {
            return Err(Error::InvalidDescriptor);
        }
        if buf[offset + 1] == descriptor_type::INTERFACE {
            return Ok(Some(offset));
        }
        offset += len;
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use usb_device::UsbDirection;

    pub const DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1,
    ];

    /// One HID boot keyboard interface with an interrupt IN endpoint
    pub const KEYBOARD_CONFIG: [u8; 34] = [
        9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
        9, 4, 0, 0, 1, 3, 1, 1, 0, // interface: HID boot keyboard
        9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // HID
        7, 5, 0x81, 3, 8, 0, 10, // endpoint 1 IN, interrupt
    ];

    #[test]
    fn device() {
        let desc = DeviceDescriptor::parse(&DEVICE).unwrap();
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.num_configurations, 1);
        assert_eq!(DeviceDescriptor::peek_max_packet_size0(&DEVICE[..8]), Ok(64));
    }

    #[test]
    fn device_truncated() {
        assert_eq!(
            DeviceDescriptor::parse(&DEVICE[..8]),
            Err(Error::InvalidDescriptor)
        );
        let mut bad = DEVICE;
        bad[7] = 7;
        assert_eq!(
            DeviceDescriptor::peek_max_packet_size0(&bad),
            Err(Error::InvalidDescriptor)
        );
    }

    #[test]
    fn configuration() {
        let config = ConfigurationDescriptor::parse(&KEYBOARD_CONFIG).unwrap();
        assert_eq!(config.total_length, 34);
        assert_eq!(config.num_interfaces, 1);
        assert_eq!(config.configuration_value, 1);
    }

    #[test]
    fn walk() {
        let types: [u8; 4] = [2, 4, 0x21, 5];
        let mut count = 0;
        for (desc, ty) in Descriptors::new(&KEYBOARD_CONFIG).zip(types) {
            assert_eq!(desc[1], ty);
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn walk_stops_on_bad_length() {
        let buf = [9, 2, 0, 0, 0, 0, 0, 0, 0, 1, 4];
        assert_eq!(Descriptors::new(&buf).count(), 1);
    }

    #[test]
    fn interfaces() {
        assert_eq!(find_interface(&KEYBOARD_CONFIG, 0), Ok(Some(9)));
        let itf = InterfaceDescriptor::parse(&KEYBOARD_CONFIG[9..]).unwrap();
        assert_eq!(itf.interface_class, 3);
        assert_eq!(itf.interface_protocol, 1);
        assert_eq!(find_interface(&KEYBOARD_CONFIG, 18), Ok(None));
        assert_eq!(
            find_interface(&[9, 2, 0, 0, 0, 0, 0, 0, 0, 0, 4], 9),
            Err(Error::InvalidDescriptor)
        );
    }

    #[test]
    fn endpoint() {
        let ep = EndpointDescriptor::parse(&KEYBOARD_CONFIG[27..]).unwrap();
        assert_eq!(ep.transfer_type(), TransferType::Interrupt);
        assert_eq!(ep.address.index(), 1);
        assert_eq!(ep.address.direction(), UsbDirection::In);
        assert_eq!(ep.packet_size(), 8);
        assert_eq!(ep.interval, 10);
    }
}
