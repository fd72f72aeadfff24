//! Control requests issued by the host
//!
//! Requests are described with `usb-device`'s [`Request`], then packed into
//! the eight-byte SETUP payload the controller sends.

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

use crate::descriptor::descriptor_type;

/// Hub class port features
pub mod port_feature {
    pub const CONNECTION: u16 = 0;
    pub const ENABLE: u16 = 1;
    pub const SUSPEND: u16 = 2;
    pub const OVER_CURRENT: u16 = 3;
    pub const RESET: u16 = 4;
    pub const POWER: u16 = 8;
    pub const LOW_SPEED: u16 = 9;
    pub const C_CONNECTION: u16 = 16;
    pub const C_ENABLE: u16 = 17;
    pub const C_SUSPEND: u16 = 18;
    pub const C_OVER_CURRENT: u16 = 19;
    pub const C_RESET: u16 = 20;
}

/// Hub class hub features
pub mod hub_feature {
    pub const C_LOCAL_POWER: u16 = 0;
    pub const C_OVER_CURRENT: u16 = 1;
}

/// The eight bytes sent in a SETUP transaction
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct SetupPacket([u8; 8]);

impl SetupPacket {
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SetupPacket(bytes)
    }

    pub const fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub const fn request_type(&self) -> u8 {
        self.0[0]
    }

    pub const fn request(&self) -> u8 {
        self.0[1]
    }

    pub const fn value(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub const fn index(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    /// `wLength`
    pub const fn length(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    /// `true` if the data stage moves from device to host
    pub const fn is_in(&self) -> bool {
        self.0[0] & 0x80 != 0
    }

    pub fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self::from(&Request {
            direction: UsbDirection::In,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: Request::GET_DESCRIPTOR,
            value: (descriptor_type as u16) << 8 | index as u16,
            index: 0,
            length,
        })
    }

    pub fn set_address(address: u8) -> Self {
        Self::from(&Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: Request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        })
    }

    pub fn set_configuration(configuration: u8) -> Self {
        Self::from(&Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: Request::SET_CONFIGURATION,
            value: configuration as u16,
            index: 0,
            length: 0,
        })
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT)
    pub fn clear_endpoint_halt(endpoint_address: u8) -> Self {
        Self::from(&Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Endpoint,
            request: Request::CLEAR_FEATURE,
            value: Request::FEATURE_ENDPOINT_HALT,
            index: endpoint_address as u16,
            length: 0,
        })
    }

    pub fn get_hub_descriptor(length: u16) -> Self {
        Self::from(&Request {
            direction: UsbDirection::In,
            request_type: RequestType::Class,
            recipient: Recipient::Device,
            request: Request::GET_DESCRIPTOR,
            value: (descriptor_type::HUB as u16) << 8,
            index: 0,
            length,
        })
    }

    /// Reads the four-byte port status and change words
    pub fn get_port_status(port: u8) -> Self {
        Self::from(&Request {
            direction: UsbDirection::In,
            request_type: RequestType::Class,
            recipient: Recipient::Other,
            request: Request::GET_STATUS,
            value: 0,
            index: port as u16,
            length: 4,
        })
    }

    /// Reads the four-byte hub status and change words
    pub fn get_hub_status() -> Self {
        Self::from(&Request {
            direction: UsbDirection::In,
            request_type: RequestType::Class,
            recipient: Recipient::Device,
            request: Request::GET_STATUS,
            value: 0,
            index: 0,
            length: 4,
        })
    }

    pub fn clear_hub_feature(feature: u16) -> Self {
        Self::from(&Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Class,
            recipient: Recipient::Device,
            request: Request::CLEAR_FEATURE,
            value: feature,
            index: 0,
            length: 0,
        })
    }

    pub fn set_port_feature(port: u8, feature: u16) -> Self {
        Self::port_feature(Request::SET_FEATURE, port, feature)
    }

    pub fn clear_port_feature(port: u8, feature: u16) -> Self {
        Self::port_feature(Request::CLEAR_FEATURE, port, feature)
    }

    fn port_feature(request: u8, port: u8, feature: u16) -> Self {
        Self::from(&Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Class,
            recipient: Recipient::Other,
            request,
            value: feature,
            index: port as u16,
            length: 0,
        })
    }
}

impl From<&Request> for SetupPacket {
    fn from(req: &Request) -> Self {
        let request_type = req.direction as u8 | (req.request_type as u8) << 5 | req.recipient as u8;
        let [value_lo, value_hi] = req.value.to_le_bytes();
        let [index_lo, index_hi] = req.index.to_le_bytes();
        let [length_lo, length_hi] = req.length.to_le_bytes();
        SetupPacket([
            request_type,
            req.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ])
    }
}
