//! Pipe handles and routing information

/// Bus speed of a device
///
/// Discriminants match the EHCI endpoint speed encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum Speed {
    Full = 0,
    Low = 1,
    High = 2,
}

/// Endpoint transfer type
///
/// Discriminants match `bmAttributes[1:0]` of an endpoint descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Names an open pipe
///
/// A handle is a projection of a queue head's position in the device's
/// pool, plus the generation of that slot when the pipe was opened. Once
/// the pipe closes, the handle goes stale: the controller drivers reject
/// it, even if the slot is reused by a later `pipe_open`.
///
/// A handle with device address 0 is the null handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct PipeHandle {
    pub(crate) dev_addr: u8,
    pub(crate) xfer_type: TransferType,
    pub(crate) index: u8,
    pub(crate) generation: u8,
}

impl PipeHandle {
    pub const NULL: PipeHandle = PipeHandle {
        dev_addr: 0,
        xfer_type: TransferType::Control,
        index: 0,
        generation: 0,
    };

    pub const fn dev_addr(&self) -> u8 {
        self.dev_addr
    }
    pub const fn xfer_type(&self) -> TransferType {
        self.xfer_type
    }
    pub const fn index(&self) -> u8 {
        self.index
    }
    pub const fn is_null(&self) -> bool {
        self.dev_addr == 0
    }
}

impl Default for PipeHandle {
    fn default() -> Self {
        Self::NULL
    }
}

/// How a device is reached, and how fast it talks
///
/// A hub address and port of zero means the device is on the root port.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct DeviceRoute {
    pub dev_addr: u8,
    pub speed: Speed,
    pub rhport: u8,
    pub hub_addr: u8,
    pub hub_port: u8,
}

#[cfg(test)]
mod test {
    use super::{PipeHandle, TransferType};

    #[test]
    fn transfer_type() {
        assert_eq!(TransferType::from_attributes(0x02), TransferType::Bulk);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
        assert_eq!(TransferType::from_attributes(0x0D), TransferType::Isochronous);
        assert_eq!(TransferType::from_attributes(0x00), TransferType::Control);
    }

    #[test]
    fn null_handle() {
        assert!(PipeHandle::NULL.is_null());
        assert!(PipeHandle::default().is_null());
    }
}
