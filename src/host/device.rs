use crate::{
    class::ClassSet,
    error::XferResult,
    osal::{Mutex, Semaphore},
    pipe::{DeviceRoute, Speed},
};

/// Where a device is in its lifecycle
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum DeviceState {
    /// The slot is free
    Unplugged,
    /// The device has its address, and is being configured
    Addressed,
    /// The device is configured, and its classes are mounted
    Configured,
    Suspended,
    /// The device is gone, and its pipes are being reclaimed
    Removing,
    SafeRemove,
}

/// Hand-off between the interrupt handler and a control transfer
///
/// The mutex keeps one control transfer in flight. The interrupt handler
/// stores the outcome, then posts the semaphore.
pub(crate) struct ControlSync {
    pub mutex: Mutex,
    pub semaphore: Semaphore,
    pub result: XferResult,
    pub bytes: usize,
}

impl ControlSync {
    const fn new() -> Self {
        ControlSync {
            mutex: Mutex::new(),
            semaphore: Semaphore::new(),
            result: XferResult::Success,
            bytes: 0,
        }
    }

    fn reset(&mut self) {
        self.mutex.reset();
        self.semaphore.reset();
        self.result = XferResult::Success;
        self.bytes = 0;
    }
}

/// A slot in the device table
pub(crate) struct Device {
    pub state: DeviceState,
    pub speed: Speed,
    pub rhport: u8,
    pub hub_addr: u8,
    pub hub_port: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub classes: ClassSet,
    pub control: ControlSync,
}

impl Device {
    pub const fn new() -> Self {
        Device {
            state: DeviceState::Unplugged,
            speed: Speed::Full,
            rhport: 0,
            hub_addr: 0,
            hub_port: 0,
            vendor_id: 0,
            product_id: 0,
            classes: ClassSet::empty(),
            control: ControlSync::new(),
        }
    }

    /// Return the slot to `Unplugged`
    pub fn reset(&mut self) {
        self.state = DeviceState::Unplugged;
        self.speed = Speed::Full;
        self.rhport = 0;
        self.hub_addr = 0;
        self.hub_port = 0;
        self.vendor_id = 0;
        self.product_id = 0;
        self.classes = ClassSet::empty();
        self.control.reset();
    }

    pub fn route(&self, dev_addr: u8) -> DeviceRoute {
        DeviceRoute {
            dev_addr,
            speed: self.speed,
            rhport: self.rhport,
            hub_addr: self.hub_addr,
            hub_port: self.hub_port,
        }
    }

    pub fn set_route(&mut self, route: &DeviceRoute) {
        self.speed = route.speed;
        self.rhport = route.rhport;
        self.hub_addr = route.hub_addr;
        self.hub_port = route.hub_port;
    }

    /// `true` if the device is (or is being) enumerated
    pub fn is_present(&self) -> bool {
        matches!(
            self.state,
            DeviceState::Addressed | DeviceState::Configured | DeviceState::Suspended
        )
    }

    /// `true` if the device sits behind `route`
    ///
    /// A root port route (no hub) matches every device on that root port,
    /// including the ones behind a hub.
    pub fn is_behind(&self, route: &DeviceRoute) -> bool {
        if self.rhport != route.rhport {
            false
        } else if route.hub_addr == 0 {
            true
        } else {
            self.hub_addr == route.hub_addr && self.hub_port == route.hub_port
        }
    }
}
