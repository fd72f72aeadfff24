//! A USB host stack for embedded systems
//!
//! `usbh-core` enumerates USB devices, and hands their interfaces to class
//! drivers. It schedules transfers on EHCI or OHCI host controllers, keeping
//! their queue heads, endpoint descriptors, and transfer descriptors in
//! memory that you allocate statically.
//!
//! The stack has three layers:
//!
//! - a host controller driver, [`Ehci`] or [`Ohci`], implementing [`Hcd`];
//! - the host, [`UsbHost`], which owns the device table and the enumeration
//!   task;
//! - class drivers, implementing [`ClassDriver`]. The hub driver is built in.
//!
//! Nothing here blocks. The controller's interrupt handler calls
//! [`UsbHost::isr`], and your main loop calls [`UsbHost::poll`]. Wrap the
//! host in a [`HostAdapter`] to share it between the two.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. See the peripherals documentation for more information.

#![no_std]

#[cfg(test)]
extern crate std;

// The derives name `defmt`, not the renamed dependency.
#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;
#[macro_use]
mod ral;

mod adapter;
mod cache;
mod class;
mod descriptor;
mod ehci;
mod error;
mod hcd;
mod host;
mod ohci;
mod osal;
mod pipe;
mod pool;
mod request;
mod schedule;
mod vcell;

pub use adapter::HostAdapter;
pub use class::{ClassDriver, ClassKind, ClassSet};
pub use descriptor::{
    descriptor_type, ConfigurationDescriptor, DeviceDescriptor, Descriptors, EndpointDescriptor,
    InterfaceDescriptor,
};
pub use ehci::{Ehci, EhciState};
pub use error::{Error, ErrorKind, Result, XferResult};
pub use hcd::{Hcd, HcdEvent};
pub use host::{
    ControlTransfer, DeviceState, HostCallbacks, HostConfig, HostContext, HostMemory, HubChange,
    PortChange, PortReport, PortStatus, UsbHost, CONTROL_TIMEOUT_MS, POWER_STABLE_DELAY_MS, RESET_DELAY_MS,
};
pub use ohci::{Ohci, OhciState};
pub use osal::{Clock, Deadline, EventQueue, Mutex, Semaphore};
pub use pipe::{DeviceRoute, PipeHandle, Speed, TransferType};
pub use request::{hub_feature, port_feature, SetupPacket};

/// Highest device address. Address 0 is reserved for enumeration.
pub const MAX_DEVICES: usize = 5;
/// Queue heads (or endpoint descriptors) per device, besides the control pipe
pub const MAX_PIPES: usize = 4;
/// Transfer descriptors per device
pub const MAX_TDS: usize = 8;
/// Entries in the periodic frame list
pub const FRAMELIST_SIZE: usize = 8;
/// Interrupt polling buckets: 1, 2, 4, and 8 ms
pub const PERIOD_BUCKETS: usize = 4;
/// Size of the enumeration buffer. Larger configurations fail to mount.
pub const ENUM_BUFFER_SIZE: usize = 256;
/// Depth of the enumeration event queue
pub const ENUM_QUEUE_DEPTH: usize = 8;
/// Ports serviced on a hub
pub const MAX_HUB_PORTS: usize = 8;

/// The 32-bit bus address of a structure the controller reads
///
/// The targets have a flat 32-bit address space.
pub(crate) fn dma_addr<T>(ptr: *const T) -> u32 {
    ptr as usize as u32
}

/// A type that owns a host controller's register block
///
/// An implementation of `Peripherals` is expected to own the operational
/// registers of one EHCI or OHCI host controller.
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// register block of a host controller. The pointer returned by
/// `host_controller` is assumed to be valid, and will be cast to a register
/// definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` for the EHCI host controller of an
/// i.MX RT USB1 instance. Assume that `ral` is shorthand for `imxrt_ral`.
///
/// ```
/// # mod ral {
/// #   use core::ops::Deref; pub struct Instance; impl Deref for Instance { type Target = u32; fn deref(&self) -> &u32 { unsafe { &*(0x402e0140 as *const u32)} } }
/// #   pub fn take() -> Result<Instance, ()> { Ok(Instance) }
/// #   pub mod usb { pub use super::Instance; pub mod USB1 { pub use super::super::take; } }
/// # }
/// use ral::usb;
/// use usbh_core::Peripherals;
///
/// struct HostController {
///     usb: usb::Instance,
/// }
///
/// impl HostController {
///     /// Panics if the instance is already taken
///     pub fn usb1() -> HostController {
///         Self {
///             usb: usb::USB1::take().unwrap(),
///         }
///     }
/// }
///
/// unsafe impl Peripherals for HostController {
///     fn host_controller(&self) -> *const () {
///         &*self.usb as *const _ as _
///     }
/// }
///
/// let controller = HostController::usb1();
/// assert_eq!(controller.host_controller(), 0x402e0140 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the host controller's operational registers
    fn host_controller(&self) -> *const ();
}
