//! Sharing a host between thread mode and the interrupt handler

use crate::{
    class::ClassSet,
    error::Result,
    hcd::Hcd,
    host::{DeviceState, HostCallbacks, UsbHost},
    osal::Clock,
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// A [`UsbHost`] behind a critical section
///
/// Call [`isr`](HostAdapter::isr) from the controller's interrupt handler,
/// and [`poll`](HostAdapter::poll) from your main loop. Every call runs with
/// interrupts disabled.
pub struct HostAdapter<'a, H, K, C = ()> {
    host: Mutex<RefCell<UsbHost<'a, H, K, C>>>,
}

impl<'a, H: Hcd, K: Clock, C: HostCallbacks> HostAdapter<'a, H, K, C> {
    /// Wrap an initialized host
    pub fn new(host: UsbHost<'a, H, K, C>) -> Self {
        HostAdapter {
            host: Mutex::new(RefCell::new(host)),
        }
    }

    /// Interrupt-safe, immutable access to the host
    fn with_host<R>(&self, func: impl FnOnce(&UsbHost<'a, H, K, C>) -> R) -> R {
        interrupt::free(|cs| {
            let host = self.host.borrow(cs);
            let host = host.borrow();
            func(&*host)
        })
    }

    /// Interrupt-safe, mutable access to the host
    pub fn with_host_mut<R>(&self, func: impl FnOnce(&mut UsbHost<'a, H, K, C>) -> R) -> R {
        interrupt::free(|cs| {
            let host = self.host.borrow(cs);
            let mut host = host.borrow_mut();
            func(&mut *host)
        })
    }

    /// Call from the host controller's interrupt handler
    pub fn isr(&self) {
        self.with_host_mut(|host| host.isr());
    }

    /// Advance enumeration
    pub fn poll(&self) {
        self.with_host_mut(|host| host.poll());
    }

    pub fn device_get_state(&self, dev_addr: u8) -> Result<DeviceState> {
        self.with_host(|host| host.device_get_state(dev_addr))
    }

    pub fn device_mounted_classes(&self, dev_addr: u8) -> Result<ClassSet> {
        self.with_host(|host| host.device_mounted_classes(dev_addr))
    }
}
