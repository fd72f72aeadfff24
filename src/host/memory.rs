#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{ENUM_BUFFER_SIZE, MAX_DEVICES};

/// A buffer the controller reads and writes
///
/// Cache maintenance works on 32-byte lines, so no two buffers share one.
#[repr(C, align(32))]
pub(crate) struct DmaBuffer<const N: usize>(pub [u8; N]);

impl<const N: usize> DmaBuffer<N> {
    const fn new() -> Self {
        DmaBuffer([0; N])
    }
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

/// The buffers used by one hub
pub(crate) struct HubBuffers {
    /// Target of the status change pipe
    pub status_change: DmaBuffer<32>,
    /// Data stage of hub requests
    pub request: DmaBuffer<32>,
}

impl HubBuffers {
    const fn new() -> Self {
        HubBuffers {
            status_change: DmaBuffer::new(),
            request: DmaBuffer::new(),
        }
    }
}

/// Buffers the host stack hands to the controller
///
/// Allocate a `static` object and supply it to [`UsbHost::new`](crate::UsbHost::new).
/// The memory can only be taken once; a second host using the same memory
/// panics.
///
/// ```
/// use usbh_core::HostMemory;
///
/// static HOST_MEMORY: HostMemory = HostMemory::new();
/// ```
pub struct HostMemory {
    enumeration: UnsafeCell<DmaBuffer<ENUM_BUFFER_SIZE>>,
    hubs: UnsafeCell<[HubBuffers; MAX_DEVICES + 1]>,
    taken: AtomicBool,
}

unsafe impl Sync for HostMemory {}

impl HostMemory {
    pub const fn new() -> Self {
        const HUB: HubBuffers = HubBuffers::new();
        HostMemory {
            enumeration: UnsafeCell::new(DmaBuffer::new()),
            hubs: UnsafeCell::new([HUB; MAX_DEVICES + 1]),
            taken: AtomicBool::new(false),
        }
    }

    /// Take the buffers. Returns `None` if they're already taken.
    pub(crate) fn take(&'static self) -> Option<Buffers> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        // Safety: the flag guarantees one owner.
        unsafe {
            Some(Buffers {
                enumeration: &mut *self.enumeration.get(),
                hubs: &mut *self.hubs.get(),
            })
        }
    }

    /// Where a controller model writes the data stage of enumeration requests
    #[cfg(test)]
    pub(crate) fn enumeration_ptr(&self) -> *mut u8 {
        self.enumeration.get() as *mut u8
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Buffers {
    pub enumeration: &'static mut DmaBuffer<ENUM_BUFFER_SIZE>,
    pub hubs: &'static mut [HubBuffers; MAX_DEVICES + 1],
}

const _: () = assert!(core::mem::size_of::<HubBuffers>() == 64);

#[cfg(test)]
mod test {
    use super::HostMemory;
    use std::boxed::Box;

    #[test]
    fn take_once() {
        let memory: &'static HostMemory = Box::leak(Box::new(HostMemory::new()));
        let buffers = memory.take().unwrap();
        assert_eq!(buffers.enumeration.0.as_ptr() as usize % 32, 0);
        assert_eq!(buffers.hubs[1].status_change.0.as_ptr() as usize % 32, 0);
        assert!(memory.take().is_none());
    }
}
