//! Volatile cell that conforms to the RAL's register API
//!
//! Hardware-shared descriptors and, in tests, simulated register
//! blocks are built from these cells.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }

    /// Returns the address of the cell, for handing to the controller
    pub fn as_ptr(&self) -> *mut T {
        self.0.get()
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

// Shared between the task and the interrupt handler. All access is volatile.
unsafe impl<T: Send> Sync for VCell<T> {}

#[cfg(test)]
mod test {
    use super::VCell;

    #[test]
    fn read_write() {
        let cell = VCell::new(0u32);
        cell.write(0xDEAD_BEEF);
        assert_eq!(cell.read(), 0xDEAD_BEEF);
    }
}
