//! Cache maintenance operations
//!
//! These functions were adapted from the cortex-m (0.7.1) crate.
//! cortex-m only lets you access these functions when you have
//! the SCB in cortex_m::Peripherals collection. But, we neither want
//! to steal the peripheral(s), nor own them. So, we're duplicating
//! the routines that we need, and making sure that we're using
//! them safely.
//!
//! Host controllers read descriptors and transfer buffers by DMA.
//! Everything the driver hands to the controller passes through
//! here first. Off-target builds (like the unit tests) have no
//! data cache, so the operations do nothing.
//!
//! cortex-m crate available at <https://github.com/rust-embedded/cortex-m>.

/// Cleans and invalidates D-cache by address.
///
/// * `addr`: The address to clean and invalidate.
/// * `size`: The number of bytes to clean and invalidate.
///
/// Cleans and invalidates D-cache starting from the first cache line containing `addr`,
/// finishing once at least `size` bytes have been cleaned and invalidated.
///
/// Cleaning and invalidating causes data in the D-cache to be written back to main memory,
/// and then marks that data in the D-cache as invalid, causing future reads to first fetch
/// from main memory.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn clean_invalidate_dcache_by_address(addr: usize, size: usize) {
    if size == 0 {
        return;
    }

    // Safety: write-only registers, pointer to static memory
    let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

    cortex_m::asm::dsb();

    // Cache lines are fixed to 32 bit on Cortex-M7 and not present in earlier Cortex-M
    const LINESIZE: usize = 32;
    let num_lines = ((size - 1) / LINESIZE) + 1;

    let mut addr = addr & 0xFFFF_FFE0;

    for _ in 0..num_lines {
        // Safety: write to Cortex-M write-only register
        unsafe { cbp.dccimvac.write(addr as u32) };
        addr += LINESIZE;
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn clean_invalidate_dcache_by_address(_addr: usize, _size: usize) {}

/// Clean and invalidate the memory behind `value`
pub fn clean_invalidate<T: ?Sized>(value: &T) {
    clean_invalidate_dcache_by_address(value as *const T as *const u8 as usize, core::mem::size_of_val(value));
}
