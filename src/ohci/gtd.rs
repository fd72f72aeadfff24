//! General transfer descriptors (gTD)

#![allow(non_snake_case, non_upper_case_globals)]

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use crate::{
    pool::{Slot, Slotted},
    ral,
    vcell::VCell,
};

#[repr(C, align(32))]
pub struct Gtd {
    CONTROL: VCell<u32>,
    CBP: VCell<u32>,
    NEXT_TD: VCell<u32>,
    BE: VCell<u32>,

    slot: Slot,
    expected: AtomicU16,
    next: AtomicU8,
}

pub mod CONTROL {
    fields! {
        R @ 18 : 1,
        DP @ 19 : 2,
        DI @ 21 : 3,
        T @ 24 : 2,
        EC @ 26 : 2,
        CC @ 28 : 4,
    }
    /// Delay interrupt value that suppresses the completion interrupt
    pub const DI_NONE: u32 = 0b111;
}

/// Condition codes written back by the controller
pub mod condition {
    pub const NO_ERROR: u8 = 0;
    pub const STALL: u8 = 4;
    /// Set by the driver; the controller hasn't retired the gTD
    pub const NOT_ACCESSED: u8 = 0xF;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Pid {
    Setup = 0,
    Out = 1,
    In = 2,
}

/// Data toggle source
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Toggle {
    /// Take the toggle carried in the endpoint descriptor
    Carry = 0b00,
    Data0 = 0b10,
    Data1 = 0b11,
}

const PAGE_SIZE: u32 = 4096;
const NO_GTD: u8 = 0xFF;

/// Bytes left between the current buffer pointer and the buffer end
fn bytes_left(cbp: u32, be: u32) -> usize {
    if cbp == 0 {
        return 0;
    }
    let crossed = if (be ^ cbp) & !(PAGE_SIZE - 1) != 0 {
        PAGE_SIZE
    } else {
        0
    };
    let offset = |addr: u32| addr & (PAGE_SIZE - 1);
    (crossed + offset(be)).wrapping_sub(offset(cbp)).wrapping_add(1) as usize
}

impl Gtd {
    pub const fn new() -> Self {
        Gtd {
            CONTROL: VCell::new(0),
            CBP: VCell::new(0),
            NEXT_TD: VCell::new(0),
            BE: VCell::new(0),
            slot: Slot::new(),
            expected: AtomicU16::new(0),
            next: AtomicU8::new(NO_GTD),
        }
    }

    /// Describe a transfer of `len` bytes, with no successor
    ///
    /// A gTD can move up to two pages; the buffer may cross one page boundary.
    pub fn prepare(&self, buffer: *const u8, len: usize, pid: Pid, toggle: Toggle, ioc: bool) {
        self.expected.store(len as u16, Ordering::Relaxed);
        self.set_next_index(None);
        self.NEXT_TD.write(0);
        if len == 0 {
            self.CBP.write(0);
            self.BE.write(0);
        } else {
            let addr = crate::dma_addr(buffer);
            self.CBP.write(addr);
            self.BE.write(addr.wrapping_add(len as u32 - 1));
        }
        ral::write_reg!(
            crate::ohci::gtd,
            self,
            CONTROL,
            R: 1,
            DP: pid as u32,
            DI: if ioc { 0 } else { CONTROL::DI_NONE },
            T: toggle as u32,
            CC: condition::NOT_ACCESSED as u32
        );
    }

    pub fn condition_code(&self) -> u8 {
        ral::read_reg!(crate::ohci::gtd, self, CONTROL, CC) as u8
    }

    /// `true` once the controller moved the gTD to the done queue
    pub fn is_retired(&self) -> bool {
        // Both 0b1110 and 0b1111 mean "not accessed"
        self.condition_code() & 0b1110 != 0b1110
    }

    pub fn is_ioc(&self) -> bool {
        ral::read_reg!(crate::ohci::gtd, self, CONTROL, DI == 0)
    }

    pub fn pid(&self) -> Pid {
        match ral::read_reg!(crate::ohci::gtd, self, CONTROL, DP) {
            0 => Pid::Setup,
            1 => Pid::Out,
            _ => Pid::In,
        }
    }

    /// Data bytes moved. SETUP bytes don't count.
    pub fn xferred(&self) -> usize {
        if self.pid() == Pid::Setup {
            return 0;
        }
        let expected = self.expected.load(Ordering::Relaxed) as usize;
        expected.saturating_sub(bytes_left(self.CBP.read(), self.BE.read()))
    }

    /// Point at the next gTD's address, or end the chain
    pub fn set_next(&self, next: Option<u32>) {
        self.NEXT_TD.write(next.unwrap_or(0) & !0xF);
    }

    pub fn next(&self) -> Option<u32> {
        let next = self.NEXT_TD.read() & !0xF;
        (next != 0).then_some(next)
    }

    /// Index of the next gTD in the software list
    pub fn next_index(&self) -> Option<u8> {
        let next = self.next.load(Ordering::Acquire);
        (next != NO_GTD).then_some(next)
    }

    pub fn set_next_index(&self, next: Option<u8>) {
        self.next.store(next.unwrap_or(NO_GTD), Ordering::Release);
    }

    /// Clean and invalidate this gTD from DCache
    pub fn clean_invalidate_dcache(&self) {
        crate::cache::clean_invalidate_dcache_by_address(self as *const _ as usize, 16);
    }

    /// Simulate the controller retiring this gTD
    #[cfg(test)]
    pub fn retire(&self, condition_code: u8, left: usize) {
        ral::modify_reg!(crate::ohci::gtd, self, CONTROL, CC: condition_code as u32);
        if left == 0 {
            self.CBP.write(0);
        } else {
            self.CBP.write(self.BE.read().wrapping_sub(left as u32 - 1));
        }
    }
}

impl Slotted for Gtd {
    fn slot(&self) -> &Slot {
        &self.slot
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Gtd>() == 32) as usize];
