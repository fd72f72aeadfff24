//! Queue element transfer descriptors (qTD)
//!
//! The module implements a RAL-compatible interface for working
//! with transfer descriptors.

#![allow(non_snake_case, non_upper_case_globals)]

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use crate::{
    pool::{Slot, Slotted},
    ral,
    vcell::VCell,
};

/// The eight words shared by a qTD and a queue head's transfer overlay
#[repr(C)]
pub struct Overlay {
    pub NEXT: VCell<u32>,
    pub ALT_NEXT: VCell<u32>,
    pub TOKEN: VCell<u32>,
    pub BUFFERS: [VCell<u32>; 5],
}

pub mod NEXT {
    fields! {
        TERMINATE @ 0 : 1,
        LINK_POINTER @ 5 : 27,
    }
}

pub mod ALT_NEXT {
    fields! {
        TERMINATE @ 0 : 1,
        LINK_POINTER @ 5 : 27,
    }
}

pub mod TOKEN {
    fields! {
        STATUS @ 0 : 8,
        PID @ 8 : 2,
        CERR @ 10 : 2,
        C_PAGE @ 12 : 3,
        IOC @ 15 : 1,
        TOTAL_BYTES @ 16 : 15,
        DT @ 31 : 1,
    }
}

bitflags::bitflags! {
    /// Status of a transfer descriptor
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Status : u32 {
        const ACTIVE = 1 << 7;
        const HALTED = 1 << 6;
        const DATA_BUFFER_ERROR = 1 << 5;
        const BABBLE = 1 << 4;
        const TRANSACTION_ERROR = 1 << 3;
        const MISSED_MICROFRAME = 1 << 2;
        const SPLIT_STATE = 1 << 1;
        const PING = 1 << 0;
    }
}

impl Status {
    /// Errors that end a transaction, as opposed to a STALL
    pub const XACT_ERRORS: Status = Status::DATA_BUFFER_ERROR
        .union(Status::BABBLE)
        .union(Status::TRANSACTION_ERROR);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

/// Bytes one descriptor can move, starting at `buffer`
pub fn max_transfer(buffer: *const u8) -> usize {
    5 * PAGE_SIZE - (buffer as usize & (PAGE_SIZE - 1))
}

const PAGE_SIZE: usize = 4096;

impl Overlay {
    pub const fn new() -> Self {
        Overlay {
            NEXT: VCell::new(1),
            ALT_NEXT: VCell::new(1),
            TOKEN: VCell::new(0),
            BUFFERS: [
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
            ],
        }
    }

    /// Describe a transfer. The status becomes active last.
    pub fn prepare(&self, buffer: *const u8, len: usize, pid: Pid, toggle: bool, ioc: bool) {
        self.NEXT.write(NEXT::TERMINATE::mask);
        self.ALT_NEXT.write(ALT_NEXT::TERMINATE::mask);
        let addr = crate::dma_addr(buffer);
        self.BUFFERS[0].write(addr);
        for (page, buf) in self.BUFFERS.iter().enumerate().skip(1) {
            buf.write((addr & !(PAGE_SIZE as u32 - 1)).wrapping_add((page * PAGE_SIZE) as u32));
        }
        ral::write_reg!(
            crate::ehci::qtd,
            self,
            TOKEN,
            STATUS: Status::ACTIVE.bits(),
            PID: pid as u32,
            CERR: 3,
            IOC: ioc as u32,
            TOTAL_BYTES: len as u32,
            DT: toggle as u32
        );
    }

    /// Forget any transfer state, leaving the overlay inactive
    pub fn clear(&self) {
        self.TOKEN.write(0);
        self.NEXT.write(NEXT::TERMINATE::mask);
        self.ALT_NEXT.write(ALT_NEXT::TERMINATE::mask);
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(ral::read_reg!(crate::ehci::qtd, self, TOKEN, STATUS))
    }

    pub fn set_status(&self, status: Status) {
        ral::modify_reg!(crate::ehci::qtd, self, TOKEN, STATUS: status.bits());
    }

    /// Bytes left to move
    pub fn total_bytes(&self) -> u16 {
        ral::read_reg!(crate::ehci::qtd, self, TOKEN, TOTAL_BYTES) as u16
    }

    pub fn is_ioc(&self) -> bool {
        ral::read_reg!(crate::ehci::qtd, self, TOKEN, IOC == 1)
    }

    pub fn pid(&self) -> Pid {
        match ral::read_reg!(crate::ehci::qtd, self, TOKEN, PID) {
            0 => Pid::Out,
            1 => Pid::In,
            _ => Pid::Setup,
        }
    }

    pub fn set_toggle(&self, toggle: bool) {
        ral::modify_reg!(crate::ehci::qtd, self, TOKEN, DT: toggle as u32);
    }

    /// Point at the next qTD's address, or terminate
    pub fn set_next(&self, next: Option<u32>) {
        match next {
            Some(addr) => self.NEXT.write(addr & NEXT::LINK_POINTER::mask),
            None => self.NEXT.write(NEXT::TERMINATE::mask),
        }
    }

    pub fn next(&self) -> Option<u32> {
        let next = self.NEXT.read();
        (next & NEXT::TERMINATE::mask == 0).then_some(next & NEXT::LINK_POINTER::mask)
    }
}

const NO_QTD: u8 = 0xFF;

/// A qTD, plus the driver's bookkeeping
#[repr(C, align(32))]
pub struct Qtd {
    pub overlay: Overlay,
    slot: Slot,
    expected: AtomicU16,
    next: AtomicU8,
}

impl Qtd {
    pub const fn new() -> Self {
        Qtd {
            overlay: Overlay::new(),
            slot: Slot::new(),
            expected: AtomicU16::new(0),
            next: AtomicU8::new(NO_QTD),
        }
    }

    /// Describe a transfer of `len` bytes, with no successor
    pub fn prepare(&self, buffer: *const u8, len: usize, pid: Pid, toggle: bool, ioc: bool) {
        self.expected.store(len as u16, Ordering::Relaxed);
        self.set_next_index(None);
        self.overlay.prepare(buffer, len, pid, toggle, ioc);
    }

    /// Index of the next qTD in the software list
    pub fn next_index(&self) -> Option<u8> {
        let next = self.next.load(Ordering::Acquire);
        (next != NO_QTD).then_some(next)
    }

    pub fn set_next_index(&self, next: Option<u8>) {
        self.next.store(next.unwrap_or(NO_QTD), Ordering::Release);
    }

    /// Data bytes moved so far. SETUP bytes don't count.
    pub fn xferred(&self) -> usize {
        if self.overlay.pid() == Pid::Setup {
            0
        } else {
            let expected = self.expected.load(Ordering::Relaxed);
            expected.saturating_sub(self.overlay.total_bytes()) as usize
        }
    }

    /// Clean and invalidate this qTD from DCache
    pub fn clean_invalidate_dcache(&self) {
        crate::cache::clean_invalidate(&self.overlay);
    }
}

impl Slotted for Qtd {
    fn slot(&self) -> &Slot {
        &self.slot
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Overlay>() == 32) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<Qtd>() == 64) as usize];
