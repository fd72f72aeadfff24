//! EHCI operational registers
//!
//! The layout starts at `USBCMD`, and follows the NXP EHCI controllers
//! (i.MX RT, LPC18xx/43xx): a single root port in `PORTSC1` that reports
//! the port speed, and `USBMODE` after the port registers.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::vcell::VCell;

#[repr(C)]
pub struct RegisterBlock {
    pub USBCMD: VCell<u32>,
    pub USBSTS: VCell<u32>,
    pub USBINTR: VCell<u32>,
    pub FRINDEX: VCell<u32>,
    pub CTRLDSSEGMENT: VCell<u32>,
    pub PERIODICLISTBASE: VCell<u32>,
    pub ASYNCLISTADDR: VCell<u32>,
    pub TTCTRL: VCell<u32>,
    pub BURSTSIZE: VCell<u32>,
    pub TXFILLTUNING: VCell<u32>,
    _reserved0: [VCell<u32>; 6],
    pub CONFIGFLAG: VCell<u32>,
    pub PORTSC1: VCell<u32>,
    _reserved1: [VCell<u32>; 7],
    pub OTGSC: VCell<u32>,
    pub USBMODE: VCell<u32>,
}

#[cfg(test)]
impl RegisterBlock {
    /// A register block in RAM, for simulating the controller
    pub const fn new() -> Self {
        const ZERO: VCell<u32> = VCell::new(0);
        RegisterBlock {
            USBCMD: ZERO,
            USBSTS: ZERO,
            USBINTR: ZERO,
            FRINDEX: ZERO,
            CTRLDSSEGMENT: ZERO,
            PERIODICLISTBASE: ZERO,
            ASYNCLISTADDR: ZERO,
            TTCTRL: ZERO,
            BURSTSIZE: ZERO,
            TXFILLTUNING: ZERO,
            _reserved0: [ZERO; 6],
            CONFIGFLAG: ZERO,
            PORTSC1: ZERO,
            _reserved1: [ZERO; 7],
            OTGSC: ZERO,
            USBMODE: ZERO,
        }
    }
}

pub mod USBCMD {
    fields! {
        RS @ 0 : 1,
        RST @ 1 : 1,
        FS_1 @ 2 : 2,
        PSE @ 4 : 1,
        ASE @ 5 : 1,
        IAA @ 6 : 1,
        FS_2 @ 15 : 1,
        ITC @ 16 : 8,
    }
}

pub mod PORTSC1 {
    fields! {
        CCS @ 0 : 1,
        CSC @ 1 : 1,
        PE @ 2 : 1,
        PEC @ 3 : 1,
        OCA @ 4 : 1,
        OCC @ 5 : 1,
        FPR @ 6 : 1,
        SUSP @ 7 : 1,
        PR @ 8 : 1,
        HSP @ 9 : 1,
        LS @ 10 : 2,
        PP @ 12 : 1,
        PSPD @ 26 : 2,
    }

    /// Write-one-to-clear change bits
    pub const CHANGE_BITS: u32 = CSC::mask | PEC::mask | OCC::mask;
}

pub mod CONFIGFLAG {
    fields! {
        CF @ 0 : 1,
    }
}

pub mod USBMODE {
    fields! {
        CM @ 0 : 2,
    }
    pub const CM_HOST: u32 = 0b11;
}

bitflags::bitflags! {
    /// Interrupt causes in `USBSTS`, and enables in `USBINTR`
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Interrupts : u32 {
        /// Transfer completed with IOC set
        const USBINT = 1 << 0;
        const ERROR = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FRAME_ROLLOVER = 1 << 3;
        const SYSTEM_ERROR = 1 << 4;
        const ASYNC_ADVANCE = 1 << 5;
        /// NXP: completion on the async list
        const ASYNC_COMPLETE = 1 << 18;
        /// NXP: completion on the periodic list
        const PERIODIC_COMPLETE = 1 << 19;
    }
}

impl Interrupts {
    /// Causes that signal transfer completion
    pub const COMPLETE: Interrupts = Interrupts::USBINT
        .union(Interrupts::ASYNC_COMPLETE)
        .union(Interrupts::PERIODIC_COMPLETE);

    /// Everything the driver services
    pub const ENABLED: Interrupts = Interrupts::COMPLETE
        .union(Interrupts::ERROR)
        .union(Interrupts::PORT_CHANGE)
        .union(Interrupts::SYSTEM_ERROR)
        .union(Interrupts::ASYNC_ADVANCE);
}

const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x6C) as usize];
