//! OHCI operational registers

#![allow(non_snake_case, non_upper_case_globals)]

use crate::vcell::VCell;

#[repr(C)]
pub struct RegisterBlock {
    pub HCREVISION: VCell<u32>,
    pub HCCONTROL: VCell<u32>,
    pub HCCOMMANDSTATUS: VCell<u32>,
    pub HCINTERRUPTSTATUS: VCell<u32>,
    pub HCINTERRUPTENABLE: VCell<u32>,
    pub HCINTERRUPTDISABLE: VCell<u32>,
    pub HCHCCA: VCell<u32>,
    pub HCPERIODCURRENTED: VCell<u32>,
    pub HCCONTROLHEADED: VCell<u32>,
    pub HCCONTROLCURRENTED: VCell<u32>,
    pub HCBULKHEADED: VCell<u32>,
    pub HCBULKCURRENTED: VCell<u32>,
    pub HCDONEHEAD: VCell<u32>,
    pub HCFMINTERVAL: VCell<u32>,
    pub HCFMREMAINING: VCell<u32>,
    pub HCFMNUMBER: VCell<u32>,
    pub HCPERIODICSTART: VCell<u32>,
    pub HCLSTHRESHOLD: VCell<u32>,
    pub HCRHDESCRIPTORA: VCell<u32>,
    pub HCRHDESCRIPTORB: VCell<u32>,
    pub HCRHSTATUS: VCell<u32>,
    pub HCRHPORTSTATUS: [VCell<u32>; 2],
}

#[cfg(test)]
impl RegisterBlock {
    /// A register block in RAM, for simulating the controller
    pub const fn new() -> Self {
        const ZERO: VCell<u32> = VCell::new(0);
        RegisterBlock {
            HCREVISION: ZERO,
            HCCONTROL: ZERO,
            HCCOMMANDSTATUS: ZERO,
            HCINTERRUPTSTATUS: ZERO,
            HCINTERRUPTENABLE: ZERO,
            HCINTERRUPTDISABLE: ZERO,
            HCHCCA: ZERO,
            HCPERIODCURRENTED: ZERO,
            HCCONTROLHEADED: ZERO,
            HCCONTROLCURRENTED: ZERO,
            HCBULKHEADED: ZERO,
            HCBULKCURRENTED: ZERO,
            HCDONEHEAD: ZERO,
            HCFMINTERVAL: ZERO,
            HCFMREMAINING: ZERO,
            HCFMNUMBER: ZERO,
            HCPERIODICSTART: ZERO,
            HCLSTHRESHOLD: ZERO,
            HCRHDESCRIPTORA: ZERO,
            HCRHDESCRIPTORB: ZERO,
            HCRHSTATUS: ZERO,
            HCRHPORTSTATUS: [ZERO; 2],
        }
    }
}

pub mod HCCONTROL {
    fields! {
        CBSR @ 0 : 2,
        PLE @ 2 : 1,
        IE @ 3 : 1,
        CLE @ 4 : 1,
        BLE @ 5 : 1,
        HCFS @ 6 : 2,
    }
    /// Control to bulk service ratio of 4:1
    pub const CBSR_4_1: u32 = 0b11;
    pub const HCFS_OPERATIONAL: u32 = 0b10;
}

pub mod HCCOMMANDSTATUS {
    fields! {
        HCR @ 0 : 1,
        CLF @ 1 : 1,
        BLF @ 2 : 1,
    }
}

pub mod HCFMINTERVAL {
    fields! {
        FI @ 0 : 14,
        FSMPS @ 16 : 15,
        FIT @ 31 : 1,
    }
    /// Nominal frame interval, in bit times
    pub const FI_NOMINAL: u32 = 0x2EDF;
    /// Largest data packet that fits in a frame, after overhead and bit stuffing
    pub const FSMPS_NOMINAL: u32 = 6 * (FI_NOMINAL - 210) / 7;
}

pub mod HCRHSTATUS {
    fields! {
        LPS @ 0 : 1,
        LPSC @ 16 : 1,
    }
}

/// Bits of `HCRHPORTSTATUS`
pub mod port {
    pub const CCS: u32 = 1 << 0;
    pub const PRS: u32 = 1 << 4;
    pub const LSDA: u32 = 1 << 9;
    pub const CSC: u32 = 1 << 16;
    pub const PESC: u32 = 1 << 17;
    pub const PSSC: u32 = 1 << 18;
    pub const OCIC: u32 = 1 << 19;
    pub const PRSC: u32 = 1 << 20;
    /// Write-one-to-clear change bits
    pub const CHANGE_BITS: u32 = CSC | PESC | PSSC | OCIC | PRSC;
}

bitflags::bitflags! {
    /// Interrupt causes in `HCINTERRUPTSTATUS`, and enables in
    /// `HCINTERRUPTENABLE` / `HCINTERRUPTDISABLE`
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Interrupts : u32 {
        const SCHEDULING_OVERRUN = 1 << 0;
        /// The controller wrote the done queue to the HCCA
        const WRITEBACK_DONE_HEAD = 1 << 1;
        const START_OF_FRAME = 1 << 2;
        const RESUME_DETECTED = 1 << 3;
        const UNRECOVERABLE_ERROR = 1 << 4;
        const FRAME_NUMBER_OVERFLOW = 1 << 5;
        const ROOT_HUB_STATUS_CHANGE = 1 << 6;
        const OWNERSHIP_CHANGE = 1 << 30;
        /// Enable register only
        const MASTER_INTERRUPT_ENABLE = 1 << 31;
    }
}

impl Interrupts {
    /// Enabled for the lifetime of the driver. Start-of-frame is enabled
    /// only while endpoints wait for reclamation.
    pub const ENABLED: Interrupts = Interrupts::WRITEBACK_DONE_HEAD
        .union(Interrupts::RESUME_DETECTED)
        .union(Interrupts::UNRECOVERABLE_ERROR)
        .union(Interrupts::ROOT_HUB_STATUS_CHANGE)
        .union(Interrupts::MASTER_INTERRUPT_ENABLE);
}

const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x5C) as usize];
