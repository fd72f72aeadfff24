//! OHCI controller memory

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{ed::Ed, gtd::Gtd};
use crate::{
    schedule::{Node, Schedule},
    vcell::VCell,
    MAX_DEVICES, MAX_PIPES, MAX_TDS, PERIOD_BUCKETS,
};

/// Entries in the HCCA interrupt table
pub const INTERRUPT_TABLE_SIZE: usize = 32;

/// Host controller communications area
#[repr(C, align(256))]
pub struct Hcca {
    pub interrupt_table: [VCell<u32>; INTERRUPT_TABLE_SIZE],
    pub frame_number: VCell<u16>,
    _pad: VCell<u16>,
    pub done_head: VCell<u32>,
    _reserved: [VCell<u32>; 29],
}

impl Hcca {
    const fn new() -> Self {
        const ZERO: VCell<u32> = VCell::new(0);
        Hcca {
            interrupt_table: [ZERO; INTERRUPT_TABLE_SIZE],
            frame_number: VCell::new(0),
            _pad: VCell::new(0),
            done_head: ZERO,
            _reserved: [ZERO; 29],
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Hcca>() == 256) as usize];

/// SETUP, DATA, and STATUS descriptors for a control pipe
pub struct ControlPipe {
    pub ed: Ed,
    pub gtd: [Gtd; 3],
    pub request: VCell<[u8; 8]>,
}

/// Per-device pools
pub struct DeviceMemory {
    pub control: ControlPipe,
    pub ed: [Ed; MAX_PIPES],
    pub gtd: [Gtd; MAX_TDS],
}

impl DeviceMemory {
    const fn new() -> Self {
        const ED: Ed = Ed::new();
        const GTD: Gtd = Gtd::new();
        DeviceMemory {
            control: ControlPipe {
                ed: Ed::new(),
                gtd: [GTD; 3],
                request: VCell::new([0; 8]),
            },
            ed: [ED; MAX_PIPES],
            gtd: [GTD; MAX_TDS],
        }
    }
}

/// Memory for one OHCI controller
///
/// ```
/// use usbh_core::OhciState;
///
/// static OHCI_STATE: OhciState = OhciState::new();
/// ```
pub struct OhciState {
    hcca: Hcca,
    period: [Ed; PERIOD_BUCKETS],
    bulk_head: Ed,
    devices: [DeviceMemory; MAX_DEVICES + 1],
    taken: AtomicBool,
}

unsafe impl Sync for OhciState {}

impl OhciState {
    pub const fn new() -> Self {
        const ED: Ed = Ed::new();
        const DEVICE: DeviceMemory = DeviceMemory::new();
        OhciState {
            hcca: Hcca::new(),
            period: [ED; PERIOD_BUCKETS],
            bulk_head: Ed::new(),
            devices: [DEVICE; MAX_DEVICES + 1],
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the memory for a driver.
    ///
    /// Returns `None` if it was already taken.
    pub(crate) fn take(&'static self) -> Option<&'static Self> {
        (!self.taken.swap(true, Ordering::SeqCst)).then_some(self)
    }

    pub fn hcca(&self) -> &Hcca {
        &self.hcca
    }

    pub fn device(&self, dev_addr: u8) -> Option<&DeviceMemory> {
        self.devices.get(dev_addr as usize)
    }

    pub fn devices(&self) -> &[DeviceMemory] {
        &self.devices
    }
}

impl Schedule for OhciState {
    type Element = Ed;
    const MAX_NODES: usize = PERIOD_BUCKETS + 1 + (MAX_DEVICES + 1) * (MAX_PIPES + 1);

    fn element(&self, node: Node) -> &Ed {
        match node {
            Node::Period(log2) => &self.period[log2 as usize],
            Node::BulkHead => &self.bulk_head,
            Node::Control(dev_addr) => &self.devices[dev_addr as usize].control.ed,
            Node::Pipe { dev_addr, index } => &self.devices[dev_addr as usize].ed[index as usize],
        }
    }

    fn link_word(&self, node: Node) -> u32 {
        crate::dma_addr(self.element(node))
    }

    fn terminate_word(&self) -> u32 {
        0
    }
}
