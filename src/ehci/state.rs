//! EHCI controller memory
//!
//! Everything the controller reads by DMA lives in an [`EhciState`]. The
//! user allocates it as a `static`, and hands it to exactly one driver.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{qhd::Qhd, qtd::Qtd};
use crate::{
    schedule::{Node, Schedule},
    vcell::VCell,
    FRAMELIST_SIZE, MAX_DEVICES, MAX_PIPES, MAX_TDS, PERIOD_BUCKETS,
};

/// Fixed SETUP, DATA, and STATUS descriptors for a control pipe
pub struct ControlPipe {
    pub qhd: Qhd,
    pub qtd: [Qtd; 3],
    pub request: VCell<[u8; 8]>,
}

/// Per-device pools
pub struct DeviceMemory {
    pub control: ControlPipe,
    pub qhd: [Qhd; MAX_PIPES],
    pub qtd: [Qtd; MAX_TDS],
}

impl DeviceMemory {
    const fn new() -> Self {
        const QHD: Qhd = Qhd::new();
        const QTD: Qtd = Qtd::new();
        DeviceMemory {
            control: ControlPipe {
                qhd: Qhd::new(),
                qtd: [QTD; 3],
                request: VCell::new([0; 8]),
            },
            qhd: [QHD; MAX_PIPES],
            qtd: [QTD; MAX_TDS],
        }
    }
}

#[repr(C, align(4096))]
struct FrameList([VCell<u32>; FRAMELIST_SIZE]);

/// Memory for one EHCI controller
///
/// ```
/// use usbh_core::EhciState;
///
/// static EHCI_STATE: EhciState = EhciState::new();
/// ```
pub struct EhciState {
    framelist: FrameList,
    period: [Qhd; PERIOD_BUCKETS],
    devices: [DeviceMemory; MAX_DEVICES + 1],
    taken: AtomicBool,
}

unsafe impl Sync for EhciState {}

impl EhciState {
    pub const fn new() -> Self {
        const ENTRY: VCell<u32> = VCell::new(1);
        const QHD: Qhd = Qhd::new();
        const DEVICE: DeviceMemory = DeviceMemory::new();
        EhciState {
            framelist: FrameList([ENTRY; FRAMELIST_SIZE]),
            period: [QHD; PERIOD_BUCKETS],
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

    pub fn framelist(&self) -> &[VCell<u32>; FRAMELIST_SIZE] {
        &self.framelist.0
    }

    pub fn device(&self, dev_addr: u8) -> Option<&DeviceMemory> {
        self.devices.get(dev_addr as usize)
    }

    pub fn devices(&self) -> &[DeviceMemory] {
        &self.devices
    }
}

impl Schedule for EhciState {
    type Element = Qhd;
    const MAX_NODES: usize = PERIOD_BUCKETS + (MAX_DEVICES + 1) * (MAX_PIPES + 1);

    fn element(&self, node: Node) -> &Qhd {
        match node {
            Node::Period(log2) => &self.period[log2 as usize],
            Node::Control(dev_addr) => &self.devices[dev_addr as usize].control.qhd,
            Node::Pipe { dev_addr, index } => &self.devices[dev_addr as usize].qhd[index as usize],
            // No separate bulk head; bulk shares the async list
            Node::BulkHead => &self.devices[0].control.qhd,
        }
    }

    fn link_word(&self, node: Node) -> u32 {
        crate::dma_addr(self.element(node)) | super::qhd::NEXT::TYPE_QHD << 1
    }

    fn terminate_word(&self) -> u32 {
        1
    }
}
