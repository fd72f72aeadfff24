//! Endpoint descriptors (ED)
//!
//! The first 16 bytes belong to the controller. The gTD queue is
//! NULL-terminated: `TAIL_P` stays zero, and the controller works until
//! `HEAD_P` runs off the end of the chain. The software list mirrors that
//! chain by gTD index, and shares ownership like a queue head does: the
//! task appends at the tail, and the interrupt handler pops retired gTDs
//! from the head.

#![allow(non_snake_case, non_upper_case_globals)]

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use super::gtd::Pid;
use crate::{
    class::ClassKind,
    pipe::{DeviceRoute, Speed, TransferType},
    pool::{Slot, Slotted},
    ral,
    schedule::{Link, SwLink},
    vcell::VCell,
};

#[repr(C, align(32))]
pub struct Ed {
    CONTROL: VCell<u32>,
    TAIL_P: VCell<u32>,
    HEAD_P: VCell<u32>,
    NEXT_ED: VCell<u32>,

    slot: Slot,
    sw_next: SwLink,
    head: AtomicU8,
    tail: AtomicU8,
    xferred: AtomicU32,
    xfer_type: AtomicU8,
    class: AtomicU8,
    interval_ms: AtomicU8,
    halt_reported: AtomicBool,
}

pub mod CONTROL {
    fields! {
        FA @ 0 : 7,
        EN @ 7 : 4,
        D @ 11 : 2,
        S @ 13 : 1,
        K @ 14 : 1,
        F @ 15 : 1,
        MPS @ 16 : 11,
    }
    /// Direction comes from each gTD
    pub const D_FROM_TD: u32 = 0b00;
    pub const D_OUT: u32 = 0b01;
    pub const D_IN: u32 = 0b10;
}

pub mod HEAD_P {
    fields! {
        H @ 0 : 1,
        C @ 1 : 1,
        ADDRESS @ 4 : 28,
    }
}

const NO_GTD: u8 = 0xFF;
const NO_CLASS: u8 = 0xFF;

impl Ed {
    pub const fn new() -> Self {
        Ed {
            CONTROL: VCell::new(0),
            TAIL_P: VCell::new(0),
            HEAD_P: VCell::new(0),
            NEXT_ED: VCell::new(0),
            slot: Slot::new(),
            sw_next: SwLink::new(),
            head: AtomicU8::new(NO_GTD),
            tail: AtomicU8::new(NO_GTD),
            xferred: AtomicU32::new(0),
            xfer_type: AtomicU8::new(TransferType::Control as u8),
            class: AtomicU8::new(NO_CLASS),
            interval_ms: AtomicU8::new(0),
            halt_reported: AtomicBool::new(false),
        }
    }

    /// Describe a pipe, leaving the list link alone
    pub fn init(
        &self,
        route: &DeviceRoute,
        endpoint: EndpointAddress,
        max_packet_size: u16,
        xfer_type: TransferType,
        b_interval: u8,
        class: Option<ClassKind>,
    ) {
        let direction = match (xfer_type, endpoint.direction()) {
            (TransferType::Control, _) => CONTROL::D_FROM_TD,
            (_, UsbDirection::In) => CONTROL::D_IN,
            (_, UsbDirection::Out) => CONTROL::D_OUT,
        };
        ral::write_reg!(
            crate::ohci::ed,
            self,
            CONTROL,
            FA: route.dev_addr as u32,
            EN: endpoint.index() as u32,
            D: direction,
            S: (route.speed == Speed::Low) as u32,
            K: 0,
            F: 0,
            MPS: max_packet_size.min(1023) as u32
        );
        self.TAIL_P.write(0);
        self.HEAD_P.write(0);

        self.head.store(NO_GTD, Ordering::Relaxed);
        self.tail.store(NO_GTD, Ordering::Relaxed);
        self.xferred.store(0, Ordering::Relaxed);
        self.xfer_type.store(xfer_type as u8, Ordering::Relaxed);
        self.class
            .store(class.map_or(NO_CLASS, |class| class as u8), Ordering::Relaxed);
        let interval_ms = match xfer_type {
            TransferType::Interrupt => b_interval,
            _ => 0,
        };
        self.interval_ms.store(interval_ms, Ordering::Relaxed);
        self.halt_reported.store(false, Ordering::Release);
    }

    /// Turn this ED into a list head that the controller skips
    pub fn init_dummy(&self) {
        ral::write_reg!(crate::ohci::ed, self, CONTROL, K: 1);
        self.TAIL_P.write(0);
        self.HEAD_P.write(0);
    }

    pub fn set_skip(&self, skip: bool) {
        ral::modify_reg!(crate::ohci::ed, self, CONTROL, K: skip as u32);
    }

    #[cfg(test)]
    pub fn is_skipped(&self) -> bool {
        ral::read_reg!(crate::ohci::ed, self, CONTROL, K == 1)
    }

    pub fn dev_addr(&self) -> u8 {
        ral::read_reg!(crate::ohci::ed, self, CONTROL, FA) as u8
    }

    pub fn endpoint(&self) -> u8 {
        ral::read_reg!(crate::ohci::ed, self, CONTROL, EN) as u8
    }

    #[cfg(test)]
    pub fn is_low_speed(&self) -> bool {
        ral::read_reg!(crate::ohci::ed, self, CONTROL, S == 1)
    }

    pub fn max_packet_size(&self) -> u16 {
        ral::read_reg!(crate::ohci::ed, self, CONTROL, MPS) as u16
    }

    /// PID for data stages on this pipe
    pub fn pid(&self) -> Pid {
        match ral::read_reg!(crate::ohci::ed, self, CONTROL, D) {
            CONTROL::D_IN => Pid::In,
            _ => Pid::Out,
        }
    }

    pub fn xfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.xfer_type.load(Ordering::Relaxed))
    }

    pub fn class(&self) -> Option<ClassKind> {
        ClassKind::from_index(self.class.load(Ordering::Relaxed))
    }

    pub fn interval_ms(&self) -> u8 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    /// Address of the gTD the controller works on next, if any
    pub fn hw_head(&self) -> Option<u32> {
        let addr = ral::read_reg!(crate::ohci::ed, self, HEAD_P, ADDRESS) << 4;
        (addr != 0).then_some(addr)
    }

    /// Start the controller at `addr`, keeping the halt and toggle bits
    pub fn set_hw_head(&self, addr: u32) {
        let flags = self.HEAD_P.read() & (HEAD_P::H::mask | HEAD_P::C::mask);
        self.HEAD_P.write(flags | (addr & HEAD_P::ADDRESS::mask));
    }

    /// Start a new chain at `addr`, clearing the halt and toggle carry
    pub fn restart(&self, addr: Option<u32>) {
        self.TAIL_P.write(0);
        self.HEAD_P.write(addr.unwrap_or(0) & HEAD_P::ADDRESS::mask);
    }

    pub fn is_halted(&self) -> bool {
        ral::read_reg!(crate::ohci::ed, self, HEAD_P, H == 1)
    }

    /// Present the halted queue as empty, so the controller doesn't count
    /// this ED when deciding whether the list has work
    pub fn park(&self) {
        self.TAIL_P.write(self.HEAD_P.read() & HEAD_P::ADDRESS::mask);
    }

    pub fn head(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Acquire);
        (head != NO_GTD).then_some(head)
    }

    pub fn set_head(&self, head: Option<u8>) {
        self.head.store(head.unwrap_or(NO_GTD), Ordering::Release);
    }

    pub fn tail(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        (tail != NO_GTD).then_some(tail)
    }

    pub fn set_tail(&self, tail: Option<u8>) {
        self.tail.store(tail.unwrap_or(NO_GTD), Ordering::Release);
    }

    pub fn add_xferred(&self, bytes: usize) {
        self.xferred.fetch_add(bytes as u32, Ordering::Relaxed);
    }

    /// Returns the accumulated byte count, and starts a new count
    pub fn take_xferred(&self) -> usize {
        self.xferred.swap(0, Ordering::Relaxed) as usize
    }

    pub fn halt_reported(&self) -> bool {
        self.halt_reported.load(Ordering::Acquire)
    }

    pub fn set_halt_reported(&self, reported: bool) {
        self.halt_reported.store(reported, Ordering::Release);
    }

    /// Simulate the controller halting on an error
    #[cfg(test)]
    pub fn set_halted(&self) {
        ral::modify_reg!(crate::ohci::ed, self, HEAD_P, H: 1);
    }

    /// Clean and invalidate this ED from DCache
    pub fn clean_invalidate_dcache(&self) {
        crate::cache::clean_invalidate_dcache_by_address(self as *const _ as usize, 16);
    }
}

impl Slotted for Ed {
    fn slot(&self) -> &Slot {
        &self.slot
    }
}

impl Link for Ed {
    fn hw_next(&self) -> u32 {
        self.NEXT_ED.read()
    }
    fn set_hw_next(&self, word: u32) {
        self.NEXT_ED.write(word);
    }
    fn sw_next(&self) -> &SwLink {
        &self.sw_next
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Ed>() <= 64) as usize];

#[cfg(test)]
mod test {
    use super::Ed;
    use crate::{
        class::ClassKind,
        ohci::gtd::Pid,
        pipe::{DeviceRoute, Speed, TransferType},
    };
    use usb_device::endpoint::EndpointAddress;

    fn route(dev_addr: u8, speed: Speed) -> DeviceRoute {
        DeviceRoute {
            dev_addr,
            speed,
            rhport: 0,
            hub_addr: 0,
            hub_port: 0,
        }
    }

    #[test]
    fn init_interrupt_in_low_speed() {
        let ed = Ed::new();
        ed.init(
            &route(3, Speed::Low),
            EndpointAddress::from(0x81),
            8,
            TransferType::Interrupt,
            10,
            Some(ClassKind::Hid),
        );
        let control = ed.CONTROL.read();
        assert_eq!(control & 0x7F, 3);
        assert_eq!(control >> 7 & 0xF, 1);
        assert_eq!(control >> 11 & 0b11, 0b10);
        assert!(ed.is_low_speed());
        assert!(!ed.is_skipped());
        assert_eq!(ed.max_packet_size(), 8);
        assert_eq!(ed.pid(), Pid::In);
        assert_eq!(ed.interval_ms(), 10);
        assert_eq!(ed.class(), Some(ClassKind::Hid));
        assert_eq!(ed.xfer_type(), TransferType::Interrupt);
    }

    #[test]
    fn init_control() {
        let ed = Ed::new();
        ed.init(
            &route(0, Speed::Full),
            EndpointAddress::from(0),
            64,
            TransferType::Control,
            0,
            None,
        );
        assert_eq!(ed.CONTROL.read() >> 11 & 0b11, 0);
        assert_eq!(ed.class(), None);
        assert_eq!(ed.interval_ms(), 0);
    }

    #[test]
    fn head_pointer() {
        let ed = Ed::new();
        assert_eq!(ed.hw_head(), None);
        ed.set_halted();
        ed.set_hw_head(0x2000_0040);
        assert_eq!(ed.hw_head(), Some(0x2000_0040));
        assert!(ed.is_halted());

        ed.park();
        assert_eq!(ed.TAIL_P.read(), 0x2000_0040);

        ed.restart(Some(0x2000_0080));
        assert!(!ed.is_halted());
        assert_eq!(ed.TAIL_P.read(), 0);
        assert_eq!(ed.hw_head(), Some(0x2000_0080));
    }

    #[test]
    fn dummy() {
        let ed = Ed::new();
        ed.init_dummy();
        assert!(ed.is_skipped());
        ed.set_skip(false);
        assert!(!ed.is_skipped());
    }
}
