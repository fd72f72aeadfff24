//! Queue heads (QH)
//!
//! A queue head schedules one pipe. The first 48 bytes belong to the
//! controller; the rest is driver bookkeeping, shared with the interrupt
//! handler through atomics:
//!
//! - `slot`: claimed by the task; released by the task (periodic pipes)
//!   or the interrupt handler (async pipes, after the doorbell).
//! - `head`/`tail`: the task appends at the tail; the interrupt handler
//!   pops from the head. The list is empty when `head` is `None`.
//! - `xferred`, `halt_reported`: interrupt handler only, except for
//!   resets performed while the queue head is idle.

#![allow(non_snake_case, non_upper_case_globals)]

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use super::qtd::{Overlay, Pid, Status};
use crate::{
    class::ClassKind,
    pipe::{DeviceRoute, Speed, TransferType},
    pool::{Slot, Slotted},
    ral,
    schedule::{Link, SwLink},
    vcell::VCell,
};

#[repr(C, align(32))]
pub struct Qhd {
    NEXT: VCell<u32>,
    CHARACTERISTICS: VCell<u32>,
    CAPABILITIES: VCell<u32>,
    // Controller owned
    CURRENT: VCell<u32>,
    pub overlay: Overlay,

    slot: Slot,
    sw_next: SwLink,
    head: AtomicU8,
    tail: AtomicU8,
    xferred: AtomicU32,
    xfer_type: AtomicU8,
    class: AtomicU8,
    interval_ms: AtomicU8,
    direction_in: AtomicBool,
    halt_reported: AtomicBool,
}

pub mod NEXT {
    fields! {
        TERMINATE @ 0 : 1,
        TYPE @ 1 : 2,
        LINK_POINTER @ 5 : 27,
    }
    /// Link type for queue heads
    pub const TYPE_QHD: u32 = 1;
}

pub mod CHARACTERISTICS {
    fields! {
        DEVICE_ADDRESS @ 0 : 7,
        INACTIVE_NEXT @ 7 : 1,
        ENDPOINT @ 8 : 4,
        SPEED @ 12 : 2,
        DTC @ 14 : 1,
        HEAD @ 15 : 1,
        MAX_PACKET_LENGTH @ 16 : 11,
        CONTROL_ENDPOINT @ 27 : 1,
        NAK_RELOAD @ 28 : 4,
    }
}

pub mod CAPABILITIES {
    fields! {
        SMASK @ 0 : 8,
        CMASK @ 8 : 8,
        HUB_ADDRESS @ 16 : 7,
        PORT_NUMBER @ 23 : 7,
        MULT @ 30 : 2,
    }
}

const NO_QTD: u8 = 0xFF;
const NO_CLASS: u8 = 0xFF;

/// Polling parameters for an interrupt endpoint
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterruptSchedule {
    /// Zero for sub-millisecond polling
    pub interval_ms: u8,
    pub smask: u8,
    pub cmask: u8,
}

/// Compute how often, and in which microframes, to poll an interrupt endpoint
pub fn interrupt_schedule(speed: Speed, b_interval: u8) -> InterruptSchedule {
    if speed == Speed::High {
        // bInterval is an exponent of 125us microframes
        match b_interval {
            0..=3 => InterruptSchedule {
                interval_ms: 0,
                smask: match b_interval {
                    0 | 1 => 0xFF,
                    2 => 0xAA,
                    _ => 0x44,
                },
                cmask: 0,
            },
            _ => InterruptSchedule {
                interval_ms: (1u32 << (b_interval - 4).min(8)).min(255) as u8,
                smask: 1 << (b_interval % 8),
                cmask: 0,
            },
        }
    } else {
        // Split transactions: start in microframe 0, complete in 2 through 4
        InterruptSchedule {
            interval_ms: b_interval,
            smask: 0x01,
            cmask: 0b0001_1100,
        }
    }
}

impl Qhd {
    pub const fn new() -> Self {
        Qhd {
            NEXT: VCell::new(1),
            CHARACTERISTICS: VCell::new(0),
            CAPABILITIES: VCell::new(0),
            CURRENT: VCell::new(0),
            overlay: Overlay::new(),
            slot: Slot::new(),
            sw_next: SwLink::new(),
            head: AtomicU8::new(NO_QTD),
            tail: AtomicU8::new(NO_QTD),
            xferred: AtomicU32::new(0),
            xfer_type: AtomicU8::new(TransferType::Control as u8),
            class: AtomicU8::new(NO_CLASS),
            interval_ms: AtomicU8::new(0),
            direction_in: AtomicBool::new(false),
            halt_reported: AtomicBool::new(false),
        }
    }

    /// Describe a pipe
    ///
    /// Leaves the links alone, so a linked queue head can be reinitialized
    /// while the controller skips over it.
    pub fn init(
        &self,
        route: &DeviceRoute,
        endpoint: EndpointAddress,
        max_packet_size: u16,
        xfer_type: TransferType,
        b_interval: u8,
        class: Option<ClassKind>,
    ) {
        let control = xfer_type == TransferType::Control;
        let schedule = match xfer_type {
            TransferType::Interrupt => interrupt_schedule(route.speed, b_interval),
            _ => InterruptSchedule {
                interval_ms: 0,
                smask: 0,
                cmask: 0,
            },
        };
        let split = route.speed != Speed::High;

        ral::write_reg!(
            crate::ehci::qhd,
            self,
            CHARACTERISTICS,
            DEVICE_ADDRESS: route.dev_addr as u32,
            ENDPOINT: endpoint.index() as u32,
            SPEED: route.speed as u32,
            DTC: control as u32,
            HEAD: (control && route.dev_addr == 0) as u32,
            MAX_PACKET_LENGTH: max_packet_size.min(1024) as u32,
            CONTROL_ENDPOINT: (control && split) as u32
        );
        ral::write_reg!(
            crate::ehci::qhd,
            self,
            CAPABILITIES,
            SMASK: schedule.smask as u32,
            CMASK: if split { schedule.cmask as u32 } else { 0 },
            HUB_ADDRESS: if split { route.hub_addr as u32 } else { 0 },
            PORT_NUMBER: if split { route.hub_port as u32 } else { 0 },
            MULT: 1
        );

        self.overlay.clear();
        let direction_in = endpoint.direction() == UsbDirection::In;
        if xfer_type == TransferType::Bulk && !direction_in && route.speed == Speed::High {
            self.overlay.set_status(Status::PING);
        }

        self.head.store(NO_QTD, Ordering::Relaxed);
        self.tail.store(NO_QTD, Ordering::Relaxed);
        self.xferred.store(0, Ordering::Relaxed);
        self.xfer_type.store(xfer_type as u8, Ordering::Relaxed);
        self.class
            .store(class.map_or(NO_CLASS, |class| class as u8), Ordering::Relaxed);
        self.interval_ms.store(schedule.interval_ms, Ordering::Relaxed);
        self.direction_in.store(direction_in, Ordering::Relaxed);
        self.halt_reported.store(false, Ordering::Release);
    }

    /// Turn this queue head into a list head that never moves data
    pub fn init_dummy(&self, head_of_reclamation: bool) {
        ral::write_reg!(crate::ehci::qhd, self, CHARACTERISTICS, HEAD: head_of_reclamation as u32);
        // Heads in the periodic list need a non-zero S-mask
        ral::write_reg!(crate::ehci::qhd, self, CAPABILITIES, SMASK: !head_of_reclamation as u32);
        self.overlay.clear();
        self.overlay.set_status(Status::HALTED);
    }

    pub fn dev_addr(&self) -> u8 {
        ral::read_reg!(crate::ehci::qhd, self, CHARACTERISTICS, DEVICE_ADDRESS) as u8
    }

    pub fn endpoint(&self) -> u8 {
        ral::read_reg!(crate::ehci::qhd, self, CHARACTERISTICS, ENDPOINT) as u8
    }

    #[cfg(test)]
    pub fn max_packet_len(&self) -> usize {
        ral::read_reg!(crate::ehci::qhd, self, CHARACTERISTICS, MAX_PACKET_LENGTH) as usize
    }

    pub fn smask(&self) -> u8 {
        ral::read_reg!(crate::ehci::qhd, self, CAPABILITIES, SMASK) as u8
    }

    pub fn cmask(&self) -> u8 {
        ral::read_reg!(crate::ehci::qhd, self, CAPABILITIES, CMASK) as u8
    }

    #[cfg(test)]
    pub fn is_head_of_reclamation(&self) -> bool {
        ral::read_reg!(crate::ehci::qhd, self, CHARACTERISTICS, HEAD == 1)
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

    /// PID for data stages on this pipe
    pub fn pid(&self) -> Pid {
        if self.direction_in.load(Ordering::Relaxed) {
            Pid::In
        } else {
            Pid::Out
        }
    }

    /// Address of the qTD the controller last fetched into the overlay
    pub fn current(&self) -> u32 {
        self.CURRENT.read() & !0b1_1111
    }

    /// Simulate the controller fetching the qTD at `addr`
    #[cfg(test)]
    pub fn set_current(&self, addr: u32) {
        self.CURRENT.write(addr);
    }

    pub fn is_halted(&self) -> bool {
        self.overlay.status().contains(Status::HALTED)
    }

    pub fn head(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Acquire);
        (head != NO_QTD).then_some(head)
    }

    pub fn set_head(&self, head: Option<u8>) {
        self.head.store(head.unwrap_or(NO_QTD), Ordering::Release);
    }

    pub fn tail(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        (tail != NO_QTD).then_some(tail)
    }

    pub fn set_tail(&self, tail: Option<u8>) {
        self.tail.store(tail.unwrap_or(NO_QTD), Ordering::Release);
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

    /// Clean and invalidate this QH from DCache
    pub fn clean_invalidate_dcache(&self) {
        crate::cache::clean_invalidate_dcache_by_address(self as *const _ as usize, 48);
    }
}

impl Slotted for Qhd {
    fn slot(&self) -> &Slot {
        &self.slot
    }
}

impl Link for Qhd {
    fn hw_next(&self) -> u32 {
        self.NEXT.read()
    }
    fn set_hw_next(&self, word: u32) {
        self.NEXT.write(word);
    }
    fn sw_next(&self) -> &SwLink {
        &self.sw_next
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Qhd>() <= 128) as usize];

#[cfg(test)]
mod test {
    use super::{interrupt_schedule, InterruptSchedule, Qhd};
    use crate::{
        class::ClassKind,
        ehci::qtd::{Pid, Status},
        pipe::{DeviceRoute, Speed, TransferType},
    };
    use usb_device::endpoint::EndpointAddress;

    fn route(dev_addr: u8, speed: Speed) -> DeviceRoute {
        DeviceRoute {
            dev_addr,
            speed,
            rhport: 0,
            hub_addr: 2,
            hub_port: 3,
        }
    }

    #[test]
    fn high_speed_sub_millisecond() {
        for (b_interval, smask) in [(1, 0xFF), (2, 0xAA), (3, 0x44)] {
            assert_eq!(
                interrupt_schedule(Speed::High, b_interval),
                InterruptSchedule {
                    interval_ms: 0,
                    smask,
                    cmask: 0
                }
            );
        }
    }

    #[test]
    fn high_speed_millisecond() {
        for b_interval in 4..=16u8 {
            let schedule = interrupt_schedule(Speed::High, b_interval);
            let expected = (1u32 << (b_interval - 4)).min(255) as u8;
            assert_eq!(schedule.interval_ms, expected, "bInterval {}", b_interval);
            assert_eq!(schedule.smask, 1 << (b_interval % 8));
        }
    }

    #[test]
    fn full_speed_interrupt() {
        assert_eq!(
            interrupt_schedule(Speed::Full, 10),
            InterruptSchedule {
                interval_ms: 10,
                smask: 0x01,
                cmask: 0x1C
            }
        );
    }

    #[test]
    fn init_control_address_zero() {
        let qhd = Qhd::new();
        qhd.init(
            &route(0, Speed::Full),
            EndpointAddress::from(0),
            8,
            TransferType::Control,
            0,
            None,
        );
        assert_eq!(qhd.dev_addr(), 0);
        assert_eq!(qhd.max_packet_len(), 8);
        assert!(qhd.is_head_of_reclamation());
        // DTC, head, control endpoint flag for full-speed
        let characteristics = qhd.CHARACTERISTICS.read();
        assert_eq!(characteristics & (1 << 14), 1 << 14);
        assert_eq!(characteristics & (1 << 27), 1 << 27);
        assert_eq!(qhd.CAPABILITIES.read() >> 16 & 0x7F, 2);
        assert_eq!(qhd.CAPABILITIES.read() >> 23 & 0x7F, 3);
        assert_eq!(qhd.class(), None);
    }

    #[test]
    fn init_bulk_out_high_speed() {
        let qhd = Qhd::new();
        qhd.init(
            &route(1, Speed::High),
            EndpointAddress::from(0x02),
            512,
            TransferType::Bulk,
            0,
            Some(ClassKind::MassStorage),
        );
        assert_eq!(qhd.endpoint(), 2);
        assert!(!qhd.is_head_of_reclamation());
        assert_eq!(qhd.pid(), Pid::Out);
        assert!(qhd.overlay.status().contains(Status::PING));
        // No transaction translator for high-speed devices
        assert_eq!(qhd.CAPABILITIES.read() & 0x3FFF_FF00, 0);
        assert_eq!(qhd.CAPABILITIES.read() >> 30, 1);
        assert_eq!(qhd.class(), Some(ClassKind::MassStorage));
        assert_eq!(qhd.xfer_type(), TransferType::Bulk);
    }

    #[test]
    fn init_interrupt_in_full_speed() {
        let qhd = Qhd::new();
        qhd.init(
            &route(1, Speed::Low),
            EndpointAddress::from(0x81),
            8,
            TransferType::Interrupt,
            10,
            Some(ClassKind::Hid),
        );
        assert_eq!(qhd.pid(), Pid::In);
        assert_eq!(qhd.smask(), 0x01);
        assert_eq!(qhd.cmask(), 0x1C);
        assert_eq!(qhd.interval_ms(), 10);
    }

    #[test]
    fn dummy() {
        let qhd = Qhd::new();
        qhd.init_dummy(false);
        assert!(qhd.is_halted());
        assert_eq!(qhd.smask(), 1);
        assert!(!qhd.is_head_of_reclamation());
    }
}
