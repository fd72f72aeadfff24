//! EHCI host controller driver
//!
//! # Design
//!
//! ## Lists
//!
//! Control and bulk pipes live on the circular asynchronous list. The
//! address-0 control queue head is the permanent head of that list; it's
//! halted when no enumeration is using it. Interrupt pipes live in a
//! periodic tree: the frame list points at bucket heads for 1, 2, 4, and
//! 8 ms, and each bucket head chains into the next faster one, ending at
//! the 1 ms head.
//!
//! ## Transfers
//!
//! Each pipe's queue head owns a FIFO of qTDs from its device's pool. The
//! task appends at the tail. The interrupt handler pops from the head once
//! the controller retires a qTD, and reports a completion when a popped
//! qTD asked for an interrupt.
//!
//! ## Removal
//!
//! The controller may cache async list entries, so closing an async pipe
//! only unlinks it and marks it removing, then rings the async-advance
//! doorbell. The doorbell interrupt releases the slot. Periodic pipes are
//! released as soon as they're unlinked.

mod qhd;
mod qtd;
mod regs;
mod state;

pub use state::EhciState;

use usb_device::endpoint::EndpointAddress;

use crate::{
    class::ClassKind,
    descriptor::EndpointDescriptor,
    error::{Error, Result, XferResult},
    hcd::{Hcd, HcdEvent},
    pipe::{DeviceRoute, PipeHandle, Speed, TransferType},
    pool::{self, Slotted},
    ral,
    request::SetupPacket,
    schedule::{self, Node, Schedule},
    Peripherals, FRAMELIST_SIZE, MAX_DEVICES, PERIOD_BUCKETS,
};
use qhd::Qhd;
use qtd::{Pid, Qtd, Status};
use regs::{Interrupts, RegisterBlock};

/// Head of the asynchronous list
const ASYNC_HEAD: Node = Node::Control(0);

/// Bounds the wait for a controller reset
const RESET_SPINS: usize = 1_000_000;

/// Periodic bucket for a polling interval
fn period_bucket(interval_ms: u8) -> u8 {
    (interval_ms as usize).clamp(1, FRAMELIST_SIZE).ilog2() as u8
}

/// An EHCI host controller driver
pub struct Ehci {
    regs: &'static RegisterBlock,
    state: &'static EhciState,
}

impl Ehci {
    /// Create a driver for the controller owned by `peripherals`
    ///
    /// `peripherals` must point at the EHCI operational registers. The
    /// driver builds its schedule in `state`, but leaves the controller
    /// alone until [`init`](Hcd::init).
    ///
    /// # Panics
    ///
    /// Panics if `state` is already in use by another driver.
    pub fn new<P: Peripherals>(peripherals: P, state: &'static EhciState) -> Self {
        let state = state
            .take()
            .expect("EHCI state already assigned to another controller");
        // Safety: Peripherals implementers guarantee the register block is valid
        // and owned.
        let regs = unsafe { &*(peripherals.host_controller() as *const RegisterBlock) };
        let ehci = Ehci { regs, state };
        ehci.init_schedule();
        ehci
    }

    fn init_schedule(&self) {
        let state = self.state;

        let async_head = state.element(ASYNC_HEAD);
        async_head.init_dummy(true);
        async_head.slot().try_claim();
        schedule::link(state, ASYNC_HEAD, Some(ASYNC_HEAD));

        for log2 in 0..PERIOD_BUCKETS as u8 {
            state.element(Node::Period(log2)).init_dummy(false);
            let next = (log2 > 0).then_some(Node::Period(0));
            schedule::link(state, Node::Period(log2), next);
        }

        // Every frame visits the 1ms bucket; even frames first visit the 2ms
        // bucket, frames 1 and 5 (mod 8) the 4ms bucket, and frame 3 the 8ms bucket.
        for (frame, entry) in state.framelist().iter().enumerate() {
            let log2 = match frame % 8 {
                0 | 2 | 4 | 6 => 1,
                1 | 5 => 2,
                3 => 3,
                _ => 0,
            };
            let log2 = log2.min(PERIOD_BUCKETS as u8 - 1);
            entry.write(state.link_word(Node::Period(log2)));
        }
        crate::cache::clean_invalidate(state);
    }

    fn live_qhd(&self, pipe: PipeHandle) -> Result<(Node, &Qhd)> {
        if pipe.dev_addr as usize > MAX_DEVICES {
            return Err(Error::InvalidPipe);
        }
        let node = match pipe.xfer_type {
            TransferType::Control => Node::Control(pipe.dev_addr),
            _ if pipe.index as usize >= crate::MAX_PIPES => return Err(Error::InvalidPipe),
            _ => Node::Pipe {
                dev_addr: pipe.dev_addr,
                index: pipe.index,
            },
        };
        let qhd = self.state.element(node);
        if qhd.slot().is_live(pipe.generation) && qhd.xfer_type() == pipe.xfer_type {
            Ok((node, qhd))
        } else {
            Err(Error::InvalidPipe)
        }
    }

    fn qtd(&self, node: Node, index: u8) -> &Qtd {
        match node {
            Node::Control(dev_addr) => &self.state.devices()[dev_addr as usize].control.qtd[index as usize],
            Node::Pipe { dev_addr, .. } => &self.state.devices()[dev_addr as usize].qtd[index as usize],
            Node::Period(_) | Node::BulkHead => unreachable!("list heads carry no transfers"),
        }
    }

    fn handle(&self, node: Node) -> PipeHandle {
        let qhd = self.state.element(node);
        let (dev_addr, index) = match node {
            Node::Control(dev_addr) => (dev_addr, 0),
            Node::Pipe { dev_addr, index } => (dev_addr, index),
            _ => (0, 0),
        };
        PipeHandle {
            dev_addr,
            xfer_type: qhd.xfer_type(),
            index,
            generation: qhd.slot().generation(),
        }
    }

    /// Link a prepared qTD at the end of the queue head's list
    fn append(&self, node: Node, index: u8) {
        let qhd = self.state.element(node);
        let qtd = self.qtd(node, index);
        let addr = crate::dma_addr(qtd);
        let old_tail = qhd.tail().map(|tail| self.qtd(node, tail));
        match old_tail {
            None => qhd.set_head(Some(index)),
            Some(tail) => {
                tail.overlay.set_next(Some(addr));
                tail.set_next_index(Some(index));
                tail.clean_invalidate_dcache();
            }
        }
        qhd.set_tail(Some(index));

        // Either the controller has nothing left to fetch, or it copied the
        // old tail's terminate bit into the overlay before the link above.
        // In both cases it would stop short of the new qTD.
        let idle = !qhd.overlay.status().contains(Status::ACTIVE);
        let on_old_tail = old_tail.map_or(false, |tail| qhd.current() == crate::dma_addr(tail));
        if !qhd.is_halted() && qhd.overlay.next().is_none() && (idle || on_old_tail) {
            qhd.overlay.set_next(Some(addr));
        }
        qhd.clean_invalidate_dcache();
    }

    /// Unlink the first qTD of the list, and release it
    fn pop(&self, node: Node) -> Option<u8> {
        let qhd = self.state.element(node);
        let index = qhd.head()?;
        let qtd = self.qtd(node, index);
        let next = qtd.next_index();
        qhd.set_head(next);
        if next.is_none() {
            qhd.set_tail(None);
        }
        qtd.slot().release();
        Some(index)
    }

    fn clear_list(&self, node: Node) {
        while self.pop(node).is_some() {}
    }

    /// Free the queue head and everything on it
    fn release(&self, node: Node) {
        self.clear_list(node);
        let qhd = self.state.element(node);
        qhd.overlay.clear();
        qhd.take_xferred();
        qhd.slot().release();
    }

    fn ring_doorbell(&self) {
        ral::modify_reg!(crate::ehci::regs, self.regs, USBCMD, IAA: 1);
    }

    /// Visit every queue head the controller can reach, async list first
    fn for_each_qhd(&self, mut f: impl FnMut(Node)) {
        schedule::walk(self.state, ASYNC_HEAD).for_each(&mut f);
        for log2 in 0..PERIOD_BUCKETS as u8 {
            schedule::walk(self.state, Node::Period(log2)).for_each(&mut f);
        }
    }

    fn port_change_isr(&mut self, events: &mut dyn FnMut(HcdEvent)) {
        let portsc = self.regs.PORTSC1.read();
        // Writing back the value acknowledges the change bits
        self.regs.PORTSC1.write(portsc);
        if portsc & regs::PORTSC1::CSC::mask != 0 {
            if portsc & regs::PORTSC1::CCS::mask != 0 {
                debug!("EHCI PORT CONNECT");
                self.port_reset(0);
                events(HcdEvent::DeviceAttached { rhport: 0 });
            } else {
                debug!("EHCI PORT DISCONNECT");
                events(HcdEvent::DeviceRemoved { rhport: 0 });
            }
        }
    }

    fn error_isr(&self, node: Node, events: &mut dyn FnMut(HcdEvent)) {
        let qhd = self.state.element(node);
        if !qhd.slot().is_used() || qhd.head().is_none() || qhd.halt_reported() {
            return;
        }
        let status = qhd.overlay.status();
        let xact_error = status.intersects(Status::XACT_ERRORS);
        let retired = !status.contains(Status::ACTIVE);
        if !(status.contains(Status::HALTED) || (xact_error && retired)) {
            return;
        }

        if let Some(head) = qhd.head() {
            qhd.add_xferred(self.qtd(node, head).xferred());
        }
        self.pop(node);
        let result = if xact_error {
            XferResult::TransactionError
        } else {
            XferResult::Stall
        };
        warn!("EHCI {:?} {:?} STATUS {:?}", node, result, status);

        if let Node::Control(_) = node {
            // Control pipes can't stay halted; drop the rest of the stages.
            self.clear_list(node);
            qhd.overlay.clear();
        } else {
            qhd.set_halt_reported(true);
        }
        events(HcdEvent::XferComplete {
            pipe: self.handle(node),
            class: qhd.class(),
            result,
            bytes: qhd.take_xferred(),
        });
    }

    fn complete_isr(&self, node: Node, events: &mut dyn FnMut(HcdEvent)) {
        let qhd = self.state.element(node);
        if !qhd.slot().is_used() || qhd.is_halted() {
            return;
        }
        while let Some(head) = qhd.head() {
            let qtd = self.qtd(node, head);
            if qtd.overlay.status().contains(Status::ACTIVE) {
                break;
            }
            let ioc = qtd.overlay.is_ioc();
            qhd.add_xferred(qtd.xferred());
            self.pop(node);
            if ioc {
                events(HcdEvent::XferComplete {
                    pipe: self.handle(node),
                    class: qhd.class(),
                    result: XferResult::Success,
                    bytes: qhd.take_xferred(),
                });
            }
        }
    }

    fn async_advance_isr(&self, events: &mut dyn FnMut(HcdEvent)) {
        for dev_addr in 1..=MAX_DEVICES as u8 {
            let Some(device) = self.state.device(dev_addr) else {
                continue;
            };
            for (index, qhd) in device.qhd.iter().enumerate() {
                if qhd.slot().is_removing() {
                    self.release(Node::Pipe {
                        dev_addr,
                        index: index as u8,
                    });
                }
            }
            if device.control.qhd.slot().is_removing() {
                self.release(Node::Control(dev_addr));
                debug!("EHCI RECLAIMED {}", dev_addr);
                events(HcdEvent::DeviceReclaimed { dev_addr });
            }
        }
    }

    /// Unlink a pipe. Returns `true` if the doorbell must confirm the removal.
    fn unlink(&self, node: Node) -> bool {
        let qhd = self.state.element(node);
        if !qhd.slot().mark_removing() {
            return false;
        }
        match qhd.xfer_type() {
            TransferType::Interrupt => {
                let bucket = Node::Period(period_bucket(qhd.interval_ms()));
                schedule::remove(self.state, bucket, node);
                self.release(node);
                false
            }
            _ => {
                schedule::remove(self.state, ASYNC_HEAD, node);
                true
            }
        }
    }
}

impl Hcd for Ehci {
    fn init(&mut self) -> Result<()> {
        ral::write_reg!(crate::ehci::regs, self.regs, USBCMD, RST: 1);
        (0..RESET_SPINS)
            .find(|_| ral::read_reg!(crate::ehci::regs, self.regs, USBCMD, RST == 0))
            .ok_or(Error::Timeout)?;

        ral::write_reg!(crate::ehci::regs, self.regs, USBMODE, CM: regs::USBMODE::CM_HOST);
        self.regs.USBSTS.write(u32::MAX);
        self.regs.USBINTR.write(Interrupts::ENABLED.bits());

        self.regs
            .PERIODICLISTBASE
            .write(crate::dma_addr(self.state.framelist()));
        self.regs
            .ASYNCLISTADDR
            .write(crate::dma_addr(self.state.element(ASYNC_HEAD)));
        ral::write_reg!(crate::ehci::regs, self.regs, CONFIGFLAG, CF: 1);

        // Frame list of eight entries
        ral::write_reg!(
            crate::ehci::regs,
            self.regs,
            USBCMD,
            ITC: 0,
            FS_2: 1,
            FS_1: 0b11,
            PSE: 1,
            ASE: 1,
            RS: 1
        );

        let portsc = self.regs.PORTSC1.read() & !regs::PORTSC1::CHANGE_BITS;
        self.regs.PORTSC1.write(portsc | regs::PORTSC1::PP::mask);
        debug!("EHCI INITIALIZED");
        Ok(())
    }

    fn port_connect_status(&self, _rhport: u8) -> bool {
        ral::read_reg!(crate::ehci::regs, self.regs, PORTSC1, CCS == 1)
    }

    fn port_reset(&mut self, _rhport: u8) {
        let portsc = self.regs.PORTSC1.read()
            & !regs::PORTSC1::CHANGE_BITS
            & !regs::PORTSC1::PE::mask;
        self.regs.PORTSC1.write(portsc | regs::PORTSC1::PR::mask);
    }

    fn port_speed(&self, _rhport: u8) -> Speed {
        match ral::read_reg!(crate::ehci::regs, self.regs, PORTSC1, PSPD) {
            1 => Speed::Low,
            2 => Speed::High,
            _ => Speed::Full,
        }
    }

    fn control_open(&mut self, route: &DeviceRoute, max_packet_size: u16) -> Result<()> {
        let device = self
            .state
            .device(route.dev_addr)
            .ok_or(Error::InvalidParameter)?;
        let node = Node::Control(route.dev_addr);
        let qhd = &device.control.qhd;

        if route.dev_addr != 0 && qhd.slot().try_claim().is_none() {
            return Err(Error::NoFreeQueueHead);
        }
        device.control.qtd.iter().for_each(|qtd| qtd.slot().release());
        qhd.init(
            route,
            EndpointAddress::from(0),
            max_packet_size,
            TransferType::Control,
            0,
            None,
        );
        qhd.clean_invalidate_dcache();
        // The address-0 queue head never leaves the list
        if route.dev_addr != 0 {
            schedule::insert(self.state, ASYNC_HEAD, node);
        }
        debug!("EHCI CONTROL OPEN {} MPS {}", route.dev_addr, max_packet_size);
        Ok(())
    }

    unsafe fn control_xfer(&mut self, dev_addr: u8, setup: &SetupPacket, data: *mut u8) -> Result<()> {
        let device = self.state.device(dev_addr).ok_or(Error::InvalidParameter)?;
        let control = &device.control;
        let qhd = &control.qhd;
        if !qhd.slot().is_used() || qhd.slot().is_removing() {
            return Err(Error::InvalidPipe);
        }
        let len = setup.length() as usize;
        if len > 0 && len > qtd::max_transfer(data) {
            return Err(Error::InvalidParameter);
        }

        let node = Node::Control(dev_addr);
        // Anything left over belongs to an abandoned transfer
        self.clear_list(node);
        qhd.take_xferred();
        qhd.set_halt_reported(false);

        control.request.write(*setup.bytes());
        crate::cache::clean_invalidate(&control.request);
        if len > 0 {
            crate::cache::clean_invalidate_dcache_by_address(data as usize, len);
        }

        let [setup_td, data_td, status_td] = &control.qtd;
        for qtd in &control.qtd {
            qtd.slot().try_claim();
        }
        let (data_pid, status_pid) = if setup.is_in() {
            (Pid::In, Pid::Out)
        } else {
            (Pid::Out, Pid::In)
        };

        status_td.prepare(core::ptr::null(), 0, status_pid, true, true);
        setup_td.prepare(control.request.as_ptr() as *const u8, 8, Pid::Setup, false, false);
        if len > 0 {
            data_td.prepare(data, len, data_pid, true, false);
            data_td.overlay.set_next(Some(crate::dma_addr(status_td)));
            data_td.set_next_index(Some(2));
            setup_td.overlay.set_next(Some(crate::dma_addr(data_td)));
            setup_td.set_next_index(Some(1));
        } else {
            data_td.slot().release();
            setup_td.overlay.set_next(Some(crate::dma_addr(status_td)));
            setup_td.set_next_index(Some(2));
        }
        control.qtd.iter().for_each(Qtd::clean_invalidate_dcache);

        qhd.set_head(Some(0));
        qhd.set_tail(Some(2));

        // Start: point the overlay at SETUP, then un-halt
        qhd.overlay.set_next(Some(crate::dma_addr(setup_td)));
        qhd.overlay.set_status(Status::empty());
        qhd.clean_invalidate_dcache();
        trace!("EHCI CONTROL XFER {} {:?}", dev_addr, setup);
        Ok(())
    }

    fn control_close(&mut self, dev_addr: u8) -> Result<()> {
        let node = Node::Control(dev_addr);
        if dev_addr == 0 {
            let qhd = self.state.element(node);
            self.clear_list(node);
            qhd.overlay.clear();
            qhd.overlay.set_status(Status::HALTED);
            return Ok(());
        }
        if dev_addr as usize > MAX_DEVICES {
            return Err(Error::InvalidParameter);
        }
        if self.unlink(node) {
            self.ring_doorbell();
            Ok(())
        } else {
            Err(Error::InvalidPipe)
        }
    }

    fn pipe_open(
        &mut self,
        route: &DeviceRoute,
        endpoint: &EndpointDescriptor,
        class: ClassKind,
    ) -> Result<PipeHandle> {
        let xfer_type = endpoint.transfer_type();
        match xfer_type {
            TransferType::Isochronous => return Err(Error::UnsupportedTransferType),
            TransferType::Control => return Err(Error::InvalidParameter),
            _ => {}
        }
        let device = match route.dev_addr {
            0 => None,
            dev_addr => self.state.device(dev_addr),
        }
        .ok_or(Error::InvalidParameter)?;

        let (index, generation) = pool::claim(&device.qhd).ok_or(Error::NoFreeQueueHead)?;
        let qhd = &device.qhd[index];
        qhd.init(
            route,
            endpoint.address,
            endpoint.packet_size(),
            xfer_type,
            endpoint.interval,
            Some(class),
        );
        qhd.clean_invalidate_dcache();

        let node = Node::Pipe {
            dev_addr: route.dev_addr,
            index: index as u8,
        };
        let head = match xfer_type {
            TransferType::Interrupt => Node::Period(period_bucket(qhd.interval_ms())),
            _ => ASYNC_HEAD,
        };
        schedule::insert(self.state, head, node);
        debug!(
            "EHCI PIPE OPEN {} EP {:02x} {:?}",
            route.dev_addr,
            u8::from(endpoint.address),
            xfer_type
        );

        Ok(PipeHandle {
            dev_addr: route.dev_addr,
            xfer_type,
            index: index as u8,
            generation,
        })
    }

    unsafe fn pipe_queue_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize) -> Result<()> {
        self.pipe_xfer(pipe, buffer, len, false)
    }

    unsafe fn pipe_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize, ioc: bool) -> Result<()> {
        if pipe.xfer_type == TransferType::Control {
            return Err(Error::InvalidPipe);
        }
        let (node, qhd) = self.live_qhd(pipe)?;
        if len > qtd::max_transfer(buffer) {
            return Err(Error::InvalidParameter);
        }
        let device = self
            .state
            .device(pipe.dev_addr)
            .ok_or(Error::InvalidPipe)?;
        let (index, _) = pool::claim(&device.qtd).ok_or(Error::NoFreeTransferDescriptor)?;

        crate::cache::clean_invalidate_dcache_by_address(buffer as usize, len);
        let qtd = &device.qtd[index];
        qtd.prepare(buffer, len, qhd.pid(), false, ioc);
        qtd.clean_invalidate_dcache();
        self.append(node, index as u8);
        Ok(())
    }

    fn pipe_close(&mut self, pipe: PipeHandle) -> Result<()> {
        if pipe.xfer_type == TransferType::Control {
            return Err(Error::InvalidPipe);
        }
        let (node, _) = self.live_qhd(pipe)?;
        if self.unlink(node) {
            self.ring_doorbell();
        }
        debug!("EHCI PIPE CLOSE {:?}", pipe);
        Ok(())
    }

    fn pipe_is_busy(&self, pipe: PipeHandle) -> bool {
        self.live_qhd(pipe)
            .map(|(_, qhd)| qhd.head().is_some())
            .unwrap_or(false)
    }

    fn pipe_is_stalled(&self, pipe: PipeHandle) -> bool {
        self.live_qhd(pipe)
            .map(|(_, qhd)| qhd.is_halted())
            .unwrap_or(false)
    }

    fn pipe_clear_stall(&mut self, pipe: PipeHandle) -> Result<()> {
        let (node, qhd) = self.live_qhd(pipe)?;
        let next = qhd
            .head()
            .map(|head| crate::dma_addr(self.qtd(node, head)));
        qhd.overlay.clear();
        qhd.overlay.set_toggle(false);
        qhd.overlay.set_next(next);
        qhd.set_halt_reported(false);
        qhd.clean_invalidate_dcache();
        Ok(())
    }

    fn device_close(&mut self, dev_addr: u8) -> bool {
        if dev_addr == 0 {
            let _ = self.control_close(0);
            return false;
        }
        let Some(device) = self.state.device(dev_addr) else {
            return false;
        };
        let mut doorbell = false;
        for index in 0..device.qhd.len() as u8 {
            doorbell |= self.unlink(Node::Pipe { dev_addr, index });
        }
        let reclaim = self.unlink(Node::Control(dev_addr));
        if doorbell || reclaim {
            self.ring_doorbell();
        }
        reclaim
    }

    fn isr(&mut self, events: &mut dyn FnMut(HcdEvent)) {
        let status = Interrupts::from_bits_truncate(self.regs.USBSTS.read() & self.regs.USBINTR.read());
        if status.is_empty() {
            return;
        }
        self.regs.USBSTS.write(status.bits());

        if status.contains(Interrupts::PORT_CHANGE) {
            self.port_change_isr(events);
        }
        if status.contains(Interrupts::SYSTEM_ERROR) {
            warn!("EHCI SYSTEM ERROR");
        }
        if status.contains(Interrupts::ERROR) {
            self.for_each_qhd(|node| self.error_isr(node, events));
        }
        if status.intersects(Interrupts::COMPLETE) {
            self.for_each_qhd(|node| self.complete_isr(node, events));
        }
        if status.contains(Interrupts::ASYNC_ADVANCE) {
            self.async_advance_isr(events);
        }
    }
}
