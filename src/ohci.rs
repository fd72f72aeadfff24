//! OHCI host controller driver
//!
//! # Design
//!
//! The controller walks three kinds of lists. The control list starts at
//! the address-0 control ED, which never leaves it and is skipped while no
//! enumeration uses it. The bulk list starts at a skipped dummy ED. The
//! HCCA interrupt table points at periodic bucket heads, arranged the same
//! way as the EHCI frame list.
//!
//! Retired gTDs are found by walking each ED's software list, rather than
//! by translating the done queue's addresses. A gTD is retired once its
//! condition code leaves "not accessed".
//!
//! An unlinked ED may still be in use until the next frame starts.
//! Closing a pipe marks its ED removing, unlinks it, and enables the
//! start-of-frame interrupt; that interrupt releases every removing ED.

mod ed;
mod gtd;
mod regs;
mod state;

pub use state::OhciState;

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
    Peripherals, MAX_DEVICES, MAX_PIPES, PERIOD_BUCKETS,
};
use ed::Ed;
use gtd::{condition, Gtd, Pid, Toggle};
use regs::{Interrupts, RegisterBlock};

/// Head of the control list
const CONTROL_HEAD: Node = Node::Control(0);

/// Bounds the wait for a controller reset
const RESET_SPINS: usize = 1_000_000;

/// Periodic bucket for a polling interval
fn period_bucket(interval_ms: u8) -> u8 {
    (interval_ms as usize)
        .clamp(1, 1 << (PERIOD_BUCKETS - 1))
        .ilog2() as u8
}

/// An OHCI host controller driver
pub struct Ohci {
    regs: &'static RegisterBlock,
    state: &'static OhciState,
}

impl Ohci {
    /// Create a driver for the controller owned by `peripherals`
    ///
    /// `peripherals` must point at the OHCI operational registers. The
    /// controller is left alone until [`init`](Hcd::init).
    ///
    /// # Panics
    ///
    /// Panics if `state` is already in use by another driver.
    pub fn new<P: Peripherals>(peripherals: P, state: &'static OhciState) -> Self {
        let state = state
            .take()
            .expect("OHCI state already assigned to another controller");
        // Safety: Peripherals implementers guarantee the register block is valid
        // and owned.
        let regs = unsafe { &*(peripherals.host_controller() as *const RegisterBlock) };
        let ohci = Ohci { regs, state };
        ohci.init_schedule();
        ohci
    }

    fn init_schedule(&self) {
        let state = self.state;

        let control_head = state.element(CONTROL_HEAD);
        control_head.init_dummy();
        control_head.slot().try_claim();
        schedule::link(state, CONTROL_HEAD, None);

        state.element(Node::BulkHead).init_dummy();
        schedule::link(state, Node::BulkHead, None);

        for log2 in 0..PERIOD_BUCKETS as u8 {
            state.element(Node::Period(log2)).init_dummy();
            let next = (log2 > 0).then_some(Node::Period(0));
            schedule::link(state, Node::Period(log2), next);
        }

        for (frame, entry) in state.hcca().interrupt_table.iter().enumerate() {
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

    fn live_ed(&self, pipe: PipeHandle) -> Result<(Node, &Ed)> {
        if pipe.dev_addr as usize > MAX_DEVICES {
            return Err(Error::InvalidPipe);
        }
        let node = match pipe.xfer_type {
            TransferType::Control => Node::Control(pipe.dev_addr),
            _ if pipe.index as usize >= MAX_PIPES => return Err(Error::InvalidPipe),
            _ => Node::Pipe {
                dev_addr: pipe.dev_addr,
                index: pipe.index,
            },
        };
        let ed = self.state.element(node);
        if ed.slot().is_live(pipe.generation) && ed.xfer_type() == pipe.xfer_type {
            Ok((node, ed))
        } else {
            Err(Error::InvalidPipe)
        }
    }

    fn gtd(&self, node: Node, index: u8) -> &Gtd {
        match node {
            Node::Control(dev_addr) => &self.state.devices()[dev_addr as usize].control.gtd[index as usize],
            Node::Pipe { dev_addr, .. } => &self.state.devices()[dev_addr as usize].gtd[index as usize],
            Node::Period(_) | Node::BulkHead => unreachable!("list heads carry no transfers"),
        }
    }

    fn handle(&self, node: Node) -> PipeHandle {
        let ed = self.state.element(node);
        let (dev_addr, index) = match node {
            Node::Control(dev_addr) => (dev_addr, 0),
            Node::Pipe { dev_addr, index } => (dev_addr, index),
            _ => (0, 0),
        };
        PipeHandle {
            dev_addr,
            xfer_type: ed.xfer_type(),
            index,
            generation: ed.slot().generation(),
        }
    }

    fn list_head(xfer_type: TransferType, interval_ms: u8) -> Node {
        match xfer_type {
            TransferType::Control => CONTROL_HEAD,
            TransferType::Interrupt => Node::Period(period_bucket(interval_ms)),
            _ => Node::BulkHead,
        }
    }

    /// Tell the controller that a list has new work
    fn list_filled(&self, xfer_type: TransferType) {
        match xfer_type {
            TransferType::Control => {
                ral::write_reg!(crate::ohci::regs, self.regs, HCCOMMANDSTATUS, CLF: 1)
            }
            TransferType::Bulk => {
                ral::write_reg!(crate::ohci::regs, self.regs, HCCOMMANDSTATUS, BLF: 1)
            }
            _ => {}
        }
    }

    /// Link a prepared gTD at the end of the ED's chain
    fn append(&self, node: Node, index: u8) {
        let ed = self.state.element(node);
        let addr = crate::dma_addr(self.gtd(node, index));
        match ed.tail() {
            None => ed.set_head(Some(index)),
            Some(tail) => {
                let tail = self.gtd(node, tail);
                tail.set_next(Some(addr));
                tail.set_next_index(Some(index));
                tail.clean_invalidate_dcache();
            }
        }
        ed.set_tail(Some(index));
        // The controller ran off the end of the chain; restart it here.
        if ed.hw_head().is_none() {
            ed.set_hw_head(addr);
        }
        ed.clean_invalidate_dcache();
    }

    fn pop(&self, node: Node) -> Option<u8> {
        let ed = self.state.element(node);
        let index = ed.head()?;
        let gtd = self.gtd(node, index);
        let next = gtd.next_index();
        ed.set_head(next);
        if next.is_none() {
            ed.set_tail(None);
        }
        gtd.slot().release();
        Some(index)
    }

    fn clear_list(&self, node: Node) {
        while self.pop(node).is_some() {}
    }

    fn release(&self, node: Node) {
        self.clear_list(node);
        let ed = self.state.element(node);
        ed.restart(None);
        ed.take_xferred();
        ed.slot().release();
    }

    fn for_each_ed(&self, mut f: impl FnMut(Node)) {
        schedule::walk(self.state, CONTROL_HEAD).for_each(&mut f);
        schedule::walk(self.state, Node::BulkHead).for_each(&mut f);
        for log2 in 0..PERIOD_BUCKETS as u8 {
            schedule::walk(self.state, Node::Period(log2)).for_each(&mut f);
        }
    }

    fn port_change_isr(&mut self, events: &mut dyn FnMut(HcdEvent)) {
        let portsc = self.regs.HCRHPORTSTATUS[0].read();
        let changes = portsc & regs::port::CHANGE_BITS;
        if changes & regs::port::CSC != 0 {
            if portsc & regs::port::CCS != 0 {
                debug!("OHCI PORT CONNECT");
                self.port_reset(0);
                events(HcdEvent::DeviceAttached { rhport: 0 });
            } else {
                debug!("OHCI PORT DISCONNECT");
                events(HcdEvent::DeviceRemoved { rhport: 0 });
            }
        }
        self.regs.HCRHPORTSTATUS[0].write(changes);
    }

    /// Pop every retired gTD, reporting completions and errors in order
    fn done_isr(&self, node: Node, events: &mut dyn FnMut(HcdEvent)) {
        let ed = self.state.element(node);
        if !ed.slot().is_used() || ed.halt_reported() {
            return;
        }
        while let Some(head) = ed.head() {
            let gtd = self.gtd(node, head);
            if !gtd.is_retired() {
                break;
            }
            let code = gtd.condition_code();
            let ioc = gtd.is_ioc();
            ed.add_xferred(gtd.xferred());
            self.pop(node);

            let result = match code {
                condition::NO_ERROR if !ioc => continue,
                condition::NO_ERROR => XferResult::Success,
                condition::STALL => XferResult::Stall,
                _ => XferResult::TransactionError,
            };
            if result != XferResult::Success {
                warn!("OHCI {:?} {:?} CC {}", node, result, code);
                if let Node::Control(_) = node {
                    // Control pipes can't stay halted; drop the rest of the stages.
                    self.clear_list(node);
                    ed.restart(None);
                } else {
                    ed.park();
                    ed.set_halt_reported(true);
                }
            }
            events(HcdEvent::XferComplete {
                pipe: self.handle(node),
                class: ed.class(),
                result,
                bytes: ed.take_xferred(),
            });
            if result != XferResult::Success {
                break;
            }
        }
    }

    fn start_of_frame_isr(&self, events: &mut dyn FnMut(HcdEvent)) {
        for dev_addr in 1..=MAX_DEVICES as u8 {
            let Some(device) = self.state.device(dev_addr) else {
                continue;
            };
            for (index, ed) in device.ed.iter().enumerate() {
                if ed.slot().is_removing() {
                    self.release(Node::Pipe {
                        dev_addr,
                        index: index as u8,
                    });
                }
            }
            if device.control.ed.slot().is_removing() {
                self.release(Node::Control(dev_addr));
                debug!("OHCI RECLAIMED {}", dev_addr);
                events(HcdEvent::DeviceReclaimed { dev_addr });
            }
        }
        self.regs
            .HCINTERRUPTDISABLE
            .write(Interrupts::START_OF_FRAME.bits());
    }

    /// Unlink an ED, and schedule its release for the next frame
    fn unlink(&self, node: Node) -> bool {
        let ed = self.state.element(node);
        if !ed.slot().mark_removing() {
            return false;
        }
        ed.set_skip(true);
        let head = Self::list_head(ed.xfer_type(), ed.interval_ms());
        schedule::remove(self.state, head, node);
        self.regs
            .HCINTERRUPTSTATUS
            .write(Interrupts::START_OF_FRAME.bits());
        self.regs
            .HCINTERRUPTENABLE
            .write(Interrupts::START_OF_FRAME.bits());
        true
    }
}

impl Hcd for Ohci {
    fn init(&mut self) -> Result<()> {
        ral::write_reg!(crate::ohci::regs, self.regs, HCCOMMANDSTATUS, HCR: 1);
        (0..RESET_SPINS)
            .find(|_| ral::read_reg!(crate::ohci::regs, self.regs, HCCOMMANDSTATUS, HCR == 0))
            .ok_or(Error::Timeout)?;

        self.regs
            .HCCONTROLHEADED
            .write(crate::dma_addr(self.state.element(CONTROL_HEAD)));
        self.regs
            .HCBULKHEADED
            .write(crate::dma_addr(self.state.element(Node::BulkHead)));
        self.regs.HCHCCA.write(crate::dma_addr(self.state.hcca()));

        self.regs.HCINTERRUPTDISABLE.write(u32::MAX);
        self.regs.HCINTERRUPTSTATUS.write(u32::MAX);
        self.regs.HCINTERRUPTENABLE.write(Interrupts::ENABLED.bits());

        ral::write_reg!(
            crate::ohci::regs,
            self.regs,
            HCFMINTERVAL,
            FI: regs::HCFMINTERVAL::FI_NOMINAL,
            FSMPS: regs::HCFMINTERVAL::FSMPS_NOMINAL
        );
        // Periodic work starts once 10% of the frame is left
        self.regs
            .HCPERIODICSTART
            .write(regs::HCFMINTERVAL::FI_NOMINAL * 9 / 10);

        ral::write_reg!(
            crate::ohci::regs,
            self.regs,
            HCCONTROL,
            CBSR: regs::HCCONTROL::CBSR_4_1,
            PLE: 1,
            CLE: 1,
            BLE: 1,
            HCFS: regs::HCCONTROL::HCFS_OPERATIONAL
        );
        // Global port power
        ral::write_reg!(crate::ohci::regs, self.regs, HCRHSTATUS, LPSC: 1);
        debug!("OHCI INITIALIZED");
        Ok(())
    }

    fn port_connect_status(&self, _rhport: u8) -> bool {
        self.regs.HCRHPORTSTATUS[0].read() & regs::port::CCS != 0
    }

    fn port_reset(&mut self, _rhport: u8) {
        self.regs.HCRHPORTSTATUS[0].write(regs::port::PRS);
    }

    fn port_speed(&self, _rhport: u8) -> Speed {
        if self.regs.HCRHPORTSTATUS[0].read() & regs::port::LSDA != 0 {
            Speed::Low
        } else {
            Speed::Full
        }
    }

    fn control_open(&mut self, route: &DeviceRoute, max_packet_size: u16) -> Result<()> {
        let device = self
            .state
            .device(route.dev_addr)
            .ok_or(Error::InvalidParameter)?;
        let ed = &device.control.ed;

        if route.dev_addr != 0 && ed.slot().try_claim().is_none() {
            return Err(Error::NoFreeQueueHead);
        }
        device.control.gtd.iter().for_each(|gtd| gtd.slot().release());
        ed.init(
            route,
            EndpointAddress::from(0),
            max_packet_size,
            TransferType::Control,
            0,
            None,
        );
        ed.clean_invalidate_dcache();
        if route.dev_addr != 0 {
            schedule::insert(self.state, CONTROL_HEAD, Node::Control(route.dev_addr));
        }
        debug!("OHCI CONTROL OPEN {} MPS {}", route.dev_addr, max_packet_size);
        Ok(())
    }

    unsafe fn control_xfer(&mut self, dev_addr: u8, setup: &SetupPacket, data: *mut u8) -> Result<()> {
        let device = self.state.device(dev_addr).ok_or(Error::InvalidParameter)?;
        let control = &device.control;
        let ed = &control.ed;
        if !ed.slot().is_used() || ed.slot().is_removing() {
            return Err(Error::InvalidPipe);
        }
        let len = setup.length() as usize;
        if len > 2 * 4096 - (data as usize & 0xFFF) {
            return Err(Error::InvalidParameter);
        }

        let node = Node::Control(dev_addr);
        self.clear_list(node);
        ed.take_xferred();
        ed.set_halt_reported(false);

        control.request.write(*setup.bytes());
        crate::cache::clean_invalidate(&control.request);
        if len > 0 {
            crate::cache::clean_invalidate_dcache_by_address(data as usize, len);
        }

        let [setup_td, data_td, status_td] = &control.gtd;
        for gtd in &control.gtd {
            gtd.slot().try_claim();
        }
        let (data_pid, status_pid) = if setup.is_in() {
            (Pid::In, Pid::Out)
        } else {
            (Pid::Out, Pid::In)
        };

        status_td.prepare(core::ptr::null(), 0, status_pid, Toggle::Data1, true);
        setup_td.prepare(control.request.as_ptr() as *const u8, 8, Pid::Setup, Toggle::Data0, false);
        if len > 0 {
            data_td.prepare(data, len, data_pid, Toggle::Data1, false);
            data_td.set_next(Some(crate::dma_addr(status_td)));
            data_td.set_next_index(Some(2));
            setup_td.set_next(Some(crate::dma_addr(data_td)));
            setup_td.set_next_index(Some(1));
        } else {
            data_td.slot().release();
            setup_td.set_next(Some(crate::dma_addr(status_td)));
            setup_td.set_next_index(Some(2));
        }
        control.gtd.iter().for_each(Gtd::clean_invalidate_dcache);

        ed.set_head(Some(0));
        ed.set_tail(Some(2));
        ed.restart(Some(crate::dma_addr(setup_td)));
        ed.set_skip(false);
        ed.clean_invalidate_dcache();
        self.list_filled(TransferType::Control);
        trace!("OHCI CONTROL XFER {} {:?}", dev_addr, setup);
        Ok(())
    }

    fn control_close(&mut self, dev_addr: u8) -> Result<()> {
        let node = Node::Control(dev_addr);
        if dev_addr == 0 {
            let ed = self.state.element(node);
            ed.set_skip(true);
            self.clear_list(node);
            ed.restart(None);
            return Ok(());
        }
        if dev_addr as usize > MAX_DEVICES {
            return Err(Error::InvalidParameter);
        }
        if self.unlink(node) {
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

        let (index, generation) = pool::claim(&device.ed).ok_or(Error::NoFreeQueueHead)?;
        let ed = &device.ed[index];
        ed.init(
            route,
            endpoint.address,
            endpoint.packet_size(),
            xfer_type,
            endpoint.interval,
            Some(class),
        );
        ed.clean_invalidate_dcache();

        let node = Node::Pipe {
            dev_addr: route.dev_addr,
            index: index as u8,
        };
        schedule::insert(self.state, Self::list_head(xfer_type, ed.interval_ms()), node);
        debug!(
            "OHCI PIPE OPEN {} EP {:02x} {:?}",
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
        self.queue(pipe, buffer, len, false)
    }

    unsafe fn pipe_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize, ioc: bool) -> Result<()> {
        self.queue(pipe, buffer, len, ioc)?;
        self.list_filled(pipe.xfer_type);
        Ok(())
    }

    fn pipe_close(&mut self, pipe: PipeHandle) -> Result<()> {
        if pipe.xfer_type == TransferType::Control {
            return Err(Error::InvalidPipe);
        }
        let (node, _) = self.live_ed(pipe)?;
        self.unlink(node);
        debug!("OHCI PIPE CLOSE {:?}", pipe);
        Ok(())
    }

    fn pipe_is_busy(&self, pipe: PipeHandle) -> bool {
        self.live_ed(pipe)
            .map(|(_, ed)| ed.head().is_some())
            .unwrap_or(false)
    }

    fn pipe_is_stalled(&self, pipe: PipeHandle) -> bool {
        self.live_ed(pipe)
            .map(|(_, ed)| ed.is_halted())
            .unwrap_or(false)
    }

    fn pipe_clear_stall(&mut self, pipe: PipeHandle) -> Result<()> {
        let (node, ed) = self.live_ed(pipe)?;
        let next = ed.head().map(|head| crate::dma_addr(self.gtd(node, head)));
        ed.restart(next);
        ed.set_halt_reported(false);
        ed.clean_invalidate_dcache();
        self.list_filled(pipe.xfer_type);
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
        for index in 0..device.ed.len() as u8 {
            self.unlink(Node::Pipe { dev_addr, index });
        }
        self.unlink(Node::Control(dev_addr))
    }

    fn isr(&mut self, events: &mut dyn FnMut(HcdEvent)) {
        let status = Interrupts::from_bits_truncate(
            self.regs.HCINTERRUPTSTATUS.read() & self.regs.HCINTERRUPTENABLE.read(),
        )
        .difference(Interrupts::MASTER_INTERRUPT_ENABLE);
        if status.is_empty() {
            return;
        }

        if status.contains(Interrupts::ROOT_HUB_STATUS_CHANGE) {
            self.port_change_isr(events);
        }
        if status.contains(Interrupts::UNRECOVERABLE_ERROR) {
            warn!("OHCI UNRECOVERABLE ERROR");
        }
        if status.contains(Interrupts::WRITEBACK_DONE_HEAD) {
            self.for_each_ed(|node| self.done_isr(node, events));
            // The controller writes the next done queue once this is clear
            self.state.hcca().done_head.write(0);
        }
        if status.contains(Interrupts::START_OF_FRAME) {
            self.start_of_frame_isr(events);
        }
        self.regs.HCINTERRUPTSTATUS.write(status.bits());
    }
}

impl Ohci {
    unsafe fn queue(&self, pipe: PipeHandle, buffer: *mut u8, len: usize, ioc: bool) -> Result<()> {
        if pipe.xfer_type == TransferType::Control {
            return Err(Error::InvalidPipe);
        }
        let (node, ed) = self.live_ed(pipe)?;
        // A gTD spans at most two pages
        if len > 2 * 4096 - (buffer as usize & 0xFFF) {
            return Err(Error::InvalidParameter);
        }
        let device = self.state.device(pipe.dev_addr).ok_or(Error::InvalidPipe)?;
        let (index, _) = pool::claim(&device.gtd).ok_or(Error::NoFreeTransferDescriptor)?;

        crate::cache::clean_invalidate_dcache_by_address(buffer as usize, len);
        let gtd = &device.gtd[index];
        gtd.prepare(buffer, len, ed.pid(), Toggle::Carry, ioc);
        gtd.clean_invalidate_dcache();
        self.append(node, index as u8);
        Ok(())
    }
}
