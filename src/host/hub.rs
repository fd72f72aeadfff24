//! The built-in hub class driver
//!
//! The hub driver opens a hub's status change pipe, powers its ports, and
//! turns status changes into enumeration events. Port resets and status
//! reads belong to the enumeration task, which issues them through the
//! requests here.

use core::task::{ready, Poll};

use super::{memory::HubBuffers, ControlTransfer, HostContext};
use crate::{
    class::{ClassDriver, ClassKind},
    descriptor::{descriptor_type, EndpointDescriptor, InterfaceDescriptor},
    error::{Error, Result, XferResult},
    pipe::{PipeHandle, Speed, TransferType},
    request::{port_feature, SetupPacket},
    MAX_DEVICES, MAX_HUB_PORTS,
};

bitflags::bitflags! {
    /// `wPortStatus`
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PortStatus : u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
    }

    /// `wPortChange`
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PortChange : u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
    }

    /// `wHubChange`
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct HubChange : u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }
}

/// The response to GET_STATUS(port)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PortReport {
    pub status: PortStatus,
    pub change: PortChange,
}

impl PortReport {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        match buf {
            [s0, s1, c0, c1, ..] => Ok(PortReport {
                status: PortStatus::from_bits_retain(u16::from_le_bytes([*s0, *s1])),
                change: PortChange::from_bits_retain(u16::from_le_bytes([*c0, *c1])),
            }),
            _ => Err(Error::InvalidDescriptor),
        }
    }

    pub fn speed(&self) -> Speed {
        if self.status.contains(PortStatus::HIGH_SPEED) {
            Speed::High
        } else if self.status.contains(PortStatus::LOW_SPEED) {
            Speed::Low
        } else {
            Speed::Full
        }
    }

    /// `true` once a port reset has finished, and the port is usable
    pub fn is_reset_complete(&self) -> bool {
        self.change.contains(PortChange::RESET)
            && self
                .status
                .contains(PortStatus::CONNECTION | PortStatus::POWER | PortStatus::ENABLE)
    }
}

/// Bytes in a status change bitmap: one bit for the hub, and one per port
pub(crate) const STATUS_CHANGE_LEN: usize = (MAX_HUB_PORTS + 1 + 7) / 8;

/// What a status change bitmap asks the host to service
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum StatusChange {
    /// Nothing to service; re-arm the status pipe
    None,
    /// The hub's own power or over-current state changed
    Hub,
    Port(u8),
}

/// Decode a status change bitmap
///
/// Bit 0 is the hub itself, and takes priority; bit N is port N. Ports
/// above `port_count` are ignored.
fn status_change(bitmap: &[u8], port_count: u8) -> StatusChange {
    let bit = |n: usize| bitmap.get(n / 8).map_or(false, |byte| byte & (1 << (n % 8)) != 0);
    if bit(0) {
        return StatusChange::Hub;
    }
    (1..=port_count)
        .find(|&port| bit(port as usize))
        .map_or(StatusChange::None, StatusChange::Port)
}

#[derive(Clone, Copy)]
struct HubInfo {
    status_pipe: PipeHandle,
    port_count: u8,
}

impl HubInfo {
    const fn new() -> Self {
        HubInfo {
            status_pipe: PipeHandle::NULL,
            port_count: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpenStep {
    Start,
    Descriptor,
    Power { port: u8 },
}

/// Length of the interface and status endpoint descriptors
const CONSUMED: usize = InterfaceDescriptor::SIZE + EndpointDescriptor::SIZE;

pub(crate) struct Hub {
    hubs: [HubInfo; MAX_DEVICES + 1],
    buffers: &'static mut [HubBuffers; MAX_DEVICES + 1],
    open: OpenStep,
    xfer: ControlTransfer,
    /// Changes reported by the status change pipes, with the hub's address
    changes: heapless::Deque<(u8, StatusChange), MAX_DEVICES>,
}

impl Hub {
    pub fn new(buffers: &'static mut [HubBuffers; MAX_DEVICES + 1]) -> Self {
        Hub {
            hubs: [HubInfo::new(); MAX_DEVICES + 1],
            buffers,
            open: OpenStep::Start,
            xfer: ControlTransfer::new(),
            changes: heapless::Deque::new(),
        }
    }

    /// Take the next port change reported by a hub
    pub fn take_change(&mut self) -> Option<(u8, StatusChange)> {
        self.changes.pop_front()
    }

    pub fn port_count(&self, hub_addr: u8) -> u8 {
        self.hubs
            .get(hub_addr as usize)
            .map_or(0, |info| info.port_count)
    }

    /// Issue a hub request that moves no more than the request buffer
    fn request(
        &mut self,
        host: &mut dyn HostContext,
        xfer: &mut ControlTransfer,
        hub_addr: u8,
        setup: &SetupPacket,
    ) -> Poll<Result<usize>> {
        let Some(buffers) = self.buffers.get_mut(hub_addr as usize) else {
            return Poll::Ready(Err(Error::InvalidParameter));
        };
        // Safety: the request buffer is static and only used for this hub's
        // requests, one at a time.
        unsafe { host.control_xfer(xfer, hub_addr, setup, buffers.request.as_mut_ptr()) }
    }

    /// GET_STATUS(hub), returning the hub's change word
    pub fn hub_status(
        &mut self,
        host: &mut dyn HostContext,
        xfer: &mut ControlTransfer,
        hub_addr: u8,
    ) -> Poll<Result<HubChange>> {
        let len = ready!(self.request(host, xfer, hub_addr, &SetupPacket::get_hub_status()))?;
        match &self.buffers[hub_addr as usize].request.0[..len] {
            [_, _, c0, c1, ..] => Poll::Ready(Ok(HubChange::from_bits_retain(u16::from_le_bytes([*c0, *c1])))),
            _ => Poll::Ready(Err(Error::InvalidDescriptor)),
        }
    }

    /// CLEAR_FEATURE(hub, feature)
    pub fn clear_hub_feature(
        &mut self,
        host: &mut dyn HostContext,
        xfer: &mut ControlTransfer,
        hub_addr: u8,
        feature: u16,
    ) -> Poll<Result<()>> {
        ready!(self.request(host, xfer, hub_addr, &SetupPacket::clear_hub_feature(feature)))?;
        Poll::Ready(Ok(()))
    }

    /// GET_STATUS(port)
    pub fn port_status(
        &mut self,
        host: &mut dyn HostContext,
        xfer: &mut ControlTransfer,
        hub_addr: u8,
        port: u8,
    ) -> Poll<Result<PortReport>> {
        let len = ready!(self.request(host, xfer, hub_addr, &SetupPacket::get_port_status(port)))?;
        let buffers = &self.buffers[hub_addr as usize];
        Poll::Ready(PortReport::parse(&buffers.request.0[..len]))
    }

    /// SET_FEATURE(port, feature)
    pub fn set_port_feature(
        &mut self,
        host: &mut dyn HostContext,
        xfer: &mut ControlTransfer,
        hub_addr: u8,
        port: u8,
        feature: u16,
    ) -> Poll<Result<()>> {
        let setup = SetupPacket::set_port_feature(port, feature);
        ready!(self.request(host, xfer, hub_addr, &setup))?;
        Poll::Ready(Ok(()))
    }

    /// CLEAR_FEATURE(port, feature)
    pub fn clear_port_feature(
        &mut self,
        host: &mut dyn HostContext,
        xfer: &mut ControlTransfer,
        hub_addr: u8,
        port: u8,
        feature: u16,
    ) -> Poll<Result<()>> {
        let setup = SetupPacket::clear_port_feature(port, feature);
        ready!(self.request(host, xfer, hub_addr, &setup))?;
        Poll::Ready(Ok(()))
    }

    /// Wait for the next status change
    pub fn rearm(&mut self, host: &mut dyn HostContext, hub_addr: u8) -> Result<()> {
        let dev = hub_addr as usize;
        let pipe = self
            .hubs
            .get(dev)
            .map(|info| info.status_pipe)
            .filter(|pipe| !pipe.is_null())
            .ok_or(Error::InvalidPipe)?;
        if host.pipe_is_stalled(pipe) {
            host.pipe_clear_stall(pipe)?;
        }
        if host.pipe_is_busy(pipe) {
            return Ok(());
        }
        let buffer = self.buffers[dev].status_change.as_mut_ptr();
        // Safety: the status change buffer is static and only used by this pipe.
        unsafe { host.pipe_xfer(pipe, buffer, STATUS_CHANGE_LEN, true) }
    }

    fn open_steps(
        &mut self,
        host: &mut dyn HostContext,
        dev_addr: u8,
        descriptors: &[u8],
    ) -> Poll<Result<usize>> {
        let dev = dev_addr as usize;
        loop {
            match self.open {
                OpenStep::Start => {
                    let itf = InterfaceDescriptor::parse(descriptors)?;
                    if itf.interface_protocol > 1 {
                        return Poll::Ready(Err(Error::UnsupportedHub));
                    }
                    let status = descriptors
                        .get(InterfaceDescriptor::SIZE..)
                        .ok_or(Error::InvalidDescriptor)
                        .and_then(EndpointDescriptor::parse)?;
                    if status.transfer_type() != TransferType::Interrupt {
                        return Poll::Ready(Err(Error::InvalidDescriptor));
                    }
                    let pipe = host.pipe_open(dev_addr, &status, ClassKind::Hub)?;
                    self.hubs[dev] = HubInfo {
                        status_pipe: pipe,
                        port_count: 0,
                    };
                    self.open = OpenStep::Descriptor;
                }
                OpenStep::Descriptor => {
                    let setup = SetupPacket::get_hub_descriptor(9);
                    let mut xfer = core::mem::take(&mut self.xfer);
                    let poll = self.request(host, &mut xfer, dev_addr, &setup);
                    self.xfer = xfer;
                    let len = ready!(poll)?;
                    let desc = &self.buffers[dev].request.0[..len];
                    if len < 3 || desc[1] != descriptor_type::HUB {
                        return Poll::Ready(Err(Error::InvalidDescriptor));
                    }
                    let port_count = desc[2].min(MAX_HUB_PORTS as u8);
                    debug!("HUB {} PORTS {}", dev_addr, port_count);
                    self.hubs[dev].port_count = port_count;
                    self.open = OpenStep::Power { port: 1 };
                }
                OpenStep::Power { port } if port > self.hubs[dev].port_count => {
                    self.rearm(host, dev_addr)?;
                    return Poll::Ready(Ok(CONSUMED));
                }
                OpenStep::Power { port } => {
                    let mut xfer = core::mem::take(&mut self.xfer);
                    let poll = self.set_port_feature(host, &mut xfer, dev_addr, port, port_feature::POWER);
                    self.xfer = xfer;
                    ready!(poll)?;
                    self.open = OpenStep::Power { port: port + 1 };
                }
            }
        }
    }
}

impl ClassDriver for Hub {
    fn open(
        &mut self,
        host: &mut dyn HostContext,
        dev_addr: u8,
        descriptors: &[u8],
    ) -> Poll<Result<usize>> {
        if dev_addr as usize > MAX_DEVICES {
            return Poll::Ready(Err(Error::InvalidParameter));
        }
        let poll = self.open_steps(host, dev_addr, descriptors);
        if let Poll::Ready(result) = &poll {
            self.open = OpenStep::Start;
            if result.is_err() {
                let info = core::mem::replace(&mut self.hubs[dev_addr as usize], HubInfo::new());
                if !info.status_pipe.is_null() {
                    let _ = host.pipe_close(info.status_pipe);
                }
            }
        }
        poll
    }

    fn isr(&mut self, pipe: PipeHandle, result: XferResult, bytes: usize) {
        let hub_addr = pipe.dev_addr();
        let Some(buffers) = self.buffers.get(hub_addr as usize) else {
            return;
        };
        let change = if result == XferResult::Success {
            let bitmap = &buffers.status_change.0[..bytes.min(STATUS_CHANGE_LEN)];
            status_change(bitmap, self.port_count(hub_addr))
        } else {
            StatusChange::None
        };
        trace!("HUB {} CHANGE {:?}", hub_addr, change);
        if self.changes.push_back((hub_addr, change)).is_err() {
            warn!("HUB CHANGE DROPPED {}", hub_addr);
        }
    }

    fn close(&mut self, dev_addr: u8) {
        if let Some(info) = self.hubs.get_mut(dev_addr as usize) {
            *info = HubInfo::new();
        }
    }
}

#[cfg(test)]
mod test {
    use super::{status_change, PortChange, PortReport, PortStatus, StatusChange, STATUS_CHANGE_LEN};
    use crate::{error::Error, pipe::Speed, MAX_HUB_PORTS};

    #[test]
    fn change_bitmap() {
        assert_eq!(status_change(&[0b0000_0000, 0], 4), StatusChange::None);
        assert_eq!(status_change(&[0b0000_0001, 0], 4), StatusChange::Hub);
        assert_eq!(status_change(&[0b0000_0011, 0], 4), StatusChange::Hub);
        assert_eq!(status_change(&[0b0000_0010, 0], 4), StatusChange::Port(1));
        assert_eq!(status_change(&[0b0001_1000, 0], 4), StatusChange::Port(3));
        // Beyond the hub's ports
        assert_eq!(status_change(&[0b0010_0000, 0], 4), StatusChange::None);
        assert_eq!(status_change(&[], 4), StatusChange::None);
    }

    #[test]
    fn eighth_port_is_in_the_second_byte() {
        assert_eq!(STATUS_CHANGE_LEN, 2);
        assert_eq!(status_change(&[0, 0b1], MAX_HUB_PORTS as u8), StatusChange::Port(8));
        assert_eq!(status_change(&[0b1000_0000, 0b1], 8), StatusChange::Port(7));
        // A short transfer never reports port 8
        assert_eq!(status_change(&[0], 8), StatusChange::None);
    }

    #[test]
    fn port_report() {
        let report = PortReport::parse(&[0x13, 0x03, 0x11, 0x00]).unwrap();
        assert!(report.status.contains(PortStatus::CONNECTION | PortStatus::ENABLE));
        assert!(report.status.contains(PortStatus::POWER | PortStatus::LOW_SPEED));
        assert_eq!(report.change, PortChange::CONNECTION | PortChange::RESET);
        assert_eq!(report.speed(), Speed::Low);
        assert!(report.is_reset_complete());

        let report = PortReport::parse(&[0x01, 0x05, 0x10, 0x00]).unwrap();
        assert_eq!(report.speed(), Speed::High);
        assert!(!report.is_reset_complete());

        assert_eq!(PortReport::parse(&[0, 0]), Err(Error::InvalidDescriptor));
    }
}
