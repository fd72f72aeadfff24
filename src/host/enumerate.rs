//! The enumeration task
//!
//! One task walks every new device from its port reset to a mounted
//! configuration. Events arrive through the host's queue, and the task
//! handles them one at a time; a connect that arrives mid-enumeration
//! waits its turn. Each step either finishes, or returns
//! [`Poll::Pending`] and runs again on the next poll.

use core::task::{ready, Poll};

use super::{
    hub::{HubChange, PortChange, PortStatus},
    memory::DmaBuffer,
    Classes, ControlTransfer, DeviceState, HostCallbacks, HostCore, SET_ADDRESS_RECOVERY_MS,
};
use crate::{
    class::ClassKind,
    descriptor::{
        descriptor_type, find_interface, ConfigurationDescriptor, DeviceDescriptor,
        InterfaceDescriptor,
    },
    error::{Error, Result},
    hcd::Hcd,
    osal::{Clock, Deadline},
    pipe::{DeviceRoute, Speed},
    request::{hub_feature, port_feature, SetupPacket},
    ENUM_BUFFER_SIZE, MAX_DEVICES,
};

/// Work for the enumeration task
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EnumEvent {
    DeviceAttached { rhport: u8 },
    DeviceRemoved { rhport: u8 },
    /// A hub reported a change on `port`. Port 0 only re-arms the hub.
    HubPortChange { hub_addr: u8, port: u8 },
    /// A hub's local power or over-current state changed
    HubChange { hub_addr: u8 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Reset {
    First,
    Second,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Step {
    Idle,
    PowerStable,
    RootReset(Reset),
    HubStatus,
    HubClearFeature { feature: u16 },
    HubPortStatus,
    HubClearPortChange { feature: u16 },
    HubClearConnection { connected: bool },
    HubSetReset(Reset),
    HubResetWait(Reset),
    HubResetStatus(Reset),
    HubClearReset(Reset),
    OpenAddress0,
    DeviceDescriptor8,
    SetAddress,
    AddressRecovery,
    DeviceDescriptor,
    ConfigurationHeader,
    Configuration,
    SetConfiguration,
    NextInterface { offset: usize },
    OpenInterface { offset: usize, kind: ClassKind },
}

const fn root_route(rhport: u8) -> DeviceRoute {
    DeviceRoute {
        dev_addr: 0,
        speed: Speed::Full,
        rhport,
        hub_addr: 0,
        hub_port: 0,
    }
}

pub(crate) struct EnumTask {
    step: Step,
    /// Route of the device being enumerated. The address is zero until
    /// SET_ADDRESS succeeds.
    route: DeviceRoute,
    /// The address that SET_ADDRESS assigns
    new_addr: u8,
    addr0_held: bool,
    max_packet_size0: u8,
    descriptor: Option<DeviceDescriptor>,
    configuration: u8,
    config_len: usize,
    xfer: ControlTransfer,
    deadline: Deadline,
    buffer: &'static mut DmaBuffer<ENUM_BUFFER_SIZE>,
}

impl EnumTask {
    pub fn new(buffer: &'static mut DmaBuffer<ENUM_BUFFER_SIZE>) -> Self {
        EnumTask {
            step: Step::Idle,
            route: root_route(0),
            new_addr: 0,
            addr0_held: false,
            max_packet_size0: 8,
            descriptor: None,
            configuration: 1,
            config_len: 0,
            xfer: ControlTransfer::new(),
            deadline: Deadline::new(),
            buffer,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.step == Step::Idle
    }

    /// Run the task until it has to wait, or until there's no more work
    pub fn poll<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        classes: &mut Classes<'_>,
        callbacks: &mut dyn HostCallbacks,
    ) {
        loop {
            if self.step == Step::Idle {
                let Some(event) = core.events.receive() else {
                    return;
                };
                self.start(core, classes, callbacks, event);
                continue;
            }
            match self.step(core, classes, callbacks) {
                Poll::Pending => return,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(err)) => self.fail(core, classes, callbacks, err),
            }
        }
    }

    fn start<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        classes: &mut Classes<'_>,
        callbacks: &mut dyn HostCallbacks,
        event: EnumEvent,
    ) {
        debug!("ENUM EVENT {:?}", event);
        self.new_addr = 0;
        self.descriptor = None;
        self.xfer = ControlTransfer::new();
        self.deadline.clear();
        match event {
            EnumEvent::DeviceAttached { rhport } => {
                self.route = root_route(rhport);
                self.step = Step::PowerStable;
            }
            EnumEvent::DeviceRemoved { rhport } => {
                disconnect(core, classes, callbacks, &root_route(rhport));
            }
            EnumEvent::HubPortChange { hub_addr, port: 0 } => {
                rearm_hub(core, classes, hub_addr);
            }
            EnumEvent::HubPortChange { hub_addr, port } => {
                if self.start_hub(core, hub_addr, port) {
                    self.step = Step::HubPortStatus;
                }
            }
            EnumEvent::HubChange { hub_addr } => {
                if self.start_hub(core, hub_addr, 0) {
                    self.step = Step::HubStatus;
                }
            }
        }
    }

    /// Route requests to `hub_port` on a hub. Returns `false` if the hub
    /// is gone.
    fn start_hub<H: Hcd, K: Clock>(&mut self, core: &HostCore<H, K>, hub_addr: u8, hub_port: u8) -> bool {
        let hub = &core.devices[hub_addr as usize];
        if !hub.is_present() {
            warn!("CHANGE FROM MISSING HUB {}", hub_addr);
            return false;
        }
        self.route = DeviceRoute {
            dev_addr: 0,
            speed: Speed::Full,
            rhport: hub.rhport,
            hub_addr,
            hub_port,
        };
        true
    }

    /// Issue a control request using the enumeration buffer
    fn control<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        dev_addr: u8,
        setup: SetupPacket,
    ) -> Poll<Result<usize>> {
        // Safety: the enumeration buffer is static, owned by this task, and
        // every request here fits in it.
        unsafe {
            self.xfer
                .poll(core, dev_addr, &setup, self.buffer.as_mut_ptr())
        }
    }

    /// Pick the lowest unplugged address for SET_ADDRESS
    fn assign_address<H: Hcd, K: Clock>(&mut self, core: &HostCore<H, K>) -> Result<()> {
        let addr = (1..=MAX_DEVICES)
            .find(|&addr| core.devices[addr].state == DeviceState::Unplugged)
            .ok_or(Error::NoFreeAddress)?;
        self.new_addr = addr as u8;
        self.step = Step::SetAddress;
        Ok(())
    }

    fn step<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        classes: &mut Classes<'_>,
        callbacks: &mut dyn HostCallbacks,
    ) -> Poll<Result<()>> {
        let config = core.config;
        let rhport = self.route.rhport;
        let hub_addr = self.route.hub_addr;
        let hub_port = self.route.hub_port;

        match self.step {
            Step::Idle => {}
            Step::PowerStable => {
                ready!(self.deadline.delay(&core.clock, config.power_stable_delay_ms));
                if !core.hcd.port_connect_status(rhport) {
                    return Poll::Ready(Err(Error::NotConnected));
                }
                core.hcd.port_reset(rhport);
                self.step = Step::RootReset(Reset::First);
            }
            Step::RootReset(reset) => {
                ready!(self.deadline.delay(&core.clock, config.reset_delay_ms));
                if !core.hcd.port_connect_status(rhport) {
                    return Poll::Ready(Err(Error::NotConnected));
                }
                match reset {
                    Reset::First => {
                        self.route.speed = core.hcd.port_speed(rhport);
                        debug!("ROOT PORT {} SPEED {:?}", rhport, self.route.speed);
                        self.step = Step::OpenAddress0;
                    }
                    Reset::Second => self.assign_address(core)?,
                }
            }
            Step::HubStatus => {
                let poll = classes.hub.hub_status(core, &mut self.xfer, hub_addr);
                let change = match ready!(poll) {
                    Ok(change) => change,
                    Err(err) => return Poll::Ready(self.hub_status_failed(core, classes, err)),
                };
                debug!("HUB {} CHANGE {:?}", hub_addr, change);
                if change.contains(HubChange::LOCAL_POWER) {
                    self.step = Step::HubClearFeature {
                        feature: hub_feature::C_LOCAL_POWER,
                    };
                } else if change.contains(HubChange::OVER_CURRENT) {
                    self.step = Step::HubClearFeature {
                        feature: hub_feature::C_OVER_CURRENT,
                    };
                } else {
                    rearm_hub(core, classes, hub_addr);
                    self.step = Step::Idle;
                }
            }
            Step::HubClearFeature { feature } => {
                let poll = classes
                    .hub
                    .clear_hub_feature(core, &mut self.xfer, hub_addr, feature);
                if let Err(err) = ready!(poll) {
                    return Poll::Ready(self.hub_status_failed(core, classes, err));
                }
                rearm_hub(core, classes, hub_addr);
                self.step = Step::Idle;
            }
            Step::HubPortStatus => {
                let report =
                    ready!(classes
                        .hub
                        .port_status(core, &mut self.xfer, hub_addr, hub_port))?;
                if !report.change.contains(PortChange::CONNECTION) {
                    debug!("HUB {} PORT {} CHANGE {:?}", hub_addr, hub_port, report.change);
                    // Acknowledge one change at a time; the hub reports the rest again.
                    let feature = [
                        (PortChange::ENABLE, port_feature::C_ENABLE),
                        (PortChange::SUSPEND, port_feature::C_SUSPEND),
                        (PortChange::OVER_CURRENT, port_feature::C_OVER_CURRENT),
                        (PortChange::RESET, port_feature::C_RESET),
                    ]
                    .into_iter()
                    .find(|(change, _)| report.change.contains(*change));
                    if let Some((_, feature)) = feature {
                        self.step = Step::HubClearPortChange { feature };
                    } else {
                        rearm_hub(core, classes, hub_addr);
                        self.step = Step::Idle;
                    }
                } else {
                    let connected = report.status.contains(PortStatus::CONNECTION);
                    if !connected {
                        disconnect(core, classes, callbacks, &self.route);
                    }
                    self.step = Step::HubClearConnection { connected };
                }
            }
            Step::HubClearPortChange { feature } => {
                ready!(classes
                    .hub
                    .clear_port_feature(core, &mut self.xfer, hub_addr, hub_port, feature))?;
                rearm_hub(core, classes, hub_addr);
                self.step = Step::Idle;
            }
            Step::HubClearConnection { connected } => {
                ready!(classes.hub.clear_port_feature(
                    core,
                    &mut self.xfer,
                    hub_addr,
                    hub_port,
                    port_feature::C_CONNECTION
                ))?;
                if connected {
                    self.step = Step::HubSetReset(Reset::First);
                } else {
                    rearm_hub(core, classes, hub_addr);
                    self.step = Step::Idle;
                }
            }
            Step::HubSetReset(reset) => {
                ready!(classes.hub.set_port_feature(
                    core,
                    &mut self.xfer,
                    hub_addr,
                    hub_port,
                    port_feature::RESET
                ))?;
                self.step = Step::HubResetWait(reset);
            }
            Step::HubResetWait(reset) => {
                ready!(self.deadline.delay(&core.clock, config.reset_delay_ms));
                self.step = Step::HubResetStatus(reset);
            }
            Step::HubResetStatus(reset) => {
                let report =
                    ready!(classes
                        .hub
                        .port_status(core, &mut self.xfer, hub_addr, hub_port))?;
                if !report.is_reset_complete() {
                    warn!("HUB {} PORT {} STATUS {:?}", hub_addr, hub_port, report);
                    return Poll::Ready(Err(Error::UnexpectedPortStatus));
                }
                if reset == Reset::First {
                    self.route.speed = report.speed();
                }
                self.step = Step::HubClearReset(reset);
            }
            Step::HubClearReset(reset) => {
                ready!(classes.hub.clear_port_feature(
                    core,
                    &mut self.xfer,
                    hub_addr,
                    hub_port,
                    port_feature::C_RESET
                ))?;
                match reset {
                    Reset::First => self.step = Step::OpenAddress0,
                    Reset::Second => self.assign_address(core)?,
                }
            }
            Step::OpenAddress0 => {
                if !core.addr0.try_lock() {
                    return Poll::Pending;
                }
                self.addr0_held = true;
                let route = self.route;
                let dev0 = &mut core.devices[0];
                dev0.reset();
                dev0.set_route(&route);
                dev0.state = DeviceState::Addressed;
                core.hcd.control_open(&route, 8)?;
                self.step = Step::DeviceDescriptor8;
            }
            Step::DeviceDescriptor8 => {
                let setup = SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 8);
                let len = ready!(self.control(core, 0, setup))?;
                self.max_packet_size0 =
                    DeviceDescriptor::peek_max_packet_size0(&self.buffer.0[..len])?;
                if hub_addr == 0 {
                    core.hcd.port_reset(rhport);
                    self.step = Step::RootReset(Reset::Second);
                } else {
                    self.step = Step::HubSetReset(Reset::Second);
                }
            }
            Step::SetAddress => {
                let new_addr = self.new_addr;
                ready!(self.control(core, 0, SetupPacket::set_address(new_addr)))?;
                debug!("ADDRESS {}", new_addr);

                self.route.dev_addr = new_addr;
                let dev = &mut core.devices[new_addr as usize];
                dev.reset();
                dev.set_route(&self.route);
                dev.state = DeviceState::Addressed;

                let _ = core.hcd.control_close(0);
                self.release_address0(core);
                core.hcd
                    .control_open(&self.route, self.max_packet_size0 as u16)?;
                self.step = Step::AddressRecovery;
            }
            Step::AddressRecovery => {
                ready!(self.deadline.delay(&core.clock, SET_ADDRESS_RECOVERY_MS));
                self.step = Step::DeviceDescriptor;
            }
            Step::DeviceDescriptor => {
                let dev_addr = self.route.dev_addr;
                let setup = SetupPacket::get_descriptor(
                    descriptor_type::DEVICE,
                    0,
                    DeviceDescriptor::SIZE as u16,
                );
                let len = ready!(self.control(core, dev_addr, setup))?;
                let desc = DeviceDescriptor::parse(&self.buffer.0[..len])?;
                let dev = &mut core.devices[dev_addr as usize];
                dev.vendor_id = desc.vendor_id;
                dev.product_id = desc.product_id;
                self.descriptor = Some(desc);
                self.configuration = callbacks.device_attached(dev_addr, &desc);
                debug!(
                    "DEVICE {} {:04x}:{:04x} CONFIG {}",
                    dev_addr,
                    desc.vendor_id,
                    desc.product_id,
                    self.configuration
                );
                self.step = Step::ConfigurationHeader;
            }
            Step::ConfigurationHeader => {
                let dev_addr = self.route.dev_addr;
                let setup = SetupPacket::get_descriptor(
                    descriptor_type::CONFIGURATION,
                    self.configuration.saturating_sub(1),
                    ConfigurationDescriptor::SIZE as u16,
                );
                let len = ready!(self.control(core, dev_addr, setup))?;
                let header = ConfigurationDescriptor::parse(&self.buffer.0[..len])?;
                let total = header.total_length as usize;
                if total > ENUM_BUFFER_SIZE {
                    warn!("CONFIGURATION TOO LARGE {}", total);
                    return Poll::Ready(Err(Error::DescriptorTooLarge));
                }
                self.config_len = total;
                self.step = Step::Configuration;
            }
            Step::Configuration => {
                let dev_addr = self.route.dev_addr;
                let setup = SetupPacket::get_descriptor(
                    descriptor_type::CONFIGURATION,
                    self.configuration.saturating_sub(1),
                    self.config_len as u16,
                );
                let len = ready!(self.control(core, dev_addr, setup))?;
                ConfigurationDescriptor::parse(&self.buffer.0[..len])?;
                self.config_len = len;
                self.step = Step::SetConfiguration;
            }
            Step::SetConfiguration => {
                let dev_addr = self.route.dev_addr;
                let setup = SetupPacket::set_configuration(self.configuration);
                ready!(self.control(core, dev_addr, setup))?;
                core.devices[dev_addr as usize].state = DeviceState::Configured;
                self.step = Step::NextInterface {
                    offset: self.buffer.0[0] as usize,
                };
            }
            Step::NextInterface { offset } => {
                let dev_addr = self.route.dev_addr;
                let config = &self.buffer.0[..self.config_len];
                let Some(at) = find_interface(config, offset)? else {
                    debug!("MOUNTED {}", dev_addr);
                    callbacks.mount_succeeded(dev_addr);
                    if hub_addr != 0 {
                        rearm_hub(core, classes, hub_addr);
                    }
                    self.step = Step::Idle;
                    return Poll::Ready(Ok(()));
                };
                let itf = InterfaceDescriptor::parse(&config[at..])?;
                let next = at + config[at] as usize;
                self.step = match ClassKind::from_class_code(itf.interface_class) {
                    Some(ClassKind::Hub) if hub_addr != 0 => {
                        warn!("HUB BEHIND HUB {}", dev_addr);
                        Step::NextInterface { offset: next }
                    }
                    Some(kind) if classes.is_registered(kind) => Step::OpenInterface { offset: at, kind },
                    _ => {
                        debug!("SKIP INTERFACE {} CLASS {}", itf.interface_number, itf.interface_class);
                        Step::NextInterface { offset: next }
                    }
                };
            }
            Step::OpenInterface { offset, kind } => {
                let dev_addr = self.route.dev_addr;
                let config = &self.buffer.0[..self.config_len];
                let itf_len = config[offset] as usize;
                let Some(driver) = classes.get(kind) else {
                    self.step = Step::NextInterface {
                        offset: offset + itf_len,
                    };
                    return Poll::Ready(Ok(()));
                };
                let next = match ready!(driver.open(core, dev_addr, &config[offset..])) {
                    Ok(consumed) => {
                        debug!("OPENED {:?} ON {}", kind, dev_addr);
                        core.devices[dev_addr as usize].classes |= kind.into();
                        offset + consumed.max(itf_len)
                    }
                    Err(_err) => {
                        warn!("OPEN {:?} ON {} FAILED {:?}", kind, dev_addr, _err);
                        offset + itf_len
                    }
                };
                self.step = Step::NextInterface { offset: next };
            }
        }
        Poll::Ready(Ok(()))
    }

    fn release_address0<H: Hcd, K: Clock>(&mut self, core: &mut HostCore<H, K>) {
        if self.addr0_held {
            core.devices[0].reset();
            core.addr0.release();
            self.addr0_held = false;
        }
    }

    /// A hub's own status couldn't be serviced. No device was involved, so
    /// nothing is reported; the hub is polled again.
    fn hub_status_failed<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        classes: &mut Classes<'_>,
        _err: Error,
    ) -> Result<()> {
        warn!("HUB {} STATUS FAILED {:?}", self.route.hub_addr, _err);
        rearm_hub(core, classes, self.route.hub_addr);
        self.xfer = ControlTransfer::new();
        self.step = Step::Idle;
        Ok(())
    }

    /// Abandon the device being enumerated
    fn fail<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        classes: &mut Classes<'_>,
        callbacks: &mut dyn HostCallbacks,
        err: Error,
    ) {
        warn!("ENUMERATION FAILED {:?}", err);
        callbacks.mount_failed(err, self.descriptor.as_ref());
        let dev_addr = self.route.dev_addr;
        if dev_addr != 0 {
            close_device(core, classes, dev_addr);
        } else if self.addr0_held {
            let _ = core.hcd.control_close(0);
            self.release_address0(core);
        }
        if self.route.hub_addr != 0 {
            rearm_hub(core, classes, self.route.hub_addr);
        }
        self.xfer = ControlTransfer::new();
        self.deadline.clear();
        self.step = Step::Idle;
    }
}

fn rearm_hub<H: Hcd, K: Clock>(core: &mut HostCore<H, K>, classes: &mut Classes<'_>, hub_addr: u8) {
    if !core.devices[hub_addr as usize].is_present() {
        return;
    }
    if let Err(_err) = classes.hub.rearm(core, hub_addr) {
        warn!("HUB {} REARM FAILED {:?}", hub_addr, _err);
    }
}

/// Unmount a device's classes, and start reclaiming its pipes
fn close_device<H: Hcd, K: Clock>(core: &mut HostCore<H, K>, classes: &mut Classes<'_>, dev_addr: u8) {
    let dev = &mut core.devices[dev_addr as usize];
    for kind in dev.classes.kinds() {
        if let Some(driver) = classes.get(kind) {
            driver.close(dev_addr);
        }
    }
    dev.classes = Default::default();
    dev.state = DeviceState::Removing;
    if !core.hcd.device_close(dev_addr) {
        core.devices[dev_addr as usize].reset();
    }
    debug!("CLOSED {}", dev_addr);
}

/// Remove every device behind `route`
fn disconnect<H: Hcd, K: Clock>(
    core: &mut HostCore<H, K>,
    classes: &mut Classes<'_>,
    callbacks: &mut dyn HostCallbacks,
    route: &DeviceRoute,
) {
    for dev_addr in 1..=MAX_DEVICES as u8 {
        let dev = &core.devices[dev_addr as usize];
        if dev.is_present() && dev.is_behind(route) {
            debug!("REMOVED {}", dev_addr);
            close_device(core, classes, dev_addr);
            callbacks.device_removed(dev_addr);
        }
    }
}
