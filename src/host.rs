//! The USB host stack
//!
//! [`UsbHost`] ties a host controller driver to the device table, the
//! class drivers, and the enumeration task. Call [`isr`](UsbHost::isr) from
//! the controller's interrupt handler, and [`poll`](UsbHost::poll) from
//! thread mode. Use [`HostAdapter`](crate::HostAdapter) to share one host
//! between the two.
//!
//! ```no_run
//! use usbh_core::{ClassKind, HostMemory, UsbHost};
//! # use usbh_core::{Clock, ClassDriver, Hcd};
//! # fn example<H: Hcd, K: Clock>(hcd: H, clock: K, hid: &mut dyn ClassDriver) {
//!
//! static HOST_MEMORY: HostMemory = HostMemory::new();
//!
//! let mut host = UsbHost::new(hcd, clock, &HOST_MEMORY, ());
//! host.register_class(ClassKind::Hid, hid).unwrap();
//! host.init().unwrap();
//! loop {
//!     host.poll();
//!     # break;
//! }
//! # }
//! ```

mod control;
mod device;
mod enumerate;
mod hub;
mod memory;

pub use control::ControlTransfer;
pub use device::DeviceState;
pub use hub::{HubChange, PortChange, PortReport, PortStatus};
pub use memory::HostMemory;

use core::task::Poll;

use crate::{
    class::{ClassDriver, ClassKind, ClassSet},
    descriptor::{DeviceDescriptor, EndpointDescriptor},
    error::{Error, Result, XferResult},
    hcd::{Hcd, HcdEvent},
    osal::{Clock, EventQueue, Mutex},
    pipe::{DeviceRoute, PipeHandle, TransferType},
    request::SetupPacket,
    ENUM_QUEUE_DEPTH, MAX_DEVICES,
};
use device::Device;
use enumerate::{EnumEvent, EnumTask};
use hub::{Hub, StatusChange};

/// Wait after a root port connects, before the first reset
pub const POWER_STABLE_DELAY_MS: u32 = 500;
/// Length of a port reset
pub const RESET_DELAY_MS: u32 = 200;
/// Bound on every control transfer wait
pub const CONTROL_TIMEOUT_MS: u32 = 3000;
/// Recovery interval after SET_ADDRESS
const SET_ADDRESS_RECOVERY_MS: u32 = 2;

/// Host stack timing
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HostConfig {
    pub power_stable_delay_ms: u32,
    pub reset_delay_ms: u32,
    pub control_timeout_ms: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            power_stable_delay_ms: POWER_STABLE_DELAY_MS,
            reset_delay_ms: RESET_DELAY_MS,
            control_timeout_ms: CONTROL_TIMEOUT_MS,
        }
    }
}

/// Application hooks into enumeration
///
/// Every method has a default, so implement only what you need. `()`
/// takes every default.
pub trait HostCallbacks {
    /// A device has an address. Return the configuration to select.
    fn device_attached(&mut self, _dev_addr: u8, _descriptor: &DeviceDescriptor) -> u8 {
        1
    }
    /// The device is configured, and its classes are open
    fn mount_succeeded(&mut self, _dev_addr: u8) {}
    /// Enumeration gave up on a device
    ///
    /// The descriptor is available if enumeration got far enough to read it.
    fn mount_failed(&mut self, _error: Error, _descriptor: Option<&DeviceDescriptor>) {}
    /// A mounted device was unplugged
    fn device_removed(&mut self, _dev_addr: u8) {}
}

impl HostCallbacks for () {}

/// What a class driver can do with the host
pub trait HostContext {
    fn now_ms(&self) -> u32;

    /// Routing for an attached device
    fn route(&self, dev_addr: u8) -> Option<DeviceRoute>;

    /// Poll a control transfer on the device's default pipe
    ///
    /// Pass the same request and buffer on every poll, until the transfer is
    /// ready. Resolves to the number of bytes moved in the data stage.
    ///
    /// # Safety
    ///
    /// `data` must be valid for `setup.length()` bytes of reads and writes
    /// until the transfer is ready.
    unsafe fn control_xfer(
        &mut self,
        xfer: &mut ControlTransfer,
        dev_addr: u8,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Poll<Result<usize>>;

    fn pipe_open(
        &mut self,
        dev_addr: u8,
        endpoint: &EndpointDescriptor,
        class: ClassKind,
    ) -> Result<PipeHandle>;

    /// # Safety
    ///
    /// See [`Hcd::pipe_queue_xfer`].
    unsafe fn pipe_queue_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize) -> Result<()>;

    /// # Safety
    ///
    /// See [`Hcd::pipe_xfer`].
    unsafe fn pipe_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize, ioc: bool) -> Result<()>;

    fn pipe_close(&mut self, pipe: PipeHandle) -> Result<()>;
    fn pipe_is_busy(&self, pipe: PipeHandle) -> bool;
    fn pipe_is_stalled(&self, pipe: PipeHandle) -> bool;
    fn pipe_clear_stall(&mut self, pipe: PipeHandle) -> Result<()>;
}

/// Controller, device table, and the enumeration queue
pub(crate) struct HostCore<H, K> {
    hcd: H,
    clock: K,
    config: HostConfig,
    devices: [Device; MAX_DEVICES + 1],
    events: EventQueue<EnumEvent, ENUM_QUEUE_DEPTH>,
    /// Held while a device answers at address 0
    addr0: Mutex,
}

impl<H: Hcd, K: Clock> HostContext for HostCore<H, K> {
    fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    fn route(&self, dev_addr: u8) -> Option<DeviceRoute> {
        self.devices
            .get(dev_addr as usize)
            .filter(|dev| dev.is_present())
            .map(|dev| dev.route(dev_addr))
    }

    unsafe fn control_xfer(
        &mut self,
        xfer: &mut ControlTransfer,
        dev_addr: u8,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Poll<Result<usize>> {
        xfer.poll(self, dev_addr, setup, data)
    }

    fn pipe_open(
        &mut self,
        dev_addr: u8,
        endpoint: &EndpointDescriptor,
        class: ClassKind,
    ) -> Result<PipeHandle> {
        if dev_addr == 0 {
            return Err(Error::InvalidParameter);
        }
        let route = self.route(dev_addr).ok_or(Error::InvalidParameter)?;
        self.hcd.pipe_open(&route, endpoint, class)
    }

    unsafe fn pipe_queue_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize) -> Result<()> {
        self.hcd.pipe_queue_xfer(pipe, buffer, len)
    }

    unsafe fn pipe_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize, ioc: bool) -> Result<()> {
        self.hcd.pipe_xfer(pipe, buffer, len, ioc)
    }

    fn pipe_close(&mut self, pipe: PipeHandle) -> Result<()> {
        self.hcd.pipe_close(pipe)
    }

    fn pipe_is_busy(&self, pipe: PipeHandle) -> bool {
        self.hcd.pipe_is_busy(pipe)
    }

    fn pipe_is_stalled(&self, pipe: PipeHandle) -> bool {
        self.hcd.pipe_is_stalled(pipe)
    }

    fn pipe_clear_stall(&mut self, pipe: PipeHandle) -> Result<()> {
        self.hcd.pipe_clear_stall(pipe)
    }
}

/// The class driver table
///
/// The hub driver is built in, and always registered.
pub(crate) struct Classes<'a> {
    hub: Hub,
    drivers: [Option<&'a mut dyn ClassDriver>; ClassKind::COUNT],
}

impl<'a> Classes<'a> {
    fn is_registered(&self, kind: ClassKind) -> bool {
        kind == ClassKind::Hub || self.drivers[kind.index()].is_some()
    }

    fn get(&mut self, kind: ClassKind) -> Option<&mut (dyn ClassDriver + 'a)> {
        if kind == ClassKind::Hub {
            Some(&mut self.hub)
        } else {
            self.drivers[kind.index()].as_deref_mut()
        }
    }

    fn init(&mut self) {
        self.hub.init();
        for driver in self.drivers.iter_mut().flatten() {
            driver.init();
        }
    }
}

/// A USB host
///
/// `H` is the host controller driver, and `K` the millisecond clock. `C`
/// receives enumeration callbacks.
pub struct UsbHost<'a, H, K, C = ()> {
    core: HostCore<H, K>,
    classes: Classes<'a>,
    enumeration: EnumTask,
    callbacks: C,
}

impl<'a, H: Hcd, K: Clock, C: HostCallbacks> UsbHost<'a, H, K, C> {
    /// Create a host with the default timing
    ///
    /// # Panics
    ///
    /// Panics if `memory` is already in use by another host.
    pub fn new(hcd: H, clock: K, memory: &'static HostMemory, callbacks: C) -> Self {
        Self::with_config(hcd, clock, memory, callbacks, HostConfig::default())
    }

    /// Create a host with custom timing
    ///
    /// # Panics
    ///
    /// Panics if `memory` is already in use by another host.
    pub fn with_config(
        hcd: H,
        clock: K,
        memory: &'static HostMemory,
        callbacks: C,
        config: HostConfig,
    ) -> Self {
        let buffers = memory.take().expect("Host memory already taken");
        const DEVICE: Device = Device::new();
        UsbHost {
            core: HostCore {
                hcd,
                clock,
                config,
                devices: [DEVICE; MAX_DEVICES + 1],
                events: EventQueue::new(),
                addr0: Mutex::new(),
            },
            classes: Classes {
                hub: Hub::new(buffers.hubs),
                drivers: core::array::from_fn(|_| None),
            },
            enumeration: EnumTask::new(buffers.enumeration),
            callbacks,
        }
    }

    /// Register the driver for a class
    ///
    /// The hub class is built in, and can't be replaced.
    pub fn register_class(&mut self, kind: ClassKind, driver: &'a mut dyn ClassDriver) -> Result<()> {
        if kind == ClassKind::Hub {
            return Err(Error::InvalidParameter);
        }
        self.classes.drivers[kind.index()] = Some(driver);
        Ok(())
    }

    /// Reset the device table, initialize the class drivers, and start the
    /// controller
    pub fn init(&mut self) -> Result<()> {
        for dev in self.core.devices.iter_mut() {
            dev.reset();
        }
        self.core.addr0.reset();
        self.classes.init();
        self.core.hcd.init()?;
        debug!("HOST INITIALIZED");
        Ok(())
    }

    /// Service the controller interrupt
    ///
    /// Control completions wake the waiting transfer. Other completions go
    /// to the class driver that opened the pipe. Port changes wait for the
    /// enumeration task.
    pub fn isr(&mut self) {
        let HostCore {
            hcd,
            devices,
            events,
            ..
        } = &mut self.core;
        let classes = &mut self.classes;
        hcd.isr(&mut |event| dispatch(devices, events, classes, event));
    }

    /// Run the enumeration task until it waits
    pub fn poll(&mut self) {
        self.enumeration
            .poll(&mut self.core, &mut self.classes, &mut self.callbacks);
    }

    /// `true` if the enumeration task has no device in progress
    pub fn is_idle(&self) -> bool {
        self.enumeration.is_idle() && self.core.events.is_empty()
    }

    fn device(&self, dev_addr: u8) -> Result<&Device> {
        match dev_addr as usize {
            addr @ 1..=MAX_DEVICES => Ok(&self.core.devices[addr]),
            _ => Err(Error::InvalidParameter),
        }
    }

    pub fn device_get_state(&self, dev_addr: u8) -> Result<DeviceState> {
        self.device(dev_addr).map(|dev| dev.state)
    }

    pub fn device_mounted_classes(&self, dev_addr: u8) -> Result<ClassSet> {
        self.device(dev_addr).map(|dev| dev.classes)
    }

    /// The vendor and product IDs of an attached device
    pub fn device_ids(&self, dev_addr: u8) -> Result<(u16, u16)> {
        let dev = self.device(dev_addr)?;
        if dev.is_present() {
            Ok((dev.vendor_id, dev.product_id))
        } else {
            Err(Error::InvalidParameter)
        }
    }

    /// Access the host on behalf of a class driver
    pub fn context(&mut self) -> &mut dyn HostContext {
        &mut self.core
    }

    pub fn callbacks(&mut self) -> &mut C {
        &mut self.callbacks
    }
}

fn queue(events: &mut EventQueue<EnumEvent, ENUM_QUEUE_DEPTH>, event: EnumEvent) {
    if events.send(event).is_err() {
        warn!("ENUM QUEUE FULL, DROPPED {:?}", event);
    }
}

fn dispatch(
    devices: &mut [Device; MAX_DEVICES + 1],
    events: &mut EventQueue<EnumEvent, ENUM_QUEUE_DEPTH>,
    classes: &mut Classes<'_>,
    event: HcdEvent,
) {
    match event {
        HcdEvent::DeviceAttached { rhport } => queue(events, EnumEvent::DeviceAttached { rhport }),
        HcdEvent::DeviceRemoved { rhport } => queue(events, EnumEvent::DeviceRemoved { rhport }),
        HcdEvent::XferComplete {
            pipe,
            class,
            result,
            bytes,
        } => {
            let Some(dev) = devices.get_mut(pipe.dev_addr() as usize) else {
                return;
            };
            if pipe.xfer_type() == TransferType::Control {
                dev.control.result = result;
                dev.control.bytes = bytes;
                dev.control.semaphore.post();
            } else if !dev.is_present() {
                warn!("STALE COMPLETION {:?}", pipe);
            } else if let Some(kind) = class {
                match classes.get(kind) {
                    Some(driver) => driver.isr(pipe, result, bytes),
                    None => {
                        warn!("NO DRIVER FOR {:?}", pipe);
                    }
                }
                while let Some((hub_addr, change)) = classes.hub.take_change() {
                    let event = match change {
                        StatusChange::None => EnumEvent::HubPortChange { hub_addr, port: 0 },
                        StatusChange::Hub => EnumEvent::HubChange { hub_addr },
                        StatusChange::Port(port) => EnumEvent::HubPortChange { hub_addr, port },
                    };
                    queue(events, event);
                }
            }
            if result != XferResult::Success {
                debug!("PIPE {:?} RESULT {:?}", pipe, result);
            }
        }
        HcdEvent::DeviceReclaimed { dev_addr } => {
            if let Some(dev) = devices.get_mut(dev_addr as usize) {
                if dev.state == DeviceState::Removing {
                    debug!("RECLAIMED {}", dev_addr);
                    dev.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DeviceState, HostCallbacks, HostContext, HostMemory, UsbHost};
    use crate::{
        class::{ClassDriver, ClassKind, ClassSet},
        descriptor::{
            test::{DEVICE, KEYBOARD_CONFIG},
            DeviceDescriptor, EndpointDescriptor,
        },
        error::{Error, Result, XferResult},
        hcd::{Hcd, HcdEvent},
        osal::test::ManualClock,
        pipe::{DeviceRoute, PipeHandle, Speed, TransferType},
        request::{hub_feature, port_feature, SetupPacket},
        MAX_DEVICES,
    };
    use core::task::Poll;
    use std::{boxed::Box, collections::VecDeque, vec::Vec};

    const HUB_CONFIG: [u8; 25] = [
        9, 2, 25, 0, 1, 1, 0, 0xE0, 0, // configuration
        9, 4, 0, 0, 1, 9, 0, 0, 0, // interface: hub
        7, 5, 0x81, 3, 1, 0, 12, // status change endpoint
    ];

    const HUB_DESCRIPTOR: [u8; 9] = [9, 0x29, 4, 0, 0, 50, 0, 0, 0xFF];

    /// A controller with one scripted device behind the root port
    #[derive(Default)]
    struct MockHcd {
        connected: bool,
        speed: Option<Speed>,
        resets: usize,
        config: Vec<u8>,
        /// GET_STATUS responses, oldest first. The last one repeats.
        port_reports: VecDeque<[u8; 4]>,
        requests: Vec<(u8, SetupPacket)>,
        control_opens: Vec<DeviceRoute>,
        control_closes: Vec<u8>,
        pipes: Vec<(DeviceRoute, u8)>,
        xfers: Vec<(PipeHandle, *mut u8, usize)>,
        device_closes: Vec<u8>,
        pending: Vec<HcdEvent>,
        /// Never finish control transfers
        silent: bool,
        /// Ports in the hub descriptor, 4 if unset
        hub_ports: Option<u8>,
        /// GET_STATUS(hub) response
        hub_status: [u8; 4],
    }

    impl MockHcd {
        fn with_config(config: &[u8]) -> Self {
            MockHcd {
                connected: true,
                config: config.to_vec(),
                ..Default::default()
            }
        }

        fn response(&mut self, setup: &SetupPacket) -> Vec<u8> {
            match (setup.request_type(), setup.request(), setup.value() >> 8) {
                (0x80, 6, 1) => DEVICE.to_vec(),
                (0x80, 6, 2) => self.config.clone(),
                (0xA0, 6, 0x29) => {
                    let mut desc = HUB_DESCRIPTOR;
                    desc[2] = self.hub_ports.unwrap_or(HUB_DESCRIPTOR[2]);
                    desc.to_vec()
                }
                (0xA0, 0, _) => self.hub_status.to_vec(),
                (0xA3, 0, _) => {
                    let report = if self.port_reports.len() > 1 {
                        self.port_reports.pop_front()
                    } else {
                        self.port_reports.front().copied()
                    };
                    report.unwrap_or_default().to_vec()
                }
                _ => Vec::new(),
            }
        }

        /// Finish the last transfer on `pipe`, writing `data` into its buffer
        fn complete(&mut self, pipe: PipeHandle, class: ClassKind, data: &[u8]) {
            let &(_, buffer, len) = self.xfers.iter().rev().find(|(p, ..)| *p == pipe).unwrap();
            let bytes = data.len().min(len);
            unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buffer, bytes) };
            self.pending.push(HcdEvent::XferComplete {
                pipe,
                class: Some(class),
                result: XferResult::Success,
                bytes,
            });
        }

        fn requests_to(&self, dev_addr: u8) -> Vec<SetupPacket> {
            self.requests
                .iter()
                .filter(|(addr, _)| *addr == dev_addr)
                .map(|(_, setup)| *setup)
                .collect()
        }
    }

    impl Hcd for MockHcd {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }
        fn port_connect_status(&self, _: u8) -> bool {
            self.connected
        }
        fn port_reset(&mut self, _: u8) {
            self.resets += 1;
        }
        fn port_speed(&self, _: u8) -> Speed {
            self.speed.unwrap_or(Speed::High)
        }
        fn control_open(&mut self, route: &DeviceRoute, _: u16) -> Result<()> {
            self.control_opens.push(*route);
            Ok(())
        }
        unsafe fn control_xfer(&mut self, dev_addr: u8, setup: &SetupPacket, data: *mut u8) -> Result<()> {
            self.requests.push((dev_addr, *setup));
            let response = self.response(setup);
            let bytes = response.len().min(setup.length() as usize);
            core::ptr::copy_nonoverlapping(response.as_ptr(), data, bytes);
            if self.silent {
                return Ok(());
            }
            self.pending.push(HcdEvent::XferComplete {
                pipe: PipeHandle {
                    dev_addr,
                    xfer_type: TransferType::Control,
                    index: 0,
                    generation: 0,
                },
                class: None,
                result: XferResult::Success,
                bytes,
            });
            Ok(())
        }
        fn control_close(&mut self, dev_addr: u8) -> Result<()> {
            self.control_closes.push(dev_addr);
            Ok(())
        }
        fn pipe_open(
            &mut self,
            route: &DeviceRoute,
            endpoint: &EndpointDescriptor,
            _: ClassKind,
        ) -> Result<PipeHandle> {
            let index = self
                .pipes
                .iter()
                .filter(|(r, _)| r.dev_addr == route.dev_addr)
                .count() as u8;
            self.pipes.push((*route, u8::from(endpoint.address)));
            Ok(PipeHandle {
                dev_addr: route.dev_addr,
                xfer_type: endpoint.transfer_type(),
                index,
                generation: 0,
            })
        }
        unsafe fn pipe_queue_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize) -> Result<()> {
            self.xfers.push((pipe, buffer, len));
            Ok(())
        }
        unsafe fn pipe_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize, _: bool) -> Result<()> {
            self.xfers.push((pipe, buffer, len));
            Ok(())
        }
        fn pipe_close(&mut self, _: PipeHandle) -> Result<()> {
            Ok(())
        }
        fn pipe_is_busy(&self, _: PipeHandle) -> bool {
            false
        }
        fn pipe_is_stalled(&self, _: PipeHandle) -> bool {
            false
        }
        fn pipe_clear_stall(&mut self, _: PipeHandle) -> Result<()> {
            Ok(())
        }
        fn device_close(&mut self, dev_addr: u8) -> bool {
            self.device_closes.push(dev_addr);
            self.pending.push(HcdEvent::DeviceReclaimed { dev_addr });
            true
        }
        fn isr(&mut self, events: &mut dyn FnMut(HcdEvent)) {
            for event in self.pending.drain(..) {
                events(event);
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        attached: Vec<u8>,
        mounted: Vec<u8>,
        failed: Vec<(Error, Option<u16>)>,
        removed: Vec<u8>,
    }

    impl HostCallbacks for Recorder {
        fn device_attached(&mut self, dev_addr: u8, _: &DeviceDescriptor) -> u8 {
            self.attached.push(dev_addr);
            1
        }
        fn mount_succeeded(&mut self, dev_addr: u8) {
            self.mounted.push(dev_addr);
        }
        fn mount_failed(&mut self, error: Error, descriptor: Option<&DeviceDescriptor>) {
            self.failed.push((error, descriptor.map(|desc| desc.vendor_id)));
        }
        fn device_removed(&mut self, dev_addr: u8) {
            self.removed.push(dev_addr);
        }
    }

    /// Opens the interrupt IN endpoint of a boot keyboard
    #[derive(Default)]
    struct MockHid {
        initialized: bool,
        opened: Vec<PipeHandle>,
        closed: Vec<u8>,
        reports: usize,
    }

    impl ClassDriver for MockHid {
        fn init(&mut self) {
            self.initialized = true;
        }
        fn open(
            &mut self,
            host: &mut dyn HostContext,
            dev_addr: u8,
            descriptors: &[u8],
        ) -> Poll<Result<usize>> {
            let endpoint = EndpointDescriptor::parse(&descriptors[18..])?;
            let pipe = host.pipe_open(dev_addr, &endpoint, ClassKind::Hid)?;
            self.opened.push(pipe);
            Poll::Ready(Ok(25))
        }
        fn isr(&mut self, _: PipeHandle, _: XferResult, _: usize) {
            self.reports += 1;
        }
        fn close(&mut self, dev_addr: u8) {
            self.closed.push(dev_addr);
        }
    }

    type TestHost<'a> = UsbHost<'a, MockHcd, &'a ManualClock, Recorder>;

    fn host<'a>(hcd: MockHcd, clock: &'a ManualClock) -> TestHost<'a> {
        let memory: &'static HostMemory = Box::leak(Box::new(HostMemory::new()));
        let mut host = UsbHost::new(hcd, clock, memory, Recorder::default());
        host.init().unwrap();
        host
    }

    /// Run the interrupt handler and the task for `ms` milliseconds
    fn run(host: &mut TestHost<'_>, clock: &ManualClock, ms: u32) {
        for _ in 0..ms {
            host.isr();
            host.poll();
            clock.advance(1);
        }
    }

    fn attach(host: &mut TestHost<'_>, clock: &ManualClock) {
        host.core.hcd.pending.push(HcdEvent::DeviceAttached { rhport: 0 });
        run(host, clock, 2000);
    }

    fn place(host: &mut TestHost<'_>, dev_addr: u8, hub_addr: u8, hub_port: u8, classes: ClassSet) {
        let dev = &mut host.core.devices[dev_addr as usize];
        dev.state = DeviceState::Configured;
        dev.hub_addr = hub_addr;
        dev.hub_port = hub_port;
        dev.classes = classes;
    }

    #[test]
    fn keyboard_enumeration() {
        let clock = ManualClock::default();
        let mut hid = MockHid::default();
        let mut host = host(MockHcd::with_config(&KEYBOARD_CONFIG), &clock);
        host.register_class(ClassKind::Hid, &mut hid).unwrap();
        host.init().unwrap();

        attach(&mut host, &clock);

        assert!(host.is_idle());
        assert_eq!(host.device_get_state(1), Ok(DeviceState::Configured));
        assert_eq!(host.device_mounted_classes(1), Ok(ClassSet::HID));
        assert_eq!(host.device_ids(1), Ok((0x1234, 0x5678)));
        assert_eq!(host.callbacks().attached, [1]);
        assert_eq!(host.callbacks().mounted, [1]);
        assert!(host.callbacks().failed.is_empty());

        let hcd = &host.core.hcd;
        assert_eq!(hcd.resets, 2);
        assert_eq!(
            hcd.requests_to(0),
            [
                SetupPacket::get_descriptor(1, 0, 8),
                SetupPacket::set_address(1)
            ]
        );
        assert_eq!(
            hcd.requests_to(1),
            [
                SetupPacket::get_descriptor(1, 0, 18),
                SetupPacket::get_descriptor(2, 0, 9),
                SetupPacket::get_descriptor(2, 0, 34),
                SetupPacket::set_configuration(1),
            ]
        );
        assert_eq!(hcd.control_opens.len(), 2);
        assert_eq!(hcd.control_opens[0].dev_addr, 0);
        assert_eq!(hcd.control_opens[1].dev_addr, 1);
        assert_eq!(hcd.control_opens[1].speed, Speed::High);
        assert_eq!(hcd.control_closes, [0]);
        assert!(!host.core.addr0.is_locked());
        assert_eq!(host.core.devices[0].state, DeviceState::Unplugged);

        // Interrupt reports route to the driver
        host.core.hcd.pending.push(HcdEvent::XferComplete {
            pipe: PipeHandle {
                dev_addr: 1,
                xfer_type: TransferType::Interrupt,
                index: 0,
                generation: 0,
            },
            class: Some(ClassKind::Hid),
            result: XferResult::Success,
            bytes: 8,
        });
        host.isr();

        drop(host);
        assert!(hid.initialized);
        assert_eq!(hid.opened.len(), 1);
        assert_eq!(hid.opened[0].dev_addr(), 1);
        assert_eq!(hid.opened[0].xfer_type(), TransferType::Interrupt);
        assert_eq!(hid.reports, 1);
    }

    #[test]
    fn unregistered_class_is_skipped() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::with_config(&KEYBOARD_CONFIG), &clock);
        attach(&mut host, &clock);
        assert_eq!(host.device_get_state(1), Ok(DeviceState::Configured));
        assert_eq!(host.device_mounted_classes(1), Ok(ClassSet::empty()));
        assert_eq!(host.callbacks().mounted, [1]);
        assert!(host.core.hcd.pipes.is_empty());
    }

    #[test]
    fn configuration_too_large() {
        let clock = ManualClock::default();
        let config = [9, 2, 0x2C, 0x01, 1, 1, 0, 0xA0, 50];
        let mut host = host(MockHcd::with_config(&config), &clock);
        attach(&mut host, &clock);

        assert_eq!(
            host.callbacks().failed,
            [(Error::DescriptorTooLarge, Some(0x1234))]
        );
        assert!(host.callbacks().mounted.is_empty());
        // Closed, and reclaimed
        assert_eq!(host.core.hcd.device_closes, [1]);
        assert_eq!(host.device_get_state(1), Ok(DeviceState::Unplugged));
        // Never asked for more than the header
        assert!(!host.core.hcd.requests_to(1).contains(&SetupPacket::get_descriptor(2, 0, 300)));
    }

    #[test]
    fn no_free_address() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::with_config(&KEYBOARD_CONFIG), &clock);
        for addr in 1..=MAX_DEVICES as u8 {
            place(&mut host, addr, 0, 0, ClassSet::empty());
        }
        attach(&mut host, &clock);

        assert_eq!(host.callbacks().failed, [(Error::NoFreeAddress, None)]);
        assert_eq!(host.core.hcd.control_closes, [0]);
        assert_eq!(host.core.devices[0].state, DeviceState::Unplugged);
        assert!(!host.core.addr0.is_locked());
        assert!(host.core.hcd.device_closes.is_empty());
        assert!(host.is_idle());
    }

    #[test]
    fn not_connected_after_power_up() {
        let clock = ManualClock::default();
        let mut hcd = MockHcd::with_config(&KEYBOARD_CONFIG);
        hcd.connected = false;
        let mut host = host(hcd, &clock);
        attach(&mut host, &clock);
        assert_eq!(host.callbacks().failed, [(Error::NotConnected, None)]);
        assert!(host.core.hcd.requests.is_empty());
        assert!(host.is_idle());
    }

    #[test]
    fn invalid_addresses() {
        let clock = ManualClock::default();
        let host = host(MockHcd::default(), &clock);
        assert_eq!(
            host.device_get_state(MAX_DEVICES as u8 + 1),
            Err(Error::InvalidParameter)
        );
        assert_eq!(host.device_get_state(0), Err(Error::InvalidParameter));
        assert_eq!(host.device_mounted_classes(0xFF), Err(Error::InvalidParameter));
        assert_eq!(host.device_get_state(1), Ok(DeviceState::Unplugged));
        assert_eq!(host.device_ids(1), Err(Error::InvalidParameter));
    }

    #[test]
    fn hub_is_built_in() {
        let clock = ManualClock::default();
        let mut hid = MockHid::default();
        let mut host = host(MockHcd::default(), &clock);
        assert_eq!(
            host.register_class(ClassKind::Hub, &mut hid),
            Err(Error::InvalidParameter)
        );
    }

    /// Enumerate a hub at address 1
    fn mount_hub(host: &mut TestHost<'_>, clock: &ManualClock) -> PipeHandle {
        let ports = host.core.hcd.hub_ports.unwrap_or(4);
        attach(host, clock);
        assert_eq!(host.device_mounted_classes(1), Ok(ClassSet::HUB));
        assert_eq!(host.classes.hub.port_count(1), ports);
        let powered = host
            .core
            .hcd
            .requests_to(1)
            .iter()
            .filter(|setup| setup.request() == 3 && setup.value() == port_feature::POWER)
            .count();
        assert_eq!(powered, ports as usize);
        let (pipe, _, len) = *host.core.hcd.xfers.last().unwrap();
        assert_eq!(pipe.dev_addr(), 1);
        assert_eq!(pipe.xfer_type(), TransferType::Interrupt);
        // One bit for the hub, and one for each of eight ports
        assert_eq!(len, 2);
        pipe
    }

    #[test]
    fn hub_attach() {
        let clock = ManualClock::default();
        let mut hid = MockHid::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        host.register_class(ClassKind::Hid, &mut hid).unwrap();
        let status_pipe = mount_hub(&mut host, &clock);

        let hcd = &mut host.core.hcd;
        hcd.config = KEYBOARD_CONFIG.to_vec();
        hcd.port_reports = VecDeque::from([
            // Connected and powered, connection changed
            [0x01, 0x01, 0x01, 0x00],
            // Enabled, low speed, reset finished
            [0x03, 0x03, 0x10, 0x00],
        ]);
        let xfers = hcd.xfers.len();
        // Port 2 changed
        hcd.complete(status_pipe, ClassKind::Hub, &[0b100]);
        run(&mut host, &clock, 2000);

        assert_eq!(host.device_get_state(2), Ok(DeviceState::Configured));
        assert_eq!(host.device_mounted_classes(2), Ok(ClassSet::HID));
        assert_eq!(host.callbacks().mounted, [1, 2]);
        let dev = &host.core.devices[2];
        assert_eq!((dev.hub_addr, dev.hub_port, dev.speed), (1, 2, Speed::Low));

        let hcd = &host.core.hcd;
        let opened = hcd.control_opens.iter().rev().nth(1).unwrap();
        assert_eq!((opened.dev_addr, opened.hub_addr, opened.hub_port), (0, 1, 2));
        let hub_requests = hcd.requests_to(1);
        let resets = hub_requests
            .iter()
            .filter(|setup| **setup == SetupPacket::set_port_feature(2, port_feature::RESET))
            .count();
        assert_eq!(resets, 2);
        assert!(hub_requests.contains(&SetupPacket::clear_port_feature(2, port_feature::C_CONNECTION)));
        assert!(hub_requests.contains(&SetupPacket::clear_port_feature(2, port_feature::C_RESET)));
        // Re-armed after the attach
        assert!(hcd.xfers[xfers..].iter().any(|x| x.0 == status_pipe));
        // Root resets only for the hub itself
        assert_eq!(hcd.resets, 2);
    }

    #[test]
    fn hub_port_disconnect() {
        let clock = ManualClock::default();
        let mut hid = MockHid::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        host.register_class(ClassKind::Hid, &mut hid).unwrap();
        let status_pipe = mount_hub(&mut host, &clock);
        place(&mut host, 2, 1, 3, ClassSet::HID);
        place(&mut host, 3, 1, 2, ClassSet::HID);

        let hcd = &mut host.core.hcd;
        // Powered, not connected; connection changed
        hcd.port_reports = VecDeque::from([[0x00, 0x01, 0x01, 0x00]]);
        let xfers = hcd.xfers.len();
        hcd.complete(status_pipe, ClassKind::Hub, &[0b1000]);
        run(&mut host, &clock, 100);

        assert_eq!(host.callbacks().removed, [2]);
        assert_eq!(host.device_get_state(2), Ok(DeviceState::Unplugged));
        assert_eq!(host.device_get_state(3), Ok(DeviceState::Configured));
        assert_eq!(host.device_get_state(1), Ok(DeviceState::Configured));
        let hcd = &host.core.hcd;
        assert_eq!(hcd.device_closes, [2]);
        assert_eq!(
            hcd.requests_to(1).last(),
            Some(&SetupPacket::clear_port_feature(3, port_feature::C_CONNECTION))
        );
        assert!(hcd.xfers[xfers..].iter().any(|x| x.0 == status_pipe));
        assert!(host.is_idle());

        drop(host);
        assert_eq!(hid.closed, [2]);
    }

    #[test]
    fn root_disconnect_removes_everything_behind_it() {
        let clock = ManualClock::default();
        let mut hid = MockHid::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        host.register_class(ClassKind::Hid, &mut hid).unwrap();
        mount_hub(&mut host, &clock);
        place(&mut host, 2, 1, 3, ClassSet::HID);

        host.core.hcd.pending.push(HcdEvent::DeviceRemoved { rhport: 0 });
        run(&mut host, &clock, 10);

        assert_eq!(host.callbacks().removed, [1, 2]);
        assert_eq!(host.core.hcd.device_closes, [1, 2]);
        for addr in 1..=MAX_DEVICES as u8 {
            assert_eq!(host.device_get_state(addr), Ok(DeviceState::Unplugged));
        }
        assert_eq!(host.classes.hub.port_count(1), 0);

        drop(host);
        assert_eq!(hid.closed, [2]);
    }

    #[test]
    fn empty_change_rearms() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        let status_pipe = mount_hub(&mut host, &clock);
        let requests = host.core.hcd.requests.len();
        let xfers = host.core.hcd.xfers.len();

        // No bits set
        host.core.hcd.complete(status_pipe, ClassKind::Hub, &[0, 0]);
        run(&mut host, &clock, 10);

        assert_eq!(host.core.hcd.requests.len(), requests);
        assert_eq!(host.core.hcd.xfers.len(), xfers + 1);
        assert_eq!(host.core.hcd.xfers[xfers].0, status_pipe);
    }

    #[test]
    fn hub_over_current_is_acknowledged() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        let status_pipe = mount_hub(&mut host, &clock);
        let requests = host.core.hcd.requests.len();
        let xfers = host.core.hcd.xfers.len();

        // Over-current change on the hub, and a change on port 1
        host.core.hcd.hub_status = [0x02, 0x00, 0x02, 0x00];
        host.core.hcd.complete(status_pipe, ClassKind::Hub, &[0b11, 0]);
        run(&mut host, &clock, 10);

        let hcd = &host.core.hcd;
        assert_eq!(
            hcd.requests[requests..],
            [
                (1, SetupPacket::get_hub_status()),
                (1, SetupPacket::clear_hub_feature(hub_feature::C_OVER_CURRENT)),
            ]
        );
        assert_eq!(hcd.xfers.len(), xfers + 1);
        assert_eq!(hcd.xfers[xfers].0, status_pipe);
        assert!(host.callbacks().failed.is_empty());
        assert!(host.is_idle());
    }

    #[test]
    fn hub_local_power_is_acknowledged_first() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        let status_pipe = mount_hub(&mut host, &clock);

        host.core.hcd.hub_status = [0x00, 0x00, 0x03, 0x00];
        host.core.hcd.complete(status_pipe, ClassKind::Hub, &[0b1]);
        run(&mut host, &clock, 10);

        assert_eq!(
            host.core.hcd.requests.last(),
            Some(&(1, SetupPacket::clear_hub_feature(hub_feature::C_LOCAL_POWER)))
        );
    }

    #[test]
    fn port_eight_is_serviced() {
        let clock = ManualClock::default();
        let mut hcd = MockHcd::with_config(&HUB_CONFIG);
        hcd.hub_ports = Some(8);
        let mut host = host(hcd, &clock);
        let status_pipe = mount_hub(&mut host, &clock);
        place(&mut host, 2, 1, 8, ClassSet::empty());

        // Powered, not connected; connection changed
        host.core.hcd.port_reports = VecDeque::from([[0x00, 0x01, 0x01, 0x00]]);
        host.core.hcd.complete(status_pipe, ClassKind::Hub, &[0, 0b1]);
        run(&mut host, &clock, 10);

        assert_eq!(host.callbacks().removed, [2]);
        let requests = host.core.hcd.requests_to(1);
        assert!(requests.contains(&SetupPacket::get_port_status(8)));
        assert_eq!(
            requests.last(),
            Some(&SetupPacket::clear_port_feature(8, port_feature::C_CONNECTION))
        );
    }

    #[test]
    fn port_change_without_connect_is_acknowledged() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::with_config(&HUB_CONFIG), &clock);
        let status_pipe = mount_hub(&mut host, &clock);
        let xfers = host.core.hcd.xfers.len();

        // Connected and enabled; over-current changed
        host.core.hcd.port_reports = VecDeque::from([[0x03, 0x01, 0x08, 0x00]]);
        host.core.hcd.complete(status_pipe, ClassKind::Hub, &[0b10]);
        run(&mut host, &clock, 10);

        assert_eq!(
            host.core.hcd.requests_to(1).last(),
            Some(&SetupPacket::clear_port_feature(1, port_feature::C_OVER_CURRENT))
        );
        assert_eq!(host.core.hcd.xfers.len(), xfers + 1);
        assert!(host.callbacks().removed.is_empty());
        assert!(host.is_idle());
    }

    #[test]
    fn control_timeout() {
        let clock = ManualClock::default();
        let mut hcd = MockHcd::with_config(&KEYBOARD_CONFIG);
        hcd.silent = true;
        let mut host = host(hcd, &clock);
        attach(&mut host, &clock);
        // Power up, reset, then the first request goes unanswered
        assert_eq!(host.core.hcd.requests.len(), 1);
        assert!(host.callbacks().failed.is_empty());

        run(&mut host, &clock, 2000);
        assert_eq!(host.callbacks().failed, [(Error::Timeout, None)]);
        assert_eq!(host.core.hcd.control_closes, [0]);
        assert!(!host.core.devices[0].control.mutex.is_locked());
        assert!(!host.core.addr0.is_locked());
        assert!(host.is_idle());
    }

    #[test]
    fn queue_drops_when_full() {
        let clock = ManualClock::default();
        let mut host = host(MockHcd::default(), &clock);
        for _ in 0..16 {
            host.core
                .hcd
                .pending
                .push(HcdEvent::DeviceRemoved { rhport: 0 });
        }
        host.isr();
        assert_eq!(host.core.events.len(), crate::ENUM_QUEUE_DEPTH - 1);
        host.poll();
        assert!(host.is_idle());
    }
}
