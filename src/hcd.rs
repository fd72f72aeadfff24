//! The interface between the host stack and a host controller driver

use crate::{
    class::ClassKind,
    descriptor::EndpointDescriptor,
    error::{Result, XferResult},
    pipe::{DeviceRoute, PipeHandle, Speed},
    request::SetupPacket,
};

/// Events produced by a controller's interrupt handler
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HcdEvent {
    /// A device connected to a root port. The port is already resetting.
    DeviceAttached { rhport: u8 },
    /// A device disconnected from a root port
    DeviceRemoved { rhport: u8 },
    /// A transfer finished, successfully or not
    XferComplete {
        pipe: PipeHandle,
        class: Option<ClassKind>,
        result: XferResult,
        bytes: usize,
    },
    /// Every pipe of a closed device has been reclaimed
    DeviceReclaimed { dev_addr: u8 },
}

/// A host controller driver
///
/// Methods are called from the host task, except for [`isr`](Hcd::isr),
/// which runs in the controller's interrupt handler.
pub trait Hcd {
    /// Reset the controller, hand it the schedule, and start it
    fn init(&mut self) -> Result<()>;

    fn port_connect_status(&self, rhport: u8) -> bool;
    /// Begin a port reset. The caller waits for the reset to finish.
    fn port_reset(&mut self, rhport: u8);
    fn port_speed(&self, rhport: u8) -> Speed;

    /// Prepare the control pipe of `route.dev_addr`
    fn control_open(&mut self, route: &DeviceRoute, max_packet_size: u16) -> Result<()>;

    /// Start a control transfer
    ///
    /// The SETUP, optional DATA, and STATUS stages are built from scratch on
    /// every call. Completion is reported with a control [`PipeHandle`].
    ///
    /// # Safety
    ///
    /// `data` must be valid for `setup.length()` bytes of reads and writes
    /// until the transfer completes, or until the control pipe is reopened.
    unsafe fn control_xfer(&mut self, dev_addr: u8, setup: &SetupPacket, data: *mut u8) -> Result<()>;

    fn control_close(&mut self, dev_addr: u8) -> Result<()>;

    /// Open a bulk or interrupt pipe
    fn pipe_open(
        &mut self,
        route: &DeviceRoute,
        endpoint: &EndpointDescriptor,
        class: ClassKind,
    ) -> Result<PipeHandle>;

    /// Queue a transfer without asking for a completion event
    ///
    /// # Safety
    ///
    /// See [`pipe_xfer`](Hcd::pipe_xfer).
    unsafe fn pipe_queue_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize) -> Result<()>;

    /// Queue a transfer, and arm the pipe
    ///
    /// When `ioc` is set, the pipe reports one completion event once this and
    /// every transfer queued before it has finished.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `len` bytes of reads and writes until the
    /// transfer completes, or until the pipe closes.
    unsafe fn pipe_xfer(&mut self, pipe: PipeHandle, buffer: *mut u8, len: usize, ioc: bool) -> Result<()>;

    fn pipe_close(&mut self, pipe: PipeHandle) -> Result<()>;

    /// `true` if the pipe has transfers in flight
    fn pipe_is_busy(&self, pipe: PipeHandle) -> bool;
    /// `true` if the pipe halted on an error
    fn pipe_is_stalled(&self, pipe: PipeHandle) -> bool;
    /// Resume a halted pipe, restarting at its oldest transfer
    fn pipe_clear_stall(&mut self, pipe: PipeHandle) -> Result<()>;

    /// Close every pipe of a device, including its control pipe
    ///
    /// Returns `true` if reclamation finishes in the interrupt handler, which
    /// then reports [`HcdEvent::DeviceReclaimed`]. Returns `false` if the
    /// device had no open control pipe; nothing will be reported.
    fn device_close(&mut self, dev_addr: u8) -> bool;

    /// Service the controller's interrupt
    fn isr(&mut self, events: &mut dyn FnMut(HcdEvent));
}
