use core::task::Poll;

use super::HostCore;
use crate::{
    error::{Error, Result},
    hcd::Hcd,
    osal::{Clock, Deadline},
    request::SetupPacket,
    MAX_DEVICES,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    Idle,
    /// Another transfer owns the control pipe
    Locking,
    /// Submitted; waiting for the interrupt handler
    Waiting,
}

/// A control transfer in progress
///
/// The owner polls the transfer with the same request until it's ready.
/// The first poll takes the device's control pipe and submits the request.
/// Every wait is bounded by the host's control timeout.
pub struct ControlTransfer {
    stage: Stage,
    deadline: Deadline,
}

impl ControlTransfer {
    pub const fn new() -> Self {
        ControlTransfer {
            stage: Stage::Idle,
            deadline: Deadline::new(),
        }
    }

    /// `true` if no transfer is in progress
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    fn finish(&mut self) {
        self.stage = Stage::Idle;
        self.deadline.clear();
    }

    /// # Safety
    ///
    /// `data` must be valid for `setup.length()` bytes until the transfer
    /// is ready.
    pub(crate) unsafe fn poll<H: Hcd, K: Clock>(
        &mut self,
        core: &mut HostCore<H, K>,
        dev_addr: u8,
        setup: &SetupPacket,
        data: *mut u8,
    ) -> Poll<Result<usize>> {
        let dev = dev_addr as usize;
        if dev > MAX_DEVICES {
            return Poll::Ready(Err(Error::InvalidParameter));
        }
        let timeout = core.config.control_timeout_ms;

        match self.stage {
            Stage::Idle | Stage::Locking => {
                let control = &core.devices[dev].control;
                if !control.mutex.try_lock() {
                    self.stage = Stage::Locking;
                    return if self.deadline.elapsed(&core.clock, timeout) {
                        warn!("CONTROL LOCK TIMEOUT {}", dev_addr);
                        self.finish();
                        Poll::Ready(Err(Error::Timeout))
                    } else {
                        Poll::Pending
                    };
                }
                control.semaphore.reset();
                self.deadline.clear();
                trace!(
                    "CONTROL {} REQ {} LEN {}",
                    dev_addr,
                    setup.request(),
                    setup.length()
                );
                if let Err(err) = core.hcd.control_xfer(dev_addr, setup, data) {
                    core.devices[dev].control.mutex.release();
                    self.finish();
                    return Poll::Ready(Err(err));
                }
                self.stage = Stage::Waiting;
                // Start the clock
                let _ = self.deadline.elapsed(&core.clock, timeout);
                Poll::Pending
            }
            Stage::Waiting => {
                let control = &mut core.devices[dev].control;
                if control.semaphore.try_wait() {
                    control.mutex.release();
                    let (result, bytes) = (control.result, control.bytes);
                    self.finish();
                    Poll::Ready(result.into_result().map(|()| bytes))
                } else if self.deadline.elapsed(&core.clock, timeout) {
                    warn!("CONTROL TIMEOUT {}", dev_addr);
                    control.mutex.release();
                    self.finish();
                    Poll::Ready(Err(Error::Timeout))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Default for ControlTransfer {
    fn default() -> Self {
        Self::new()
    }
}
