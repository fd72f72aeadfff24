//! Host stack errors

use core::fmt;

/// Errors surfaced by the host controller drivers and the host stack
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[non_exhaustive]
pub enum Error {
    /// Every queue head for the device is in use, or still being reclaimed
    NoFreeQueueHead,
    /// Every transfer descriptor for the device is in use
    NoFreeTransferDescriptor,
    /// No unplugged device slot is left for a new address
    NoFreeAddress,
    /// The transfer type cannot be scheduled (isochronous)
    UnsupportedTransferType,
    /// Only one level of hubs is supported
    UnsupportedHubDepth,
    /// The hub needs multiple transaction translators
    UnsupportedHub,
    /// A descriptor didn't fit in the enumeration buffer
    DescriptorTooLarge,
    /// A descriptor was truncated, or had an unexpected type
    InvalidDescriptor,
    /// A hub port didn't report the status expected after a request
    UnexpectedPortStatus,
    /// The device didn't connect, or disconnected mid-way
    NotConnected,
    /// CRC, timeout, babble, or data buffer error reported by the controller
    TransactionError,
    /// The device returned a STALL handshake
    Stall,
    /// A blocking wait expired
    Timeout,
    /// The pipe handle doesn't name an open pipe
    InvalidPipe,
    /// An argument is out of range
    InvalidParameter,
}

/// Coarse error categories
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum ErrorKind {
    ResourceExhaustion,
    ProtocolError,
    TransactionError,
    ProtocolStall,
    Timeout,
    UnsupportedFeature,
    InvalidParameter,
}

impl Error {
    /// Returns the category for this error
    pub const fn kind(self) -> ErrorKind {
        match self {
            Error::NoFreeQueueHead | Error::NoFreeTransferDescriptor | Error::NoFreeAddress => {
                ErrorKind::ResourceExhaustion
            }
            Error::UnsupportedTransferType | Error::UnsupportedHubDepth | Error::UnsupportedHub => {
                ErrorKind::UnsupportedFeature
            }
            Error::DescriptorTooLarge
            | Error::InvalidDescriptor
            | Error::UnexpectedPortStatus
            | Error::NotConnected => ErrorKind::ProtocolError,
            Error::TransactionError => ErrorKind::TransactionError,
            Error::Stall => ErrorKind::ProtocolStall,
            Error::Timeout => ErrorKind::Timeout,
            Error::InvalidPipe | Error::InvalidParameter => ErrorKind::InvalidParameter,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NoFreeQueueHead => "no free queue head",
            Error::NoFreeTransferDescriptor => "no free transfer descriptor",
            Error::NoFreeAddress => "no free device address",
            Error::UnsupportedTransferType => "unsupported transfer type",
            Error::UnsupportedHubDepth => "hubs may only attach to the root port",
            Error::UnsupportedHub => "multi-TT hubs are not supported",
            Error::DescriptorTooLarge => "descriptor exceeds the enumeration buffer",
            Error::InvalidDescriptor => "malformed descriptor",
            Error::UnexpectedPortStatus => "unexpected hub port status",
            Error::NotConnected => "device not connected",
            Error::TransactionError => "transaction error",
            Error::Stall => "endpoint stalled",
            Error::Timeout => "timed out",
            Error::InvalidPipe => "invalid pipe handle",
            Error::InvalidParameter => "invalid parameter",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Outcome of a completed transfer, as reported by the controller
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum XferResult {
    Success,
    Stall,
    TransactionError,
}

impl XferResult {
    /// Convert a failed result into an error
    pub const fn into_result(self) -> Result<()> {
        match self {
            XferResult::Success => Ok(()),
            XferResult::Stall => Err(Error::Stall),
            XferResult::TransactionError => Err(Error::TransactionError),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Error, ErrorKind, XferResult};

    #[test]
    fn kinds() {
        assert_eq!(Error::NoFreeTransferDescriptor.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(Error::Stall.kind(), ErrorKind::ProtocolStall);
        assert_eq!(Error::UnsupportedTransferType.kind(), ErrorKind::UnsupportedFeature);
        assert_eq!(Error::DescriptorTooLarge.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn xfer_results() {
        assert_eq!(XferResult::Success.into_result(), Ok(()));
        assert_eq!(XferResult::Stall.into_result(), Err(Error::Stall));
        assert_eq!(
            XferResult::TransactionError.into_result(),
            Err(Error::TransactionError)
        );
    }
}
