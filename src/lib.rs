//! NXP LPC Serial ISP Bootloader.
//!
//! Talks to the line-oriented ISP bootloader in the LPC boot ROM to erase,
//! program, verify and read back on-chip flash over a UART.
//!
//! Layered as:
//! - [`engine::LineProtocolEngine`]: command / response exchange and synchronisation
//! - [`block::BlockTransferEngine`]: checksummed RAM transfers
//! - [`flash::FlashProgrammer`]: sector prepare / erase / copy / go
//! - [`flasher::ImageFlasher`]: end to end image programming

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod block;
pub mod device;
pub mod engine;
pub mod flash;
pub mod flasher;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod mock;

pub use device::{Core, Device, DeviceTable};
pub use engine::LineProtocolEngine;
pub use flasher::{Completion, FlashImage, ImageFlasher, TargetInfo};
pub use protocol::{Command, Encoding, ExecMode, ReturnCode, Session, SyncVariant};
pub use transport::{GpioControl, ManualControl, PinControl, ReadError, SerialPort, SerialTransport, Transport};

/// Flashing state machine
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Connecting,
    Synchronized,
    Unlocked,
    Erasing,
    Programming,
    Verifying,
    Done,
    Failed,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("no response within timeout")]
    ResponseTimeout,

    #[error("failed to drive target control lines")]
    Gpio,

    #[error("unexpected response: '{0}'")]
    InvalidResponse(String),

    #[error("no bootloader response at any candidate baud rate")]
    SyncFailed,

    #[error("command {command:?} rejected: {code:?}")]
    Rejected { command: Command, code: ReturnCode },

    #[error("baud rate rejected by bootloader")]
    InvalidBaudRate,

    #[error("invalid sector")]
    InvalidSector,

    #[error("sector erase failed: {0:?}")]
    EraseFailed(ReturnCode),

    #[error("code read protection enabled")]
    CodeReadProtected,

    #[error("access denied (bootloader locked): {0:?}")]
    AccessDenied(ReturnCode),

    #[error("block checksum retry limit exceeded")]
    ChecksumError,

    #[error("verification failed at 0x{address:08x}")]
    VerifyFailed { address: u32 },

    #[error("address 0x{0:08x} is not aligned")]
    Misaligned(u32),

    #[error("invalid transfer length {0}")]
    InvalidLength(usize),

    #[error("unsupported flash write size {0}")]
    UnsupportedPageSize(u32),

    #[error("range 0x{start:08x}..0x{end:08x} outside of flash")]
    OutOfRange { start: u32, end: u32 },

    #[error("unknown part id 0x{0:08x}")]
    UnknownPart(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no active bootloader session")]
    NotConnected,
}

impl<E> Error<E> {
    /// Map a non-zero bootloader status to an error
    pub fn from_code(command: Command, code: ReturnCode) -> Self {
        match (command, code) {
            (_, ReturnCode::InvalidBaudRate) | (_, ReturnCode::InvalidStopBit) => Error::InvalidBaudRate,
            (_, ReturnCode::InvalidSector) => Error::InvalidSector,
            (_, ReturnCode::CodeReadProtectionEnabled) => Error::CodeReadProtected,
            (_, ReturnCode::CmdLocked) | (_, ReturnCode::InvalidCode) => Error::AccessDenied(code),
            (Command::Erase, code) => Error::EraseFailed(code),
            (command, code) => Error::Rejected { command, code },
        }
    }

    /// Serial failure or missing response
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Serial(_) | Error::ResponseTimeout | Error::SyncFailed)
    }

    /// Data was written but reads back different
    pub fn is_verification(&self) -> bool {
        matches!(self, Error::VerifyFailed { .. })
    }

    /// Rejected locally, nothing was sent to the target
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Misaligned(_)
                | Error::InvalidLength(_)
                | Error::UnsupportedPageSize(_)
                | Error::OutOfRange { .. }
        )
    }
}

impl<E> From<ReadError<E>> for Error<E> {
    fn from(e: ReadError<E>) -> Self {
        match e {
            ReadError::Timeout => Error::ResponseTimeout,
            ReadError::Io(e) => Error::Serial(e),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device into the bootloader on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for each bootloader response line
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for the autobaud response at each baud rate
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "300"))]
    pub sync_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Width of the reset pulse
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub reset_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// Delay after baud rate changes and the LPC177x/8x handshake
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub settle_delay_ms: u32,

    /// Retransmissions allowed per block before a transfer fails
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub max_resend: u32,

    /// Use the decimal line encoding instead of UU encoding
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub decimal: bool,

    /// Force the LPC177x/8x synchronisation sequence
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub lpc177x_8x: bool,

    /// Do not patch the valid user code vector checksum
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_checksum_patch: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            sync_timeout_ms: 300,
            poll_delay_ms: 1,
            reset_delay_ms: 100,
            init_delay_ms: 100,
            settle_delay_ms: 20,
            max_resend: 3,
            decimal: false,
            lpc177x_8x: false,
            no_checksum_patch: false,
        }
    }
}

impl Options {
    pub fn encoding(&self) -> Encoding {
        if self.decimal {
            Encoding::Decimal
        } else {
            Encoding::Uuencode
        }
    }
}
