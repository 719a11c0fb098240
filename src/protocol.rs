//! LPC boot ROM ISP wire definitions.
//!
//! Based on the "Flash memory programming" chapters of UM10360 / UM10398 / UM10139

use core::fmt;

/// Autobaud request character
pub const SYNC_REQUEST: &str = "?";

/// Autobaud response / acknowledgement string
pub const SYNC_WORD: &str = "Synchronized";

/// Line acknowledgement used during synchronisation and block transfers
pub const OK: &str = "OK";

/// Block checksum rejection
pub const RESEND: &str = "RESEND";

/// Line terminator for everything the host sends
pub const LINE_END: &str = "\r\n";

/// Fixed code accepted by the unlock command
pub const UNLOCK_CODE: u32 = 23130;

/// Candidate baud rates, fastest first
pub const BAUD_RATES: &[u32] = &[115200, 57600, 38400, 19200, 9600];

/// Flash write sizes accepted by the copy-RAM-to-flash command
pub const COPY_SIZES: &[u32] = &[256, 512, 1024, 4096];

/// Bootloader command verbs
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Unlock flash write, erase and go commands
    Unlock,
    /// Turn echo of received characters on or off
    Echo,
    /// Write data to RAM
    WriteMemory,
    /// Read data from RAM or flash
    ReadMemory,
    /// Prepare sectors for a write or erase operation
    Prepare,
    /// Copy RAM to flash
    Copy,
    /// Jump to an address and start executing
    Go,
    /// Erase sectors
    Erase,
    /// Check whether sectors are blank
    BlankCheck,
    /// Read the part identification number
    ReadPartId,
    /// Read the boot code version
    ReadBootVersion,
    /// Compare two memory regions
    Compare,
    /// Read the device serial number
    ReadSerialNumber,
}

impl Command {
    /// Single character verb sent on the wire
    pub fn verb(&self) -> char {
        match self {
            Command::Unlock => 'U',
            Command::Echo => 'A',
            Command::WriteMemory => 'W',
            Command::ReadMemory => 'R',
            Command::Prepare => 'P',
            Command::Copy => 'C',
            Command::Go => 'G',
            Command::Erase => 'E',
            Command::BlankCheck => 'I',
            Command::ReadPartId => 'J',
            Command::ReadBootVersion => 'K',
            Command::Compare => 'M',
            Command::ReadSerialNumber => 'N',
        }
    }
}

/// Execution mode for the go command
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ExecMode {
    Thumb,
    Arm,
}

impl ExecMode {
    fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Thumb => "T",
            ExecMode::Arm => "A",
        }
    }
}

/// Single command argument
#[derive(Debug, PartialEq, Clone)]
pub enum Arg {
    Num(u32),
    Mode(ExecMode),
}

/// An outbound command line
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub command: Command,
    pub args: Vec<Arg>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            args: Vec::new(),
        }
    }

    /// Append a numeric argument
    pub fn arg(mut self, value: u32) -> Self {
        self.args.push(Arg::Num(value));
        self
    }

    /// Append an execution mode argument
    pub fn mode(mut self, mode: ExecMode) -> Self {
        self.args.push(Arg::Mode(mode));
        self
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command.verb())?;
        for a in &self.args {
            match a {
                Arg::Num(n) => write!(f, " {}", n)?,
                Arg::Mode(m) => write!(f, " {}", m.as_str())?,
            }
        }
        Ok(())
    }
}

/// Bootloader status codes
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ReturnCode {
    Success,
    InvalidCommand,
    SrcAddrError,
    DstAddrError,
    SrcAddrNotMapped,
    DstAddrNotMapped,
    CountError,
    InvalidSector,
    SectorNotBlank,
    SectorNotPrepared,
    CompareError,
    Busy,
    ParamError,
    AddrError,
    AddrNotMapped,
    CmdLocked,
    InvalidCode,
    InvalidBaudRate,
    InvalidStopBit,
    CodeReadProtectionEnabled,
    Unknown(i32),
}

impl ReturnCode {
    pub fn from_i32(v: i32) -> Self {
        use ReturnCode::*;

        match v {
            0 => Success,
            1 => InvalidCommand,
            2 => SrcAddrError,
            3 => DstAddrError,
            4 => SrcAddrNotMapped,
            5 => DstAddrNotMapped,
            6 => CountError,
            7 => InvalidSector,
            8 => SectorNotBlank,
            9 => SectorNotPrepared,
            10 => CompareError,
            11 => Busy,
            12 => ParamError,
            13 => AddrError,
            14 => AddrNotMapped,
            15 => CmdLocked,
            16 => InvalidCode,
            17 => InvalidBaudRate,
            18 => InvalidStopBit,
            19 => CodeReadProtectionEnabled,
            v => Unknown(v),
        }
    }

    /// Parse the leading integer of a response line
    pub fn parse(line: &str) -> Option<Self> {
        let s = line.trim();
        let end = s
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
            .map(|(i, _)| i)
            .unwrap_or_else(|| s.len());

        s[..end].parse::<i32>().ok().map(Self::from_i32)
    }

    pub fn is_success(&self) -> bool {
        *self == ReturnCode::Success
    }
}

/// Synchronisation handshake flavour
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SyncVariant {
    /// Handshake lines are echoed
    Standard,
    /// LPC177x/8x: no echo during the handshake, settle delay afterwards
    Lpc177x8x,
}

/// Text encoding used for RAM block transfers
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Encoding {
    /// Legacy UU-style encoding, 45 bytes per line
    Uuencode,
    /// One decimal byte per line
    Decimal,
}

impl Encoding {
    /// Payload bytes carried by one line
    pub fn bytes_per_line(&self) -> usize {
        match self {
            Encoding::Uuencode => 45,
            Encoding::Decimal => 1,
        }
    }

    /// Lines sent before each checksum line
    pub fn lines_per_group(&self) -> usize {
        match self {
            Encoding::Uuencode => 20,
            Encoding::Decimal => 64,
        }
    }

    pub fn group_size(&self) -> usize {
        self.bytes_per_line() * self.lines_per_group()
    }
}

/// Live protocol conversation state
#[derive(Debug, PartialEq, Clone)]
pub struct Session {
    /// Bootloader echoes received lines
    pub echo: bool,
    /// Crystal frequency reported to the bootloader
    pub crystal_hz: u32,
    /// Negotiated baud rate
    pub baud: u32,
    /// Staging buffer used for writes
    pub ram_buffer: u32,
    pub variant: SyncVariant,
    pub encoding: Encoding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_requests() {
        let r = Request::new(Command::Copy).arg(0).arg(0x1000_0200).arg(512);
        assert_eq!(r.to_string(), "C 0 268435968 512");

        let g = Request::new(Command::Go).arg(0).mode(ExecMode::Thumb);
        assert_eq!(g.to_string(), "G 0 T");

        assert_eq!(Request::new(Command::ReadPartId).to_string(), "J");
    }

    #[test]
    fn parse_return_codes() {
        assert_eq!(ReturnCode::parse("0"), Some(ReturnCode::Success));
        assert_eq!(ReturnCode::parse("19\r"), Some(ReturnCode::CodeReadProtectionEnabled));
        assert_eq!(ReturnCode::parse("8 trailing"), Some(ReturnCode::SectorNotBlank));
        assert_eq!(ReturnCode::parse("42"), Some(ReturnCode::Unknown(42)));
        assert_eq!(ReturnCode::parse("OK"), None);
        assert_eq!(ReturnCode::parse(""), None);
    }
}
