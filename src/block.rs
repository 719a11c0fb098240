//! Checksummed block transfers to and from target memory.
//!
//! Payloads are sent as groups of encoded text lines, each group followed by
//! a line holding the sum of the group's bytes. The receiver answers `OK` or
//! `RESEND`; only the rejected group is retransmitted.

use embedded_hal::blocking::delay::DelayMs;

use crate::engine::LineProtocolEngine;
use crate::protocol::{Command, Encoding, Request, ReturnCode, OK, RESEND};
use crate::transport::Transport;
use crate::Error;

/// Sum of bytes carried in a checksum line
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |a, b| a.wrapping_add(*b as u32))
}

fn uu_char(v: u8) -> char {
    match v & 0x3f {
        0 => '`',
        v => (v + 0x20) as char,
    }
}

fn uu_value(c: u8) -> u8 {
    c.wrapping_sub(0x20) & 0x3f
}

/// Encode one line of payload
pub fn encode_line(encoding: Encoding, data: &[u8]) -> String {
    match encoding {
        Encoding::Decimal => data.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(" "),
        Encoding::Uuencode => {
            let mut s = String::with_capacity(1 + (data.len() + 2) / 3 * 4);
            s.push(uu_char(data.len() as u8));

            for c in data.chunks(3) {
                let b = [c[0], c.get(1).cloned().unwrap_or(0), c.get(2).cloned().unwrap_or(0)];

                s.push(uu_char(b[0] >> 2));
                s.push(uu_char((b[0] << 4) | (b[1] >> 4)));
                s.push(uu_char((b[1] << 2) | (b[2] >> 6)));
                s.push(uu_char(b[2]));
            }

            s
        }
    }
}

/// Decode one line of payload
pub fn decode_line(encoding: Encoding, line: &str) -> Option<Vec<u8>> {
    match encoding {
        Encoding::Decimal => line.split_whitespace().map(|v| v.parse::<u8>().ok()).collect(),
        Encoding::Uuencode => {
            let raw = line.as_bytes();
            let (len, body) = raw.split_first()?;
            let len = uu_value(*len) as usize;

            if body.len() < (len + 2) / 3 * 4 {
                return None;
            }

            let mut data = Vec::with_capacity(len + 2);
            for c in body.chunks(4).take((len + 2) / 3) {
                let v = [uu_value(c[0]), uu_value(c[1]), uu_value(c[2]), uu_value(c[3])];

                data.push((v[0] << 2) | (v[1] >> 4));
                data.push((v[1] << 4) | (v[2] >> 2));
                data.push((v[2] << 6) | v[3]);
            }
            data.truncate(len);

            Some(data)
        }
    }
}

fn check_alignment<E>(address: u32, len: usize) -> Result<(), Error<E>> {
    if address % 4 != 0 {
        return Err(Error::Misaligned(address));
    }
    if len == 0 || len % 4 != 0 {
        return Err(Error::InvalidLength(len));
    }
    Ok(())
}

/// RAM transfer operations over a synchronised [`LineProtocolEngine`]
pub struct BlockTransferEngine<'a, T, D> {
    engine: &'a mut LineProtocolEngine<T, D>,
}

impl<'a, T, D> BlockTransferEngine<'a, T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(engine: &'a mut LineProtocolEngine<T, D>) -> Self {
        Self { engine }
    }

    fn encoding(&self) -> Result<Encoding, Error<T::Error>> {
        self.engine.session().map(|s| s.encoding).ok_or(Error::NotConnected)
    }

    /// Write `data` to target RAM at `address`
    pub fn write_ram(&mut self, address: u32, data: &[u8]) -> Result<(), Error<T::Error>> {
        check_alignment(address, data.len())?;
        let encoding = self.encoding()?;

        debug!("Writing {} bytes to 0x{:08x}", data.len(), address);

        self.engine
            .command(&Request::new(Command::WriteMemory).arg(address).arg(data.len() as u32))?;

        for (i, group) in data.chunks(encoding.group_size()).enumerate() {
            let mut resends = 0;

            loop {
                for line in group.chunks(encoding.bytes_per_line()) {
                    self.engine.write_line(&encode_line(encoding, line))?;
                }
                self.engine.write_line(&checksum(group).to_string())?;

                let resp = self.engine.read_response()?;
                if resp == OK {
                    break;
                } else if resp == RESEND {
                    resends += 1;
                    warn!("Checksum rejected for block {} (attempt {})", i, resends);

                    if resends > self.engine.options().max_resend {
                        error!("Block {} retry limit exceeded", i);
                        return Err(Error::ChecksumError);
                    }
                } else {
                    return Err(Error::InvalidResponse(resp));
                }
            }
        }

        Ok(())
    }

    /// Read `size` bytes of target memory from `address`
    pub fn read_ram(&mut self, address: u32, size: usize) -> Result<Vec<u8>, Error<T::Error>> {
        check_alignment(address, size)?;
        let encoding = self.encoding()?;

        debug!("Reading {} bytes from 0x{:08x}", size, address);

        self.engine
            .command(&Request::new(Command::ReadMemory).arg(address).arg(size as u32))?;

        let mut data = Vec::with_capacity(size);
        let mut index = 0;

        while data.len() < size {
            let len = (size - data.len()).min(encoding.group_size());
            let lines = (len + encoding.bytes_per_line() - 1) / encoding.bytes_per_line();
            let mut resends = 0;

            loop {
                let mut group = Vec::with_capacity(len);
                for _ in 0..lines {
                    let line = self.engine.read_response()?;
                    match decode_line(encoding, &line) {
                        Some(d) => group.extend_from_slice(&d),
                        None => return Err(Error::InvalidResponse(line)),
                    }
                }
                let sum = self.engine.read_value()?;

                if group.len() == len && sum == checksum(&group) {
                    self.engine.write_line(OK)?;
                    data.extend_from_slice(&group);
                    break;
                }

                resends += 1;
                warn!("Checksum mismatch on block {} (attempt {})", index, resends);

                if resends > self.engine.options().max_resend {
                    error!("Block {} retry limit exceeded", index);
                    return Err(Error::ChecksumError);
                }
                self.engine.write_line(RESEND)?;
            }

            index += 1;
        }

        Ok(data)
    }

    /// Compare two memory regions on the target.
    ///
    /// Returns the offset of the first difference, if any.
    pub fn compare(&mut self, addr0: u32, addr1: u32, size: usize) -> Result<Option<u32>, Error<T::Error>> {
        check_alignment(addr0, size)?;
        check_alignment(addr1, size)?;

        let request = Request::new(Command::Compare).arg(addr0).arg(addr1).arg(size as u32);
        match self.engine.send_command(&request)? {
            ReturnCode::Success => Ok(None),
            ReturnCode::CompareError => {
                let offset = self.engine.read_value()?;
                debug!("Compare mismatch at offset 0x{:x}", offset);
                Ok(Some(offset))
            }
            code => Err(Error::from_code(Command::Compare, code)),
        }
    }

    /// Compare two memory regions on the target, `true` on match
    pub fn compare_memory(&mut self, addr0: u32, addr1: u32, size: usize) -> Result<bool, Error<T::Error>> {
        self.compare(addr0, addr1, size).map(|r| r.is_none())
    }
}
