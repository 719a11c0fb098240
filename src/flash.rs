//! Flash sector operations.

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{Device, SectorRange};
use crate::engine::LineProtocolEngine;
use crate::protocol::{Command, ExecMode, Request, ReturnCode};
use crate::transport::Transport;
use crate::Error;

/// Flash operations over a synchronised [`LineProtocolEngine`].
///
/// Sector geometry and copy sizes come from the attached [`Device`], which is
/// only needed for [`FlashProgrammer::copy_ram_to_flash`].
pub struct FlashProgrammer<'a, T, D> {
    engine: &'a mut LineProtocolEngine<T, D>,
    device: Option<&'a Device>,
}

impl<'a, T, D> FlashProgrammer<'a, T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(engine: &'a mut LineProtocolEngine<T, D>) -> Self {
        Self { engine, device: None }
    }

    pub fn with_device(mut self, device: &'a Device) -> Self {
        self.device = Some(device);
        self
    }

    fn check_range(range: SectorRange) -> Result<(), Error<T::Error>> {
        if range.end < range.start {
            return Err(Error::InvalidSector);
        }
        Ok(())
    }

    /// Prepare sectors for the next erase or copy
    pub fn prepare_sectors(&mut self, range: SectorRange) -> Result<(), Error<T::Error>> {
        Self::check_range(range)?;

        self.engine
            .command(&Request::new(Command::Prepare).arg(range.start).arg(range.end))
    }

    /// Prepare and erase sectors
    pub fn erase_sectors(&mut self, range: SectorRange) -> Result<(), Error<T::Error>> {
        info!("Erasing sectors {} to {}", range.start, range.end);

        self.prepare_sectors(range)?;
        self.engine
            .command(&Request::new(Command::Erase).arg(range.start).arg(range.end))
    }

    /// Check whether the sectors are erased
    pub fn blank_check_sectors(&mut self, range: SectorRange) -> Result<bool, Error<T::Error>> {
        Self::check_range(range)?;

        let request = Request::new(Command::BlankCheck).arg(range.start).arg(range.end);
        match self.engine.send_command(&request)? {
            ReturnCode::Success => Ok(true),
            ReturnCode::SectorNotBlank => {
                let offset = self.engine.read_value()?;
                let value = self.engine.read_value()?;
                debug!("Sector not blank at offset 0x{:x} (0x{:08x})", offset, value);
                Ok(false)
            }
            code => Err(Error::from_code(Command::BlankCheck, code)),
        }
    }

    /// Program `size` bytes from the RAM buffer into flash
    pub fn copy_ram_to_flash(&mut self, flash_address: u32, ram_address: u32, size: u32) -> Result<(), Error<T::Error>> {
        let device = self.device.ok_or(Error::NotConnected)?;

        if !device.supports_copy_size(size) {
            return Err(Error::UnsupportedPageSize(size));
        }
        if flash_address % 256 != 0 {
            return Err(Error::Misaligned(flash_address));
        }
        if ram_address % 4 != 0 {
            return Err(Error::Misaligned(ram_address));
        }

        let range = device
            .sectors_for(flash_address, size)
            .ok_or(Error::OutOfRange {
                start: flash_address,
                end: flash_address.wrapping_add(size),
            })?;

        self.prepare_sectors(range)?;
        self.engine.command(
            &Request::new(Command::Copy)
                .arg(flash_address)
                .arg(ram_address)
                .arg(size),
        )
    }

    /// Start execution at `address`, ending the ISP session
    pub fn go(&mut self, address: u32, mode: ExecMode) -> Result<(), Error<T::Error>> {
        info!("Starting execution at 0x{:08x}", address);

        let r = self.engine.command(&Request::new(Command::Go).arg(address).mode(mode));
        self.engine.end_session();
        r
    }

    pub fn read_part_id(&mut self) -> Result<u32, Error<T::Error>> {
        self.engine.command(&Request::new(Command::ReadPartId))?;
        self.engine.read_value()
    }

    /// Boot code version as (major, minor)
    pub fn read_boot_version(&mut self) -> Result<(u8, u8), Error<T::Error>> {
        self.engine.command(&Request::new(Command::ReadBootVersion))?;

        let minor = self.engine.read_value()?;
        let major = self.engine.read_value()?;
        Ok((major as u8, minor as u8))
    }

    pub fn read_serial_number(&mut self) -> Result<[u32; 4], Error<T::Error>> {
        self.engine.command(&Request::new(Command::ReadSerialNumber))?;

        let mut serial = [0u32; 4];
        for s in serial.iter_mut() {
            *s = self.engine.read_value()?;
        }
        Ok(serial)
    }
}
