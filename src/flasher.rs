//! Image programming orchestration.

use embedded_hal::blocking::delay::DelayMs;

use crate::block::BlockTransferEngine;
use crate::device::{Core, Device, DeviceTable};
use crate::engine::LineProtocolEngine;
use crate::flash::FlashProgrammer;
use crate::protocol::{ExecMode, BAUD_RATES, COPY_SIZES, UNLOCK_CODE};
use crate::transport::{GpioControl, Transport};
use crate::{Error, Options, State};

/// Binary image to be written at a flash address
#[derive(Debug, Clone, PartialEq)]
pub struct FlashImage {
    pub base_address: u32,
    pub data: Vec<u8>,
}

impl FlashImage {
    pub fn new(base_address: u32, data: Vec<u8>) -> Self {
        Self { base_address, data }
    }
}

/// Action taken once an image has been written and verified
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Completion {
    /// Release the ISP line and reset into the new image
    Reset,
    /// Jump to the image via the bootloader, in the core's default mode
    /// unless `mode` is given
    Go { address: u32, mode: Option<ExecMode> },
    /// Leave the target in the bootloader
    Stay,
}

/// Identification read from a connected target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub part_id: u32,
    pub boot_version: (u8, u8),
    pub serial_number: [u32; 4],
    pub device: Option<Device>,
}

impl Core {
    /// Vector table word holding the valid user code checksum
    fn checksum_vector(&self) -> usize {
        match self {
            Core::Arm7 => 5,
            Core::CortexM => 7,
        }
    }
}

/// Patch the reserved vector so the first eight vectors sum to zero.
///
/// The boot ROM only starts user code with a valid checksum. Returns false
/// for images shorter than the vector table.
pub fn patch_vector_checksum(data: &mut [u8], core: Core) -> bool {
    if data.len() < 32 {
        return false;
    }

    let slot = core.checksum_vector();
    let word = |i: usize| u32::from_le_bytes([data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]]);

    let sum = (0..8)
        .filter(|i| *i != slot)
        .fold(0u32, |a, i| a.wrapping_add(word(i)));
    let value = 0u32.wrapping_sub(sum);

    debug!("Vector checksum 0x{:08x} at 0x{:02x}", value, slot * 4);
    data[slot * 4..slot * 4 + 4].copy_from_slice(&value.to_le_bytes());

    true
}

/// End to end flashing of LPC targets.
///
/// Owns the transport, control lines and delay for the duration of each
/// operation. A session is created by every operation and dropped when it
/// completes or fails.
pub struct ImageFlasher<T, G, D> {
    engine: LineProtocolEngine<T, D>,
    control: G,
    devices: DeviceTable,
    baud_rates: Vec<u32>,
    completion: Completion,
    device: Option<Device>,
    state: State,
}

impl<T, G, D> ImageFlasher<T, G, D>
where
    T: Transport,
    G: GpioControl,
    D: DelayMs<u32>,
{
    /// Create a new flasher instance
    pub fn new(transport: T, control: G, delay: D, devices: DeviceTable, options: Options) -> Self {
        Self {
            engine: LineProtocolEngine::new(transport, delay, options),
            control,
            devices,
            baud_rates: BAUD_RATES.to_vec(),
            completion: Completion::Reset,
            device: None,
            state: State::Idle,
        }
    }

    /// Override the candidate baud rates
    pub fn with_baud_rates(mut self, rates: &[u32]) -> Self {
        self.baud_rates = rates.to_vec();
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Fetch the flasher state
    pub fn state(&self) -> State {
        self.state
    }

    /// Device matched during the current session
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Return the transport, control lines and delay
    pub fn release(self) -> (T, G, D) {
        let (transport, delay) = self.engine.release();
        (transport, self.control, delay)
    }

    fn transition(&mut self, state: State) {
        info!("State {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn finish<R>(&mut self, r: Result<R, Error<T::Error>>) -> Result<R, Error<T::Error>> {
        match &r {
            Ok(_) => self.transition(State::Done),
            Err(e) => {
                error!("Operation failed in state {:?}: {}", self.state, e);
                self.transition(State::Failed);
                self.engine.end_session();
                self.device = None;
            }
        }
        r
    }

    /// Enter the bootloader and open a session.
    ///
    /// With `unlock` set the session is unlocked for erase, write and go.
    /// The target is identified against the device table.
    pub fn connect(&mut self, crystal_hz: u32, unlock: bool) -> Result<Device, Error<T::Error>> {
        let r = self.open(crystal_hz, unlock);
        if let Err(e) = &r {
            error!("Connection failed in state {:?}: {}", self.state, e);
            self.transition(State::Failed);
            self.engine.end_session();
        }
        r
    }

    fn open(&mut self, crystal_hz: u32, unlock: bool) -> Result<Device, Error<T::Error>> {
        self.device = None;
        self.transition(State::Connecting);

        if !self.engine.options().no_reset {
            self.engine.enter_bootloader(&mut self.control)?;
        }
        self.engine.synchronize(&self.baud_rates, crystal_hz)?;
        self.transition(State::Synchronized);

        if unlock {
            self.engine.unlock(UNLOCK_CODE)?;
            self.engine.set_echo(false)?;
            self.transition(State::Unlocked);
        } else {
            self.engine.set_echo(false)?;
        }

        let part_id = FlashProgrammer::new(&mut self.engine).read_part_id()?;
        let device = self
            .devices
            .lookup(part_id)
            .cloned()
            .ok_or(Error::UnknownPart(part_id))?;

        info!("Connected to {} (part id 0x{:08x})", device.name, part_id);

        let session = self.engine.session_mut()?;
        if session.variant != device.sync {
            warn!(
                "{} expects {:?} synchronisation, target answered {:?}",
                device.name, device.sync, session.variant
            );
        }
        session.ram_buffer = device.ram_buffer;
        self.device = Some(device.clone());

        Ok(device)
    }

    /// Read identification from the connected target
    pub fn identify(&mut self) -> Result<TargetInfo, Error<T::Error>> {
        let mut f = FlashProgrammer::new(&mut self.engine);

        let part_id = f.read_part_id()?;
        let boot_version = f.read_boot_version()?;
        let serial_number = f.read_serial_number()?;

        Ok(TargetInfo {
            part_id,
            boot_version,
            serial_number,
            device: self.devices.lookup(part_id).cloned(),
        })
    }

    /// Erase, program and verify `image`.
    ///
    /// `progress` is called with (bytes done, bytes total) after each page and
    /// cancels the operation by returning false.
    pub fn program<P>(&mut self, image: &FlashImage, crystal_hz: u32, progress: P) -> Result<(), Error<T::Error>>
    where
        P: FnMut(usize, usize) -> bool,
    {
        let r = self.run_program(image, crystal_hz, progress);
        self.finish(r)
    }

    fn run_program<P>(&mut self, image: &FlashImage, crystal_hz: u32, mut progress: P) -> Result<(), Error<T::Error>>
    where
        P: FnMut(usize, usize) -> bool,
    {
        if image.data.is_empty() {
            return Err(Error::InvalidLength(0));
        }
        if image.base_address % COPY_SIZES[0] != 0 {
            return Err(Error::Misaligned(image.base_address));
        }

        let device = self.open(crystal_hz, true)?;
        let page = device.page_size as usize;
        let base = image.base_address;

        if base % device.page_size != 0 {
            return Err(Error::Misaligned(base));
        }

        let mut data = image.data.clone();
        let padded = (data.len() + page - 1) / page * page;
        data.resize(padded, 0xFF);

        if base == 0 && !self.engine.options().no_checksum_patch {
            patch_vector_checksum(&mut data, device.core);
        }

        let range = device
            .sectors_for(base, data.len() as u32)
            .ok_or(Error::OutOfRange {
                start: base,
                end: base.wrapping_add(data.len() as u32),
            })?;

        self.transition(State::Erasing);
        {
            let mut f = FlashProgrammer::new(&mut self.engine).with_device(&device);
            if f.blank_check_sectors(range)? {
                info!("Sectors {} to {} already blank", range.start, range.end);
            } else {
                f.erase_sectors(range)?;
            }
        }

        self.transition(State::Programming);
        let total = image.data.len();
        for (i, chunk) in data.chunks(page).enumerate() {
            let address = base + (i * page) as u32;

            BlockTransferEngine::new(&mut self.engine).write_ram(device.ram_buffer, chunk)?;
            FlashProgrammer::new(&mut self.engine)
                .with_device(&device)
                .copy_ram_to_flash(address, device.ram_buffer, device.page_size)?;

            if !progress(((i + 1) * page).min(total), total) {
                warn!("Programming cancelled at 0x{:08x}", address);
                return Err(Error::Cancelled);
            }
        }

        self.transition(State::Verifying);
        for (i, chunk) in data.chunks(page).enumerate() {
            let address = base + (i * page) as u32;

            let mut b = BlockTransferEngine::new(&mut self.engine);
            b.write_ram(device.ram_buffer, chunk)?;

            if let Some(offset) = b.compare(address, device.ram_buffer, page)? {
                return Err(Error::VerifyFailed {
                    address: address + offset,
                });
            }
        }

        info!("Programmed and verified {} bytes at 0x{:08x}", total, base);

        match self.completion {
            Completion::Reset => self.reset_target()?,
            Completion::Go { address, mode } => {
                self.start_execution(address, mode.unwrap_or_else(|| device.core.exec_mode()))?
            }
            Completion::Stay => {
                self.engine.end_session();
            }
        }

        Ok(())
    }

    /// Read `size` bytes from `base_address`
    pub fn read<P>(&mut self, base_address: u32, size: usize, crystal_hz: u32, progress: P) -> Result<Vec<u8>, Error<T::Error>>
    where
        P: FnMut(usize, usize) -> bool,
    {
        let r = self.run_read(base_address, size, crystal_hz, progress);
        let r = self.finish(r);
        self.engine.end_session();
        r
    }

    fn run_read<P>(&mut self, base: u32, size: usize, crystal_hz: u32, mut progress: P) -> Result<Vec<u8>, Error<T::Error>>
    where
        P: FnMut(usize, usize) -> bool,
    {
        if base % 4 != 0 {
            return Err(Error::Misaligned(base));
        }
        if size == 0 {
            return Err(Error::InvalidLength(0));
        }

        let device = self.open(crystal_hz, false)?;
        let page = device.page_size as usize;

        let mut data = Vec::with_capacity(size + 3);
        while data.len() < size {
            let address = base + data.len() as u32;
            let len = ((size - data.len()).min(page) + 3) / 4 * 4;

            let chunk = BlockTransferEngine::new(&mut self.engine).read_ram(address, len)?;
            data.extend_from_slice(&chunk);

            if !progress(data.len().min(size), size) {
                warn!("Read cancelled at 0x{:08x}", address);
                return Err(Error::Cancelled);
            }
        }
        data.truncate(size);

        Ok(data)
    }

    /// Reset the target into user code
    pub fn reset_target(&mut self) -> Result<(), Error<T::Error>> {
        info!("Resetting target");
        self.engine.reset(&mut self.control, false)
    }

    /// Jump to `address` through the bootloader of the connected target
    pub fn start_execution(&mut self, address: u32, mode: ExecMode) -> Result<(), Error<T::Error>> {
        if self.engine.session().is_none() {
            return Err(Error::NotConnected);
        }
        if self.state != State::Unlocked && self.state != State::Verifying {
            self.engine.unlock(UNLOCK_CODE)?;
        }

        FlashProgrammer::new(&mut self.engine).go(address, mode)
    }
}
