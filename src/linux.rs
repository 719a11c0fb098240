use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::sysfs_gpio::{Direction, Error as GpioError};
use linux_embedded_hal::{Delay, Serial, SysfsPin};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{PinControl, SerialPort, SerialTransport};

impl SerialPort<IoErrorKind> for Serial {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(|e| {
            error!("Failed to read serial settings: {:?}", e);
            IoErrorKind::Other
        })?;

        settings
            .set_baud_rate(BaudRate::from_speed(baud as usize))
            .map_err(|_| IoErrorKind::InvalidInput)?;

        self.0.write_settings(&settings).map_err(|e| {
            error!("Failed to apply {} baud: {:?}", baud, e);
            IoErrorKind::Other
        })
    }
}

impl SerialTransport<Serial, Delay, IoErrorKind> {
    /// Open a linux serial port configured for the LPC bootloader (8N1)
    pub fn linux<P: AsRef<Path>>(port: P, baud: u32, poll_delay_ms: u32) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud as usize))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads must not block, the polling loop owns the response timeout
        port.0.set_timeout(Duration::from_millis(0))?;

        // Return instance
        Ok(Self::new(port, Delay {}, poll_delay_ms))
    }
}

fn output(num: u64) -> Result<SysfsPin, GpioError> {
    let pin = SysfsPin::new(num);
    pin.export()?;
    pin.set_direction(Direction::High)?;
    Ok(pin)
}

impl PinControl<SysfsPin, SysfsPin> {
    /// Drive RESET and ISP from sysfs GPIO numbers, idle (released) high
    pub fn sysfs(reset: u64, isp: u64) -> Result<Self, GpioError> {
        Ok(Self::new(output(reset)?, output(isp)?))
    }
}
