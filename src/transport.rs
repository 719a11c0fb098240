//! Transport and target control abstractions.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

/// Failure to receive data
#[derive(Clone, PartialEq, Debug)]
pub enum ReadError<E> {
    /// Nothing (or not enough) received before the timeout expired
    Timeout,
    /// Underlying I/O error
    Io(E),
}

/// Byte transport to the bootloader
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Write bytes to the target
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read a single line, including the line terminator
    fn read_line(&mut self, timeout_ms: u32) -> Result<String, ReadError<Self::Error>>;

    /// Read exactly `n` bytes
    fn read_exact(&mut self, n: usize, timeout_ms: u32) -> Result<Vec<u8>, ReadError<Self::Error>>;

    /// Discard any bytes already received
    fn clear_input(&mut self) -> Result<(), Self::Error>;

    /// Reconfigure the link baud rate
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Self::Error>;
}

/// Control over the target RESET and ISP request lines.
///
/// `true` means asserted, independent of the electrical polarity.
pub trait GpioControl {
    type Error: core::fmt::Debug;

    fn set_reset(&mut self, asserted: bool) -> Result<(), Self::Error>;

    fn set_isp_request(&mut self, asserted: bool) -> Result<(), Self::Error>;
}

/// Serial port with a runtime configurable baud rate
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), E>;
}

/// Line transport over a non-blocking embedded-hal serial port.
///
/// Reads are polled with a delay between attempts until the timeout expires.
pub struct SerialTransport<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> SerialTransport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
            _err: PhantomData,
        }
    }

    /// Return the underlying port
    pub fn into_inner(self) -> P {
        self.port
    }

    fn read_byte(&mut self, timeout_ms: u32, elapsed: &mut u32) -> Result<u8, ReadError<E>> {
        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(ReadError::Io(e)),
                Ok(v) => return Ok(v),
            };

            self.delay.delay_ms(self.poll_delay_ms);
            *elapsed += self.poll_delay_ms;

            if *elapsed > timeout_ms {
                return Err(ReadError::Timeout);
            }
        }
    }
}

impl<P, D, E> Transport for SerialTransport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn write(&mut self, data: &[u8]) -> Result<(), E> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())
    }

    fn read_line(&mut self, timeout_ms: u32) -> Result<String, ReadError<E>> {
        let mut elapsed = 0;
        let mut line = Vec::new();

        loop {
            let b = self.read_byte(timeout_ms, &mut elapsed)?;
            line.push(b);
            if b == b'\n' {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn read_exact(&mut self, n: usize, timeout_ms: u32) -> Result<Vec<u8>, ReadError<E>> {
        let mut elapsed = 0;
        let mut data = Vec::with_capacity(n);

        while data.len() < n {
            data.push(self.read_byte(timeout_ms, &mut elapsed)?);
        }

        Ok(data)
    }

    fn clear_input(&mut self) -> Result<(), E> {
        let mut discarded = 0;
        loop {
            match self.port.read() {
                Ok(_) => discarded += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }

        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), E> {
        self.port.set_baud_rate(baud)
    }
}

/// RESET / ISP lines driven by a pair of output pins
pub struct PinControl<R, I> {
    reset: R,
    isp: I,
    active_low: bool,
}

impl<R, I, E> PinControl<R, I>
where
    R: OutputPin<Error = E>,
    I: OutputPin<Error = E>,
{
    /// Create pin control for active-low lines (the LPC default)
    pub fn new(reset: R, isp: I) -> Self {
        Self {
            reset,
            isp,
            active_low: true,
        }
    }

    /// Treat both lines as active-high, for inverting level shifters
    pub fn active_high(mut self) -> Self {
        self.active_low = false;
        self
    }

    pub fn release(self) -> (R, I) {
        (self.reset, self.isp)
    }

    fn drive<P: OutputPin<Error = E>>(pin: &mut P, asserted: bool, active_low: bool) -> Result<(), E> {
        if asserted == active_low {
            pin.set_low()
        } else {
            pin.set_high()
        }
    }
}

impl<R, I, E> GpioControl for PinControl<R, I>
where
    R: OutputPin<Error = E>,
    I: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn set_reset(&mut self, asserted: bool) -> Result<(), E> {
        Self::drive(&mut self.reset, asserted, self.active_low)
    }

    fn set_isp_request(&mut self, asserted: bool) -> Result<(), E> {
        Self::drive(&mut self.isp, asserted, self.active_low)
    }
}

/// No control lines, the target is put into ISP mode by hand
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualControl;

impl GpioControl for ManualControl {
    type Error = core::convert::Infallible;

    fn set_reset(&mut self, asserted: bool) -> Result<(), Self::Error> {
        if asserted {
            info!("No reset line configured, reset the target manually");
        }
        Ok(())
    }

    fn set_isp_request(&mut self, _asserted: bool) -> Result<(), Self::Error> {
        Ok(())
    }
}
