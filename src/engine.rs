//! Line protocol engine: command / response exchange and bootloader entry.

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Command, Request, ReturnCode, Session, SyncVariant, LINE_END, OK, SYNC_REQUEST, SYNC_WORD};
use crate::transport::{GpioControl, Transport};
use crate::{Error, Options};

/// Command / response engine for one serial link.
///
/// Holds the [`Session`] once [`LineProtocolEngine::synchronize`] has succeeded.
pub struct LineProtocolEngine<T, D> {
    transport: T,
    delay: D,
    options: Options,
    session: Option<Session>,
}

fn gpio<E: core::fmt::Debug, SE>(r: Result<(), E>) -> Result<(), Error<SE>> {
    r.map_err(|e| {
        error!("Target control error: {:?}", e);
        Error::Gpio
    })
}

impl<T, D> LineProtocolEngine<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(transport: T, delay: D, options: Options) -> Self {
        Self {
            transport,
            delay,
            options,
            session: None,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Current session, if synchronised
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut Session, Error<T::Error>> {
        self.session.as_mut().ok_or(Error::NotConnected)
    }

    /// Drop the current session, further commands require resynchronising
    pub fn end_session(&mut self) -> Option<Session> {
        self.session.take()
    }

    pub fn release(self) -> (T, D) {
        (self.transport, self.delay)
    }

    /// Pulse RESET with the ISP request line held at `bootloader`
    pub fn reset<G: GpioControl>(&mut self, control: &mut G, bootloader: bool) -> Result<(), Error<T::Error>> {
        debug!("Resetting target (bootloader: {})", bootloader);

        self.session = None;

        gpio(control.set_isp_request(bootloader))?;
        gpio(control.set_reset(true))?;

        self.delay.delay_ms(self.options.reset_delay_ms);

        gpio(control.set_reset(false))?;

        self.delay.delay_ms(self.options.init_delay_ms);

        // ISP request is only sampled on reset
        if bootloader {
            gpio(control.set_isp_request(false))?;
        }

        Ok(())
    }

    /// Force the target into the boot ROM ISP handler
    pub fn enter_bootloader<G: GpioControl>(&mut self, control: &mut G) -> Result<(), Error<T::Error>> {
        self.reset(control, true)
    }

    /// Autobaud against the bootloader, trying `rates` fastest first.
    pub fn synchronize(&mut self, rates: &[u32], crystal_hz: u32) -> Result<Session, Error<T::Error>> {
        let mut candidates = rates.to_vec();
        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates.dedup();

        for baud in candidates {
            debug!("Attempting synchronisation at {} baud", baud);

            self.transport.set_baud_rate(baud).map_err(Error::Serial)?;
            self.delay.delay_ms(self.options.settle_delay_ms);

            if !self.autobaud()? {
                continue;
            }

            let variant = self.handshake(crystal_hz)?;
            let session = Session {
                echo: true,
                crystal_hz,
                baud,
                ram_buffer: 0,
                variant,
                encoding: self.options.encoding(),
            };

            info!("Synchronised at {} baud ({:?})", baud, variant);

            self.session = Some(session.clone());
            return Ok(session);
        }

        error!("No bootloader response at any baud rate");
        Err(Error::SyncFailed)
    }

    fn autobaud(&mut self) -> Result<bool, Error<T::Error>> {
        // Output at a wrong rate decodes as noise and must not prefix the reply
        self.transport.clear_input().map_err(Error::Serial)?;
        self.transport.write(SYNC_REQUEST.as_bytes()).map_err(Error::Serial)?;

        let expected = format!("{}{}", SYNC_WORD, LINE_END);
        match self.transport.read_exact(expected.len(), self.options.sync_timeout_ms) {
            Ok(r) if r == expected.as_bytes() => Ok(true),
            Ok(r) => {
                debug!("Unexpected autobaud response: {:02x?}", r);
                Ok(false)
            }
            Err(crate::ReadError::Timeout) => Ok(false),
            Err(crate::ReadError::Io(e)) => Err(Error::Serial(e)),
        }
    }

    fn handshake(&mut self, crystal_hz: u32) -> Result<SyncVariant, Error<T::Error>> {
        self.write_raw(SYNC_WORD)?;

        let first = self.read_response()?;
        let mut variant = if first == SYNC_WORD {
            self.expect(OK)?;
            SyncVariant::Standard
        } else if first == OK {
            SyncVariant::Lpc177x8x
        } else {
            return Err(Error::InvalidResponse(first));
        };

        if self.options.lpc177x_8x {
            variant = SyncVariant::Lpc177x8x;
        }

        let khz = (crystal_hz / 1000).to_string();
        self.write_raw(&khz)?;

        let line = self.read_response()?;
        let line = if line == khz { self.read_response()? } else { line };
        if line != OK {
            return Err(Error::InvalidResponse(line));
        }

        if variant == SyncVariant::Lpc177x8x {
            self.delay.delay_ms(self.options.settle_delay_ms);
        }

        Ok(variant)
    }

    fn write_raw(&mut self, line: &str) -> Result<(), Error<T::Error>> {
        debug!("> {}", line);

        let data = format!("{}{}", line, LINE_END);
        self.transport.write(data.as_bytes()).map_err(Error::Serial)
    }

    /// Write a line, discarding the echoed copy when echo is enabled
    pub fn write_line(&mut self, line: &str) -> Result<(), Error<T::Error>> {
        self.write_raw(line)?;

        if self.session.as_ref().map(|s| s.echo).unwrap_or(false) {
            let echo = self.read_response()?;
            if echo != line {
                warn!("Echo mismatch, sent '{}' received '{}'", line, echo);
            }
        }

        Ok(())
    }

    /// Read the next non-empty response line, without terminator
    pub fn read_response(&mut self) -> Result<String, Error<T::Error>> {
        loop {
            let line = self.transport.read_line(self.options.response_timeout_ms)?;
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

            if !line.is_empty() {
                debug!("< {}", line);
                return Ok(line.to_string());
            }
        }
    }

    fn expect(&mut self, expected: &str) -> Result<(), Error<T::Error>> {
        let line = self.read_response()?;
        if line != expected {
            return Err(Error::InvalidResponse(line));
        }
        Ok(())
    }

    /// Read a response line holding a single decimal value
    pub fn read_value(&mut self) -> Result<u32, Error<T::Error>> {
        let line = self.read_response()?;
        line.trim().parse().map_err(|_| Error::InvalidResponse(line))
    }

    /// Issue a command and return the decoded status
    pub fn send_command(&mut self, request: &Request) -> Result<ReturnCode, Error<T::Error>> {
        if self.session.is_none() {
            return Err(Error::NotConnected);
        }

        self.write_line(&request.to_string())?;

        let line = self.read_response()?;
        match ReturnCode::parse(&line) {
            Some(code) => Ok(code),
            None => Err(Error::InvalidResponse(line)),
        }
    }

    /// Issue a command, failing on any non-zero status
    pub fn command(&mut self, request: &Request) -> Result<(), Error<T::Error>> {
        match self.send_command(request)? {
            ReturnCode::Success => Ok(()),
            code => {
                error!("Command '{}' failed: {:?}", request, code);
                Err(Error::from_code(request.command, code))
            }
        }
    }

    /// Unlock flash write, erase and go commands
    pub fn unlock(&mut self, code: u32) -> Result<(), Error<T::Error>> {
        self.command(&Request::new(Command::Unlock).arg(code))
    }

    /// Enable or disable bootloader echo
    pub fn set_echo(&mut self, enabled: bool) -> Result<(), Error<T::Error>> {
        self.command(&Request::new(Command::Echo).arg(enabled as u32))?;
        self.session_mut()?.echo = enabled;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
