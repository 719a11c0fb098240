//! Simulated LPC boot ROM for tests.

use std::collections::VecDeque;
use std::io::ErrorKind;

use crate::block::{checksum, decode_line, encode_line};
use crate::device::Device;
use crate::protocol::{Encoding, SyncVariant, COPY_SIZES, LINE_END, OK, RESEND, SYNC_WORD, UNLOCK_CODE};
use crate::transport::{ReadError, Transport};

pub const RAM_BASE: u32 = 0x1000_0000;
const RAM_SIZE: usize = 0x2000;

#[derive(Debug, PartialEq)]
enum Phase {
    Autobaud,
    SyncEcho,
    Crystal,
    Command,
    Write { address: u32, total: usize, done: usize, pending: Vec<u8> },
    Read { address: u32, total: usize, done: usize },
    Running,
}

pub struct MockTarget {
    pub device: Device,
    pub part_id: u32,
    pub variant: SyncVariant,
    pub encoding: Encoding,
    /// Baud rate the target answers autobaud at
    pub respond_at: Option<u32>,
    /// Suppress all output
    pub mute: bool,
    /// Garbage sent in reply to an autobaud request at a given rate
    pub noise: Option<(u32, Vec<u8>)>,
    /// Write group indices to reject once each
    pub corrupt_write_groups: Vec<usize>,
    /// Read group indices to send a bad checksum for, once each
    pub corrupt_read_groups: Vec<usize>,
    pub compare_mismatch: bool,

    /// Baud rate at each autobaud request
    pub sync_attempts: Vec<u32>,
    pub crystal_khz: Option<u32>,
    /// Commands received after synchronisation
    pub log: Vec<String>,
    /// Offset of each write group checksum received
    pub group_offsets: Vec<usize>,
    pub resend_requests: usize,
    pub running: bool,

    flash: Vec<u8>,
    ram: Vec<u8>,
    baud: u32,
    phase: Phase,
    echo: bool,
    unlocked: bool,
    prepared: Option<(u32, u32)>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl MockTarget {
    pub fn new(device: Device, respond_at: Option<u32>) -> Self {
        Self {
            part_id: device.part_id,
            variant: SyncVariant::Standard,
            encoding: Encoding::Uuencode,
            respond_at,
            mute: false,
            noise: None,
            corrupt_write_groups: vec![],
            corrupt_read_groups: vec![],
            compare_mismatch: false,
            sync_attempts: vec![],
            crystal_khz: None,
            log: vec![],
            group_offsets: vec![],
            resend_requests: 0,
            running: false,
            flash: vec![0xFF; device.flash_size as usize],
            ram: vec![0; RAM_SIZE],
            baud: 0,
            phase: Phase::Autobaud,
            echo: false,
            unlocked: false,
            prepared: None,
            rx: vec![],
            tx: VecDeque::new(),
            device,
        }
    }

    fn mem(&mut self, address: u32) -> Option<&mut u8> {
        if address >= RAM_BASE {
            self.ram.get_mut((address - RAM_BASE) as usize)
        } else {
            self.flash.get_mut(address as usize)
        }
    }

    pub fn write_mem(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            if let Some(m) = self.mem(address + i as u32) {
                *m = *b;
            }
        }
    }

    pub fn read_mem(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                let a = address + i;
                if a >= RAM_BASE {
                    self.ram[(a - RAM_BASE) as usize]
                } else {
                    self.flash[a as usize]
                }
            })
            .collect()
    }

    fn push(&mut self, line: &str) {
        if !self.mute {
            self.tx.extend(line.as_bytes());
            self.tx.extend(LINE_END.as_bytes());
        }
    }

    fn push_code(&mut self, code: u32) {
        self.push(&code.to_string());
    }

    fn sector_base(&self, sector: u32) -> u32 {
        let mut base = 0;
        let mut index = 0;
        for g in self.device.sectors {
            if sector < index + g.count {
                return base + (sector - index) * g.size;
            }
            base += g.size * g.count;
            index += g.count;
        }
        base
    }

    fn sector_span(&self, start: u32, end: u32) -> (usize, usize) {
        (self.sector_base(start) as usize, self.sector_base(end + 1) as usize)
    }

    fn valid_sectors(&self, start: u32, end: u32) -> bool {
        start <= end && end < self.device.sector_count()
    }

    fn is_prepared(&self, start: u32, end: u32) -> bool {
        matches!(self.prepared, Some((s, e)) if s <= start && end <= e)
    }

    fn push_read_group(&mut self, address: u32, total: usize, done: usize) {
        let len = (total - done).min(self.encoding.group_size());
        let data = self.read_mem(address + done as u32, len);

        for line in data.chunks(self.encoding.bytes_per_line()) {
            let l = encode_line(self.encoding, line);
            self.push(&l);
        }

        let index = done / self.encoding.group_size();
        let mut sum = checksum(&data);
        if let Some(i) = self.corrupt_read_groups.iter().position(|g| *g == index) {
            self.corrupt_read_groups.remove(i);
            sum = sum.wrapping_add(1);
        }
        self.push(&sum.to_string());
    }

    fn handle_line(&mut self, line: String) {
        let phase = std::mem::replace(&mut self.phase, Phase::Running);

        match phase {
            Phase::SyncEcho => {
                if line == SYNC_WORD {
                    if self.variant == SyncVariant::Standard {
                        self.push(SYNC_WORD);
                    }
                    self.push(OK);
                    self.phase = Phase::Crystal;
                } else {
                    self.phase = Phase::Autobaud;
                }
            }
            Phase::Crystal => {
                self.crystal_khz = line.parse().ok();
                if self.variant == SyncVariant::Standard {
                    self.push(&line);
                }
                self.push(OK);
                self.echo = true;
                self.phase = Phase::Command;
            }
            Phase::Command => {
                if self.echo {
                    self.push(&line);
                }
                self.log.push(line.clone());
                self.phase = Phase::Command;
                self.command(&line);
            }
            Phase::Write { address, total, mut done, mut pending } => {
                if self.echo {
                    self.push(&line);
                }

                let group = (total - done).min(self.encoding.group_size());
                if pending.len() < group {
                    if let Some(d) = decode_line(self.encoding, &line) {
                        pending.extend_from_slice(&d);
                    }
                    self.phase = Phase::Write { address, total, done, pending };
                    return;
                }

                self.group_offsets.push(done);
                let index = done / self.encoding.group_size();
                let sum: Option<u32> = line.parse().ok();

                let inject = self.corrupt_write_groups.iter().position(|g| *g == index);
                if let Some(i) = inject {
                    self.corrupt_write_groups.remove(i);
                    self.push(RESEND);
                } else if sum == Some(checksum(&pending)) {
                    self.write_mem(address + done as u32, &pending);
                    done += pending.len();
                    self.push(OK);
                } else {
                    self.push(RESEND);
                }

                pending.clear();
                self.phase = if done == total {
                    Phase::Command
                } else {
                    Phase::Write { address, total, done, pending }
                };
            }
            Phase::Read { address, total, mut done } => {
                if self.echo {
                    self.push(&line);
                }

                if line == OK {
                    done += (total - done).min(self.encoding.group_size());
                } else {
                    self.resend_requests += 1;
                }

                if done == total {
                    self.phase = Phase::Command;
                } else {
                    self.push_read_group(address, total, done);
                    self.phase = Phase::Read { address, total, done };
                }
            }
            other => self.phase = other,
        }
    }

    fn command(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let args: Vec<u32> = parts.filter_map(|a| a.parse().ok()).collect();
        let arg = |i: usize| args.get(i).cloned().unwrap_or(0);

        match verb {
            "U" => {
                if arg(0) == UNLOCK_CODE {
                    self.unlocked = true;
                    self.push_code(0);
                } else {
                    self.push_code(16);
                }
            }
            "A" => {
                self.push_code(0);
                self.echo = arg(0) == 1;
            }
            "J" => {
                self.push_code(0);
                self.push(&self.part_id.to_string());
            }
            "K" => {
                self.push_code(0);
                self.push("1");
                self.push("7");
            }
            "N" => {
                self.push_code(0);
                for s in &["1", "2", "3", "4"] {
                    self.push(s);
                }
            }
            "W" => {
                let (address, total) = (arg(0), arg(1) as usize);
                if address % 4 != 0 || address < RAM_BASE {
                    self.push_code(3);
                } else if total % 4 != 0 {
                    self.push_code(6);
                } else {
                    self.push_code(0);
                    self.phase = Phase::Write { address, total, done: 0, pending: vec![] };
                }
            }
            "R" => {
                let (address, total) = (arg(0), arg(1) as usize);
                if address % 4 != 0 {
                    self.push_code(2);
                } else if total % 4 != 0 {
                    self.push_code(6);
                } else {
                    self.push_code(0);
                    self.push_read_group(address, total, 0);
                    self.phase = Phase::Read { address, total, done: 0 };
                }
            }
            "P" => {
                if self.valid_sectors(arg(0), arg(1)) {
                    self.prepared = Some((arg(0), arg(1)));
                    self.push_code(0);
                } else {
                    self.push_code(7);
                }
            }
            "E" => {
                if !self.unlocked {
                    self.push_code(15);
                } else if !self.valid_sectors(arg(0), arg(1)) {
                    self.push_code(7);
                } else if !self.is_prepared(arg(0), arg(1)) {
                    self.push_code(9);
                } else {
                    let (s, e) = self.sector_span(arg(0), arg(1));
                    for b in &mut self.flash[s..e] {
                        *b = 0xFF;
                    }
                    self.prepared = None;
                    self.push_code(0);
                }
            }
            "I" => {
                if !self.valid_sectors(arg(0), arg(1)) {
                    self.push_code(7);
                    return;
                }

                let (s, e) = self.sector_span(arg(0), arg(1));
                match self.flash[s..e].iter().position(|b| *b != 0xFF) {
                    None => self.push_code(0),
                    Some(offset) => {
                        let w = offset & !3;
                        let value = u32::from_le_bytes([
                            self.flash[s + w],
                            self.flash[s + w + 1],
                            self.flash[s + w + 2],
                            self.flash[s + w + 3],
                        ]);
                        self.push_code(8);
                        self.push(&w.to_string());
                        self.push(&value.to_string());
                    }
                }
            }
            "C" => {
                let (dst, src, len) = (arg(0), arg(1), arg(2));
                if !self.unlocked {
                    self.push_code(15);
                } else if !COPY_SIZES.contains(&len) {
                    self.push_code(6);
                } else {
                    let first = self.device.sector_of(dst);
                    let last = self.device.sector_of(dst + len - 1);
                    match (first, last) {
                        (Some(s), Some(e)) if self.is_prepared(s, e) => {
                            let data = self.read_mem(src, len as usize);
                            self.write_mem(dst, &data);
                            self.prepared = None;
                            self.push_code(0);
                        }
                        (Some(_), Some(_)) => self.push_code(9),
                        _ => self.push_code(3),
                    }
                }
            }
            "M" => {
                let (a, b, len) = (arg(0), arg(1), arg(2) as usize);
                let offset = if self.compare_mismatch {
                    Some(0)
                } else {
                    let x = self.read_mem(a, len);
                    let y = self.read_mem(b, len);
                    x.iter().zip(y.iter()).position(|(p, q)| p != q)
                };

                match offset {
                    None => self.push_code(0),
                    Some(o) => {
                        self.push_code(10);
                        self.push(&o.to_string());
                    }
                }
            }
            "G" => {
                if !self.unlocked {
                    self.push_code(15);
                } else {
                    self.push_code(0);
                    self.running = true;
                    self.phase = Phase::Running;
                }
            }
            _ => self.push_code(1),
        }
    }

    fn pop_line(&mut self) -> Option<String> {
        let end = self.tx.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.tx.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Transport for MockTarget {
    type Error = ErrorKind;

    fn write(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        for b in data {
            if self.phase == Phase::Autobaud {
                if *b == b'?' {
                    self.sync_attempts.push(self.baud);
                    if let Some((baud, noise)) = &self.noise {
                        if *baud == self.baud {
                            self.tx.extend(noise.iter());
                        }
                    }
                    if self.respond_at == Some(self.baud) {
                        self.push(SYNC_WORD);
                        self.phase = Phase::SyncEcho;
                    }
                }
                continue;
            }

            if *b == b'\n' {
                let line = String::from_utf8_lossy(&self.rx).trim_end_matches('\r').to_string();
                self.rx.clear();
                self.handle_line(line);
            } else {
                self.rx.push(*b);
            }
        }
        Ok(())
    }

    fn read_line(&mut self, _timeout_ms: u32) -> Result<String, ReadError<ErrorKind>> {
        self.pop_line().ok_or(ReadError::Timeout)
    }

    fn read_exact(&mut self, n: usize, _timeout_ms: u32) -> Result<Vec<u8>, ReadError<ErrorKind>> {
        if self.tx.len() < n {
            self.tx.clear();
            return Err(ReadError::Timeout);
        }
        Ok(self.tx.drain(..n).collect())
    }

    fn clear_input(&mut self) -> Result<(), ErrorKind> {
        self.tx.clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ErrorKind> {
        self.baud = baud;
        Ok(())
    }
}
