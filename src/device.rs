//! Device capability table.

use crate::protocol::{ExecMode, SyncVariant, COPY_SIZES};

/// CPU core, selects the vector checksum slot and default go mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Core {
    Arm7,
    CortexM,
}

impl Core {
    /// Instruction set user code is entered in
    pub fn exec_mode(&self) -> ExecMode {
        match self {
            Core::Arm7 => ExecMode::Arm,
            Core::CortexM => ExecMode::Thumb,
        }
    }
}

/// Run of equally sized flash sectors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorGroup {
    /// Size of each sector in bytes
    pub size: u32,
    /// Number of sectors in this group
    pub count: u32,
}

impl SectorGroup {
    pub const fn new(size: u32, count: u32) -> Self {
        Self { size, count }
    }
}

/// Inclusive range of sector numbers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectorRange {
    pub start: u32,
    pub end: u32,
}

/// Per part ISP capabilities
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub part_id: u32,
    pub name: &'static str,
    pub core: Core,
    /// Usable flash size in bytes
    pub flash_size: u32,
    pub sectors: &'static [SectorGroup],
    /// RAM staging buffer for writes
    pub ram_buffer: u32,
    pub ram_buffer_size: u32,
    /// Flash write unit used when programming
    pub page_size: u32,
    pub sync: SyncVariant,
}

impl Device {
    pub fn sector_count(&self) -> u32 {
        self.sectors.iter().map(|g| g.count).sum()
    }

    /// Sector holding `address`
    pub fn sector_of(&self, address: u32) -> Option<u32> {
        if address >= self.flash_size {
            return None;
        }

        let mut base = 0u32;
        let mut index = 0u32;
        for g in self.sectors {
            let len = g.size * g.count;
            if address < base + len {
                return Some(index + (address - base) / g.size);
            }
            base += len;
            index += g.count;
        }

        None
    }

    /// Sectors covering `[address, address + len)`
    pub fn sectors_for(&self, address: u32, len: u32) -> Option<SectorRange> {
        if len == 0 {
            return None;
        }
        let last = address.checked_add(len - 1)?;

        Some(SectorRange {
            start: self.sector_of(address)?,
            end: self.sector_of(last)?,
        })
    }

    /// Copy sizes that fit in the staging buffer
    pub fn copy_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        COPY_SIZES.iter().cloned().filter(move |s| *s <= self.ram_buffer_size)
    }

    pub fn supports_copy_size(&self, size: u32) -> bool {
        self.copy_sizes().any(|s| s == size)
    }
}

const LPC11XX_8K: &[SectorGroup] = &[SectorGroup::new(4096, 2)];
const LPC11XX_32K: &[SectorGroup] = &[SectorGroup::new(4096, 8)];
const LPC17XX_128K: &[SectorGroup] = &[SectorGroup::new(4096, 16), SectorGroup::new(32768, 2)];
const LPC17XX_256K: &[SectorGroup] = &[SectorGroup::new(4096, 16), SectorGroup::new(32768, 6)];
const LPC17XX_512K: &[SectorGroup] = &[SectorGroup::new(4096, 16), SectorGroup::new(32768, 14)];
const LPC2XXX_512K: &[SectorGroup] = &[
    SectorGroup::new(4096, 8),
    SectorGroup::new(32768, 14),
    SectorGroup::new(4096, 5),
];

const fn lpc11xx(part_id: u32, name: &'static str, flash_size: u32, sectors: &'static [SectorGroup]) -> Device {
    Device {
        part_id,
        name,
        core: Core::CortexM,
        flash_size,
        sectors,
        ram_buffer: 0x1000_0300,
        ram_buffer_size: 1024,
        page_size: 512,
        sync: SyncVariant::Standard,
    }
}

// 2 KB parts, the ISP stack sits at the top of SRAM
const fn lpc11xx_2k(part_id: u32, name: &'static str, flash_size: u32, sectors: &'static [SectorGroup]) -> Device {
    Device {
        ram_buffer_size: 512,
        ..lpc11xx(part_id, name, flash_size, sectors)
    }
}

const fn lpc17xx(
    part_id: u32,
    name: &'static str,
    flash_size: u32,
    sectors: &'static [SectorGroup],
    sync: SyncVariant,
) -> Device {
    Device {
        part_id,
        name,
        core: Core::CortexM,
        flash_size,
        sectors,
        ram_buffer: 0x1000_0200,
        ram_buffer_size: 4096,
        page_size: 1024,
        sync,
    }
}

const fn lpc2xxx(part_id: u32, name: &'static str) -> Device {
    Device {
        part_id,
        name,
        core: Core::Arm7,
        flash_size: 500 * 1024,
        sectors: LPC2XXX_512K,
        ram_buffer: 0x4000_0200,
        ram_buffer_size: 4096,
        page_size: 1024,
        sync: SyncVariant::Standard,
    }
}

const BUILTIN: &[Device] = &[
    lpc11xx_2k(0x2516_D02B, "LPC1111/102", 8 * 1024, LPC11XX_8K),
    lpc11xx(0x1A40_902B, "LPC1114/302", 32 * 1024, LPC11XX_32K),
    lpc17xx(0x2601_1922, "LPC1764", 128 * 1024, LPC17XX_128K, SyncVariant::Standard),
    lpc17xx(0x2601_3F33, "LPC1766", 256 * 1024, LPC17XX_256K, SyncVariant::Standard),
    lpc17xx(0x2601_3F37, "LPC1768", 512 * 1024, LPC17XX_512K, SyncVariant::Standard),
    lpc17xx(0x2611_3F37, "LPC1769", 512 * 1024, LPC17XX_512K, SyncVariant::Standard),
    lpc17xx(0x2719_3F47, "LPC1778", 512 * 1024, LPC17XX_512K, SyncVariant::Lpc177x8x),
    lpc17xx(0x281D_3F47, "LPC1788", 512 * 1024, LPC17XX_512K, SyncVariant::Lpc177x8x),
    lpc2xxx(0x0002_FF25, "LPC2138"),
    lpc2xxx(0x0402_FF25, "LPC2148"),
];

/// Immutable part ID lookup
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Table of the parts known to this crate
    pub fn builtin() -> Self {
        Self::new(BUILTIN.to_vec())
    }

    pub fn lookup(&self, part_id: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.part_id == part_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::builtin()
    }
}
