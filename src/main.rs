#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::Delay;

use lpc_isp::protocol::BAUD_RATES;
use lpc_isp::{
    Completion, DeviceTable, ExecMode, FlashImage, GpioControl, ImageFlasher, ManualControl, Options, PinControl,
    SerialTransport,
};

fn parse_num(src: &str) -> Result<u32, std::num::ParseIntError> {
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => src.parse(),
    }
}

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Candidate baud rates, tried fastest first
    #[structopt(long, use_delimiter = true)]
    baud: Vec<u32>,

    /// Target crystal frequency in kHz
    #[structopt(long, default_value = "12000")]
    crystal_khz: u32,

    /// sysfs GPIO driving the target RESET line (manual reset if unset)
    #[structopt(long, requires = "isp-pin")]
    reset_pin: Option<u64>,

    /// sysfs GPIO driving the target ISP request line
    #[structopt(long, requires = "reset-pin")]
    isp_pin: Option<u64>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Erase, program and verify a raw binary image
    Program {
        /// Binary image file
        file: String,

        /// Flash address to write the image to
        #[structopt(long, default_value = "0", parse(try_from_str = parse_num))]
        address: u32,

        /// Jump to this address once programmed instead of resetting
        #[structopt(long, parse(try_from_str = parse_num))]
        go: Option<u32>,

        /// Leave the target in the bootloader once programmed
        #[structopt(long, conflicts_with = "go")]
        stay: bool,
    },
    /// Read target memory to a file
    Read {
        /// Output file
        file: String,

        #[structopt(long, default_value = "0", parse(try_from_str = parse_num))]
        address: u32,

        #[structopt(long, parse(try_from_str = parse_num))]
        size: u32,
    },
    /// Show part identification
    Info,
    /// Start execution at an address
    Go {
        #[structopt(parse(try_from_str = parse_num))]
        address: u32,

        /// Execute in ARM mode, otherwise the mode follows the part's core
        #[structopt(long)]
        arm: bool,
    },
    /// Reset the target into user code
    Reset,
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("#>-"),
    );
    pb
}

fn run<G: GpioControl>(o: Args, control: G) -> Result<()> {
    let transport = SerialTransport::linux(&o.port, BAUD_RATES[0], o.options.poll_delay_ms)
        .map_err(|e| anyhow!("Error connecting to serial port: {:?}", e))?;

    let rates = if o.baud.is_empty() { BAUD_RATES.to_vec() } else { o.baud.clone() };
    let crystal_hz = o.crystal_khz * 1000;

    let mut flasher = ImageFlasher::new(transport, control, Delay {}, DeviceTable::builtin(), o.options.clone())
        .with_baud_rates(&rates);

    match o.command {
        Operation::Program { file, address, go, stay } => {
            let data = std::fs::read(&file).with_context(|| format!("Failed to read firmware file '{}'", file))?;
            info!("Programming {} ({}) at 0x{:08x}", file, bytefmt::format(data.len() as u64), address);

            let completion = match (go, stay) {
                (Some(address), _) => Completion::Go { address, mode: None },
                (None, true) => Completion::Stay,
                (None, false) => Completion::Reset,
            };
            let mut flasher = flasher.with_completion(completion);

            let pb = progress_bar(data.len());
            let image = FlashImage::new(address, data);
            let r = flasher.program(&image, crystal_hz, |done, _total| {
                pb.set_position(done as u64);
                true
            });
            pb.finish();

            r.map_err(|e| anyhow!("Programming failed: {}", e))?;
            info!("Programming complete");
        }
        Operation::Read { file, address, size } => {
            let pb = progress_bar(size as usize);
            let r = flasher.read(address, size as usize, crystal_hz, |done, _total| {
                pb.set_position(done as u64);
                true
            });
            pb.finish();

            let data = r.map_err(|e| anyhow!("Read failed: {}", e))?;
            std::fs::write(&file, &data).with_context(|| format!("Failed to write '{}'", file))?;
            info!("Read {} to {}", bytefmt::format(data.len() as u64), file);
        }
        Operation::Info => {
            flasher
                .connect(crystal_hz, false)
                .map_err(|e| anyhow!("Error connecting to bootloader: {}", e))?;
            let info = flasher.identify().map_err(|e| anyhow!("Error reading part info: {}", e))?;

            let serial: Vec<u8> = info.serial_number.iter().flat_map(|w| w.to_be_bytes().to_vec()).collect();

            info!("Part ID: 0x{:08x}", info.part_id);
            match &info.device {
                Some(d) => info!("Device: {} ({} flash)", d.name, bytefmt::format(d.flash_size as u64)),
                None => warn!("Device: unknown"),
            }
            info!("Boot code version: {}.{}", info.boot_version.0, info.boot_version.1);
            info!("Serial number: {}", hex::encode(serial));
        }
        Operation::Go { address, arm } => {
            let device = flasher
                .connect(crystal_hz, true)
                .map_err(|e| anyhow!("Error connecting to bootloader: {}", e))?;

            let mode = if arm { ExecMode::Arm } else { device.core.exec_mode() };
            flasher
                .start_execution(address, mode)
                .map_err(|e| anyhow!("Error starting execution: {}", e))?;
        }
        Operation::Reset => {
            flasher.reset_target().map_err(|e| anyhow!("Error resetting target: {}", e))?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    match (o.reset_pin, o.isp_pin) {
        (Some(reset), Some(isp)) => {
            let control = PinControl::sysfs(reset, isp).context("Error configuring control GPIOs")?;
            run(o, control)
        }
        _ => run(o, ManualControl),
    }
}
