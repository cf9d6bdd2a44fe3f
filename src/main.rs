use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use psmctl::device::DeviceDb;
use psmctl::pmbus::{PageMode, PmBus, Supervision};
use psmctl::smbus::SmBus;
use psmctl::topology::Topology;
use psmctl::transport::{Bridge, SerialTransport};
use psmctl::update::{Mode, Processor};

type Board = PmBus<Bridge<SerialTransport>>;

#[derive(Parser)]
#[command(
    name = "psmctl",
    version,
    about = "Power system management over PMBus: detect rails, read telemetry, update NVM"
)]
struct Cli {
    /// Serial port of the I2C bridge, the first port found if omitted
    #[arg(long, global = true)]
    port: Option<String>,
    #[arg(long, global = true, default_value_t = psmctl::transport::DEFAULT_BAUDRATE)]
    baud: u32,
    /// Bus clock in Hz
    #[arg(long, global = true)]
    speed: Option<u32>,
    /// Frame every transaction with a Packet Error Code
    #[arg(long, global = true)]
    pec: bool,
    /// Alternative device registry (YAML)
    #[arg(long, global = true)]
    devices: Option<PathBuf>,
    /// More output, repeat for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices and the rails they drive
    Detect,
    /// Read every rail
    Telemetry,
    /// Report addresses that do not answer or have corrupt NVM
    Bricks {
        #[arg(required = true, value_parser = parse_address)]
        addresses: Vec<u8>,
    },
    /// Program devices from an update image
    Program { path: PathBuf },
    /// Check devices against an update image without changing them
    Verify { path: PathBuf },
    /// Decode an update image without touching the bus
    Inspect { path: PathBuf },
    /// Store RAM to NVM on every device
    Store,
    /// Restore RAM from NVM on every device
    Restore,
    /// Clear faults on every device
    ClearFaults,
    /// Margin every rail
    Margin {
        #[arg(value_enum)]
        level: MarginLevel,
    },
    /// Change an output voltage, moving margins and limits along
    SetVout {
        #[arg(value_parser = parse_address)]
        address: u8,
        volts: f32,
        #[arg(long)]
        page: Option<u8>,
        /// Margin as a fraction of the set point
        #[arg(long, default_value_t = 0.05)]
        margin: f32,
        #[arg(long, default_value_t = 0.075)]
        warn: f32,
        #[arg(long, default_value_t = 0.10)]
        fault: f32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MarginLevel {
    High,
    Low,
    Off,
}

fn parse_address(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(address) if address < 0x80 => Ok(address),
        Ok(address) => Err(format!("0x{:02x} is not a 7-bit address", address)),
        Err(e) => Err(e.to_string()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => simplelog::LevelFilter::Warn,
        (false, 0) => simplelog::LevelFilter::Info,
        (false, 1) => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Command::Inspect { path } = &cli.command {
        return inspect(path);
    }

    let mut pmbus = open(&cli)?;
    match cli.command {
        Command::Detect => {
            let topology = Topology::detect(&mut pmbus)?;
            for device in topology.devices() {
                println!("0x{:02x} {}", device.address(), device.info());
            }
            for rail in topology.rails() {
                println!("{}", rail);
            }
        }
        Command::Telemetry => telemetry(&mut pmbus)?,
        Command::Bricks { addresses } => {
            let bricked = pmbus.bricks(&addresses)?;
            if bricked.is_empty() {
                log::info!("All {} devices healthy", addresses.len());
            }
            for address in bricked {
                println!("0x{:02x}", address);
            }
        }
        Command::Program { path } => update(&mut pmbus, &path, Mode::Program)?,
        Command::Verify { path } => update(&mut pmbus, &path, Mode::Verify)?,
        Command::Inspect { path } => inspect(&path)?,
        Command::Store => pmbus.store_global()?,
        Command::Restore => pmbus.restore_global()?,
        Command::ClearFaults => pmbus.clear_faults_global()?,
        Command::Margin { level } => match level {
            MarginLevel::High => pmbus.margin_high_global()?,
            MarginLevel::Low => pmbus.margin_low_global()?,
            MarginLevel::Off => pmbus.margin_off_global()?,
        },
        Command::SetVout {
            address,
            volts,
            page,
            margin,
            warn,
            fault,
        } => {
            anyhow::ensure!(volts > 0.0, "output voltage must be positive");
            anyhow::ensure!(
                margin < warn && warn < fault && fault < 1.0,
                "expected margin < warn < fault < 1"
            );
            let mode = page.map_or(PageMode::Current, PageMode::Select);
            pmbus
                .set_vout_with_supervision(address, mode, volts, Supervision { margin, warn, fault })
                .with_context(|| format!("setting VOUT of 0x{:02x}", address))?;
            log::info!("0x{:02x} set to {:.4} V", address, volts);
        }
    }

    Ok(())
}

fn open(cli: &Cli) -> Result<Board> {
    let transport = match &cli.port {
        Some(port) => SerialTransport::open(port, cli.baud),
        None => SerialTransport::open_any(cli.baud),
    }
    .context("opening the I2C bridge")?;

    let mut smbus = SmBus::new(Bridge::new(transport));
    smbus.set_pec(cli.pec);
    if let Some(hz) = cli.speed {
        smbus.set_frequency(hz)?;
    }

    Ok(match &cli.devices {
        Some(path) => {
            let registry = DeviceDb::from_file(path)
                .with_context(|| format!("loading device registry {}", path.display()))?;
            PmBus::with_registry(smbus, registry)
        }
        None => PmBus::new(smbus)?,
    })
}

fn telemetry(pmbus: &mut Board) -> Result<()> {
    let topology = Topology::detect(pmbus)?;
    anyhow::ensure!(!topology.rails().is_empty(), "no rails found");
    for rail in topology.rails() {
        let vout = rail.read_vout(pmbus, false)?;
        let iout = rail.read_iout(pmbus, false)?;
        let pout = rail.read_pout(pmbus, false)?;
        let temperature = rail.read_external_temperature(pmbus, false)?;
        let status = rail.read_status_word(pmbus)?;
        println!(
            "{}: {:.4} V {:.3} A {:.3} W {:.1} C status 0x{:04x}",
            rail,
            vout,
            iout,
            pout,
            temperature,
            status.raw()
        );
        if rail.is_multiphase() {
            println!(
                "    balance {:.1} % efficiency {:.1} %",
                rail.read_phase_balance(pmbus, false)?,
                rail.read_efficiency(pmbus, false)?
            );
        }
    }
    Ok(())
}

fn update(pmbus: &mut Board, path: &Path, mode: Mode) -> Result<()> {
    let image = psmctl::format::read_image(path)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner} {pos} records {wide_msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));

    let outcome = Processor::new(pmbus, mode).run_with(image, |record| {
        pb.inc(1);
        pb.set_message(record.to_string());
    });
    pb.finish_and_clear();

    let outcome = outcome.with_context(|| format!("{:?} of {} failed", mode, path.display()))?;
    log::info!(
        "{:?} of {} succeeded: {} records over {} lines, {} skipped",
        mode,
        path.display(),
        outcome.records,
        outcome.lines,
        outcome.skipped
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let image = psmctl::format::read_image(path)?;
    let text = String::from_utf8(image).context("image is not text")?;
    let inspection = psmctl::format::inspect(&text)?;
    for (i, record) in inspection.records.iter().enumerate() {
        println!("{:5} 0x{:02x} {}", i, record.kind(), record);
    }
    log::info!(
        "{} lines, {} records",
        inspection.lines,
        inspection.records.len()
    );
    Ok(())
}
