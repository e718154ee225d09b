use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pcidev::access::{RegValue, SYSFS_PCI_DEVICES};
use pcidev::{
    match_device, match_single, transactional_write, BarIndex, DeviceEntry, DeviceHandle,
    PciContext, PciError, PciSession, ProgrammerParams, Registry, SysfsAccess, TestState,
    PCI_PARAM,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// List all PCI devices with their BAR sizes
    #[arg(short, long)]
    list: bool,

    /// Supported device as VVVV:DDDD (hex), may be given several times
    #[arg(long = "id", value_name = "VVVV:DDDD", value_parser = parse_id)]
    ids: Vec<(u16, u16)>,

    /// Mark the supported devices as untested
    #[arg(long)]
    untested: bool,

    /// Programmer parameters (e.g., pci=00:1f.0)
    #[arg(short, long, default_value = "")]
    params: String,

    /// Resolve generic BAR N (0-5) of the selected device
    #[arg(long, value_name = "N", conflicts_with = "rom")]
    bar: Option<u8>,

    /// Resolve the expansion ROM BAR of the selected device
    #[arg(long)]
    rom: bool,

    /// Map BAR N of the selected device through sysfs
    #[arg(long, value_name = "N")]
    map: Option<u8>,

    /// Read a 32-bit register at OFF from the mapped BAR
    #[arg(long, value_name = "OFF", value_parser = parse_offset, requires = "map")]
    read_long: Vec<usize>,

    /// Read an 8-bit register at OFF from the mapped BAR
    #[arg(long, value_name = "OFF", value_parser = parse_offset, requires = "map")]
    read_byte: Vec<usize>,

    /// Write a 32-bit register in the mapped BAR
    #[arg(long, value_name = "OFF=VAL", value_parser = parse_write_long, requires = "map")]
    write_long: Vec<(usize, u32)>,

    /// Replace the bits in MASK of a 32-bit register in the mapped BAR
    #[arg(long, value_name = "OFF=VAL/MASK", value_parser = parse_mask_long, requires = "map")]
    mask_long: Vec<(usize, u32, u32)>,

    /// Write config space of the selected device, restored at exit
    #[arg(long, value_name = "OFF=VAL[:b|w|l]")]
    config_write: Vec<ConfigWrite>,

    /// Directory holding one entry per PCI function
    #[arg(long, default_value = SYSFS_PCI_DEVICES)]
    sysfs_root: PathBuf,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// A configuration space write requested on the command line.
#[derive(Debug, Clone, Copy)]
struct ConfigWrite {
    offset: u16,
    value: RegValue,
}

impl FromStr for ConfigWrite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (offset, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected OFF=VAL[:width], got \"{s}\""))?;
        let (value, width) = rest.split_once(':').unwrap_or((rest, "b"));
        let offset = u16::try_from(parse_number(offset)?)
            .ok()
            .filter(|o| *o < 0x1000)
            .ok_or_else(|| format!("config offset {offset} out of range"))?;
        let value = parse_number(value)?;
        let value = match width {
            "b" | "8" => u8::try_from(value).map(RegValue::Byte).ok(),
            "w" | "16" => u16::try_from(value).map(RegValue::Word).ok(),
            "l" | "32" => u32::try_from(value).map(RegValue::Long).ok(),
            other => return Err(format!("unknown width \"{other}\", use b, w or l")),
        }
        .ok_or_else(|| format!("value {value:#x} does not fit width {width}"))?;
        Ok(Self { offset, value })
    }
}

/// Accepts `0x`-prefixed hex or plain decimal.
fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number \"{s}\": {e}"))
}

fn parse_offset(s: &str) -> Result<usize, String> {
    usize::try_from(parse_number(s)?).map_err(|e| e.to_string())
}

fn parse_u32(s: &str) -> Result<u32, String> {
    u32::try_from(parse_number(s)?).map_err(|e| e.to_string())
}

fn parse_id(s: &str) -> Result<(u16, u16), String> {
    let (vendor, device) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VVVV:DDDD, got \"{s}\""))?;
    let vendor = u16::from_str_radix(vendor, 16).map_err(|e| format!("vendor id: {e}"))?;
    let device = u16::from_str_radix(device, 16).map_err(|e| format!("device id: {e}"))?;
    Ok((vendor, device))
}

fn parse_write_long(s: &str) -> Result<(usize, u32), String> {
    let (offset, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected OFF=VAL, got \"{s}\""))?;
    Ok((parse_offset(offset)?, parse_u32(value)?))
}

fn parse_mask_long(s: &str) -> Result<(usize, u32, u32), String> {
    let (offset, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("expected OFF=VAL/MASK, got \"{s}\""))?;
    let (value, mask) = rest
        .split_once('/')
        .ok_or_else(|| format!("expected OFF=VAL/MASK, got \"{s}\""))?;
    Ok((parse_offset(offset)?, parse_u32(value)?, parse_u32(mask)?))
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Allow-list rows for the `--id` arguments.
///
/// Names are built once per process and live until exit.
fn allow_list(args: &Args) -> Vec<DeviceEntry> {
    let status = if args.untested {
        TestState::Untested
    } else {
        TestState::Tested
    };
    args.ids
        .iter()
        .map(|&(vendor, device)| {
            let device_name: &'static str =
                Box::leak(format!("device {vendor:04x}:{device:04x}").into_boxed_str());
            DeviceEntry::new(vendor, device, status, "PCI", device_name)
        })
        .collect()
}

fn list_devices(ctx: &PciContext) {
    println!("=== PCI Devices ===");
    println!(
        "{:<14} {:<11} {:<6} BAR sizes",
        "Device", "ID", "Class"
    );
    println!("{:-<75}", "");
    for dev in ctx.devices() {
        let sizes = dev
            .sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size != 0)
            .map(|(n, size)| format!("{n}:{size:#x}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<14} {:<11} {:04x}   {}",
            dev.address.to_string(),
            dev.ids(),
            dev.device_class,
            if sizes.is_empty() { "-" } else { sizes.as_str() }
        );
    }
    println!("{} devices", ctx.devices().len());
}

fn show_bar(ctx: &PciContext, entries: &[DeviceEntry], pci: Option<&str>, bar: BarIndex) -> Result<(), PciError> {
    let (found, resolved) = match_device(ctx, entries, pci, bar)?;
    println!(
        "{} ({}) {:?}: {resolved}",
        found.dev.address,
        found.dev.ids(),
        bar
    );
    Ok(())
}

fn config_writes(
    session: &mut PciSession,
    registry: &mut Registry,
    entries: &[DeviceEntry],
    pci: Option<&str>,
    writes: &[ConfigWrite],
) -> Result<(), PciError> {
    let address = match_single(session.context()?, entries, pci)?.dev.address;
    for write in writes {
        transactional_write(session, registry, address, write.offset, write.value)?;
        println!(
            "{} config[{:#05x}] <- {} (restored at exit)",
            address, write.offset, write.value
        );
    }
    Ok(())
}

fn mmio_access(handle: &DeviceHandle, bar: u8, args: &Args) -> Result<(), PciError> {
    handle.map(bar)?;
    println!(
        "Mapped BAR{bar} of {} \"{}\", {:#x} bytes",
        handle.address(),
        handle.name(),
        handle.mmio_size()
    );

    for &(offset, value) in &args.write_long {
        handle.write_long(offset, value)?;
        println!("[{offset:#06x}] <- {value:#010x}");
    }
    for &(offset, value, mask) in &args.mask_long {
        handle.mask_long(offset, value, mask)?;
        println!("[{offset:#06x}] <- {value:#010x} mask {mask:#010x}");
    }
    for &offset in &args.read_long {
        println!("[{offset:#06x}] = {:#010x}", handle.read_long(offset)?);
    }
    for &offset in &args.read_byte {
        println!("[{offset:#06x}] = {:#04x}", handle.read_byte(offset)?);
    }

    handle.unmap();
    Ok(())
}

fn run(args: &Args, session: &mut PciSession, registry: &mut Registry) -> Result<(), PciError> {
    let mut params = ProgrammerParams::parse(&args.params)?;
    let pci = params.extract(PCI_PARAM);
    for key in params.unhandled() {
        warn!("Unhandled programmer parameter: {key}");
    }

    session.init(SysfsAccess::new(&args.sysfs_root), registry)?;

    if args.list {
        list_devices(session.context()?);
    }

    let entries = allow_list(args);
    let bar = match (args.bar, args.rom) {
        (Some(n), _) => Some(BarIndex::base(n)?),
        (None, true) => Some(BarIndex::Rom),
        (None, false) => None,
    };
    let wants_device = bar.is_some() || args.map.is_some() || !args.config_write.is_empty();
    if !wants_device {
        return Ok(());
    }
    if entries.is_empty() {
        warn!("No --id given, no PCI device is supported");
    }

    if let Some(bar) = bar {
        show_bar(session.context()?, &entries, pci.as_deref(), bar)?;
    }

    if !args.config_write.is_empty() {
        config_writes(session, registry, &entries, pci.as_deref(), &args.config_write)?;
    }

    if let Some(bar) = args.map {
        let handle = DeviceHandle::open(session.context()?, registry, &entries, pci.as_deref())?;
        mmio_access(&handle, bar, args)?;
    }
    Ok(())
}

fn main() -> Result<(), PciError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut session = PciSession::new();
    let mut registry = Registry::new();

    let result = run(&args, &mut session, &mut registry);

    // Undo everything, whether or not run() succeeded
    let failed = registry.run(&mut session);
    if failed > 0 {
        warn!("{failed} shutdown action(s) failed");
    } else {
        info!("Shutdown complete");
    }
    result
}
