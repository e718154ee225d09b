//! Boundary to the PCI enumeration backend.
//!
//! The core never walks the bus itself. A [`PciAccess`] implementation
//! produces the device list and moves raw bytes in and out of configuration
//! space; everything width-typed is layered on top in
//! [`PciContext`](crate::context::PciContext).

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PciError;

/// Where Linux exposes one directory per PCI function.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Number of generic BARs in a normal (type 0) header.
pub const PCI_NUM_BARS: usize = 6;

/// Configuration space standard offsets.
pub mod offset {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const COMMAND: u16 = 0x04;
    pub const CLASS_DEVICE: u16 = 0x0A;
    pub const HEADER_TYPE: u16 = 0x0E;
    pub const BASE_ADDRESS_0: u16 = 0x10;
    /// Expansion ROM BAR of a normal header.
    pub const ROM_ADDRESS: u16 = 0x30;
    /// Expansion ROM BAR of a PCI-to-PCI bridge header.
    pub const ROM_ADDRESS1: u16 = 0x38;
}

/// Header type values (multi-function bit masked off).
pub mod header {
    pub const MULTI_FUNCTION: u8 = 0x80;
    pub const NORMAL: u8 = 0x00;
    pub const BRIDGE: u8 = 0x01;
    pub const CARDBUS: u8 = 0x02;
}

/// Command register bits.
pub mod command {
    pub const IO: u16 = 0x0001;
    pub const MEMORY: u16 = 0x0002;
}

/// Domain:bus:device.function of one PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(domain: u32, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }

    /// Short `bb:dd.f` form used in operator messages.
    pub fn bdf(&self) -> String {
        format!("{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// Formats as the sysfs directory name, `dddd:bb:dd.f`.
impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// One enumerated PCI function, as filled in by the backend.
///
/// Identity fields are read once at scan time and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDev {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Base class and sub class, `0xCCSS`.
    pub device_class: u16,
    /// Decoded sizes of BAR0..BAR5 in bytes, zero when unimplemented.
    pub sizes: [u64; PCI_NUM_BARS],
}

impl PciDev {
    pub fn new(address: PciAddress, vendor_id: u16, device_id: u16) -> Self {
        Self {
            address,
            vendor_id,
            device_id,
            device_class: 0,
            sizes: [0; PCI_NUM_BARS],
        }
    }

    /// `vvvv:dddd` form used in operator messages.
    pub fn ids(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.device_id)
    }
}

/// Width of a configuration space register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegWidth {
    Byte,
    Word,
    Long,
}

impl RegWidth {
    pub const fn bytes(self) -> usize {
        match self {
            RegWidth::Byte => 1,
            RegWidth::Word => 2,
            RegWidth::Long => 4,
        }
    }
}

/// A configuration space register value tagged with its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegValue {
    Byte(u8),
    Word(u16),
    Long(u32),
}

impl RegValue {
    pub const fn width(self) -> RegWidth {
        match self {
            RegValue::Byte(_) => RegWidth::Byte,
            RegValue::Word(_) => RegWidth::Word,
            RegValue::Long(_) => RegWidth::Long,
        }
    }
}

impl From<u8> for RegValue {
    fn from(v: u8) -> Self {
        RegValue::Byte(v)
    }
}

impl From<u16> for RegValue {
    fn from(v: u16) -> Self {
        RegValue::Word(v)
    }
}

impl From<u32> for RegValue {
    fn from(v: u32) -> Self {
        RegValue::Long(v)
    }
}

impl fmt::Display for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegValue::Byte(v) => write!(f, "{v:#04x}"),
            RegValue::Word(v) => write!(f, "{v:#06x}"),
            RegValue::Long(v) => write!(f, "{v:#010x}"),
        }
    }
}

/// Source of PCI devices and raw configuration space I/O.
///
/// Multi-byte configuration values travel as little-endian byte slices;
/// width decoding happens in the caller.
pub trait PciAccess {
    /// Scans all buses and fills in identity, class and BAR sizes.
    fn scan(&mut self) -> Result<Vec<PciDev>, PciError>;

    /// Reads `buf.len()` bytes of configuration space starting at `offset`.
    fn read_config(&self, address: PciAddress, offset: u16, buf: &mut [u8]) -> Result<(), PciError>;

    /// Writes `data` into configuration space starting at `offset`.
    fn write_config(&mut self, address: PciAddress, offset: u16, data: &[u8]) -> Result<(), PciError>;

    /// Directory holding the `enable` and `resource<N>` nodes of a device.
    fn device_dir(&self, address: PciAddress) -> PathBuf {
        Path::new(SYSFS_PCI_DEVICES).join(address.to_string())
    }
}
