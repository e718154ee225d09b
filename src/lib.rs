//! PCI device selection and direct access for userspace flash programmers.
//!
//! A programmer driver scans the bus once per [`PciSession`], picks its one
//! supported device with [`match_device`] or [`DeviceHandle::open`], and
//! either resolves a BAR for its own mapping or maps a BAR through sysfs.
//! Configuration space changes go through [`transactional_write`] so they
//! are rolled back when the [`ShutdownRegistry`] runs at exit.

pub mod access;
pub mod bar;
pub mod context;
pub mod device;
pub mod error;
pub mod filter;
pub mod matcher;
pub mod mmio;
pub mod params;
pub mod shutdown;
pub mod sysfs;
pub mod undo;

#[cfg(test)]
mod testutil;

pub use access::{PciAccess, PciAddress, PciDev, RegValue, RegWidth};
pub use bar::{resolve_bar, BarDescriptor, BarIndex, BarKind, BarWidth};
pub use context::{PciContext, PciSession, Registry};
pub use device::DeviceHandle;
pub use error::PciError;
pub use filter::SlotFilter;
pub use matcher::{match_device, match_single, DeviceEntry, DeviceMatch, TestState};
pub use params::{ProgrammerParams, PCI_PARAM};
pub use shutdown::ShutdownRegistry;
pub use sysfs::SysfsAccess;
pub use undo::{transactional_write, UndoWriteRecord};
