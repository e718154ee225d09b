use std::path::PathBuf;
use thiserror::Error;

use crate::access::PciAddress;

/// Error types for PCI device lookup, BAR resolution, sysfs access and
/// rollback bookkeeping.
///
/// Every variant identifies what went wrong precisely enough for an operator
/// to act on it: lookups name the filter or device involved, register
/// accesses carry the offending offset and window size, and I/O failures
/// carry both the sysfs path and the underlying OS error.
///
/// # Error Categories
///
/// ## Device Selection
/// - [`NotFound`](PciError::NotFound): no supported device survived filtering
/// - [`Ambiguous`](PciError::Ambiguous): more than one supported device survived
/// - [`BadFilter`](PciError::BadFilter): the `pci=` bus:device.function string is malformed
///
/// ## Hardware Resources
/// - [`UnreachableBar`](PciError::UnreachableBar): a 64-bit BAR lies beyond this platform's address width
/// - [`InvalidBar`](PciError::InvalidBar): BAR index outside 0-5
/// - [`AlreadyMapped`](PciError::AlreadyMapped): a mapping exists whose size no longer matches the BAR
/// - [`OutOfBounds`](PciError::OutOfBounds) / [`Misaligned`](PciError::Misaligned): register access rejected before touching memory
/// - [`Io`](PciError::Io): sysfs open/read/write/mmap failure
///
/// ## Lifecycle Misuse
/// - [`DoubleInit`](PciError::DoubleInit), [`CleanupWithoutInit`](PciError::CleanupWithoutInit),
///   [`NoContext`](PciError::NoContext): a bug in the calling code, reported loudly
/// - [`RegistryFull`](PciError::RegistryFull): no room left to register an undo action
/// - [`PrivateDataAttached`](PciError::PrivateDataAttached): a device handle was torn down with a payload still attached
///
/// # Propagation
///
/// Selection and mapping failures are returned to the caller and never
/// retried. Register-level failures are returned per call and leave the
/// device handle usable.
///
/// ```no_run
/// # use pcidev::PciError;
/// # fn select() -> Result<(), PciError> { Ok(()) }
/// match select() {
///     Err(PciError::Ambiguous { count }) => {
///         eprintln!("{count} candidates, pass pci=bb:dd.f to pick one");
///     }
///     Err(e) => eprintln!("{e}"),
///     Ok(()) => {}
/// }
/// ```
#[derive(Error, Debug)]
pub enum PciError {
    /// No enumerated device passed both the slot filter and the allow-list.
    #[error("No supported PCI device found")]
    NotFound,

    /// More than one enumerated device qualified.
    ///
    /// Never resolved automatically. The message tells the operator to
    /// narrow the selection with the `pci=` parameter.
    #[error(
        "Multiple supported PCI devices found ({count}). Use 'pci=bb:dd.f' to explicitly \
         select the card with the given BDF (PCI bus, device, function)"
    )]
    Ambiguous { count: usize },

    /// The `[domain:]bus:device.function` filter string could not be parsed.
    #[error("Invalid PCI slot filter '{filter}': {reason}")]
    BadFilter { filter: String, reason: &'static str },

    /// A 64-bit memory BAR has a non-zero upper dword on a platform whose
    /// pointers cannot hold it.
    #[error("BAR at config offset {offset:#04x} of {address} is unreachable: {value:#018x} does not fit in a {bits}-bit address")]
    UnreachableBar {
        address: PciAddress,
        offset: u16,
        value: u64,
        bits: u32,
    },

    /// A sysfs node (or config space file) could not be opened, read,
    /// written or mapped.
    ///
    /// The wrapped [`std::io::Error`] keeps the raw OS error code, see
    /// [`std::io::Error::raw_os_error`].
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Only BAR indices 0 to 5 can be mapped through sysfs.
    #[error("Invalid BAR provided: {0}")]
    InvalidBar(u8),

    /// A window is already mapped and its size differs from what the device
    /// now reports for the requested BAR.
    #[error("Already mapped BAR{bar}: {mapped:#x} bytes, device now reports {reported:#x} bytes")]
    AlreadyMapped {
        bar: u8,
        mapped: usize,
        reported: usize,
    },

    /// Register offset lies at or beyond the end of the mapped window.
    #[error("MMIO offset {offset:#x} is outside the mapped window of {size:#x} bytes")]
    OutOfBounds { offset: usize, size: usize },

    /// Register offset is not aligned to the access width.
    #[error("MMIO offset {offset:#x} is not aligned to {align} bytes")]
    Misaligned { offset: usize, align: usize },

    /// A second PCI context was requested while one is still alive.
    #[error("Tried to allocate a new PCI context, but there is still an old one")]
    DoubleInit,

    /// The PCI context was cleaned up although it was never set up.
    #[error("Tried to cleanup an invalid PCI context")]
    CleanupWithoutInit,

    /// An operation needed a live PCI context and found none.
    #[error("No valid PCI context for {0}")]
    NoContext(&'static str),

    /// An undo action could not find its device again.
    #[error("Tried to undo PCI writes without a valid PCI device ({0})")]
    DeviceGone(PciAddress),

    /// The shutdown registry cannot accept more actions.
    #[error("Shutdown registry is full ({0} actions), refusing to register more")]
    RegistryFull(usize),

    /// A device handle still carried caller data at teardown.
    #[error("Device \"{0}\" still has private data attached")]
    PrivateDataAttached(String),

    /// The programmer parameter string is malformed.
    #[error("Invalid programmer parameter: {0}")]
    InvalidParameter(String),
}

impl PciError {
    /// Wraps an [`std::io::Error`] together with the path it happened on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PciError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the OS error code carried by an [`PciError::Io`], if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            PciError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
