//! Direct register access to one matched device through sysfs.
//!
//! Linux exposes an `enable` node and one `resource<N>` file per BAR under
//! the device's sysfs directory. Mapping `resource<N>` gives direct access to
//! the BAR without going through `/dev/mem`, so none of its restrictions
//! apply, but this only works where such a sysfs tree exists.
//!
//! Register accesses through the handle are not rolled back automatically;
//! drivers restore whatever MMIO state they change themselves. Only the
//! enable toggle and the mapping are undone, by the teardown registered in
//! [`DeviceHandle::open`].

use std::any::Any;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, error, info};

use crate::access::{PciAddress, PciDev};
use crate::bar::BarIndex;
use crate::context::{PciContext, PciSession, Registry};
use crate::error::PciError;
use crate::matcher::{match_single, DeviceEntry, EntryPrivate};
use crate::mmio::MmioWindow;

struct DeviceState {
    name: String,
    dev: PciDev,
    sysfs_path: Option<PathBuf>,
    enabled: bool,
    was_disabled: bool,
    mmio: Option<MmioWindow>,
    active_bar: Option<u8>,
    entry_private: Option<EntryPrivate>,
    private_data: Option<Box<dyn Any>>,
}

/// A matched device with its enable toggle and (optionally) one mapped BAR.
///
/// Cloning yields another handle to the same device. The shutdown registry
/// keeps one clone to run the teardown; after that every register access
/// fails with [`PciError::OutOfBounds`].
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Rc<RefCell<DeviceState>>,
}

fn open_rw(path: &Path) -> Result<File, PciError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            error!("failed to open {}: {e}", path.display());
            PciError::io(path, e)
        })
}

fn read_enable(file: &File, path: &Path) -> Result<u8, PciError> {
    let mut value = [0u8; 1];
    match file.read_at(&mut value, 0) {
        Ok(1) => Ok(value[0]),
        Ok(_) => Err(PciError::io(
            path,
            io::Error::new(io::ErrorKind::UnexpectedEof, "empty enable node"),
        )),
        Err(e) => {
            error!("failed to read {}: {e}", path.display());
            Err(PciError::io(path, e))
        }
    }
}

fn write_enable(file: &File, path: &Path, value: u8) -> Result<(), PciError> {
    match file.write_at(&[value], 0) {
        Ok(1) => Ok(()),
        Ok(_) => Err(PciError::io(
            path,
            io::Error::new(io::ErrorKind::WriteZero, "short write to enable node"),
        )),
        Err(e) => {
            error!("failed to write {}: {e}", path.display());
            Err(PciError::io(path, e))
        }
    }
}

fn invalid_enable(path: &Path, value: u8) -> PciError {
    error!(
        "invalid value read from {}: {:?}",
        path.display(),
        char::from(value)
    );
    PciError::io(
        path,
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid value {:?}", char::from(value)),
        ),
    )
}

impl DeviceState {
    fn sysfs(&self) -> Result<&Path, PciError> {
        self.sysfs_path
            .as_deref()
            .ok_or(PciError::NoContext("released device handle"))
    }

    fn enable(&mut self) -> Result<(), PciError> {
        if self.enabled {
            return Ok(());
        }
        let path = self.sysfs()?.join("enable");
        let file = open_rw(&path)?;
        match read_enable(&file, &path)? {
            b'0' => {
                self.was_disabled = true;
                write_enable(&file, &path, b'1')?;
                debug!("Enabled {} ({})", self.name, self.dev.address);
            }
            b'1' => {}
            other => return Err(invalid_enable(&path, other)),
        }
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), PciError> {
        // leave devices alone that were already enabled when we found them
        if !self.enabled || !self.was_disabled {
            return Ok(());
        }
        let path = self.sysfs()?.join("enable");
        let file = open_rw(&path)?;
        match read_enable(&file, &path)? {
            b'1' => {
                write_enable(&file, &path, b'0')?;
                debug!("Disabled {} ({})", self.name, self.dev.address);
            }
            b'0' => {}
            other => return Err(invalid_enable(&path, other)),
        }
        self.enabled = false;
        Ok(())
    }

    fn map(&mut self, bar: u8) -> Result<(), PciError> {
        BarIndex::base(bar).map_err(|e| {
            error!("Invalid BAR provided: {bar}");
            e
        })?;
        let reported = usize::try_from(self.dev.sizes[usize::from(bar)]).unwrap_or(usize::MAX);

        if let Some(window) = &self.mmio {
            if self.active_bar == Some(bar) && window.len() == reported {
                return Ok(());
            }
            // another BAR, or this one changed size underneath us
            error!(
                "already mapped BAR{}: {:#x} bytes, BAR{bar} reports {reported:#x} bytes",
                self.active_bar.unwrap_or(bar),
                window.len()
            );
            return Err(PciError::AlreadyMapped {
                bar,
                mapped: window.len(),
                reported,
            });
        }

        let path = self.sysfs()?.join(format!("resource{bar}"));
        let file = open_rw(&path)?;
        let window = MmioWindow::map(&file, reported).map_err(|e| {
            error!("mapping {} failed: {e}", path.display());
            PciError::io(&path, e)
        })?;
        debug!(
            "Mapped BAR{bar} of {} ({:#x} bytes)",
            self.dev.address,
            window.len()
        );
        self.mmio = Some(window);
        self.active_bar = Some(bar);
        Ok(())
    }

    fn unmap(&mut self) {
        if self.mmio.take().is_some() {
            debug!("Unmapped BAR{} of {}", self.active_bar.unwrap_or(0), self.dev.address);
        }
        self.active_bar = None;
    }

    fn window(&self) -> Result<&MmioWindow, PciError> {
        self.mmio
            .as_ref()
            .ok_or(PciError::OutOfBounds { offset: 0, size: 0 })
    }

    fn window_mut(&mut self) -> Result<&mut MmioWindow, PciError> {
        self.mmio
            .as_mut()
            .ok_or(PciError::OutOfBounds { offset: 0, size: 0 })
    }

    /// Unmap, disable, release the path, then check for leftover payload.
    fn teardown(&mut self) -> Result<(), PciError> {
        if self.sysfs_path.is_none() {
            error!("Tried to cleanup an invalid PCI device! Please report a bug.");
            return Err(PciError::NoContext("device teardown"));
        }

        // the BAR may become unreadable once the device is disabled
        self.unmap();
        let disabled = self.disable();
        self.sysfs_path = None;
        self.entry_private = None;

        if self.private_data.take().is_some() {
            error!(
                "device \"{}\" still has private data attached! Please report a bug.",
                self.name
            );
            disabled?;
            return Err(PciError::PrivateDataAttached(self.name.clone()));
        }
        disabled
    }
}

/// Maps an out-of-window offset error to the caller's offset.
fn at(offset: usize, e: PciError) -> PciError {
    match e {
        PciError::OutOfBounds { size: 0, .. } => PciError::OutOfBounds { offset, size: 0 },
        e => e,
    }
}

impl DeviceHandle {
    /// Selects the single supported device and takes it over.
    ///
    /// The teardown is registered before the device is enabled, so a failed
    /// enable still leaves a (harmless) teardown behind.
    pub fn open(
        ctx: &PciContext,
        registry: &mut Registry,
        entries: &[DeviceEntry],
        pci_param: Option<&str>,
    ) -> Result<Self, PciError> {
        let found = match_single(ctx, entries, pci_param)?;
        let name = found.entry.display_name();
        info!(
            "Detected {}@{} \"{name}\"",
            found.dev.ids(),
            found.dev.address.bdf()
        );

        let handle = DeviceHandle {
            inner: Rc::new(RefCell::new(DeviceState {
                sysfs_path: Some(ctx.device_dir(found.dev.address)),
                name,
                dev: found.dev,
                enabled: false,
                was_disabled: false,
                mmio: None,
                active_bar: None,
                entry_private: found.entry.private,
                private_data: None,
            })),
        };

        let teardown = handle.clone();
        registry.register(
            format!("teardown {}", handle.address()),
            move |_: &mut PciSession| teardown.teardown(),
        )?;

        handle.enable()?;
        Ok(handle)
    }

    fn state(&self) -> Ref<'_, DeviceState> {
        self.inner.borrow()
    }

    /// Sets the sysfs `enable` node to 1 if it reads 0, remembering that we
    /// did so. No-op if already enabled through this handle.
    pub fn enable(&self) -> Result<(), PciError> {
        self.inner.borrow_mut().enable()
    }

    /// Undoes [`enable`](Self::enable), but only if it actually flipped the
    /// device from disabled to enabled.
    pub fn disable(&self) -> Result<(), PciError> {
        self.inner.borrow_mut().disable()
    }

    /// Maps `resource<bar>` read/write, shared.
    ///
    /// Mapping the BAR that is already mapped, at its reported size, is a
    /// no-op. Any other mapping request while a window is live fails with
    /// [`PciError::AlreadyMapped`]; [`unmap`](Self::unmap) first to switch
    /// BARs.
    pub fn map(&self, bar: u8) -> Result<(), PciError> {
        self.inner.borrow_mut().map(bar)
    }

    /// Releases the mapping, if any.
    pub fn unmap(&self) {
        self.inner.borrow_mut().unmap()
    }

    /// Runs the teardown sequence. Normally invoked by the shutdown registry.
    pub fn teardown(&self) -> Result<(), PciError> {
        self.inner.borrow_mut().teardown()
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8, PciError> {
        let st = self.state();
        st.window().and_then(|w| w.read_u8(offset)).map_err(|e| at(offset, e))
    }

    pub fn write_byte(&self, offset: usize, value: u8) -> Result<(), PciError> {
        let mut st = self.inner.borrow_mut();
        st.window_mut()
            .and_then(|w| w.write_u8(offset, value))
            .map_err(|e| at(offset, e))
    }

    pub fn mask_byte(&self, offset: usize, value: u8, mask: u8) -> Result<(), PciError> {
        let mut st = self.inner.borrow_mut();
        st.window_mut()
            .and_then(|w| w.mask_u8(offset, value, mask))
            .map_err(|e| at(offset, e))
    }

    pub fn read_long(&self, offset: usize) -> Result<u32, PciError> {
        let st = self.state();
        st.window().and_then(|w| w.read_u32(offset)).map_err(|e| at(offset, e))
    }

    pub fn write_long(&self, offset: usize, value: u32) -> Result<(), PciError> {
        let mut st = self.inner.borrow_mut();
        st.window_mut()
            .and_then(|w| w.write_u32(offset, value))
            .map_err(|e| at(offset, e))
    }

    pub fn mask_long(&self, offset: usize, value: u32, mask: u32) -> Result<(), PciError> {
        let mut st = self.inner.borrow_mut();
        st.window_mut()
            .and_then(|w| w.mask_u32(offset, value, mask))
            .map_err(|e| at(offset, e))
    }

    /// Attaches caller data, returning whatever was attached before.
    ///
    /// It must be detached again before teardown.
    pub fn attach_private_data(&self, data: Box<dyn Any>) -> Option<Box<dyn Any>> {
        self.inner.borrow_mut().private_data.replace(data)
    }

    pub fn detach_private_data(&self) -> Option<Box<dyn Any>> {
        self.inner.borrow_mut().private_data.take()
    }

    pub fn has_private_data(&self) -> bool {
        self.state().private_data.is_some()
    }

    /// Private payload of the allow-list row this device matched.
    pub fn entry_private(&self) -> Option<EntryPrivate> {
        self.state().entry_private
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn address(&self) -> PciAddress {
        self.state().dev.address
    }

    pub fn vendor_id(&self) -> u16 {
        self.state().dev.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.state().dev.device_id
    }

    /// `None` once torn down.
    pub fn sysfs_path(&self) -> Option<PathBuf> {
        self.state().sysfs_path.clone()
    }

    pub fn mmio_size(&self) -> usize {
        self.state().mmio.as_ref().map_or(0, MmioWindow::len)
    }

    pub fn active_bar(&self) -> Option<u8> {
        self.state().active_bar
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn was_disabled_by_us(&self) -> bool {
        self.state().was_disabled
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("DeviceHandle")
            .field("name", &st.name)
            .field("address", &st.dev.address)
            .field("sysfs_path", &st.sysfs_path)
            .field("enabled", &st.enabled)
            .field("was_disabled", &st.was_disabled)
            .field("mmio", &st.mmio)
            .field("active_bar", &st.active_bar)
            .finish_non_exhaustive()
    }
}
