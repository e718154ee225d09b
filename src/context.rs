//! PCI enumeration session and its lifecycle.
//!
//! At most one [`PciContext`] lives inside a [`PciSession`] at a time. It is
//! created by [`PciSession::init`], which also registers the matching
//! cleanup with the shutdown registry, and is destroyed by that cleanup.

use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, error, trace};

use crate::access::{header, offset, PciAccess, PciAddress, PciDev, RegValue, RegWidth};
use crate::error::PciError;
use crate::shutdown::ShutdownRegistry;

/// Registry whose actions run against the session.
pub type Registry = ShutdownRegistry<PciSession>;

/// A scanned bus plus the backend used to reach configuration space.
pub struct PciContext {
    access: Box<dyn PciAccess>,
    devices: Vec<PciDev>,
}

impl PciContext {
    /// Scans the bus through `access`.
    pub fn new(mut access: Box<dyn PciAccess>) -> Result<Self, PciError> {
        let devices = access.scan()?;
        for dev in &devices {
            trace!(
                "{} {} class {:04x}",
                dev.address,
                dev.ids(),
                dev.device_class
            );
        }
        Ok(Self { access, devices })
    }

    pub fn devices(&self) -> &[PciDev] {
        &self.devices
    }

    /// Looks a device up again by its address.
    pub fn get_dev(&self, address: PciAddress) -> Option<&PciDev> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// Sysfs directory of `address` as laid out by the backend.
    pub fn device_dir(&self, address: PciAddress) -> PathBuf {
        self.access.device_dir(address)
    }

    pub fn read(&self, address: PciAddress, reg: u16, width: RegWidth) -> Result<RegValue, PciError> {
        let mut buf = [0u8; 4];
        let buf = &mut buf[..width.bytes()];
        self.access.read_config(address, reg, buf)?;
        Ok(match width {
            RegWidth::Byte => RegValue::Byte(buf[0]),
            RegWidth::Word => RegValue::Word(LittleEndian::read_u16(buf)),
            RegWidth::Long => RegValue::Long(LittleEndian::read_u32(buf)),
        })
    }

    pub fn write(&mut self, address: PciAddress, reg: u16, value: RegValue) -> Result<(), PciError> {
        let mut buf = [0u8; 4];
        let len = value.width().bytes();
        match value {
            RegValue::Byte(v) => buf[0] = v,
            RegValue::Word(v) => LittleEndian::write_u16(&mut buf, v),
            RegValue::Long(v) => LittleEndian::write_u32(&mut buf, v),
        }
        self.access.write_config(address, reg, &buf[..len])
    }

    pub fn read_u8(&self, address: PciAddress, reg: u16) -> Result<u8, PciError> {
        let mut buf = [0u8; 1];
        self.access.read_config(address, reg, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, address: PciAddress, reg: u16) -> Result<u16, PciError> {
        let mut buf = [0u8; 2];
        self.access.read_config(address, reg, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn read_u32(&self, address: PciAddress, reg: u16) -> Result<u32, PciError> {
        let mut buf = [0u8; 4];
        self.access.read_config(address, reg, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn write_u8(&mut self, address: PciAddress, reg: u16, value: u8) -> Result<(), PciError> {
        self.write(address, reg, RegValue::Byte(value))
    }

    pub fn write_u16(&mut self, address: PciAddress, reg: u16, value: u16) -> Result<(), PciError> {
        self.write(address, reg, RegValue::Word(value))
    }

    pub fn write_u32(&mut self, address: PciAddress, reg: u16, value: u32) -> Result<(), PciError> {
        self.write(address, reg, RegValue::Long(value))
    }

    /// Header type with the multi-function bit masked off.
    pub fn header_type(&self, address: PciAddress) -> Result<u8, PciError> {
        Ok(self.read_u8(address, offset::HEADER_TYPE)? & !header::MULTI_FUNCTION)
    }
}

/// Owner of the process-wide PCI context.
#[derive(Default)]
pub struct PciSession {
    context: Option<PciContext>,
}

impl PciSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the bus and registers the context cleanup.
    ///
    /// A second call while a context is alive fails with
    /// [`PciError::DoubleInit`]. If the cleanup cannot be registered the
    /// freshly scanned context is discarded.
    pub fn init(
        &mut self,
        access: impl PciAccess + 'static,
        registry: &mut Registry,
    ) -> Result<&mut PciContext, PciError> {
        if self.context.is_some() {
            error!("Tried to allocate a new PCI context, but there is still an old one! Please report a bug.");
            return Err(PciError::DoubleInit);
        }
        let context = PciContext::new(Box::new(access))?;
        registry.register("PCI context cleanup", PciSession::cleanup)?;
        debug!("PCI context ready, {} devices", context.devices.len());
        Ok(self.context.insert(context))
    }

    /// Drops the context. Called from the shutdown registry.
    pub fn cleanup(&mut self) -> Result<(), PciError> {
        match self.context.take() {
            Some(_) => {
                debug!("PCI context released");
                Ok(())
            }
            None => {
                error!("Tried to cleanup an invalid PCI context! Please report a bug.");
                Err(PciError::CleanupWithoutInit)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    pub fn context(&self) -> Result<&PciContext, PciError> {
        self.context.as_ref().ok_or(PciError::NoContext("device lookup"))
    }

    pub fn context_mut(&mut self) -> Result<&mut PciContext, PciError> {
        self.context.as_mut().ok_or(PciError::NoContext("config space access"))
    }
}
