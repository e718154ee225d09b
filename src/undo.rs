//! Configuration space writes that are rolled back at shutdown.
//!
//! The register's current value is captured and its restore action is handed
//! to the shutdown registry before the new value reaches the hardware. If the
//! action cannot be registered the write is not attempted, so there is never
//! a write through this path that cannot be undone.
//!
//! Every call creates its own restore point. Writing the same register twice
//! registers two restores, and since the registry runs newest first the
//! register ends up at the value it had before the first write.

use tracing::{debug, error};

use crate::access::{PciAddress, RegValue, RegWidth};
use crate::context::{PciContext, PciSession, Registry};
use crate::error::PciError;

/// Value a register held before a transactional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoWriteRecord {
    pub address: PciAddress,
    pub register: u16,
    pub prior: RegValue,
}

impl UndoWriteRecord {
    /// Reads the current value of `register` at `width`.
    pub fn capture(
        ctx: &PciContext,
        address: PciAddress,
        register: u16,
        width: RegWidth,
    ) -> Result<Self, PciError> {
        let prior = ctx.read(address, register, width)?;
        Ok(Self {
            address,
            register,
            prior,
        })
    }

    /// Writes the captured value back.
    ///
    /// The device is looked up again in whatever context is live at
    /// shutdown time, since the one the record was captured in may be gone.
    pub fn restore(&self, session: &mut PciSession) -> Result<(), PciError> {
        let ctx = session.context_mut().map_err(|e| {
            error!(
                "Tried to undo PCI write to {} reg {:#04x} without a valid PCI context! Please report a bug.",
                self.address, self.register
            );
            e
        })?;
        if ctx.get_dev(self.address).is_none() {
            error!(
                "Tried to undo PCI write to reg {:#04x} without a valid PCI device ({})! Please report a bug.",
                self.register, self.address
            );
            return Err(PciError::DeviceGone(self.address));
        }
        debug!(
            "Restoring PCI config space for {} reg {:#04x} to {}",
            self.address.bdf(),
            self.register,
            self.prior
        );
        ctx.write(self.address, self.register, self.prior)
    }
}

/// Writes `value` to `register`, registering its rollback first.
pub fn transactional_write(
    session: &mut PciSession,
    registry: &mut Registry,
    address: PciAddress,
    register: u16,
    value: impl Into<RegValue>,
) -> Result<(), PciError> {
    let value = value.into();
    let ctx = session.context_mut()?;
    if ctx.get_dev(address).is_none() {
        return Err(PciError::DeviceGone(address));
    }

    let record = UndoWriteRecord::capture(ctx, address, register, value.width())?;
    registry.register(
        format!("undo PCI write {address} reg {register:#04x}"),
        move |session: &mut PciSession| record.restore(session),
    )?;

    debug!(
        "PCI config write {} reg {register:#04x}: {} -> {value}",
        address.bdf(),
        record.prior
    );
    ctx.write(address, register, value)
}
