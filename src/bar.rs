//! Base Address Register resolution.
//!
//! Works out what a BAR decodes (memory, I/O, expansion ROM) from the header
//! type and the BAR's own type bits, merges the upper dword of 64-bit memory
//! BARs and strips the attribute bits off the address.
//!
//! ```text
//! Memory BAR   31..4 address | 3 prefetchable | 2..1 type (00 = 32, 10 = 64) | 0 = 0
//! I/O BAR      31..2 address | 1 reserved | 0 = 1
//! ROM BAR      31..11 address | 10..1 reserved | 0 enable
//! ```

use std::fmt;

use tracing::{debug, error, trace, warn};

use crate::access::{command, header, offset, PciAddress, PCI_NUM_BARS};
use crate::context::PciContext;
use crate::error::PciError;

const BASE_ADDRESS_SPACE_IO: u32 = 0x01;
const BASE_ADDRESS_MEM_TYPE_MASK: u32 = 0x06;
const BASE_ADDRESS_MEM_TYPE_32: u32 = 0x00;
const BASE_ADDRESS_MEM_TYPE_64: u32 = 0x04;
const BASE_ADDRESS_MEM_PREFETCH: u32 = 0x08;

const BASE_ADDRESS_MEM_MASK: u64 = !0x0f;
const BASE_ADDRESS_IO_MASK: u64 = !0x03;
const ROM_ADDRESS_MASK: u64 = !0x7ff;

/// What a BAR decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Memory,
    Io,
    Rom,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarWidth {
    Bits32,
    Bits64,
}

/// A resolved BAR. `base_address` never carries type or attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarDescriptor {
    pub kind: BarKind,
    pub base_address: usize,
    pub width: BarWidth,
    pub prefetchable: bool,
}

impl fmt::Display for BarDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = match self.width {
            BarWidth::Bits32 => 32,
            BarWidth::Bits64 => 64,
        };
        write!(f, "{:?} @ {:#x}, {width}-bit", self.kind, self.base_address)?;
        if self.prefetchable {
            write!(f, ", prefetchable")?;
        }
        Ok(())
    }
}

/// Selects one BAR of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarIndex {
    /// Generic BAR 0 to 5.
    Base(u8),
    /// Expansion ROM BAR, whose location depends on the header type.
    Rom,
}

impl BarIndex {
    pub fn base(index: u8) -> Result<Self, PciError> {
        if usize::from(index) < PCI_NUM_BARS {
            Ok(BarIndex::Base(index))
        } else {
            Err(PciError::InvalidBar(index))
        }
    }

    /// Configuration space offset of this BAR under `header_type`.
    pub fn offset(self, header_type: u8) -> u16 {
        match self {
            BarIndex::Base(n) => offset::BASE_ADDRESS_0 + 4 * u16::from(n),
            BarIndex::Rom if header_type == header::BRIDGE => offset::ROM_ADDRESS1,
            BarIndex::Rom => offset::ROM_ADDRESS,
        }
    }
}

/// Whether this build can drive I/O ports at all.
pub fn port_io_available() -> bool {
    cfg!(any(target_arch = "x86", target_arch = "x86_64"))
}

fn classify(header_type: u8, bar: BarIndex, raw: u32) -> BarKind {
    let by_space = if raw & BASE_ADDRESS_SPACE_IO != 0 {
        BarKind::Io
    } else {
        BarKind::Memory
    };
    match header_type {
        header::NORMAL => match bar {
            BarIndex::Base(_) => by_space,
            BarIndex::Rom => BarKind::Rom,
        },
        header::BRIDGE => match bar {
            BarIndex::Base(0 | 1) => by_space,
            BarIndex::Rom => BarKind::Rom,
            BarIndex::Base(_) => BarKind::Unknown,
        },
        header::CARDBUS => BarKind::Unknown,
        other => {
            error!("Unknown PCI header type {other:#04x}, BAR type cannot be determined reliably.");
            BarKind::Unknown
        }
    }
}

/// Resolves `bar` of the device at `address`.
///
/// A zero base address is returned as is; deciding whether an unassigned BAR
/// is usable is up to the caller.
pub fn resolve_bar(ctx: &PciContext, address: PciAddress, bar: BarIndex) -> Result<BarDescriptor, PciError> {
    resolve_bar_with_pointer_width(ctx, address, bar, usize::BITS)
}

/// [`resolve_bar`] for a platform whose pointers are `pointer_bits` wide.
pub fn resolve_bar_with_pointer_width(
    ctx: &PciContext,
    address: PciAddress,
    bar: BarIndex,
    pointer_bits: u32,
) -> Result<BarDescriptor, PciError> {
    if let BarIndex::Base(n) = bar {
        BarIndex::base(n)?;
    }
    let header_type = ctx.header_type(address)?;
    trace!("PCI header type {header_type:#04x}");

    let reg = bar.offset(header_type);
    let raw = ctx.read_u32(address, reg)?;
    let kind = classify(header_type, bar, raw);
    let cmd = ctx.read_u16(address, offset::COMMAND)?;

    let mut addr = u64::from(raw);
    let mut width = BarWidth::Bits32;
    let mut prefetchable = false;

    match kind {
        BarKind::Memory => {
            prefetchable = raw & BASE_ADDRESS_MEM_PREFETCH != 0;
            let width_name = match raw & BASE_ADDRESS_MEM_TYPE_MASK {
                BASE_ADDRESS_MEM_TYPE_32 => "32",
                BASE_ADDRESS_MEM_TYPE_64 => {
                    width = BarWidth::Bits64;
                    "64"
                }
                _ => "reserved",
            };
            debug!(
                "Requested BAR is of type MEM, {width_name}bit, {}prefetchable",
                if prefetchable { "" } else { "not " }
            );
            if cmd & command::MEMORY == 0 {
                warn!("MEM BAR access requested, but device {address} has MEM space accesses disabled.");
            }
            if width == BarWidth::Bits64 {
                // a 64-bit BAR consumes the next dword as its upper half
                let upper = ctx.read_u32(address, reg + 4)?;
                if upper != 0 {
                    let full = addr | (u64::from(upper) << 32);
                    if pointer_bits < 64 {
                        error!("BAR unreachable! {address} decodes {full:#x}, beyond a {pointer_bits}-bit address space.");
                        return Err(PciError::UnreachableBar {
                            address,
                            offset: reg,
                            value: full,
                            bits: pointer_bits,
                        });
                    }
                    addr = full;
                }
            }
            addr &= BASE_ADDRESS_MEM_MASK;
        }
        BarKind::Io => {
            debug!("Requested BAR is of type I/O");
            if !port_io_available() {
                error!("I/O BAR access requested, but port I/O is not supported on this platform.");
            } else if cmd & command::IO == 0 {
                warn!("I/O BAR access requested, but device {address} has I/O space accesses disabled.");
            }
            addr &= BASE_ADDRESS_IO_MASK;
        }
        BarKind::Rom => {
            debug!("Requested BAR is of type ROM");
            if cmd & command::MEMORY == 0 {
                warn!("ROM BAR access requested, but device {address} has MEM space accesses disabled.");
            }
            addr &= ROM_ADDRESS_MASK;
        }
        BarKind::Unknown => {
            error!("BAR type unknown for {address} (config offset {reg:#04x}), please report a bug.");
            addr &= BASE_ADDRESS_MEM_MASK;
        }
    }

    let base_address = usize::try_from(addr).map_err(|_| PciError::UnreachableBar {
        address,
        offset: reg,
        value: addr,
        bits: usize::BITS,
    })?;

    Ok(BarDescriptor {
        kind,
        base_address,
        width,
        prefetchable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PciSession, Registry};
    use crate::testutil::{FakePci, LogCapture};
    use tracing::Level;

    const DEV: PciAddress = PciAddress::new(0, 0, 0x1f, 0);

    fn session_with(setup: impl FnOnce(&FakePci)) -> (PciSession, Registry) {
        let mut access = FakePci::new();
        access.add(DEV, 0x8086, 0x1234);
        setup(&access);
        let mut session = PciSession::new();
        let mut registry = Registry::new();
        session.init(access, &mut registry).unwrap();
        (session, registry)
    }

    fn resolve(session: &PciSession, bar: BarIndex) -> Result<BarDescriptor, PciError> {
        resolve_bar(session.context().unwrap(), DEV, bar)
    }

    #[test]
    fn prefetchable_32bit_memory_bar() {
        let (mut session, mut registry) = session_with(|pci| pci.set_u32(DEV, 0x10, 0xf000_0008));
        let bar = resolve(&session, BarIndex::Base(0)).unwrap();
        assert_eq!(
            bar,
            BarDescriptor {
                kind: BarKind::Memory,
                base_address: 0xf000_0000,
                width: BarWidth::Bits32,
                prefetchable: true,
            }
        );
        registry.run(&mut session);
    }

    #[test]
    fn io_bar_masks_low_two_bits() {
        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u32(DEV, 0x14, 0x0000_e001);
            pci.set_u16(DEV, 0x04, 0x0001);
        });
        let bar = resolve(&session, BarIndex::Base(1)).unwrap();
        assert_eq!(bar.kind, BarKind::Io);
        assert_eq!(bar.base_address, 0xe000);
        registry.run(&mut session);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn merges_64bit_upper_dword() {
        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u32(DEV, 0x18, 0x8000_000c);
            pci.set_u32(DEV, 0x1c, 0x0000_0040);
        });
        let bar = resolve(&session, BarIndex::Base(2)).unwrap();
        assert_eq!(bar.width, BarWidth::Bits64);
        assert!(bar.prefetchable);
        assert_eq!(bar.base_address, 0x40_8000_0000);
        registry.run(&mut session);
    }

    #[test]
    fn upper_dword_unreachable_on_32bit_pointers() {
        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u32(DEV, 0x10, 0x8000_0004);
            pci.set_u32(DEV, 0x14, 0x0000_0001);
        });
        let err = resolve_bar_with_pointer_width(session.context().unwrap(), DEV, BarIndex::Base(0), 32)
            .unwrap_err();
        assert!(matches!(
            err,
            PciError::UnreachableBar { offset: 0x10, value: 0x1_8000_0004, bits: 32, .. }
        ));
        registry.run(&mut session);
    }

    #[test]
    fn zero_upper_dword_fits_32bit_pointers() {
        let (mut session, mut registry) = session_with(|pci| pci.set_u32(DEV, 0x10, 0x8000_0004));
        let bar = resolve_bar_with_pointer_width(session.context().unwrap(), DEV, BarIndex::Base(0), 32)
            .unwrap();
        assert_eq!(bar.base_address, 0x8000_0000);
        assert_eq!(bar.width, BarWidth::Bits64);
        registry.run(&mut session);
    }

    #[test]
    fn rom_bar_location_depends_on_header() {
        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u32(DEV, 0x30, 0xfee0_0001);
            pci.set_u32(DEV, 0x38, 0xfec0_07ff);
        });
        let bar = resolve(&session, BarIndex::Rom).unwrap();
        assert_eq!((bar.kind, bar.base_address), (BarKind::Rom, 0xfee0_0000));
        registry.run(&mut session);

        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u8(DEV, 0x0e, 0x81);
            pci.set_u32(DEV, 0x38, 0xfec0_07ff);
        });
        let bar = resolve(&session, BarIndex::Rom).unwrap();
        assert_eq!((bar.kind, bar.base_address), (BarKind::Rom, 0xfec0_0000));
        registry.run(&mut session);
    }

    #[test]
    fn bridge_only_has_two_generic_bars() {
        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u8(DEV, 0x0e, 0x01);
            pci.set_u32(DEV, 0x18, 0x0001_0107);
        });
        let bar = resolve(&session, BarIndex::Base(2)).unwrap();
        assert_eq!(bar.kind, BarKind::Unknown);
        assert_eq!(bar.base_address & 0xf, 0);
        registry.run(&mut session);
    }

    #[test]
    fn unassigned_bar_resolves_to_zero() {
        let (mut session, mut registry) = session_with(|_| {});
        let bar = resolve(&session, BarIndex::Base(5)).unwrap();
        assert_eq!(bar.kind, BarKind::Memory);
        assert_eq!(bar.base_address, 0);
        registry.run(&mut session);
    }

    #[test]
    fn attribute_bits_never_leak() {
        for raw in [0xffff_ffffu32, 0x0000_000f, 0x1234_5679, 0xabcd_ef0e] {
            for bar in [BarIndex::Base(0), BarIndex::Base(3), BarIndex::Rom] {
                let (mut session, mut registry) = session_with(|pci| {
                    pci.set_u32(DEV, usize::from(bar.offset(0)), raw);
                    pci.set_u16(DEV, 0x04, 0x0003);
                });
                match resolve(&session, bar) {
                    Ok(d) => {
                        let attr = match d.kind {
                            BarKind::Io => 0x3,
                            BarKind::Rom => 0x7ff,
                            _ => 0xf,
                        };
                        assert_eq!(d.base_address & attr, 0, "{raw:#x} {bar:?}");
                    }
                    Err(e) => assert!(matches!(e, PciError::UnreachableBar { .. })),
                }
                registry.run(&mut session);
            }
        }
    }

    #[test]
    fn disabled_decoding_only_warns() {
        let (mut session, mut registry) = session_with(|pci| {
            pci.set_u32(DEV, 0x10, 0xfed0_0000);
            pci.set_u32(DEV, 0x30, 0x000c_0001);
            pci.set_u16(DEV, 0x04, 0x0000);
        });

        let logs = LogCapture::new();
        let (mem, rom) = logs.run(|| {
            (
                resolve(&session, BarIndex::Base(0)),
                resolve(&session, BarIndex::Rom),
            )
        });
        assert_eq!(mem.unwrap().base_address, 0xfed0_0000);
        assert_eq!(rom.unwrap().base_address, 0x000c_0000);
        assert!(logs.contains(Level::WARN, "MEM BAR access requested"));
        assert!(logs.contains(Level::WARN, "ROM BAR access requested"));

        let enabled = LogCapture::new();
        let ctx = session.context_mut().unwrap();
        ctx.write_u16(DEV, 0x04, 0x0002).unwrap();
        enabled.run(|| resolve(&session, BarIndex::Base(0))).unwrap();
        assert_eq!(enabled.count(Level::WARN, "access requested"), 0);
        registry.run(&mut session);
    }

    #[test]
    fn base_index_is_bounded() {
        assert!(BarIndex::base(5).is_ok());
        assert!(matches!(BarIndex::base(6), Err(PciError::InvalidBar(6))));
    }
}
