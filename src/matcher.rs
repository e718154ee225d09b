//! Selection of exactly one supported device.
//!
//! A device is a candidate when it passes the `pci=` slot filter and its
//! vendor/device pair appears in the caller's allow-list. Anything other
//! than exactly one candidate is an error; ambiguity is never resolved by
//! guessing.

use std::any::Any;

use tracing::{error, info};

use crate::access::PciDev;
use crate::bar::{resolve_bar, BarDescriptor, BarIndex};
use crate::context::PciContext;
use crate::error::PciError;
use crate::filter::SlotFilter;

/// How well a supported device has been exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Tested,
    Untested,
}

/// Per-entry data a driver attaches to its allow-list rows.
pub type EntryPrivate = &'static (dyn Any + Send + Sync);

/// One allow-list row.
#[derive(Debug, Clone, Copy)]
pub struct DeviceEntry {
    pub vendor_id: u16,
    pub device_id: u16,
    pub status: TestState,
    pub vendor_name: &'static str,
    pub device_name: &'static str,
    pub private: Option<EntryPrivate>,
}

impl DeviceEntry {
    pub const fn new(
        vendor_id: u16,
        device_id: u16,
        status: TestState,
        vendor_name: &'static str,
        device_name: &'static str,
    ) -> Self {
        Self {
            vendor_id,
            device_id,
            status,
            vendor_name,
            device_name,
            private: None,
        }
    }

    pub const fn with_private(mut self, private: EntryPrivate) -> Self {
        self.private = Some(private);
        self
    }

    pub fn matches(&self, dev: &PciDev) -> bool {
        self.vendor_id == dev.vendor_id && self.device_id == dev.device_id
    }

    /// `"<vendor> <device>"`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.vendor_name, self.device_name)
    }
}

/// The single surviving candidate.
#[derive(Debug, Clone)]
pub struct DeviceMatch<'a> {
    pub dev: PciDev,
    pub entry: &'a DeviceEntry,
}

/// First allow-list row naming `dev`.
pub fn find_entry<'a>(entries: &'a [DeviceEntry], dev: &PciDev) -> Option<&'a DeviceEntry> {
    entries.iter().find(|e| e.matches(dev))
}

fn candidates<'c, 'a>(
    ctx: &'c PciContext,
    entries: &'a [DeviceEntry],
    filter: SlotFilter,
) -> impl Iterator<Item = (&'c PciDev, &'a DeviceEntry)> + 'c
where
    'a: 'c,
{
    ctx.devices()
        .iter()
        .filter(move |dev| filter.matches(dev))
        .filter_map(move |dev| find_entry(entries, dev).map(|entry| (dev, entry)))
        .inspect(|(dev, entry)| {
            info!(
                "Found \"{}\" ({}, BDF {}).",
                entry.display_name(),
                dev.ids(),
                dev.address.bdf()
            );
            if entry.status == TestState::Untested {
                info!(
                    "===\nThis PCI device ({}, {}) is UNTESTED. Please report whether it works \
                     for you, naming the PCI device in the subject. Thank you for your help!\n===",
                    dev.ids(),
                    entry.display_name()
                );
            }
        })
}

fn parse_filter(pci_param: Option<&str>) -> Result<SlotFilter, PciError> {
    SlotFilter::from_param(pci_param).map_err(|e| {
        error!("Error: {e}");
        e
    })
}

fn exactly_one<T>(mut found: Vec<T>) -> Result<T, PciError> {
    match found.len() {
        0 => {
            error!("Error: No supported PCI device found.");
            Err(PciError::NotFound)
        }
        1 => Ok(found.remove(0)),
        count => {
            error!(
                "Error: Multiple supported PCI devices found. Use 'pci=bb:dd.f' to explicitly \
                 select the card with the given BDF (PCI bus, device, function)."
            );
            Err(PciError::Ambiguous { count })
        }
    }
}

/// Picks the one supported device and resolves its `bar`.
///
/// Only candidates whose resolved base address is non-zero are counted, so
/// a supported device with an unassigned BAR neither matches nor makes the
/// selection ambiguous. A candidate whose BAR is unreachable on this
/// platform is skipped the same way.
pub fn match_device<'a>(
    ctx: &PciContext,
    entries: &'a [DeviceEntry],
    pci_param: Option<&str>,
    bar: BarIndex,
) -> Result<(DeviceMatch<'a>, BarDescriptor), PciError> {
    let filter = parse_filter(pci_param)?;

    let mut found = Vec::new();
    for (dev, entry) in candidates(ctx, entries, filter) {
        let resolved = match resolve_bar(ctx, dev.address, bar) {
            Ok(resolved) => resolved,
            Err(PciError::UnreachableBar { .. }) => continue,
            Err(e) => return Err(e),
        };
        // TODO: count candidates with an unassigned BAR once callers can
        // tell "ambiguous" apart from "only one usable BAR".
        if resolved.base_address != 0 {
            found.push((
                DeviceMatch {
                    dev: dev.clone(),
                    entry,
                },
                resolved,
            ));
        }
    }
    exactly_one(found)
}

/// Picks the one supported device without looking at its BARs.
pub fn match_single<'a>(
    ctx: &PciContext,
    entries: &'a [DeviceEntry],
    pci_param: Option<&str>,
) -> Result<DeviceMatch<'a>, PciError> {
    let filter = parse_filter(pci_param)?;
    let found = candidates(ctx, entries, filter)
        .map(|(dev, entry)| DeviceMatch {
            dev: dev.clone(),
            entry,
        })
        .collect();
    exactly_one(found)
}
