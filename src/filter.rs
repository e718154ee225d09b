//! Bus:device.function slot filter.
//!
//! Accepts `[[[domain]:][bus]:][slot][.[func]]` in hexadecimal. Any
//! component that is left empty or given as `*` matches everything.

use std::fmt;
use std::str::FromStr;

use crate::access::{PciAddress, PciDev};
use crate::error::PciError;

/// Restricts device selection to a (partial) PCI address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub domain: Option<u32>,
    pub bus: Option<u8>,
    pub slot: Option<u8>,
    pub func: Option<u8>,
}

impl SlotFilter {
    /// Filter that matches every device.
    pub fn any() -> Self {
        Self::default()
    }

    /// Parses an optional `pci=` value; `None` yields the match-all filter.
    pub fn from_param(param: Option<&str>) -> Result<Self, PciError> {
        param.map_or(Ok(Self::any()), str::parse)
    }

    pub fn matches_address(&self, address: &PciAddress) -> bool {
        self.domain.map_or(true, |d| d == address.domain)
            && self.bus.map_or(true, |b| b == address.bus)
            && self.slot.map_or(true, |s| s == address.device)
            && self.func.map_or(true, |f| f == address.function)
    }

    pub fn matches(&self, dev: &PciDev) -> bool {
        self.matches_address(&dev.address)
    }
}

fn field(s: &str, max: u32, reason: &'static str) -> Result<Option<u32>, &'static str> {
    if s.is_empty() || s == "*" {
        return Ok(None);
    }
    match u32::from_str_radix(s, 16) {
        Ok(v) if v <= max => Ok(Some(v)),
        _ => Err(reason),
    }
}

fn parse_slot(s: &str) -> Result<SlotFilter, &'static str> {
    let mut filter = SlotFilter::default();

    // The last ':' separates bus from slot, the first one domain from bus.
    let (prefix, tail) = match s.rsplit_once(':') {
        Some((prefix, tail)) => (Some(prefix), tail),
        None => (None, s),
    };
    if let Some(prefix) = prefix {
        let bus = match prefix.split_once(':') {
            Some((domain, bus)) => {
                filter.domain = field(domain, 0x7fff_ffff, "Invalid domain number")?;
                bus
            }
            None => prefix,
        };
        filter.bus = field(bus, 0xff, "Invalid bus number")?.map(|v| v as u8);
    }

    let (slot, func) = match tail.split_once('.') {
        Some((slot, func)) => (slot, Some(func)),
        None => (tail, None),
    };
    filter.slot = field(slot, 0x1f, "Invalid slot number")?.map(|v| v as u8);
    if let Some(func) = func {
        filter.func = field(func, 7, "Invalid function number")?.map(|v| v as u8);
    }
    Ok(filter)
}

impl FromStr for SlotFilter {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_slot(s).map_err(|reason| PciError::BadFilter {
            filter: s.to_string(),
            reason,
        })
    }
}

impl fmt::Display for SlotFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain {
            Some(d) => write!(f, "{d:04x}:")?,
            None => write!(f, "*:")?,
        }
        match self.bus {
            Some(b) => write!(f, "{b:02x}:")?,
            None => write!(f, "*:")?,
        }
        match self.slot {
            Some(s) => write!(f, "{s:02x}.")?,
            None => write!(f, "*.")?,
        }
        match self.func {
            Some(func) => write!(f, "{func:x}"),
            None => write!(f, "*"),
        }
    }
}
