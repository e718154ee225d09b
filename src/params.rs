//! Programmer parameter string, `key=value[,key=value...]`.
//!
//! Components pull out the keys they understand with
//! [`ProgrammerParams::extract`]; whatever is left afterwards was not
//! understood by anyone and is reported by the caller.

use crate::error::PciError;

/// Parameter key carrying the `[domain:]bus:device.function` filter.
pub const PCI_PARAM: &str = "pci";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgrammerParams {
    entries: Vec<(String, String)>,
}

impl ProgrammerParams {
    pub fn parse(s: &str) -> Result<Self, PciError> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                PciError::InvalidParameter(format!("missing '=' in \"{item}\""))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(PciError::InvalidParameter(format!(
                    "empty key in \"{item}\""
                )));
            }
            if entries.iter().any(|(k, _)| k == key) {
                return Err(PciError::InvalidParameter(format!(
                    "\"{key}\" given more than once"
                )));
            }
            entries.push((key.to_string(), value.trim().to_string()));
        }
        Ok(Self { entries })
    }

    /// Removes `key` and returns its value.
    ///
    /// An empty value counts as absent, so `pci=` means "match any device".
    pub fn extract(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        let (_, value) = self.entries.remove(idx);
        (!value.is_empty()).then_some(value)
    }

    /// Keys nobody extracted.
    pub fn unhandled(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
