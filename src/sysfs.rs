//! Linux sysfs enumeration backend.
//!
//! Each PCI function shows up as `/sys/bus/pci/devices/dddd:bb:dd.f/` with
//! `vendor`, `device`, `class`, `resource` and `config` nodes. Config space
//! reads beyond the first 64 bytes need root on most kernels.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::access::{PciAccess, PciAddress, PciDev, PCI_NUM_BARS, SYSFS_PCI_DEVICES};
use crate::error::PciError;

/// [`PciAccess`] over a sysfs-shaped directory tree.
#[derive(Debug, Clone)]
pub struct SysfsAccess {
    root: PathBuf,
}

impl Default for SysfsAccess {
    fn default() -> Self {
        Self::new(SYSFS_PCI_DEVICES)
    }
}

impl SysfsAccess {
    /// Uses `root` in place of `/sys/bus/pci/devices`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_device(&self, address: PciAddress) -> Result<PciDev, PciError> {
        let dir = self.device_dir(address);
        let vendor_id = read_hex_attr(&dir.join("vendor"))? as u16;
        let device_id = read_hex_attr(&dir.join("device"))? as u16;
        // class holds 0xCCSSPP, drop the programming interface
        let device_class = (read_hex_attr(&dir.join("class"))? >> 8) as u16;

        let mut dev = PciDev::new(address, vendor_id, device_id);
        dev.device_class = device_class;

        let resource = dir.join("resource");
        match fs::read_to_string(&resource) {
            Ok(content) => dev.sizes = parse_resource_sizes(&content),
            Err(e) => debug!("No resource table for {address}: {e}"),
        }
        Ok(dev)
    }
}

impl PciAccess for SysfsAccess {
    fn scan(&mut self) -> Result<Vec<PciDev>, PciError> {
        let entries = fs::read_dir(&self.root).map_err(|e| PciError::io(&self.root, e))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PciError::io(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(address) = parse_device_name(&name) else {
                trace!("Skipping non-device entry {name}");
                continue;
            };
            devices.push(self.read_device(address)?);
        }
        // read_dir order is unspecified; matching must be deterministic
        devices.sort_by_key(|d| d.address);
        debug!("Scanned {} PCI functions under {}", devices.len(), self.root.display());
        Ok(devices)
    }

    fn read_config(&self, address: PciAddress, offset: u16, buf: &mut [u8]) -> Result<(), PciError> {
        let path = self.device_dir(address).join("config");
        let file = File::open(&path).map_err(|e| PciError::io(&path, e))?;
        file.read_exact_at(buf, u64::from(offset))
            .map_err(|e| PciError::io(&path, e))
    }

    fn write_config(&mut self, address: PciAddress, offset: u16, data: &[u8]) -> Result<(), PciError> {
        let path = self.device_dir(address).join("config");
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| PciError::io(&path, e))?;
        file.write_all_at(data, u64::from(offset))
            .map_err(|e| PciError::io(&path, e))
    }

    fn device_dir(&self, address: PciAddress) -> PathBuf {
        self.root.join(address.to_string())
    }
}

/// Parses a sysfs directory name of the form `dddd:bb:dd.f`.
pub fn parse_device_name(name: &str) -> Option<PciAddress> {
    let (rest, function) = name.rsplit_once('.')?;
    let mut parts = rest.split(':');
    let domain = u32::from_str_radix(parts.next()?, 16).ok()?;
    let bus = u8::from_str_radix(parts.next()?, 16).ok()?;
    let device = u8::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    let function = u8::from_str_radix(function, 16).ok()?;
    if device > 0x1f || function > 7 {
        return None;
    }
    Some(PciAddress::new(domain, bus, device, function))
}

/// Extracts BAR0..BAR5 sizes from the `resource` table.
///
/// Each line is `start end flags` in hex; an all-zero line is an
/// unimplemented BAR.
pub fn parse_resource_sizes(content: &str) -> [u64; PCI_NUM_BARS] {
    let mut sizes = [0u64; PCI_NUM_BARS];
    for (slot, line) in sizes.iter_mut().zip(content.lines()) {
        let mut fields = line.split_whitespace().map(parse_hex);
        let (Some(Some(start)), Some(Some(end))) = (fields.next(), fields.next()) else {
            continue;
        };
        if end > start || (end == start && end != 0) {
            *slot = end - start + 1;
        }
    }
    sizes
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

fn read_hex_attr(path: &Path) -> Result<u64, PciError> {
    let content = fs::read_to_string(path).map_err(|e| PciError::io(path, e))?;
    parse_hex(&content).ok_or_else(|| {
        PciError::io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("not a hex value: {:?}", content.trim()),
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestDir;

    #[test]
    fn parses_device_names() {
        assert_eq!(
            parse_device_name("0000:00:1f.0"),
            Some(PciAddress::new(0, 0, 0x1f, 0))
        );
        assert_eq!(
            parse_device_name("10000:3b:00.7"),
            Some(PciAddress::new(0x10000, 0x3b, 0, 7))
        );
        assert_eq!(parse_device_name("0000:00:20.0"), None);
        assert_eq!(parse_device_name("0000:00:1f.8"), None);
        assert_eq!(parse_device_name("pci0000:00"), None);
    }

    #[test]
    fn resource_sizes_skip_unimplemented_bars() {
        let table = "\
0x00000000f0000000 0x00000000f0003fff 0x0000000000040200
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x000000000000e000 0x000000000000e01f 0x0000000000040101
";
        let sizes = parse_resource_sizes(table);
        assert_eq!(sizes, [0x4000, 0, 0x20, 0, 0, 0]);
    }

    #[test]
    fn scans_fake_tree_in_address_order() {
        let dir = TestDir::new("sysfs-scan");
        for (name, vendor, device) in [
            ("0000:01:00.0", "0x10de", "0x1c82"),
            ("0000:00:1f.0", "0x8086", "0xa304"),
        ] {
            let dev = dir.path().join(name);
            fs::create_dir_all(&dev).unwrap();
            fs::write(dev.join("vendor"), format!("{vendor}\n")).unwrap();
            fs::write(dev.join("device"), format!("{device}\n")).unwrap();
            fs::write(dev.join("class"), "0x060100\n").unwrap();
        }
        fs::create_dir_all(dir.path().join("not-a-device")).unwrap();

        let mut access = SysfsAccess::new(dir.path());
        let devices = access.scan().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, PciAddress::new(0, 0, 0x1f, 0));
        assert_eq!(devices[0].vendor_id, 0x8086);
        assert_eq!(devices[0].device_class, 0x0601);
        assert_eq!(devices[1].device_id, 0x1c82);
    }

    #[test]
    fn config_space_reads_and_writes_at_offset() {
        let dir = TestDir::new("sysfs-config");
        let address = PciAddress::new(0, 0, 2, 0);
        let dev = dir.path().join(address.to_string());
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("config"), [0u8; 64]).unwrap();

        let mut access = SysfsAccess::new(dir.path());
        access
            .write_config(address, 0x10, &[0x04, 0x00, 0x00, 0xf0])
            .unwrap();
        let mut buf = [0u8; 4];
        access.read_config(address, 0x10, &mut buf).unwrap();
        assert_eq!(buf, [0x04, 0x00, 0x00, 0xf0]);
    }

    #[test]
    fn missing_config_reports_path() {
        let dir = TestDir::new("sysfs-missing");
        let access = SysfsAccess::new(dir.path());
        let mut buf = [0u8; 1];
        let err = access
            .read_config(PciAddress::new(0, 9, 0, 0), 0, &mut buf)
            .unwrap_err();
        assert!(matches!(err, PciError::Io { ref path, .. } if path.ends_with("config")));
        assert_eq!(err.raw_os_error(), Some(2));
    }
}
