#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use pcidev::PciAddress;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Sysfs-shaped device tree in a temp directory, removed on drop.
///
/// Every device gets the nodes `SysfsAccess` and `DeviceHandle` read:
/// `vendor`, `device`, `class`, `resource`, a 256-byte `config`, `enable`
/// and one zero-filled `resource<N>` per implemented BAR.
pub struct SysfsTree {
    root: PathBuf,
}

impl SysfsTree {
    pub fn new(tag: &str) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!("pcidev-it-{tag}-{}-{n}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node(&self, address: PciAddress) -> PathBuf {
        self.root.join(address.to_string())
    }

    /// Normal-header device with memory decoding on and BAR0 at `bar0`.
    pub fn add_device(&self, address: PciAddress, ids: (u16, u16), bar0: u32, enable: &str, sizes: &[u64]) {
        let node = self.node(address);
        fs::create_dir_all(&node).unwrap();
        fs::write(node.join("vendor"), format!("{:#06x}\n", ids.0)).unwrap();
        fs::write(node.join("device"), format!("{:#06x}\n", ids.1)).unwrap();
        fs::write(node.join("class"), "0x020000\n").unwrap();
        fs::write(node.join("enable"), enable).unwrap();

        let mut config = [0u8; 256];
        config[0..2].copy_from_slice(&ids.0.to_le_bytes());
        config[2..4].copy_from_slice(&ids.1.to_le_bytes());
        config[0x04] = 0x02;
        config[0x10..0x14].copy_from_slice(&bar0.to_le_bytes());
        fs::write(node.join("config"), config).unwrap();

        let mut table = String::new();
        for bar in 0..6 {
            let size = sizes.get(bar).copied().unwrap_or(0);
            if size == 0 {
                table.push_str("0x0000000000000000 0x0000000000000000 0x0000000000000000\n");
                continue;
            }
            let start = 0xe000_0000u64 + (bar as u64) * 0x10_0000;
            table.push_str(&format!("{start:#018x} {:#018x} 0x0000000000040200\n", start + size - 1));
            fs::write(node.join(format!("resource{bar}")), vec![0u8; size as usize]).unwrap();
        }
        fs::write(node.join("resource"), table).unwrap();
    }

    pub fn poke(&self, address: PciAddress, offset: u64, bytes: &[u8]) {
        let config = OpenOptions::new()
            .write(true)
            .open(self.node(address).join("config"))
            .unwrap();
        config.write_all_at(bytes, offset).unwrap();
    }

    pub fn peek(&self, address: PciAddress, offset: usize, len: usize) -> Vec<u8> {
        self.read(address, "config")[offset..offset + len].to_vec()
    }

    pub fn read(&self, address: PciAddress, name: &str) -> Vec<u8> {
        fs::read(self.node(address).join(name)).unwrap()
    }
}

impl Drop for SysfsTree {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
