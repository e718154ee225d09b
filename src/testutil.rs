use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::access::{PciAccess, PciAddress, PciDev, SYSFS_PCI_DEVICES};
use crate::error::PciError;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory removed on drop.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(tag: &str) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("pcidev-{tag}-{}-{n}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

type ConfigSpace = Rc<RefCell<HashMap<PciAddress, [u8; 256]>>>;

/// In-memory bus. Clones share configuration space, so a test can keep one
/// clone to inspect registers after handing the other to a session.
#[derive(Clone, Default)]
pub struct FakePci {
    devices: Vec<PciDev>,
    config: ConfigSpace,
    root: Option<PathBuf>,
}

impl FakePci {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    /// Adds a normal-header device with memory decoding enabled.
    pub fn add(&mut self, address: PciAddress, vendor_id: u16, device_id: u16) -> &mut PciDev {
        let mut cfg = [0u8; 256];
        cfg[0..2].copy_from_slice(&vendor_id.to_le_bytes());
        cfg[2..4].copy_from_slice(&device_id.to_le_bytes());
        cfg[0x04] = 0x02;
        self.config.borrow_mut().insert(address, cfg);
        self.devices.push(PciDev::new(address, vendor_id, device_id));
        self.devices.last_mut().unwrap()
    }

    pub fn set_u8(&self, address: PciAddress, off: usize, v: u8) {
        self.config.borrow_mut().get_mut(&address).unwrap()[off] = v;
    }

    pub fn set_u16(&self, address: PciAddress, off: usize, v: u16) {
        self.config.borrow_mut().get_mut(&address).unwrap()[off..off + 2]
            .copy_from_slice(&v.to_le_bytes());
    }

    pub fn set_u32(&self, address: PciAddress, off: usize, v: u32) {
        self.config.borrow_mut().get_mut(&address).unwrap()[off..off + 4]
            .copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u32(&self, address: PciAddress, off: usize) -> u32 {
        let cfg = self.config.borrow();
        let bytes = &cfg[&address][off..off + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl PciAccess for FakePci {
    fn scan(&mut self) -> Result<Vec<PciDev>, PciError> {
        Ok(self.devices.clone())
    }

    fn read_config(&self, address: PciAddress, offset: u16, buf: &mut [u8]) -> Result<(), PciError> {
        let cfg = self.config.borrow();
        let space = cfg.get(&address).copied().unwrap_or([0xff; 256]);
        let off = usize::from(offset);
        buf.copy_from_slice(&space[off..off + buf.len()]);
        Ok(())
    }

    fn write_config(&mut self, address: PciAddress, offset: u16, data: &[u8]) -> Result<(), PciError> {
        let mut cfg = self.config.borrow_mut();
        let space = cfg.entry(address).or_insert([0xff; 256]);
        let off = usize::from(offset);
        space[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn device_dir(&self, address: PciAddress) -> PathBuf {
        self.root
            .as_deref()
            .unwrap_or_else(|| Path::new(SYSFS_PCI_DEVICES))
            .join(address.to_string())
    }
}

/// Records the level and message of every event emitted inside [`LogCapture::run`].
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), message.0));
    }
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with this capture as the thread's subscriber.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, m)| *l == level && m.contains(needle))
            .count()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.count(level, needle) > 0
    }
}
