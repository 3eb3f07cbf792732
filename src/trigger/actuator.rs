use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

pub const DEFAULT_PRESS_COMMAND: &[u8] = b"km.left(1)\r";
pub const DEFAULT_RELEASE_COMMAND: &[u8] = b"km.left(0)\r";

/// Device performing the two-phase action.
///
/// Implementations are shared between the detection workers and the detached
/// action threads, so every method takes `&self`.
pub trait Actuator: Send + Sync {
    /// Actuator identifier for logs.
    fn name(&self) -> &str;

    /// Whether the device can currently accept commands.
    fn is_available(&self) -> bool;

    fn press(&self) -> Result<()>;

    fn release(&self) -> Result<()>;
}

/// Writes one command line per phase to a device node or any `Write`.
///
/// The default commands drive a KMBox-style serial input bridge. An I/O error
/// marks the actuator unavailable until `set_available(true)`.
pub struct LineActuator {
    name: String,
    writer: Mutex<Box<dyn Write + Send>>,
    press_command: Vec<u8>,
    release_command: Vec<u8>,
    available: AtomicBool,
}

impl LineActuator {
    pub fn from_writer(name: impl Into<String>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(writer),
            press_command: DEFAULT_PRESS_COMMAND.to_vec(),
            release_command: DEFAULT_RELEASE_COMMAND.to_vec(),
            available: AtomicBool::new(true),
        }
    }

    /// Open a device node (e.g. `/dev/ttyACM0`) for writing. The line settings
    /// of serial devices are expected to be configured already.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("open actuator device {}", path.display()))?;
        Ok(Self::from_writer(path.display().to_string(), Box::new(file)))
    }

    pub fn with_commands(mut self, press: impl Into<Vec<u8>>, release: impl Into<Vec<u8>>) -> Self {
        self.press_command = press.into();
        self.release_command = release.into();
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn send(&self, command: &[u8]) -> Result<()> {
        if !self.is_available() {
            return Err(anyhow!("actuator {} is not available", self.name));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let result = writer.write_all(command).and_then(|_| writer.flush());
        if let Err(err) = result {
            self.available.store(false, Ordering::SeqCst);
            return Err(anyhow!("write to actuator {}: {}", self.name, err));
        }
        Ok(())
    }
}

impl Actuator for LineActuator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn press(&self) -> Result<()> {
        self.send(&self.press_command)
    }

    fn release(&self) -> Result<()> {
        self.send(&self.release_command)
    }
}

/// Dry-run actuator: logs each phase and counts them.
#[derive(Default)]
pub struct LogActuator {
    presses: AtomicU64,
    releases: AtomicU64,
}

impl LogActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presses(&self) -> u64 {
        self.presses.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Actuator for LogActuator {
    fn name(&self) -> &str {
        "log"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn press(&self) -> Result<()> {
        let n = self.presses.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("actuator: press #{}", n);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let n = self.releases.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("actuator: release #{}", n);
        Ok(())
    }
}
