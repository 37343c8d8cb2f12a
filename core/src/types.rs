use std::sync::atomic::{AtomicBool, Ordering};

/// Size of an addressable sector on the emulated drive
pub const SECTOR_SIZE: usize = 256;

/// A single sector worth of data
pub type Sector = [u8; SECTOR_SIZE];

/// Number of LUNs in a LUN directory
pub const LUN_COUNT: usize = 8;

/// Self-clearing latch for the host reset condition.
///
/// This is the only state shared with interrupt context: the platform's
/// falling-edge handler on RST calls [`ResetLatch::set`] and nothing else.
#[derive(Debug, Default)]
pub struct ResetLatch {
    val: AtomicBool,
}

impl ResetLatch {
    pub const fn new() -> Self {
        Self {
            val: AtomicBool::new(false),
        }
    }

    /// Sets the latch.
    pub fn set(&self) {
        self.val.store(true, Ordering::Release);
    }

    pub fn write(&self, val: bool) {
        self.val.store(val, Ordering::Release);
    }

    /// Peeks at the latch without clearing it
    pub fn peek(&self) -> bool {
        self.val.load(Ordering::Acquire)
    }
}
