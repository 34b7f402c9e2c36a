//! Kernel Logging
//!
//! Provides logging infrastructure using the `log` crate.
//!
//! Log messages are formatted into a fixed-size ring buffer which a
//! userspace log daemon drains via syscall. Formatting happens into a
//! stack buffer first so the ring lock is held only for the copy.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Maximum size of one formatted log entry.
const LOG_ENTRY_SIZE: usize = 128;

/// Number of entries in the ring.
const LOG_ENTRIES: usize = 256;

/// One formatted entry in the ring buffer.
#[derive(Clone, Copy)]
struct LogEntry {
    data: [u8; LOG_ENTRY_SIZE],
    len: usize,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            data: [0; LOG_ENTRY_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

/// Stack buffer for formatting a message before pushing it to the ring.
struct MessageBuffer {
    data: [u8; LOG_ENTRY_SIZE],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0; LOG_ENTRY_SIZE],
            len: 0,
        }
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = LOG_ENTRY_SIZE - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

/// The ring of formatted entries. Overwrites the oldest entry when full.
struct LogRing {
    entries: [LogEntry; LOG_ENTRIES],
    head: usize,
    count: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_ENTRIES],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.head] = entry;
        self.head = (self.head + 1) % LOG_ENTRIES;
        if self.count < LOG_ENTRIES {
            self.count += 1;
        }
    }
}

static LOG_RING: Once<Mutex<LogRing>> = Once::new();

fn get_ring() -> &'static Mutex<LogRing> {
    LOG_RING.call_once(|| Mutex::new(LogRing::new()))
}

/// Kernel logger implementation.
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // Format into a stack buffer first (no locks held).
            let mut msg = MessageBuffer::new();
            let _ = write!(
                msg,
                "{:>5} {}: {}",
                record.level(),
                record.target(),
                record.args()
            );

            let mut entry = LogEntry::empty();
            entry.data = msg.data;
            entry.len = msg.len;
            get_ring().lock().push(entry);
        }
    }

    fn flush(&self) {}
}

/// Global logger instance.
static LOGGER: KernelLogger = KernelLogger;

/// Initialise the logging system.
///
/// Safe to call multiple times; only the first call installs the logger.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .ok();
}

/// Drain buffered entries, newest last, through `f`.
///
/// Entries are consumed; a second drain yields nothing new.
pub fn drain<F: FnMut(&str)>(mut f: F) {
    let mut ring = get_ring().lock();
    let count = ring.count;
    let start = (ring.head + LOG_ENTRIES - count) % LOG_ENTRIES;
    for i in 0..count {
        let entry = ring.entries[(start + i) % LOG_ENTRIES];
        f(entry.as_str());
    }
    ring.count = 0;
}
