//! Virtual display allocation
//!
//! Concurrent OCR tasks each need their own X display. The allocator hands out
//! display numbers that are neither reserved by this process nor bound by a
//! display server already running on the machine. Reservations are returned
//! by dropping the [`DisplayLease`].

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Display numbers handed out
pub const DISPLAY_RANGE: Range<u32> = 50..9000;

const BACKOFF_BASE_MS: u64 = 25;
const BACKOFF_CAP_MS: u64 = 1000;

type Observer = Box<dyn Fn() -> HashSet<u32> + Send + Sync>;

/// Process-wide arena of reserved display numbers
pub struct DisplayAllocator {
    reserved: Mutex<HashSet<u32>>,
    observe: Observer,
    range: Range<u32>,
}

impl std::fmt::Debug for DisplayAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayAllocator")
            .field("reserved", &self.reserved.lock().len())
            .field("range", &self.range)
            .finish()
    }
}

impl DisplayAllocator {
    /// Allocator that checks running display servers before reserving
    pub fn new() -> Self {
        Self::with_observer(DISPLAY_RANGE, Box::new(observed_displays))
    }

    /// Allocator over `range` that asks `observe` which numbers the OS already uses
    pub fn with_observer(range: Range<u32>, observe: Observer) -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            observe,
            range,
        }
    }

    /// The allocator shared by every task in this process
    pub fn global() -> Arc<DisplayAllocator> {
        static GLOBAL: OnceLock<Arc<DisplayAllocator>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(DisplayAllocator::new()))
            .clone()
    }

    /// Reserve an unused display number, blocking until one is free.
    ///
    /// Candidates are drawn at random; a collision with a reserved or
    /// OS-observed number backs off with jitter and tries again.
    pub fn acquire(self: &Arc<Self>) -> DisplayLease {
        let mut rng = rand::rng();
        let mut attempt: u64 = 0;
        loop {
            // OS inspection happens outside the lock
            let observed = (self.observe)();
            let candidate = rng.random_range(self.range.clone());
            if !observed.contains(&candidate) && self.try_reserve(candidate) {
                tracing::debug!(display = candidate, attempt, "Reserved display");
                return DisplayLease {
                    allocator: Arc::clone(self),
                    id: candidate,
                };
            }
            attempt += 1;
            let backoff = (BACKOFF_BASE_MS * attempt).min(BACKOFF_CAP_MS);
            let jitter = rng.random_range(0..=BACKOFF_BASE_MS);
            std::thread::sleep(Duration::from_millis(backoff + jitter));
        }
    }

    fn try_reserve(&self, id: u32) -> bool {
        self.reserved.lock().insert(id)
    }

    /// Return a number to the pool; releasing twice is a no-op
    pub fn release(&self, id: u32) {
        if self.reserved.lock().remove(&id) {
            tracing::debug!(display = id, "Released display");
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_reserved(&self, id: u32) -> bool {
        self.reserved.lock().contains(&id)
    }
}

impl Default for DisplayAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved display number, released on drop
#[derive(Debug)]
pub struct DisplayLease {
    allocator: Arc<DisplayAllocator>,
    id: u32,
}

impl DisplayLease {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Value for the `DISPLAY` environment variable
    pub fn display_var(&self) -> String {
        format!(":{}", self.id)
    }
}

impl Drop for DisplayLease {
    fn drop(&mut self) {
        self.allocator.release(self.id);
    }
}

pub(crate) fn lossy<S: AsRef<OsStr>>(s: S) -> String {
    s.as_ref().to_string_lossy().into_owned()
}

/// Parse `:N` (optionally `:N.screen`) into a display number
fn parse_display_arg(arg: &str) -> Option<u32> {
    let rest = arg.strip_prefix(':')?;
    let number = rest.split('.').next()?;
    number.parse().ok()
}

/// Parse `.X<N>-lock` into a display number
fn parse_lock_file(name: &str) -> Option<u32> {
    name.strip_prefix(".X")?.strip_suffix("-lock")?.parse().ok()
}

/// Display numbers in use on this machine.
///
/// Looks at the command lines of running X servers and at the lock files
/// they leave in `/tmp`.
pub fn observed_displays() -> HashSet<u32> {
    use sysinfo::{ProcessRefreshKind, RefreshKind, System};

    let mut ids = HashSet::new();

    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    for process in sys.processes().values() {
        let name = lossy(process.name()).to_lowercase();
        if !(name.contains("xvfb") || name == "xorg" || name.contains("xvnc")) {
            continue;
        }
        for arg in process.cmd() {
            if let Some(id) = parse_display_arg(&lossy(arg)) {
                ids.insert(id);
            }
        }
    }

    if let Ok(entries) = std::fs::read_dir(Path::new("/tmp")) {
        for entry in entries.flatten() {
            if let Some(id) = entry.file_name().to_str().and_then(parse_lock_file) {
                ids.insert(id);
            }
        }
    }

    ids
}
