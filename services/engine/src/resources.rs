//! Host capacity probing and the engine's resource ledger.

use gantry_api::Capacity;

/// Measured host resources, used to default the agent's allocatable
/// capacity when none is configured.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_millis: i64,
    pub total_memory_bytes: i64,
    pub available_memory_bytes: i64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_millis = get_cpu_count() as i64 * 1000;
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_millis,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }

    /// The allocatable capacity this host advertises.
    pub fn capacity(&self) -> Capacity {
        Capacity {
            cpu_millis: self.cpu_millis,
            memory_bytes: self.total_memory_bytes,
        }
    }
}

fn get_cpu_count() -> i32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as i32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as i32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (i64, i64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    sysconf_memory_info()
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (i64, i64) {
    sysconf_memory_info()
}

fn sysconf_memory_info() -> (i64, i64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size * total_pages) as i64;
            return (total, total / 2);
        }
    }

    (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024)
}

#[cfg(target_os = "linux")]
fn parse_meminfo(content: &str) -> (i64, i64) {
    const KB_TO_BYTES: i64 = 1024;
    let mut total: i64 = 0;
    let mut available: i64 = 0;
    let mut free: i64 = 0;
    let mut buffers: i64 = 0;
    let mut cached: i64 = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            let value: i64 = parts[1].parse().unwrap_or(0) * KB_TO_BYTES;
            match parts[0] {
                "MemTotal:" => total = value,
                "MemAvailable:" => available = value,
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

/// Aggregate reserved/used capacity of this agent.
///
/// Every live (non-terminal) container holds one reservation; the reservation
/// is taken before any side-effecting work and returned when the container
/// reaches a terminal state.
#[derive(Debug)]
pub struct ResourceLedger {
    total: Capacity,
    used: Capacity,
}

impl ResourceLedger {
    pub fn new(total: Capacity) -> Self {
        Self {
            total,
            used: Capacity::ZERO,
        }
    }

    pub fn total(&self) -> Capacity {
        self.total
    }

    pub fn used(&self) -> Capacity {
        self.used
    }

    pub fn free(&self) -> Capacity {
        self.total.saturating_sub(&self.used)
    }

    /// Reserve `want`, or refuse without changing anything.
    pub fn try_reserve(&mut self, want: &Capacity) -> bool {
        if !want.fits_within(&self.free()) {
            return false;
        }
        self.used = self.used.saturating_add(want);
        true
    }

    /// Return a reservation previously taken with `try_reserve`.
    pub fn release(&mut self, held: &Capacity) {
        self.used = self.used.saturating_sub(held);
    }
}
