//! Host capacity measurement and per-node resource accounting.

use std::sync::Mutex;

use bidmesh_bidstrategy::CapacitySource;
use bidmesh_model::ResourceUsage;
use tracing::debug;

/// Resources the host has, measured at startup.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: u64,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }

    /// Capacity to offer: `configured` quantities win, zeros are filled
    /// from the measurement. Disk is not measured and is unbounded unless
    /// configured.
    pub fn capacity(&self, configured: &ResourceUsage) -> ResourceUsage {
        configured.or_defaults(&ResourceUsage {
            cpu: self.cpu_cores as f64,
            memory: self.available_memory_bytes,
            disk: u64::MAX,
            gpu: 0,
        })
    }
}

fn get_cpu_count() -> u64 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u64;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u64)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, available) = parse_meminfo(&meminfo);
        if total > 0 {
            return (total, available);
        }
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        let total = (page_size * total_pages) as u64;
        let avail = if avail_pages > 0 {
            (page_size * avail_pages) as u64
        } else {
            total
        };
        return (total, avail);
    }

    (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024)
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size * total_pages) as u64;
            return (total, total / 2);
        }
    }

    (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024)
}

/// Parses `MemTotal` and `MemAvailable` (in bytes) from `/proc/meminfo`.
/// Older kernels without `MemAvailable` get free + buffers + cached.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    const KB_TO_BYTES: u64 = 1024;
    let mut total = 0;
    let mut available = None;
    let mut reclaimable = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = Some(value),
            "MemFree:" | "Buffers:" | "Cached:" => reclaimable += value,
            _ => {}
        }
    }

    (total, available.unwrap_or(reclaimable))
}

/// Tracks resources reserved by running shards.
#[derive(Debug)]
pub struct CapacityTracker {
    total: ResourceUsage,
    reserved: Mutex<ResourceUsage>,
}

impl CapacityTracker {
    pub fn new(total: ResourceUsage) -> Self {
        Self {
            total,
            reserved: Mutex::new(ResourceUsage::default()),
        }
    }

    pub fn total(&self) -> ResourceUsage {
        self.total
    }

    /// Reserves `usage` if it fits in what is left.
    pub fn reserve(&self, usage: &ResourceUsage) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let next = reserved.saturating_add(usage);
        if !next.fits_within(&self.total) {
            return false;
        }
        *reserved = next;
        debug!(cpu = reserved.cpu, memory = reserved.memory, "Reserved capacity");
        true
    }

    pub fn release(&self, usage: &ResourceUsage) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        *reserved = reserved.saturating_sub(usage);
    }
}

impl CapacitySource for CapacityTracker {
    fn available(&self) -> ResourceUsage {
        let reserved = *self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        self.total.saturating_sub(&reserved)
    }
}
