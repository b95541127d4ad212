//! 4.A Proxy-port allocator.
//!
//! Hands out unique ephemeral local ports in a configured range and releases
//! them on return. `alloc` never returns zero. Whether an allocated port is
//! actually free is the caller's problem — a collision is reported by the
//! `bind` attempt the caller makes next, not by this allocator.

use std::str::FromStr;

use parking_lot::Mutex;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end);
        Self { start, end }
    }

    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// Defaults to the ephemeral range, as `spec.md` §4.A requires when no range
/// is configured.
impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 32768,
            end: 60999,
        }
    }
}

#[derive(Debug)]
pub struct PortRangeParseError(String);

impl std::fmt::Display for PortRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid port range: {}", self.0)
    }
}

impl std::error::Error for PortRangeParseError {}

impl FromStr for PortRange {
    type Err = PortRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| PortRangeParseError(s.to_string()))?;

        let start: u16 = start
            .parse()
            .map_err(|_| PortRangeParseError(s.to_string()))?;
        let end: u16 = end
            .parse()
            .map_err(|_| PortRangeParseError(s.to_string()))?;

        if start > end {
            return Err(PortRangeParseError(s.to_string()));
        }

        Ok(Self { start, end })
    }
}

/// A bitset-backed free-port pool. Allocation starts at a random offset so
/// that repeated runs don't hand out the same low end of the range first
/// (the same reasoning RFC 6056 gives for randomizing ephemeral ports).
pub struct PortAllocator {
    inner: Mutex<Bitset>,
}

struct Bitset {
    range: PortRange,
    buckets: Vec<u64>,
    allocated: usize,
}

impl Bitset {
    fn new(range: PortRange) -> Self {
        let bucket_count = range.size().div_ceil(64);
        Self {
            buckets: vec![0; bucket_count],
            allocated: 0,
            range,
        }
    }

    fn is_set(&self, index: usize) -> bool {
        let bucket = index / 64;
        let bit = index % 64;
        self.buckets[bucket] & (1 << bit) != 0
    }

    fn set(&mut self, index: usize, value: bool) {
        let bucket = index / 64;
        let bit = index % 64;
        if value {
            self.buckets[bucket] |= 1 << bit;
        } else {
            self.buckets[bucket] &= !(1 << bit);
        }
    }

    fn alloc_next(&mut self, start: usize) -> Option<u16> {
        let size = self.range.size();
        if self.allocated >= size {
            return None;
        }

        for offset in 0..size {
            let index = (start + offset) % size;
            if !self.is_set(index) {
                self.set(index, true);
                self.allocated += 1;
                return Some(self.range.start + index as u16);
            }
        }

        None
    }

    fn release(&mut self, port: u16) {
        if !self.range.contains(port) {
            return;
        }

        let index = (port - self.range.start) as usize;
        if self.is_set(index) {
            self.set(index, false);
            self.allocated -= 1;
        }
    }
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            inner: Mutex::new(Bitset::new(range)),
        }
    }

    pub fn range(&self) -> PortRange {
        self.inner.lock().range
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Allocate the next free port in the range, starting the scan from a
    /// random offset. Returns `None` once the range is exhausted.
    pub fn allocate_next(&self) -> Option<u16> {
        let mut guard = self.inner.lock();
        let size = guard.range.size();
        let start = rand::rng().random_range(0..size);
        guard.alloc_next(start)
    }

    /// Return a previously allocated port to the pool. Releasing a port that
    /// was never allocated (or is outside the range) is tolerated silently.
    pub fn release(&self, port: u16) {
        self.inner.lock().release(port);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}
