//! Loopback port allocation for child proxies.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use botlink_settings::PortSettings;

/// Hands out free loopback ports from a fixed range.
///
/// A port is "free" when it is not already allocated here and a throwaway
/// listener can bind it on `127.0.0.1`. The bind is released immediately,
/// so the caller must bind for real soon after.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    random_attempts: u32,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator for the configured range.
    pub fn new(settings: &PortSettings) -> Self {
        Self {
            range: settings.range_start..=settings.range_end,
            random_attempts: settings.random_attempts,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a free port.
    ///
    /// Random picks first, then a linear scan. `None` means every port in
    /// the range is allocated or unbindable. Checking binds sockets, so async
    /// callers should run this on the blocking pool.
    pub fn acquire(&self) -> Option<u16> {
        if self.range.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        for _ in 0..self.random_attempts {
            let port = rng.random_range(self.range.clone());
            if self.try_claim(port) {
                return Some(port);
            }
        }
        self.range.clone().find(|port| self.try_claim(*port))
    }

    /// Bind check runs without the lock held; the final insert settles races.
    fn try_claim(&self, port: u16) -> bool {
        if self.allocated.lock().contains(&port) || !can_bind(port) {
            return false;
        }
        self.allocated.lock().insert(port)
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if !self.allocated.lock().remove(&port) {
            debug!(port, "release of unallocated port ignored");
        }
    }

    /// Whether `port` is currently handed out.
    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.lock().contains(&port)
    }

    /// Number of ports currently handed out.
    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }
}

fn can_bind(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(start: u16, end: u16) -> PortSettings {
        PortSettings {
            range_start: start,
            range_end: end,
            random_attempts: 10,
        }
    }

    /// Find a small window of currently bindable ports.
    fn free_window(len: u16) -> (u16, u16) {
        let scratch = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let base = scratch.local_addr().unwrap().port();
        drop(scratch);
        let start = base.saturating_sub(len - 1).max(1024);
        (start, start + len - 1)
    }

    #[test]
    fn acquired_ports_are_in_range_and_unique() {
        let (start, end) = free_window(64);
        let ports = PortAllocator::new(&settings(start, end));
        let mut seen = HashSet::new();
        for _ in 0..8 {
            let port = ports.acquire().unwrap();
            assert!((start..=end).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert_eq!(ports.allocated_count(), 8);
    }

    #[test]
    fn exhaustion_returns_none_and_release_restores() {
        let (start, _) = free_window(1);
        let ports = PortAllocator::new(&settings(start, start));
        let first = ports.acquire().unwrap();
        assert_eq!(first, start);
        assert!(ports.acquire().is_none());

        ports.release(first);
        assert!(!ports.is_allocated(first));
        assert_eq!(ports.acquire(), Some(start));
    }

    #[test]
    fn ports_in_use_are_skipped() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = busy.local_addr().unwrap().port();
        let ports = PortAllocator::new(&settings(port, port));
        assert!(ports.acquire().is_none());
    }

    #[test]
    fn concurrent_acquires_never_share_a_port() {
        let (start, end) = free_window(64);
        let ports = PortAllocator::new(&settings(start, end));
        let handed_out: Vec<u16> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| (0..4).filter_map(|_| ports.acquire()).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        let unique: HashSet<u16> = handed_out.iter().copied().collect();
        assert_eq!(unique.len(), handed_out.len());
        assert_eq!(ports.allocated_count(), handed_out.len());
    }

    #[test]
    fn releasing_unknown_port_is_noop() {
        let ports = PortAllocator::new(&settings(40_000, 40_010));
        ports.release(40_005);
        assert_eq!(ports.allocated_count(), 0);
    }
}
