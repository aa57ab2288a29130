//! Tunnel address allocation
//!
//! Assigns unique tunnel-internal IPv4 addresses to peers from a bounded
//! pool and reclaims them on removal. Allocation is exclusive under
//! arbitrary concurrency: the assigned set lives behind a single
//! `parking_lot::Mutex`, and a linear scan from the lowest host address
//! keeps assignment deterministic. Pool sizes are bounded (≤ 65536), so
//! correctness is prioritized over scan speed.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::AllocatorError;

/// Exclusive allocator over the host addresses of one IPv4 network
#[derive(Debug)]
pub struct AddressAllocator {
    network: Ipv4Net,
    capacity: usize,
    assigned: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressAllocator {
    /// Create an allocator over the usable host addresses of `network`
    /// (network and broadcast addresses excluded for prefixes shorter
    /// than /31)
    #[must_use]
    pub fn new(network: Ipv4Net) -> Self {
        let capacity = match network.prefix_len() {
            32 => 1,
            31 => 2,
            p => ((1u64 << (32 - p)) - 2) as usize,
        };
        debug!(%network, capacity, "address allocator created");
        Self {
            network,
            capacity,
            assigned: Mutex::new(BTreeSet::new()),
        }
    }

    /// Assign the lowest-numbered free address in the pool.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::PoolExhausted`] when every address is
    /// assigned. Never retried internally.
    pub fn allocate(&self) -> Result<Ipv4Addr, AllocatorError> {
        let mut assigned = self.assigned.lock();
        if assigned.len() >= self.capacity {
            warn!(network = %self.network, capacity = self.capacity, "address pool exhausted");
            return Err(AllocatorError::PoolExhausted {
                capacity: self.capacity,
            });
        }
        for addr in self.network.hosts() {
            if assigned.insert(addr) {
                debug!(%addr, "address assigned");
                return Ok(addr);
            }
        }
        // Unreachable while the length check above holds; fail the single
        // request loudly rather than continuing with corrupted accounting.
        warn!(network = %self.network, "assigned set disagrees with pool capacity");
        Err(AllocatorError::PoolExhausted {
            capacity: self.capacity,
        })
    }

    /// Return an address to the free set. Releasing an address that is
    /// already free is a no-op, not an error.
    pub fn release(&self, addr: Ipv4Addr) {
        if self.assigned.lock().remove(&addr) {
            debug!(%addr, "address released");
        }
    }

    /// Whether an address is currently assigned
    #[must_use]
    pub fn is_assigned(&self, addr: Ipv4Addr) -> bool {
        self.assigned.lock().contains(&addr)
    }

    /// Number of assigned addresses
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.assigned.lock().len()
    }

    /// Number of free addresses
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.capacity - self.assigned_count()
    }

    /// Total pool capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The pool network
    #[must_use]
    pub const fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Sorted copy of the assigned set, for invariant checks
    #[must_use]
    pub fn assigned_addresses(&self) -> Vec<Ipv4Addr> {
        self.assigned.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(net: &str) -> AddressAllocator {
        AddressAllocator::new(net.parse().unwrap())
    }

    #[test]
    fn test_capacity() {
        assert_eq!(pool("10.8.0.0/24").capacity(), 254);
        assert_eq!(pool("10.8.0.0/30").capacity(), 2);
        assert_eq!(pool("10.8.0.0/31").capacity(), 2);
        assert_eq!(pool("10.8.0.1/32").capacity(), 1);
    }

    #[test]
    fn test_allocates_lowest_first() {
        let allocator = pool("10.8.0.0/24");
        assert_eq!(allocator.allocate().unwrap(), "10.8.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(allocator.allocate().unwrap(), "10.8.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(allocator.allocate().unwrap(), "10.8.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let allocator = pool("10.8.0.0/30");
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);

        let err = allocator.allocate().unwrap_err();
        assert!(matches!(err, AllocatorError::PoolExhausted { capacity: 2 }));

        // Releasing the lowest address makes it the next assignment
        allocator.release(a);
        assert_eq!(allocator.free_count(), 1);
        assert_eq!(allocator.allocate().unwrap(), a);
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = pool("10.8.0.0/29");
        let addr = allocator.allocate().unwrap();
        allocator.release(addr);
        allocator.release(addr);
        // An address outside the assigned set is a no-op too
        allocator.release("10.8.0.5".parse().unwrap());
        assert_eq!(allocator.assigned_count(), 0);
    }

    #[test]
    fn test_is_assigned() {
        let allocator = pool("10.8.0.0/29");
        let addr = allocator.allocate().unwrap();
        assert!(allocator.is_assigned(addr));
        allocator.release(addr);
        assert!(!allocator.is_assigned(addr));
    }

    #[test]
    fn test_concurrent_allocation_is_exclusive() {
        use std::sync::Arc;
        use std::thread;

        let allocator = Arc::new(pool("10.8.0.0/24"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = Arc::clone(&allocator);
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                while let Ok(addr) = allocator.allocate() {
                    got.push(addr);
                }
                got
            }));
        }

        let mut all: Vec<Ipv4Addr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();

        // Every address handed out exactly once, pool fully drained
        assert_eq!(all.len(), before);
        assert_eq!(all.len(), 254);
        assert_eq!(allocator.free_count(), 0);
    }

    #[test]
    fn test_concurrent_allocate_release_churn() {
        use std::sync::Arc;
        use std::thread;

        let allocator = Arc::new(pool("10.8.0.0/28"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let allocator = Arc::clone(&allocator);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    if let Ok(addr) = allocator.allocate() {
                        assert!(allocator.is_assigned(addr));
                        allocator.release(addr);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(allocator.assigned_count(), 0);
    }
}
