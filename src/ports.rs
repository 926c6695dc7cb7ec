// RTP/RTCP port-pair allocator

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::{Error, Result};

/// An RTP/RTCP port pair: even RTP port plus the odd port above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

// Leases even/odd port pairs from the configured range. Only the set of
// in-use RTP ports is tracked; binding is the caller's business.
pub struct PortAllocator {
    range: (u16, u16),
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        PortAllocator {
            range,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lease the lowest-numbered free even port in the range.
    pub fn acquire(&self) -> Result<PortPair> {
        let mut in_use = self.in_use.lock().unwrap();
        let start = self.range.0 + (self.range.0 % 2);
        let mut port = start;
        while port < self.range.1 {
            if !in_use.contains(&port) {
                in_use.insert(port);
                return Ok(PortPair {
                    rtp: port,
                    rtcp: port + 1,
                });
            }
            port += 2;
        }
        Err(Error::NoPortsAvailable)
    }

    /// Release a leased pair. Releasing twice, or releasing a port that was
    /// never leased here, is a no-op.
    pub fn release(&self, rtp_port: u16) {
        if rtp_port < self.range.0 || rtp_port >= self.range.1 {
            return;
        }
        self.in_use.lock().unwrap().remove(&rtp_port);
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_lowest_even() {
        let allocator = PortAllocator::new((10_000, 10_010));
        let first = allocator.acquire().unwrap();
        assert_eq!(first, PortPair { rtp: 10_000, rtcp: 10_001 });
        let second = allocator.acquire().unwrap();
        assert_eq!(second.rtp, 10_002);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new((10_000, 10_004));
        allocator.acquire().unwrap();
        allocator.acquire().unwrap();
        assert!(matches!(
            allocator.acquire().unwrap_err(),
            Error::NoPortsAvailable
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new((10_000, 10_004));
        let pair = allocator.acquire().unwrap();
        allocator.release(pair.rtp);
        allocator.release(pair.rtp);
        assert_eq!(allocator.in_use_count(), 0);

        // The freed pair is reused, lowest first
        assert_eq!(allocator.acquire().unwrap().rtp, 10_000);
    }

    #[test]
    fn test_release_ignores_foreign_ports() {
        let allocator = PortAllocator::new((10_000, 10_004));
        allocator.release(9_998);
        allocator.release(20_000);
        assert_eq!(allocator.in_use_count(), 0);
    }

    #[test]
    fn test_odd_range_start_rounds_up() {
        let allocator = PortAllocator::new((10_001, 10_006));
        assert_eq!(allocator.acquire().unwrap().rtp, 10_002);
    }

    #[test]
    fn test_no_pair_shares_a_port() {
        let allocator = PortAllocator::new((10_000, 10_100));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let pair = allocator.acquire().unwrap();
            assert!(seen.insert(pair.rtp));
            assert!(seen.insert(pair.rtcp));
        }
    }
}
