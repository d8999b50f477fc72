//! [`PortPool`] – the set of ports held by live device records.
//!
//! A port joins the set when it is chosen for a new device and leaves it
//! when that device is destroyed; no port is ever handed out twice while
//! held.  Candidates are drawn at random from the range and rejected on
//! collision, with a linear sweep as the fallback once the range is nearly
//! full.

use std::collections::BTreeSet;

use labmesh_types::LabError;
use rand::Rng;
use rand::rngs::StdRng;
use rand::SeedableRng;

const RANDOM_ATTEMPTS: usize = 64;

#[derive(Debug)]
pub struct PortPool {
    low: u16,
    high: u16,
    used: BTreeSet<u16>,
    rng: StdRng,
}

impl PortPool {
    /// Pool over `low..high` (upper bound excluded).
    pub fn new(low: u16, high: u16) -> Self {
        Self::with_rng(low, high, StdRng::from_entropy())
    }

    /// Deterministic pool for tests.
    pub fn seeded(low: u16, high: u16, seed: u64) -> Self {
        Self::with_rng(low, high, StdRng::seed_from_u64(seed))
    }

    fn with_rng(low: u16, high: u16, rng: StdRng) -> Self {
        Self {
            low,
            high: high.max(low),
            used: BTreeSet::new(),
            rng,
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.high - self.low)
    }

    /// Held ports that lie inside the range.
    fn held_in_range(&self) -> usize {
        self.used.range(self.low..self.high).count()
    }

    /// Take one free port.
    pub fn allocate(&mut self) -> Result<u16, LabError> {
        if self.held_in_range() >= self.capacity() {
            return Err(self.exhausted());
        }
        for _ in 0..RANDOM_ATTEMPTS {
            let port = self.rng.gen_range(self.low..self.high);
            if self.used.insert(port) {
                return Ok(port);
            }
        }
        let port = (self.low..self.high)
            .find(|p| !self.used.contains(p))
            .ok_or_else(|| self.exhausted())?;
        self.used.insert(port);
        Ok(port)
    }

    /// Take two distinct free ports (request, publish).  Either both are
    /// taken or neither is.
    pub fn allocate_pair(&mut self) -> Result<(u16, u16), LabError> {
        let first = self.allocate()?;
        match self.allocate() {
            Ok(second) => Ok((first, second)),
            Err(e) => {
                self.used.remove(&first);
                Err(e)
            }
        }
    }

    /// Mark a caller-chosen port as used.  Returns `false` when it already
    /// was.  Ports outside the range can be reserved too; they never count
    /// against the range's capacity.
    pub fn reserve(&mut self, port: u16) -> bool {
        self.used.insert(port)
    }

    /// Return a port to the pool.  Returns `false` if it was not held.
    pub fn release(&mut self, port: u16) -> bool {
        self.used.remove(&port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    /// Held ports in ascending order.
    pub fn used(&self) -> impl Iterator<Item = u16> + '_ {
        self.used.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    fn exhausted(&self) -> LabError {
        LabError::PortsExhausted {
            low: self.low,
            high: self.high,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::collections::BTreeMap;

    #[test]
    fn allocations_stay_in_range_and_never_repeat() -> Result<(), LabError> {
        let mut pool = PortPool::seeded(30000, 30100, 1);
        let mut seen = BTreeSet::new();
        for _ in 0..50 {
            let (a, b) = pool.allocate_pair()?;
            assert_ne!(a, b);
            for p in [a, b] {
                assert!((30000..30100).contains(&p));
                assert!(seen.insert(p), "port {p} handed out twice");
            }
        }
        assert!(pool.allocate().is_err());
        Ok(())
    }

    #[test]
    fn failed_pair_releases_the_first_port() -> Result<(), LabError> {
        let mut pool = PortPool::seeded(40000, 40003, 2);
        pool.allocate_pair()?;
        assert_eq!(pool.len(), 2);
        let err = pool.allocate_pair().unwrap_err();
        assert!(matches!(err, LabError::PortsExhausted { low: 40000, high: 40003 }));
        assert_eq!(pool.len(), 2);
        Ok(())
    }

    #[test]
    fn reserved_ports_are_skipped() -> Result<(), LabError> {
        let mut pool = PortPool::seeded(50000, 50002, 3);
        assert!(pool.reserve(50000));
        assert!(!pool.reserve(50000));
        assert_eq!(pool.allocate()?, 50001);
        Ok(())
    }

    #[test]
    fn out_of_range_reservations_leave_the_range_usable() -> Result<(), LabError> {
        let mut pool = PortPool::seeded(50100, 50104, 5);
        // The orchestrator's own ports sit outside the worker range.
        for port in [23412, 23413, 14453, 50104] {
            assert!(pool.reserve(port));
        }
        let (a, b) = pool.allocate_pair()?;
        let (c, d) = pool.allocate_pair()?;
        let mut taken = vec![a, b, c, d];
        taken.sort_unstable();
        assert_eq!(taken, vec![50100, 50101, 50102, 50103]);
        assert!(matches!(pool.allocate(), Err(LabError::PortsExhausted { .. })));
        assert_eq!(pool.len(), 8);
        Ok(())
    }

    /// After any interleaving of allocations and releases the pool holds
    /// exactly the ports of the live records.
    #[test]
    fn pool_matches_live_records_under_random_churn() -> Result<(), LabError> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut pool = PortPool::seeded(31000, 31040, 4);
        let mut live: BTreeMap<usize, (u16, u16)> = BTreeMap::new();
        let mut next_id = 0;

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.55) {
                match pool.allocate_pair() {
                    Ok(pair) => {
                        live.insert(next_id, pair);
                        next_id += 1;
                    }
                    Err(LabError::PortsExhausted { .. }) => assert_eq!(pool.len(), 40),
                    Err(e) => return Err(e),
                }
            } else {
                let ids: Vec<usize> = live.keys().copied().collect();
                let id = *ids.choose(&mut rng).ok_or(LabError::UnknownDevice("none".into()))?;
                let (a, b) = live.remove(&id).ok_or(LabError::UnknownDevice(id.to_string()))?;
                assert!(pool.release(a));
                assert!(pool.release(b));
            }

            let expected: BTreeSet<u16> = live.values().flat_map(|&(a, b)| [a, b]).collect();
            let actual: BTreeSet<u16> = pool.used().collect();
            assert_eq!(actual, expected);
        }
        Ok(())
    }
}
