use anyhow::Result;
use std::collections::BTreeSet;

/// Hands out per-client resolver ports.
///
/// Allocation is "one past the highest live port", falling back to the first
/// free slot from `base` once the top of the range is reached. A port is
/// never returned while another live client holds it, no matter how clients
/// come and go.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, reserved: BTreeSet<u16>) -> Self {
        Self { base, reserved }
    }

    /// Pick a port for a new client given the ports of all live allocations.
    pub fn allocate(&self, live: &BTreeSet<u16>) -> Result<u16> {
        let start = match live.range(self.base..).next_back() {
            Some(max) => max.saturating_add(1),
            None => self.base,
        };

        if let Some(p) = self.next_free_port(start, live) {
            return Ok(p);
        }
        // Wrapped past u16::MAX: reuse holes left by deleted clients.
        if let Some(p) = self.next_free_port(self.base, live) {
            return Ok(p);
        }
        anyhow::bail!("no free resolver port available from {}", self.base);
    }

    fn next_free_port(&self, start: u16, live: &BTreeSet<u16>) -> Option<u16> {
        let start = start.max(self.base) as u32;
        (start..=u16::MAX as u32)
            .map(|p| p as u16)
            .find(|p| !live.contains(p) && !self.reserved.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(v: &[u16]) -> BTreeSet<u16> {
        v.iter().copied().collect()
    }

    #[test]
    fn first_allocation_is_base() {
        let a = PortAllocator::new(10530, BTreeSet::new());
        assert_eq!(a.allocate(&set(&[])).unwrap(), 10530);
    }

    #[test]
    fn next_is_one_past_max() {
        let a = PortAllocator::new(10530, BTreeSet::new());
        assert_eq!(a.allocate(&set(&[10530, 10531])).unwrap(), 10532);
    }

    #[test]
    fn delete_then_create_does_not_collide() {
        // Three clients, the middle one deleted: a count-based scheme would
        // hand out 10532 again.
        let a = PortAllocator::new(10530, BTreeSet::new());
        let live = set(&[10530, 10532]);
        let p = a.allocate(&live).unwrap();
        assert!(!live.contains(&p));
        assert_eq!(p, 10533);
    }

    #[test]
    fn reserved_ports_are_skipped() {
        let a = PortAllocator::new(10530, set(&[10530, 10531]));
        assert_eq!(a.allocate(&set(&[])).unwrap(), 10532);
    }

    #[test]
    fn ports_below_base_are_ignored() {
        let a = PortAllocator::new(10530, BTreeSet::new());
        assert_eq!(a.allocate(&set(&[53, 8080])).unwrap(), 10530);
    }

    #[test]
    fn wraps_into_holes_at_top_of_range() {
        let a = PortAllocator::new(65533, BTreeSet::new());
        assert_eq!(a.allocate(&set(&[65534, 65535])).unwrap(), 65533);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let a = PortAllocator::new(65534, BTreeSet::new());
        assert!(a.allocate(&set(&[65534, 65535])).is_err());
    }

    #[test]
    fn churn_never_duplicates_live_ports() {
        let a = PortAllocator::new(10530, BTreeSet::new());
        let mut live = BTreeSet::new();
        for round in 0..200u32 {
            let p = a.allocate(&live).unwrap();
            assert!(live.insert(p), "port {p} handed out twice");
            if round % 3 == 0 {
                let victim = *live.iter().nth((round as usize) % live.len()).unwrap();
                live.remove(&victim);
            }
        }
    }
}
