//! Device level tracking and relative-ramp resolution
//!
//! Remembers the last-known wire level per group and services the
//! INCREASE/DECREASE ramp flow: the router registers a pending step, a
//! follow-up GET causes C-Gate to report the current level, and the first
//! matching level delivery consumes the registration and yields the ramp
//! target. At most one registration can be pending per address.

use crate::domain::types::{step_level, Address};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// How long a relative-ramp registration may wait for its level report.
pub const RELATIVE_RAMP_TIMEOUT: Duration = Duration::from_secs(5);

/// A relative ramp that is now resolvable: ramp `address` to `level`.
#[derive(Debug, Clone, PartialEq)]
pub struct RampDue {
    pub address: Address,
    pub level: u8,
}

#[derive(Debug)]
struct PendingRamp {
    step: i16,
    deadline: Instant,
}

#[derive(Default)]
pub struct LevelTracker {
    levels: FxHashMap<Address, u8>,
    pending: FxHashMap<Address, PendingRamp>,
}

impl LevelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one observed level. Returns the ramp target when a pending
    /// relative ramp for this address is waiting on it; a matched
    /// registration is consumed.
    pub fn record(&mut self, address: &Address, level: u8) -> Option<RampDue> {
        self.levels.insert(address.clone(), level);

        self.pending.remove(address).map(|op| RampDue {
            address: address.clone(),
            level: step_level(level, op.step),
        })
    }

    pub fn last_level(&self, address: &Address) -> Option<u8> {
        self.levels.get(address).copied()
    }

    /// Register a relative ramp. Returns false (and leaves the existing
    /// registration untouched) when one is already pending for the address.
    pub fn register_relative(&mut self, address: Address, step: i16, timeout: Duration) -> bool {
        if self.pending.contains_key(&address) {
            return false;
        }
        self.pending.insert(address, PendingRamp { step, deadline: Instant::now() + timeout });
        true
    }

    /// Withdraw registrations past their deadline. Returns the expired
    /// addresses so the caller can log them; no command is emitted.
    pub fn sweep_expired(&mut self) -> Vec<Address> {
        let now = Instant::now();
        let expired: Vec<Address> = self
            .pending
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &expired {
            self.pending.remove(addr);
        }
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.levels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RAMP_STEP;

    fn addr() -> Address {
        Address::new("254", "56", "4")
    }

    #[test]
    fn test_record_remembers_level() {
        let mut tracker = LevelTracker::new();
        assert_eq!(tracker.last_level(&addr()), None);
        assert!(tracker.record(&addr(), 128).is_none());
        assert_eq!(tracker.last_level(&addr()), Some(128));
    }

    #[test]
    fn test_relative_ramp_resolves_on_delivery() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.register_relative(addr(), RAMP_STEP, RELATIVE_RAMP_TIMEOUT));

        let due = tracker.record(&addr(), 128).unwrap();
        assert_eq!(due, RampDue { address: addr(), level: 154 });
        // Consumed: the next delivery resolves nothing.
        assert!(tracker.record(&addr(), 154).is_none());
    }

    #[test]
    fn test_decrease_clamps_at_zero() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.register_relative(addr(), -RAMP_STEP, RELATIVE_RAMP_TIMEOUT));
        let due = tracker.record(&addr(), 10).unwrap();
        assert_eq!(due.level, 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.register_relative(addr(), RAMP_STEP, RELATIVE_RAMP_TIMEOUT));
        assert!(!tracker.register_relative(addr(), -RAMP_STEP, RELATIVE_RAMP_TIMEOUT));
        assert_eq!(tracker.pending_count(), 1);

        // The original (+step) registration is the one that resolves.
        let due = tracker.record(&addr(), 100).unwrap();
        assert_eq!(due.level, 126);
    }

    #[test]
    fn test_delivery_for_other_address_does_not_resolve() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.register_relative(addr(), RAMP_STEP, RELATIVE_RAMP_TIMEOUT));
        let other = Address::new("254", "56", "9");
        assert!(tracker.record(&other, 40).is_none());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_sweep_expires_registrations() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.register_relative(addr(), RAMP_STEP, Duration::from_millis(0)));
        let expired = tracker.sweep_expired();
        assert_eq!(expired, vec![addr()]);
        assert_eq!(tracker.pending_count(), 0);
        // Expired means gone: a later delivery resolves nothing.
        assert!(tracker.record(&addr(), 128).is_none());
    }

    #[test]
    fn test_sweep_keeps_live_registrations() {
        let mut tracker = LevelTracker::new();
        assert!(tracker.register_relative(addr(), RAMP_STEP, RELATIVE_RAMP_TIMEOUT));
        assert!(tracker.sweep_expired().is_empty());
        assert_eq!(tracker.pending_count(), 1);
    }
}
