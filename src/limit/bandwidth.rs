//! Fair-share bandwidth allocation across active transfers.
//!
//! # Overview
//!
//! The [`BandwidthManager`] owns one [`BandwidthThrottle`] per active
//! transfer and keeps the sum of their rates at the configured total. Every
//! registration and removal rebalances the surviving throttles in place to
//! an equal share, so a transfer finishing immediately frees its bandwidth
//! for the others.
//!
//! # Example
//!
//! ```
//! use downlink::limit::BandwidthManager;
//!
//! // Split 1 MiB/s across however many transfers are active.
//! let manager = BandwidthManager::new(1024 * 1024);
//! let throttle = manager.register(42);
//! assert_eq!(throttle.rate(), 1024 * 1024);
//! manager.unregister(42);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{debug, instrument};

use super::throttle::BandwidthThrottle;

/// Divides a total byte rate equally among active transfers.
///
/// Constructed once at the application boundary and passed explicitly to
/// the scheduler; independent engine instances each get their own manager.
/// A total of zero disables shaping entirely.
#[derive(Debug)]
pub struct BandwidthManager {
    total_rate: u64,
    throttles: Mutex<HashMap<i64, Arc<BandwidthThrottle>>>,
    consumed: DashMap<i64, u64>,
}

impl BandwidthManager {
    /// Creates a manager distributing `total_bytes_per_second` across
    /// active transfers.
    #[must_use]
    pub fn new(total_bytes_per_second: u64) -> Self {
        Self {
            total_rate: total_bytes_per_second,
            throttles: Mutex::new(HashMap::new()),
            consumed: DashMap::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<i64, Arc<BandwidthThrottle>>> {
        self.throttles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the configured aggregate rate in bytes per second.
    #[must_use]
    pub fn total_rate(&self) -> u64 {
        self.total_rate
    }

    /// Returns the number of transfers currently holding a throttle.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.locked().len()
    }

    /// Creates (or returns the existing) throttle for a transfer and
    /// rebalances every active throttle to the new equal share.
    #[instrument(skip(self))]
    pub fn register(&self, id: i64) -> Arc<BandwidthThrottle> {
        let mut throttles = self.locked();
        if let Some(existing) = throttles.get(&id) {
            return Arc::clone(existing);
        }

        let share = fair_share(self.total_rate, throttles.len() + 1);
        let throttle = Arc::new(BandwidthThrottle::new(share));
        throttles.insert(id, Arc::clone(&throttle));
        rebalance(share, &throttles);
        self.consumed.entry(id).or_insert(0);

        debug!(
            transfer_id = id,
            share_bytes_per_sec = share,
            active = throttles.len(),
            "registered bandwidth throttle"
        );
        throttle
    }

    /// Removes a transfer's throttle, rebalances the remaining ones, and
    /// returns the total bytes the transfer consumed.
    #[instrument(skip(self))]
    pub fn unregister(&self, id: i64) -> u64 {
        let mut throttles = self.locked();
        throttles.remove(&id);
        if !throttles.is_empty() {
            let share = fair_share(self.total_rate, throttles.len());
            rebalance(share, &throttles);
        }
        drop(throttles);

        let total = self.consumed.remove(&id).map_or(0, |(_, bytes)| bytes);
        debug!(transfer_id = id, bytes_consumed = total, "unregistered bandwidth throttle");
        total
    }

    /// Returns the throttle for a transfer, if it is registered.
    #[must_use]
    pub fn throttle_for(&self, id: i64) -> Option<Arc<BandwidthThrottle>> {
        self.locked().get(&id).map(Arc::clone)
    }

    /// Adds to a transfer's byte-consumption counter.
    pub fn record_consumption(&self, id: i64, bytes: u64) {
        self.consumed
            .entry(id)
            .and_modify(|total| *total = total.saturating_add(bytes))
            .or_insert(bytes);
    }

    /// Returns the bytes consumed so far by a transfer.
    #[must_use]
    pub fn bytes_consumed(&self, id: i64) -> u64 {
        self.consumed.get(&id).map_or(0, |entry| *entry)
    }
}

/// Equal share of `total` among `count` transfers.
///
/// A nonzero total never yields a zero share; zero means unlimited and must
/// only come from an unlimited total.
fn fair_share(total: u64, count: usize) -> u64 {
    if total == 0 {
        return 0;
    }
    (total / count.max(1) as u64).max(1)
}

fn rebalance(share: u64, throttles: &HashMap<i64, Arc<BandwidthThrottle>>) {
    for throttle in throttles.values() {
        throttle.set_rate(share);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Fair Share Tests ====================

    #[test]
    fn test_first_transfer_gets_full_rate() {
        let manager = BandwidthManager::new(1000);
        let throttle = manager.register(1);
        assert_eq!(throttle.rate(), 1000);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_registration_rebalances_existing_throttles() {
        let manager = BandwidthManager::new(900);
        let first = manager.register(1);
        let second = manager.register(2);
        assert_eq!(first.rate(), 450);
        assert_eq!(second.rate(), 450);

        let third = manager.register(3);
        assert_eq!(first.rate(), 300);
        assert_eq!(second.rate(), 300);
        assert_eq!(third.rate(), 300);
    }

    #[test]
    fn test_unregister_rebalances_upward() {
        let manager = BandwidthManager::new(900);
        let first = manager.register(1);
        let _second = manager.register(2);
        let _third = manager.register(3);
        assert_eq!(first.rate(), 300);

        manager.unregister(3);
        assert_eq!(first.rate(), 450);

        manager.unregister(2);
        assert_eq!(first.rate(), 900);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_register_twice_returns_same_throttle() {
        let manager = BandwidthManager::new(1000);
        let first = manager.register(7);
        let again = manager.register(7);

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(manager.active_count(), 1);
        assert_eq!(first.rate(), 1000, "re-registration must not halve the share");
    }

    #[test]
    fn test_zero_total_means_unlimited_shares() {
        let manager = BandwidthManager::new(0);
        let first = manager.register(1);
        let second = manager.register(2);
        assert_eq!(first.rate(), 0);
        assert_eq!(second.rate(), 0);
    }

    #[test]
    fn test_small_total_never_rounds_to_unlimited() {
        let manager = BandwidthManager::new(2);
        manager.register(1);
        manager.register(2);
        let third = manager.register(3);
        assert_eq!(third.rate(), 1, "a shaped manager must keep shaping");
    }

    #[test]
    fn test_throttle_for_lookup() {
        let manager = BandwidthManager::new(1000);
        assert!(manager.throttle_for(5).is_none());

        let registered = manager.register(5);
        let found = manager.throttle_for(5).unwrap();
        assert!(Arc::ptr_eq(&registered, &found));
    }

    // ==================== Consumption Accounting Tests ====================

    #[test]
    fn test_consumption_counter_accumulates() {
        let manager = BandwidthManager::new(1000);
        manager.register(1);

        manager.record_consumption(1, 100);
        manager.record_consumption(1, 250);
        assert_eq!(manager.bytes_consumed(1), 350);
        assert_eq!(manager.bytes_consumed(2), 0);
    }

    #[test]
    fn test_unregister_returns_final_byte_count() {
        let manager = BandwidthManager::new(1000);
        manager.register(1);
        manager.record_consumption(1, 4096);

        let total = manager.unregister(1);
        assert_eq!(total, 4096);
        assert_eq!(manager.bytes_consumed(1), 0, "counter is discarded on removal");
    }

    #[test]
    fn test_unregister_unknown_id_is_harmless() {
        let manager = BandwidthManager::new(1000);
        assert_eq!(manager.unregister(99), 0);
        assert_eq!(manager.active_count(), 0);
    }
}
