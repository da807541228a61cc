//! Consistent hash rings over the membership view.
//!
//! A ring provider subscribes to the oracle's status events and maps 32-bit
//! keys to the silo responsible for them: the first ring point whose hash is
//! `>=` the key, wrapping to the lowest point. Each silo owns the arcs that
//! end at its points.
//!
//! - [`ConsistentRingProvider`]: one point per silo.
//! - [`VirtualBucketsRingProvider`]: `num_buckets_per_silo` points per silo,
//!   which evens out range sizes.
//!
//! Providers publish an immutable snapshot after every change, so lookups
//! never contend with membership updates.

mod consistent;
mod range;
mod virtual_buckets;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::error;

use crate::SiloAddress;

pub use consistent::ConsistentRingProvider;
pub use range::{RingRange, SingleRange, RING_SIZE};
pub use virtual_buckets::VirtualBucketsRingProvider;

/// Receives changes of this silo's range.
///
/// `increased` is a hint only: it may be true when the range shrank or did
/// not change.
pub trait RingRangeListener: Send + Sync {
    fn range_change_notification(&self, old: &RingRange, new: &RingRange, increased: bool);
}

/// Key-to-silo routing over the current membership view.
pub trait RingProvider: Send + Sync {
    /// The part of the ring this silo is responsible for.
    fn my_range(&self) -> RingRange;

    /// The silo responsible for `key`, or `None` if the ring is empty.
    fn primary_target_silo(&self, key: u32) -> Option<SiloAddress>;

    /// Registers a listener. Returns false if it was already registered.
    fn subscribe(&self, listener: Arc<dyn RingRangeListener>) -> bool;

    /// Removes a listener. Returns false if it was not registered.
    fn unsubscribe(&self, listener: &Arc<dyn RingRangeListener>) -> bool;

    /// Number of distinct silos on the ring.
    fn ring_size(&self) -> usize;
}

/// Copy-on-write listener list shared by both providers.
#[derive(Default)]
struct RangeListeners {
    listeners: ArcSwap<Vec<Arc<dyn RingRangeListener>>>,
}

impl RangeListeners {
    fn subscribe(&self, listener: Arc<dyn RingRangeListener>) -> bool {
        let mut added = false;
        self.listeners.rcu(|current| {
            added = !current.iter().any(|l| Arc::ptr_eq(l, &listener));
            let mut next = Vec::clone(current);
            if added {
                next.push(Arc::clone(&listener));
            }
            next
        });
        added
    }

    fn unsubscribe(&self, listener: &Arc<dyn RingRangeListener>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    fn notify(&self, old: &RingRange, new: &RingRange, increased: bool) {
        for listener in self.listeners.load().iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.range_change_notification(old, new, increased)
            }));
            if outcome.is_err() {
                error!("range listener panicked on {old} -> {new}");
            }
        }
    }
}

/// Sorted `(hash, silo)` ring points and the per-silo arcs they define.
fn ranges_of(points: &[(u32, SiloAddress)]) -> Vec<(SiloAddress, RingRange)> {
    let mut by_silo: std::collections::BTreeMap<SiloAddress, Vec<SingleRange>> =
        std::collections::BTreeMap::new();
    for (i, (hash, silo)) in points.iter().enumerate() {
        let prev = if i == 0 { points[points.len() - 1].0 } else { points[i - 1].0 };
        if prev == *hash && points.len() > 1 {
            // a colliding point owns nothing; the first silo at the hash wins
            continue;
        }
        by_silo
            .entry(*silo)
            .or_default()
            .push(SingleRange::new(prev, *hash));
    }
    by_silo
        .into_iter()
        .map(|(silo, segments)| (silo, RingRange::from_segments(segments)))
        .collect()
}

/// First point at or after `key`, walking clockwise, that passes `accept`.
fn first_at_or_after(
    points: &[(u32, SiloAddress)],
    key: u32,
    accept: impl Fn(&SiloAddress) -> bool,
) -> Option<SiloAddress> {
    let start = points.partition_point(|(hash, _)| *hash < key);
    points[start..]
        .iter()
        .chain(points[..start].iter())
        .map(|(_, silo)| *silo)
        .find(|silo| accept(silo))
}
