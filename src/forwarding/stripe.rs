//! Stripe selection: hashing `targetPeerId` to pick one of N parallel
//! connections to the broker.
//!
//! Per-target ordering is guaranteed only if the sender always uses the
//! same stripe for a given target (spec.md §4.C7); the default dispatcher
//! ensures that by hashing. Uses `rustc-hash`'s `FxHasher` — already
//! present in the broader pack's dependency set and consistent with the
//! teacher's preference for fast non-cryptographic hashing over `SipHash`.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::protocol::PeerId;

/// Picks the stripe index `[0, stripe_count)` for `target`, stable for the
/// lifetime of the process (no reseeding between calls, unlike the
/// default `HashMap` hasher).
pub fn stripe_for(target: &PeerId, stripe_count: usize) -> usize {
    debug_assert!(stripe_count > 0, "stripe_count must be positive");
    let mut hasher = FxHasher::default();
    target.hash(&mut hasher);
    (hasher.finish() as usize) % stripe_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_target_always_maps_to_the_same_stripe() {
        let target = PeerId::new_v4();
        let first = stripe_for(&target, 4);
        for _ in 0..100 {
            assert_eq!(stripe_for(&target, 4), first);
        }
    }

    #[test]
    fn stripe_index_is_always_in_range() {
        let target = PeerId::new_v4();
        for count in 1..=16 {
            assert!(stripe_for(&target, count) < count);
        }
    }
}
