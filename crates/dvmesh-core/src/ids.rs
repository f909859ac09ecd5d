//! Identifiers used across the mesh.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a distributor ("transmitter") in the mesh.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransmitterId(pub u64);

impl fmt::Display for TransmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Identifier of a local subscriber attached to a distributor.
///
/// For distributors this is the application connection id; for client
/// libraries it names one local receiver or sender object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Simulation variant meaning "live, non-simulated data".
pub const LIVE_SIMULATION_VARIANT: i16 = -1;

/// Identity of one data channel.
///
/// Equality, ordering and hashing use exactly the object id, the
/// attribute-group usage id and the simulation variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BaseSubscriptionInfo {
    /// Object the data belongs to
    pub object_id: u64,
    /// Attribute-group usage (attribute group + aspect pairing)
    pub usage_id: u64,
    /// Simulation variant, `-1` for live data
    pub simulation_variant: i16,
}

impl BaseSubscriptionInfo {
    /// Size of the identity on the wire.
    pub const ENCODED_LEN: usize = 18;

    /// Create a channel identity.
    #[must_use]
    pub const fn new(object_id: u64, usage_id: u64, simulation_variant: i16) -> Self {
        Self {
            object_id,
            usage_id,
            simulation_variant,
        }
    }

    /// Create a channel identity for live data.
    #[must_use]
    pub const fn live(object_id: u64, usage_id: u64) -> Self {
        Self::new(object_id, usage_id, LIVE_SIMULATION_VARIANT)
    }

    /// Whether this channel carries simulated data.
    #[must_use]
    pub const fn is_simulation(&self) -> bool {
        self.simulation_variant >= 0
    }

    /// Mixing hash over the three identity fields.
    ///
    /// Stable across processes and releases, unlike `std`'s `DefaultHasher`.
    #[must_use]
    pub fn mixing_hash(&self) -> u64 {
        let mut h: u64 = 17;
        h = h.wrapping_mul(31).wrapping_add(mix(self.object_id));
        h = h.wrapping_mul(31).wrapping_add(mix(self.usage_id));
        // Reinterpret the variant bits; sign does not matter for hashing.
        #[allow(clippy::cast_sign_loss)]
        let variant = u64::from(self.simulation_variant as u16);
        h.wrapping_mul(31).wrapping_add(variant)
    }
}

/// 64-bit finalizer (splitmix64).
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl fmt::Display for BaseSubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.object_id, self.usage_id, self.simulation_variant
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_covers_all_three_fields() {
        let a = BaseSubscriptionInfo::live(1, 2);
        let b = BaseSubscriptionInfo::new(1, 2, 0);
        let c = BaseSubscriptionInfo::live(1, 3);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, BaseSubscriptionInfo::new(1, 2, -1));

        let set: HashSet<_> = [a, b, c, a].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn mixing_hash_is_deterministic_and_spreads() {
        let a = BaseSubscriptionInfo::live(42, 7);
        assert_eq!(a.mixing_hash(), BaseSubscriptionInfo::live(42, 7).mixing_hash());
        assert_ne!(a.mixing_hash(), BaseSubscriptionInfo::live(7, 42).mixing_hash());
        assert_ne!(a.mixing_hash(), BaseSubscriptionInfo::new(42, 7, 1).mixing_hash());
    }

    #[test]
    fn live_is_not_simulation() {
        assert!(!BaseSubscriptionInfo::live(1, 1).is_simulation());
        assert!(BaseSubscriptionInfo::new(1, 1, 3).is_simulation());
    }
}
