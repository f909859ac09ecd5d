//! Interest lists exchanged between neighbouring distributors.
//!
//! The list owner publishes which objects and attribute-group/aspect
//! combinations it needs forwarded. After a (re)connection it sends a full
//! sync; afterwards only the difference to what it last published.
//!
//! Applying a delta is idempotent: adding a present element or removing an
//! absent one changes nothing, so duplicated or reordered updates across
//! reconnects are harmless.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::TransmitterId;

/// An attribute group paired with an aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeGroupAspect {
    /// Attribute group id
    pub attribute_group: u64,
    /// Aspect id
    pub aspect: u64,
}

impl AttributeGroupAspect {
    /// Create a pair.
    #[must_use]
    pub const fn new(attribute_group: u64, aspect: u64) -> Self {
        Self {
            attribute_group,
            aspect,
        }
    }
}

/// A full or incremental change to an interest list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterestDelta {
    /// Object ids to add
    pub objects_added: BTreeSet<u64>,
    /// Object ids to remove
    pub objects_removed: BTreeSet<u64>,
    /// Attribute-group/aspect pairs to add
    pub aspects_added: BTreeSet<AttributeGroupAspect>,
    /// Attribute-group/aspect pairs to remove
    pub aspects_removed: BTreeSet<AttributeGroupAspect>,
    /// The delta replaces the receiver's list instead of amending it
    pub is_full_sync: bool,
}

impl InterestDelta {
    /// Whether the delta changes nothing. A full sync is never empty: it
    /// clears the receiver's list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_full_sync
            && self.objects_added.is_empty()
            && self.objects_removed.is_empty()
            && self.aspects_added.is_empty()
            && self.aspects_removed.is_empty()
    }

    /// Number of elements carried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects_added.len()
            + self.objects_removed.len()
            + self.aspects_added.len()
            + self.aspects_removed.len()
    }
}

/// The content of one interest list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterestSet {
    /// Objects of interest
    pub objects: BTreeSet<u64>,
    /// Attribute-group/aspect pairs of interest
    pub aspects: BTreeSet<AttributeGroupAspect>,
}

impl InterestSet {
    /// Apply a delta. Returns `true` if the set changed.
    pub fn apply(&mut self, delta: &InterestDelta) -> bool {
        let before = self.clone();
        if delta.is_full_sync {
            self.objects.clear();
            self.aspects.clear();
        }
        for id in &delta.objects_removed {
            self.objects.remove(id);
        }
        for aspect in &delta.aspects_removed {
            self.aspects.remove(aspect);
        }
        self.objects.extend(delta.objects_added.iter().copied());
        self.aspects.extend(delta.aspects_added.iter().copied());
        *self != before
    }

    /// Whether an object is of interest.
    #[must_use]
    pub fn contains_object(&self, object_id: u64) -> bool {
        self.objects.contains(&object_id)
    }

    /// Whether an object is of interest under the given attribute group and aspect.
    #[must_use]
    pub fn wants(&self, object_id: u64, aspect: &AttributeGroupAspect) -> bool {
        self.objects.contains(&object_id) && self.aspects.contains(aspect)
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.aspects.is_empty()
    }
}

/// Owner side: the current list and what was last published.
#[derive(Debug, Clone, Default)]
pub struct InterestList {
    current: InterestSet,
    published: Option<InterestSet>,
}

impl InterestList {
    /// Create an empty, never published list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content.
    #[must_use]
    pub fn current(&self) -> &InterestSet {
        &self.current
    }

    /// Add an object. Returns `true` if it was new.
    pub fn add_object(&mut self, object_id: u64) -> bool {
        self.current.objects.insert(object_id)
    }

    /// Remove an object. Returns `true` if it was present.
    pub fn remove_object(&mut self, object_id: u64) -> bool {
        self.current.objects.remove(&object_id)
    }

    /// Add an attribute-group/aspect pair. Returns `true` if it was new.
    pub fn add_aspect(&mut self, aspect: AttributeGroupAspect) -> bool {
        self.current.aspects.insert(aspect)
    }

    /// Remove an attribute-group/aspect pair. Returns `true` if it was present.
    pub fn remove_aspect(&mut self, aspect: &AttributeGroupAspect) -> bool {
        self.current.aspects.remove(aspect)
    }

    /// Replace the whole content. Returns `true` if it changed.
    pub fn replace(&mut self, content: InterestSet) -> bool {
        if self.current == content {
            return false;
        }
        self.current = content;
        true
    }

    /// Forget what was published; the next publication is a full sync.
    pub fn reset_publication(&mut self) {
        self.published = None;
    }

    /// Whether unpublished changes exist.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.published.as_ref() != Some(&self.current)
    }

    /// Produce the deltas bringing a subscriber up to date and mark them
    /// published.
    ///
    /// A full sync larger than `max_elements` is split into one full chunk
    /// followed by incremental chunks. Returns an empty vector when nothing
    /// changed since the last publication.
    pub fn publish(&mut self, max_elements: usize) -> Vec<InterestDelta> {
        let max_elements = max_elements.max(1);
        let deltas = match &self.published {
            None => {
                let full = InterestDelta {
                    objects_added: self.current.objects.clone(),
                    aspects_added: self.current.aspects.clone(),
                    is_full_sync: true,
                    ..InterestDelta::default()
                };
                chunk(full, max_elements)
            }
            Some(published) if *published == self.current => Vec::new(),
            Some(published) => {
                let diff = InterestDelta {
                    objects_added: self.current.objects.difference(&published.objects).copied().collect(),
                    objects_removed: published.objects.difference(&self.current.objects).copied().collect(),
                    aspects_added: self.current.aspects.difference(&published.aspects).copied().collect(),
                    aspects_removed: published.aspects.difference(&self.current.aspects).copied().collect(),
                    is_full_sync: false,
                };
                chunk(diff, max_elements)
            }
        };
        self.published = Some(self.current.clone());
        deltas
    }

    /// The complete list as a single-or-chunked full sync, without touching
    /// the publication state. Used to answer a resync request.
    #[must_use]
    pub fn full_sync(&self, max_elements: usize) -> Vec<InterestDelta> {
        chunk(
            InterestDelta {
                objects_added: self.current.objects.clone(),
                aspects_added: self.current.aspects.clone(),
                is_full_sync: true,
                ..InterestDelta::default()
            },
            max_elements.max(1),
        )
    }
}

/// Split a delta into pieces of at most `max_elements`; only the first
/// piece keeps the full-sync flag.
fn chunk(delta: InterestDelta, max_elements: usize) -> Vec<InterestDelta> {
    if delta.len() <= max_elements {
        return vec![delta];
    }

    let mut chunks = Vec::new();
    let mut current = InterestDelta {
        is_full_sync: delta.is_full_sync,
        ..InterestDelta::default()
    };

    macro_rules! spill {
        ($field:ident, $source:expr) => {
            for item in $source {
                if current.len() == max_elements {
                    chunks.push(std::mem::take(&mut current));
                }
                current.$field.insert(item);
            }
        };
    }

    spill!(objects_removed, delta.objects_removed);
    spill!(aspects_removed, delta.aspects_removed);
    spill!(objects_added, delta.objects_added);
    spill!(aspects_added, delta.aspects_added);

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Receiver side: interest lists of all owners, keyed by owner.
#[derive(Debug, Clone, Default)]
pub struct InterestTable {
    lists: BTreeMap<TransmitterId, InterestSet>,
}

impl InterestTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a delta from `owner`. Returns `true` if the owner's list changed.
    pub fn apply(&mut self, owner: TransmitterId, delta: &InterestDelta) -> bool {
        let changed = self.lists.entry(owner).or_default().apply(delta);
        if changed {
            tracing::debug!(
                %owner,
                full = delta.is_full_sync,
                elements = delta.len(),
                "Interest list updated"
            );
        }
        changed
    }

    /// Drop an owner's list, e.g. when the link to it goes down.
    pub fn remove_owner(&mut self, owner: TransmitterId) -> Option<InterestSet> {
        self.lists.remove(&owner)
    }

    /// An owner's list.
    #[must_use]
    pub fn list(&self, owner: TransmitterId) -> Option<&InterestSet> {
        self.lists.get(&owner)
    }

    /// Owners whose list contains the object.
    #[must_use]
    pub fn owners_interested_in(&self, object_id: u64) -> Vec<TransmitterId> {
        self.lists
            .iter()
            .filter(|(_, set)| set.contains_object(object_id))
            .map(|(owner, _)| *owner)
            .collect()
    }

    /// Whether `owner` needs the object forwarded under the given pair.
    #[must_use]
    pub fn wants(&self, owner: TransmitterId, object_id: u64, aspect: &AttributeGroupAspect) -> bool {
        self.lists
            .get(&owner)
            .is_some_and(|set| set.wants(object_id, aspect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: TransmitterId = TransmitterId(9);

    fn aspect(n: u64) -> AttributeGroupAspect {
        AttributeGroupAspect::new(100 + n, 200 + n)
    }

    fn delta(added: &[u64], removed: &[u64]) -> InterestDelta {
        InterestDelta {
            objects_added: added.iter().copied().collect(),
            objects_removed: removed.iter().copied().collect(),
            ..InterestDelta::default()
        }
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let mut once = InterestTable::new();
        let mut twice = InterestTable::new();
        let mut d = delta(&[1, 2, 3], &[]);
        d.aspects_added.insert(aspect(1));

        once.apply(OWNER, &d);
        assert!(twice.apply(OWNER, &d));
        assert!(!twice.apply(OWNER, &d));

        assert_eq!(once.list(OWNER), twice.list(OWNER));
    }

    #[test]
    fn removing_non_member_is_noop() {
        let mut table = InterestTable::new();
        table.apply(OWNER, &delta(&[1], &[]));
        let before = table.list(OWNER).cloned();

        assert!(!table.apply(OWNER, &delta(&[], &[42])));
        assert_eq!(table.list(OWNER).cloned(), before);
    }

    #[test]
    fn full_sync_replaces_list() {
        let mut table = InterestTable::new();
        table.apply(OWNER, &delta(&[1, 2], &[]));

        let mut full = delta(&[3], &[]);
        full.is_full_sync = true;
        table.apply(OWNER, &full);

        assert_eq!(
            table.list(OWNER).unwrap().objects,
            [3].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn empty_full_sync_clears_list() {
        let mut table = InterestTable::new();
        table.apply(OWNER, &delta(&[1], &[]));

        let clear = InterestDelta {
            is_full_sync: true,
            ..InterestDelta::default()
        };
        assert!(!clear.is_empty());
        assert!(table.apply(OWNER, &clear));
        assert!(table.list(OWNER).unwrap().is_empty());
    }

    #[test]
    fn first_publication_is_full_then_incremental() {
        let mut list = InterestList::new();
        list.add_object(1);
        list.add_aspect(aspect(1));

        let first = list.publish(100);
        assert_eq!(first.len(), 1);
        assert!(first[0].is_full_sync);
        assert!(!list.has_pending_changes());
        assert!(list.publish(100).is_empty());

        list.remove_object(1);
        list.add_object(2);
        let next = list.publish(100);
        assert_eq!(next, vec![{
            let mut d = delta(&[2], &[1]);
            d.is_full_sync = false;
            d
        }]);

        list.reset_publication();
        assert!(list.publish(100)[0].is_full_sync);
    }

    #[test]
    fn chunked_full_sync_rebuilds_complete_list() {
        let mut list = InterestList::new();
        for id in 0..25 {
            list.add_object(id);
        }
        for n in 0..5 {
            list.add_aspect(aspect(n));
        }

        let chunks = list.publish(7);

        assert_eq!(chunks.len(), 5);
        assert!(chunks[0].is_full_sync);
        assert!(chunks[1..].iter().all(|c| !c.is_full_sync));
        assert!(chunks.iter().all(|c| c.len() <= 7));

        let mut table = InterestTable::new();
        table.apply(OWNER, &delta(&[999], &[]));
        for c in &chunks {
            table.apply(OWNER, c);
        }
        assert_eq!(table.list(OWNER), Some(list.current()));
    }

    #[test]
    fn owners_and_wants_lookup() {
        let mut table = InterestTable::new();
        let mut d = delta(&[5], &[]);
        d.aspects_added.insert(aspect(1));
        table.apply(TransmitterId(1), &d);
        table.apply(TransmitterId(2), &delta(&[5, 6], &[]));

        assert_eq!(
            table.owners_interested_in(5),
            vec![TransmitterId(1), TransmitterId(2)]
        );
        assert!(table.wants(TransmitterId(1), 5, &aspect(1)));
        assert!(!table.wants(TransmitterId(2), 5, &aspect(1)));

        table.remove_owner(TransmitterId(1));
        assert_eq!(table.owners_interested_in(5), vec![TransmitterId(2)]);
    }

    #[test]
    fn delta_serializes_to_json() {
        let mut d = delta(&[1], &[]);
        d.aspects_added.insert(aspect(0));

        let json = serde_json::to_string(&d).unwrap();
        let back: InterestDelta = serde_json::from_str(&json).unwrap();

        assert_eq!(back, d);
    }
}
