//! Configuration-backed directory.

use std::collections::{BTreeMap, HashMap};

use dvmesh_core::{
    AttributeGroupAspect, BaseSubscriptionInfo, Directory, InterestTable, SubscriptionDirection,
    TransmitterId,
};

use crate::config::{AccessConfig, DistributorConfig};

/// Potential central distributors, access rights and aspect names from
/// static configuration, falling back to neighbours' interest lists.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    centrals: BTreeMap<u64, Vec<TransmitterId>>,
    aspects: HashMap<u64, AttributeGroupAspect>,
    denied: Vec<AccessConfig>,
    interest: InterestTable,
}

impl StaticDirectory {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &DistributorConfig) -> Self {
        let mut centrals: BTreeMap<u64, Vec<TransmitterId>> = BTreeMap::new();
        for entry in &config.centrals {
            centrals
                .entry(entry.object_id)
                .or_default()
                .extend(entry.transmitters.iter().copied().map(TransmitterId));
        }

        let aspects = config
            .aspects
            .iter()
            .map(|a| {
                (
                    a.usage_id,
                    AttributeGroupAspect::new(a.attribute_group, a.aspect),
                )
            })
            .collect();

        Self {
            centrals,
            aspects,
            denied: config.denied.clone(),
            interest: InterestTable::new(),
        }
    }

    /// Neighbours' interest lists.
    #[must_use]
    pub fn interest(&self) -> &InterestTable {
        &self.interest
    }

    /// Neighbours' interest lists, for applying updates.
    pub fn interest_mut(&mut self) -> &mut InterestTable {
        &mut self.interest
    }
}

impl Directory for StaticDirectory {
    fn potential_centrals(&self, base: &BaseSubscriptionInfo) -> Vec<TransmitterId> {
        match self.centrals.get(&base.object_id) {
            Some(configured) if !configured.is_empty() => configured.clone(),
            _ => self.interest.owners_interested_in(base.object_id),
        }
    }

    fn may_access(
        &self,
        base: &BaseSubscriptionInfo,
        direction: SubscriptionDirection,
        origin: TransmitterId,
    ) -> bool {
        let denied = self
            .denied
            .iter()
            .any(|entry| entry.denies(base.object_id, direction, origin));
        if denied {
            tracing::debug!(channel = %base, ?direction, %origin, "Access refused by configuration");
        }
        !denied
    }

    fn attribute_group_aspect(&self, usage_id: u64) -> Option<AttributeGroupAspect> {
        self.aspects.get(&usage_id).copied()
    }
}
