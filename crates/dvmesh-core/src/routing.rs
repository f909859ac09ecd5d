//! Best-path routing between distributors.
//!
//! Each distributor advertises to every neighbour the full set of remote
//! distributors it can reach, with the cumulative weight and the path of
//! distributors involved. A received advertisement replaces everything
//! previously learned from that neighbour, so omitting a destination
//! withdraws it.
//!
//! Route selection per destination:
//! 1. lowest cumulative weight (advertised weight + local link weight)
//! 2. the currently installed next hop
//! 3. the lowest neighbour id
//!
//! Updates whose path already contains the local distributor are dropped,
//! and routes are never advertised back to the neighbour they came from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::TransmitterId;

/// One advertised destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingUpdate {
    /// Destination distributor
    pub origin: TransmitterId,
    /// Cost of reaching `origin` from the advertising distributor
    pub weight: u16,
    /// Distributors on the path, starting with the advertising one
    pub involved: Vec<TransmitterId>,
}

/// An installed best route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination distributor
    pub destination: TransmitterId,
    /// Neighbour the route goes through
    pub next_hop: TransmitterId,
    /// Cumulative weight
    pub weight: u16,
    /// Distributors between us and the destination (empty for direct links)
    pub via: Vec<TransmitterId>,
}

/// Distance-vector routing table of one distributor.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local: TransmitterId,
    links: BTreeMap<TransmitterId, u16>,
    learned: BTreeMap<TransmitterId, BTreeMap<TransmitterId, RoutingUpdate>>,
    best: BTreeMap<TransmitterId, RouteEntry>,
}

impl RoutingTable {
    /// Create a table for the given local distributor.
    #[must_use]
    pub fn new(local: TransmitterId) -> Self {
        Self {
            local,
            links: BTreeMap::new(),
            learned: BTreeMap::new(),
            best: BTreeMap::new(),
        }
    }

    /// The local distributor.
    #[must_use]
    pub fn local(&self) -> TransmitterId {
        self.local
    }

    /// Add (or re-weight) a direct link.
    ///
    /// Returns the destinations whose best route changed.
    pub fn add_neighbor(&mut self, neighbor: TransmitterId, weight: u16) -> Vec<TransmitterId> {
        if neighbor == self.local {
            return Vec::new();
        }
        self.links.insert(neighbor, weight);
        self.recompute()
    }

    /// Remove a direct link and everything learned through it.
    ///
    /// Returns the destinations whose best route changed.
    pub fn remove_neighbor(&mut self, neighbor: TransmitterId) -> Vec<TransmitterId> {
        self.links.remove(&neighbor);
        self.learned.remove(&neighbor);
        self.recompute()
    }

    /// Replace the advertisement received from `neighbor`.
    ///
    /// Returns the destinations whose best route changed.
    pub fn apply_update(
        &mut self,
        neighbor: TransmitterId,
        updates: Vec<RoutingUpdate>,
    ) -> Vec<TransmitterId> {
        if !self.links.contains_key(&neighbor) {
            tracing::warn!(%neighbor, "Ignoring routing update from unknown neighbour");
            return Vec::new();
        }

        let local = self.local;
        let accepted: BTreeMap<_, _> = updates
            .into_iter()
            .filter(|u| u.origin != local && !u.involved.contains(&local))
            .map(|u| (u.origin, u))
            .collect();
        self.learned.insert(neighbor, accepted);
        self.recompute()
    }

    fn recompute(&mut self) -> Vec<TransmitterId> {
        let mut candidates: BTreeMap<TransmitterId, Vec<RouteEntry>> = BTreeMap::new();

        for (&neighbor, &link_weight) in &self.links {
            candidates.entry(neighbor).or_default().push(RouteEntry {
                destination: neighbor,
                next_hop: neighbor,
                weight: link_weight,
                via: Vec::new(),
            });

            for update in self.learned.get(&neighbor).into_iter().flat_map(BTreeMap::values) {
                candidates.entry(update.origin).or_default().push(RouteEntry {
                    destination: update.origin,
                    next_hop: neighbor,
                    weight: update.weight.saturating_add(link_weight),
                    via: update.involved.clone(),
                });
            }
        }

        let mut best = BTreeMap::new();
        for (destination, routes) in candidates {
            let installed = self.best.get(&destination).map(|r| r.next_hop);
            let winner = routes.into_iter().min_by(|a, b| {
                a.weight
                    .cmp(&b.weight)
                    .then_with(|| {
                        let a_installed = Some(a.next_hop) == installed;
                        let b_installed = Some(b.next_hop) == installed;
                        b_installed.cmp(&a_installed)
                    })
                    .then_with(|| a.next_hop.cmp(&b.next_hop))
                    .then_with(|| a.via.len().cmp(&b.via.len()))
            });
            if let Some(route) = winner {
                best.insert(destination, route);
            }
        }

        let mut changed: Vec<TransmitterId> = best
            .iter()
            .filter(|(d, r)| self.best.get(d) != Some(r))
            .map(|(d, _)| *d)
            .collect();
        changed.extend(self.best.keys().filter(|d| !best.contains_key(d)).copied());
        changed.sort_unstable();

        for destination in &changed {
            match best.get(destination) {
                Some(route) => tracing::debug!(
                    local = %self.local,
                    %destination,
                    weight = route.weight,
                    next_hop = %route.next_hop,
                    "Best route changed"
                ),
                None => tracing::debug!(local = %self.local, %destination, "Destination unreachable"),
            }
        }

        self.best = best;
        changed
    }

    /// Best route to a destination.
    #[must_use]
    pub fn route(&self, destination: TransmitterId) -> Option<&RouteEntry> {
        self.best.get(&destination)
    }

    /// Neighbour to forward to for reaching `destination`.
    #[must_use]
    pub fn next_hop(&self, destination: TransmitterId) -> Option<TransmitterId> {
        self.route(destination).map(|r| r.next_hop)
    }

    /// Cumulative weight to `destination`, zero for the local distributor.
    #[must_use]
    pub fn weight_to(&self, destination: TransmitterId) -> Option<u16> {
        if destination == self.local {
            return Some(0);
        }
        self.route(destination).map(|r| r.weight)
    }

    /// Direct neighbours.
    pub fn neighbors(&self) -> impl Iterator<Item = TransmitterId> + '_ {
        self.links.keys().copied()
    }

    /// All installed routes.
    pub fn routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.best.values()
    }

    /// The advertisement to send to `neighbor`.
    #[must_use]
    pub fn advertisement_for(&self, neighbor: TransmitterId) -> Vec<RoutingUpdate> {
        self.best
            .values()
            .filter(|r| r.next_hop != neighbor && r.destination != neighbor)
            .map(|r| {
                let mut involved = Vec::with_capacity(r.via.len() + 1);
                involved.push(self.local);
                involved.extend_from_slice(&r.via);
                RoutingUpdate {
                    origin: r.destination,
                    weight: r.weight,
                    involved,
                }
            })
            .collect()
    }
}
