//! Hop-by-hop discovery of a channel's central distributor.
//!
//! State per `(channel, direction)`:
//!
//! ```text
//! Unresolved ──request sent──▶ Pending ──Positive / PositiveNoRights──▶ Resolved
//!                                 │
//!                                 └──Negative (no more targets) / MoreThanOnePositive──▶ Rejected
//! ```
//!
//! A distributor with a local application in the opposing role (a Source for
//! a Receiver's request, a Drain for a Sender's request) is central and
//! answers directly. Otherwise it forwards the request toward the closest
//! potential central distributor it has not tried yet, appending itself to
//! the candidate list. Receipts travel back along the reverse path and
//! every hop caches the result until an unsubscription or a routing change.
//!
//! Access rights belong to the origin of a request, not to the channel. A
//! hop answering from its cache checks the new origin against the
//! [`Directory`], and asks upstream again when it holds only a
//! `PositiveNoRights` grant but the new origin has access. Data is passed
//! only to neighbours granted `Positive`.
//!
//! The resolver is a pure state machine: every operation returns the
//! [`ResolutionAction`]s the caller must carry out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{BaseSubscriptionInfo, TransmitterId};
use crate::interest::AttributeGroupAspect;
use crate::registry::SubscriptionRegistry;
use crate::routing::RoutingTable;

/// Which side of a channel is looking for its central distributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubscriptionDirection {
    /// A Sender or Source looking for the Drain
    Sender,
    /// A Receiver or Drain looking for the Source
    Receiver,
}

impl SubscriptionDirection {
    /// Number of local applications in the role this direction resolves toward.
    #[must_use]
    pub fn opposing_attached(self, registry: &SubscriptionRegistry, base: &BaseSubscriptionInfo) -> usize {
        match self {
            SubscriptionDirection::Sender => registry.drain_count(base),
            SubscriptionDirection::Receiver => registry.source_count(base),
        }
    }
}

/// Answer to a resolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReceiptCode {
    /// No central distributor on this path
    Negative = 0,
    /// Central distributor found
    Positive = 1,
    /// Central distributor found, requester lacks access rights
    PositiveNoRights = 2,
    /// Two applications claim the authoritative role
    MoreThanOnePositive = 3,
}

impl ReceiptCode {
    /// Parse a wire value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Negative),
            1 => Some(Self::Positive),
            2 => Some(Self::PositiveNoRights),
            3 => Some(Self::MoreThanOnePositive),
            _ => None,
        }
    }

    /// Whether the receipt identifies a central distributor that may be cached.
    #[must_use]
    pub fn is_positive(self) -> bool {
        matches!(self, Self::Positive | Self::PositiveNoRights)
    }
}

/// A request travelling toward the central distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    /// Channel being resolved
    pub base: BaseSubscriptionInfo,
    /// Side doing the resolving
    pub direction: SubscriptionDirection,
    /// Distributors the request passed through, the originator first
    pub candidates: Vec<TransmitterId>,
}

/// A receipt travelling back toward the originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReceipt {
    /// Channel being resolved
    pub base: BaseSubscriptionInfo,
    /// Side doing the resolving
    pub direction: SubscriptionDirection,
    /// Outcome
    pub code: ReceiptCode,
    /// The central distributor, or the answering distributor for `Negative`
    pub central: TransmitterId,
    /// Candidate list of the request being answered
    pub candidates: Vec<TransmitterId>,
}

/// A resolution outcome that must be surfaced to local applications.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionRejected {
    /// No central distributor could be found
    #[error("no central distributor found for {base}")]
    Negative {
        /// Channel concerned
        base: BaseSubscriptionInfo,
    },
    /// Access to the channel was denied by the central distributor
    #[error("no rights for {base} at central distributor {central}")]
    NoRights {
        /// Channel concerned
        base: BaseSubscriptionInfo,
        /// Central distributor
        central: TransmitterId,
    },
    /// Topology misconfiguration: two authoritative applications
    #[error("more than one authoritative application for {base} at {central}")]
    MoreThanOnePositive {
        /// Channel concerned
        base: BaseSubscriptionInfo,
        /// Distributor reporting the conflict
        central: TransmitterId,
    },
}

/// Resolution state of one `(channel, direction)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Nothing requested yet, or invalidated
    Unresolved,
    /// Request sent toward `target`
    Pending {
        /// Potential central distributor currently tried
        target: TransmitterId,
    },
    /// Central distributor known
    Resolved {
        /// Central distributor
        central: TransmitterId,
        /// `Positive` when data of the channel flows to this distributor,
        /// `PositiveNoRights` when no origin served here may access it
        code: ReceiptCode,
    },
    /// Resolution failed
    Rejected {
        /// `Negative` or `MoreThanOnePositive`
        code: ReceiptCode,
    },
}

/// A neighbour waiting on, or served by, a resolution entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// Candidate list of its latest request
    pub candidates: Vec<TransmitterId>,
    /// Code last answered to it, `None` while waiting
    pub code: Option<ReceiptCode>,
}

impl Requester {
    fn waiting(candidates: Vec<TransmitterId>) -> Self {
        Self {
            candidates,
            code: None,
        }
    }

    fn origin(&self, neighbor: TransmitterId) -> TransmitterId {
        self.candidates.first().copied().unwrap_or(neighbor)
    }
}

/// Cached resolution state.
#[derive(Debug, Clone)]
pub struct ResolutionEntry {
    /// Current state
    pub state: ResolutionState,
    /// Potential central distributors tried so far
    pub tried: Vec<TransmitterId>,
    /// Neighbour the request was forwarded to
    pub upstream: Option<TransmitterId>,
    /// Neighbours waiting on (or served by) this entry
    pub requesters: BTreeMap<TransmitterId, Requester>,
    /// Whether a local application registered the channel
    pub local_interest: bool,
    /// Code last surfaced to local applications
    pub local_code: Option<ReceiptCode>,
}

impl ResolutionEntry {
    fn new() -> Self {
        Self {
            state: ResolutionState::Unresolved,
            tried: Vec::new(),
            upstream: None,
            requesters: BTreeMap::new(),
            local_interest: false,
            local_code: None,
        }
    }

    /// Resolved central distributor.
    #[must_use]
    pub fn central(&self) -> Option<TransmitterId> {
        match self.state {
            ResolutionState::Resolved { central, .. } => Some(central),
            _ => None,
        }
    }

    /// Receipt code of the last settled outcome.
    #[must_use]
    pub fn receipt_code(&self) -> Option<ReceiptCode> {
        match self.state {
            ResolutionState::Resolved { code, .. } | ResolutionState::Rejected { code } => Some(code),
            _ => None,
        }
    }

    /// Outcome for local applications: their own access rights once resolved.
    #[must_use]
    pub fn local_receipt_code(&self) -> Option<ReceiptCode> {
        match self.state {
            ResolutionState::Resolved { .. } => self.local_code,
            ResolutionState::Rejected { code } => Some(code),
            _ => None,
        }
    }

    fn is_idle(&self) -> bool {
        !self.local_interest && self.requesters.is_empty()
    }
}

/// Lookups the resolver needs from the configuration directory.
pub trait Directory {
    /// Distributors that may be central for the channel.
    fn potential_centrals(&self, base: &BaseSubscriptionInfo) -> Vec<TransmitterId>;

    /// Whether a request originating at `origin` may access the channel.
    fn may_access(
        &self,
        _base: &BaseSubscriptionInfo,
        _direction: SubscriptionDirection,
        _origin: TransmitterId,
    ) -> bool {
        true
    }

    /// Attribute group and aspect an attribute-group usage id stands for.
    fn attribute_group_aspect(&self, _usage_id: u64) -> Option<AttributeGroupAspect> {
        None
    }
}

/// Shared state the resolver reads.
#[derive(Clone, Copy)]
pub struct ResolutionContext<'a> {
    /// Local routing table
    pub routing: &'a RoutingTable,
    /// Local application registrations
    pub registry: &'a SubscriptionRegistry,
    /// Configuration directory
    pub directory: &'a dyn Directory,
}

/// Work the caller must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Send a resolution request to a neighbour
    Forward {
        /// Neighbour
        to: TransmitterId,
        /// Request to send
        request: ResolutionRequest,
    },
    /// Send a receipt to a neighbour
    Reply {
        /// Neighbour
        to: TransmitterId,
        /// Receipt to send
        receipt: ResolutionReceipt,
    },
    /// Withdraw a request previously forwarded to a neighbour
    Cancel {
        /// Neighbour
        to: TransmitterId,
        /// Withdrawn request
        request: ResolutionRequest,
    },
    /// Local applications' channel resolved
    Resolved {
        /// Channel
        base: BaseSubscriptionInfo,
        /// Direction
        direction: SubscriptionDirection,
        /// Central distributor
        central: TransmitterId,
    },
    /// Local applications' channel rejected
    Rejected {
        /// Direction
        direction: SubscriptionDirection,
        /// Reason
        error: ResolutionRejected,
    },
}

type Key = (BaseSubscriptionInfo, SubscriptionDirection);

/// Resolution cache and state machine of one distributor.
#[derive(Debug)]
pub struct Resolver {
    local: TransmitterId,
    entries: BTreeMap<Key, ResolutionEntry>,
}

impl Resolver {
    /// Create a resolver for the given local distributor.
    #[must_use]
    pub fn new(local: TransmitterId) -> Self {
        Self {
            local,
            entries: BTreeMap::new(),
        }
    }

    /// Cached entry of a channel.
    #[must_use]
    pub fn entry(
        &self,
        base: &BaseSubscriptionInfo,
        direction: SubscriptionDirection,
    ) -> Option<&ResolutionEntry> {
        self.entries.get(&(*base, direction))
    }

    /// Neighbours served by an entry that were granted access.
    pub fn downstream(
        &self,
        base: &BaseSubscriptionInfo,
        direction: SubscriptionDirection,
    ) -> impl Iterator<Item = TransmitterId> + '_ {
        self.entries
            .get(&(*base, direction))
            .into_iter()
            .flat_map(|e| e.requesters.iter())
            .filter(|(_, r)| r.code == Some(ReceiptCode::Positive))
            .map(|(n, _)| *n)
    }

    /// Whether data of the channel may be taken from (or passed to) a neighbour.
    #[must_use]
    pub fn granted(
        &self,
        base: &BaseSubscriptionInfo,
        direction: SubscriptionDirection,
        neighbor: TransmitterId,
    ) -> bool {
        self.entry(base, direction)
            .and_then(|e| e.requesters.get(&neighbor))
            .is_some_and(|r| r.code == Some(ReceiptCode::Positive))
    }

    /// Outcome local applications of the channel are in.
    #[must_use]
    pub fn local_rights(
        &self,
        base: &BaseSubscriptionInfo,
        direction: SubscriptionDirection,
    ) -> Option<ReceiptCode> {
        self.entry(base, direction)
            .and_then(ResolutionEntry::local_receipt_code)
    }

    /// Neighbour toward the central distributor, once resolved.
    #[must_use]
    pub fn upstream(
        &self,
        base: &BaseSubscriptionInfo,
        direction: SubscriptionDirection,
    ) -> Option<TransmitterId> {
        self.entry(base, direction)
            .filter(|e| matches!(e.state, ResolutionState::Resolved { .. }))
            .and_then(|e| e.upstream)
    }

    /// A local application registered the channel.
    pub fn subscribe_local(
        &mut self,
        ctx: ResolutionContext<'_>,
        base: BaseSubscriptionInfo,
        direction: SubscriptionDirection,
    ) -> Vec<ResolutionAction> {
        let key = (base, direction);
        let entry = self.entries.entry(key).or_insert_with(ResolutionEntry::new);
        entry.local_interest = true;

        match entry.state {
            ResolutionState::Resolved { central, code } => {
                let local = self.rights_for(ctx, key, self.local, central, code);
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.local_code = Some(local);
                }
                let mut actions = vec![local_outcome(key, local, central)];
                if local == ReceiptCode::Positive {
                    actions.extend(self.widen(key, vec![self.local]));
                }
                return actions;
            }
            ResolutionState::Pending { .. } => return Vec::new(),
            ResolutionState::Rejected { .. } => {
                entry.state = ResolutionState::Unresolved;
                entry.tried.clear();
            }
            ResolutionState::Unresolved => {}
        }

        if let Some(code) = self.local_receipt(ctx, key, self.local) {
            return self.settle(ctx, key, code, self.local);
        }
        self.advance(ctx, key)
    }

    /// The last local application unregistered the channel.
    pub fn unsubscribe_local(
        &mut self,
        base: BaseSubscriptionInfo,
        direction: SubscriptionDirection,
    ) -> Vec<ResolutionAction> {
        let key = (base, direction);
        let Some(entry) = self.entries.get_mut(&key) else {
            return Vec::new();
        };
        entry.local_interest = false;
        self.drop_if_idle(key)
    }

    /// A local application in an authoritative role registered or left.
    ///
    /// Entries with local interest become centrally resolved at this
    /// distributor as soon as the opposing role is attached locally. Entries
    /// resolved here whose opposing role left are answered `Negative` to
    /// their requesters and resolved again. A second authoritative
    /// application turns them into a `MoreThanOnePositive` rejection.
    pub fn local_roles_changed(
        &mut self,
        ctx: ResolutionContext<'_>,
        base: BaseSubscriptionInfo,
    ) -> Vec<ResolutionAction> {
        let mut actions = Vec::new();
        for direction in [SubscriptionDirection::Sender, SubscriptionDirection::Receiver] {
            let key = (base, direction);
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            let receipt = self.local_receipt(ctx, key, self.local);
            if entry.central() == Some(self.local) {
                match receipt {
                    None => actions.extend(self.central_departed(ctx, key)),
                    Some(ReceiptCode::MoreThanOnePositive) => {
                        actions.extend(self.settle(ctx, key, ReceiptCode::MoreThanOnePositive, self.local));
                    }
                    Some(_) => {}
                }
                continue;
            }
            if !entry.local_interest {
                continue;
            }
            let Some(code) = receipt else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&key) {
                if let Some(old) = entry.upstream.take() {
                    actions.push(ResolutionAction::Cancel {
                        to: old,
                        request: self.withdrawal(key),
                    });
                }
            }
            actions.extend(self.settle(ctx, key, code, self.local));
        }
        actions
    }

    /// A neighbour forwarded a resolution request.
    pub fn handle_request(
        &mut self,
        ctx: ResolutionContext<'_>,
        from: TransmitterId,
        request: ResolutionRequest,
    ) -> Vec<ResolutionAction> {
        let key = (request.base, request.direction);

        if request.candidates.contains(&self.local) {
            tracing::debug!(channel = %request.base, %from, "Resolution request looped back");
            return vec![self.reply(from, key, ReceiptCode::Negative, self.local, request.candidates)];
        }

        let origin = request.candidates.first().copied().unwrap_or(from);
        if let Some(code) = self.local_receipt(ctx, key, origin) {
            if !code.is_positive() {
                report_conflict(key, self.local);
                return vec![self.reply(from, key, code, self.local, request.candidates)];
            }
            let local = self.local;
            let entry = self.entries.entry(key).or_insert_with(ResolutionEntry::new);
            // A neighbour keeps the best rights any origin behind it was granted.
            let granted = entry
                .requesters
                .get(&from)
                .and_then(|r| r.code)
                .map_or(code, |old| stronger(old, code));
            entry.requesters.insert(
                from,
                Requester {
                    candidates: request.candidates.clone(),
                    code: Some(granted),
                },
            );
            let state = match entry.state {
                ResolutionState::Resolved { central, code: old } if central == local => stronger(old, granted),
                _ => granted,
            };
            entry.state = ResolutionState::Resolved {
                central: local,
                code: state,
            };
            let mut actions = Vec::new();
            if let Some(old) = entry.upstream.take() {
                actions.push(ResolutionAction::Cancel {
                    to: old,
                    request: self.withdrawal(key),
                });
            }
            actions.push(self.reply(from, key, granted, local, request.candidates));
            return actions;
        }

        let entry = self.entries.entry(key).or_insert_with(ResolutionEntry::new);
        let previous = entry
            .requesters
            .insert(from, Requester::waiting(request.candidates.clone()))
            .and_then(|r| r.code);
        match entry.state {
            ResolutionState::Resolved { central, code } => {
                let rights = self.rights_for(ctx, key, origin, central, code);
                let granted = previous.map_or(rights, |old| stronger(old, rights));
                if let Some(requester) = self
                    .entries
                    .get_mut(&key)
                    .and_then(|e| e.requesters.get_mut(&from))
                {
                    requester.code = Some(granted);
                }
                let mut path = request.candidates.clone();
                let mut actions = vec![self.reply(from, key, granted, central, request.candidates)];
                if rights == ReceiptCode::Positive {
                    path.push(self.local);
                    actions.extend(self.widen(key, path));
                }
                actions
            }
            ResolutionState::Pending { .. } => Vec::new(),
            ResolutionState::Unresolved | ResolutionState::Rejected { .. } => {
                entry.state = ResolutionState::Unresolved;
                entry.tried.clear();
                self.advance(ctx, key)
            }
        }
    }

    /// A neighbour answered a request.
    pub fn handle_receipt(
        &mut self,
        ctx: ResolutionContext<'_>,
        from: TransmitterId,
        receipt: ResolutionReceipt,
    ) -> Vec<ResolutionAction> {
        let key = (receipt.base, receipt.direction);
        let Some(entry) = self.entries.get(&key) else {
            tracing::debug!(channel = %receipt.base, %from, "Receipt for unknown resolution ignored");
            return Vec::new();
        };
        if entry.upstream != Some(from) {
            tracing::debug!(channel = %receipt.base, %from, "Stale receipt ignored");
            return Vec::new();
        }

        match receipt.code {
            ReceiptCode::Negative => self.advance(ctx, key),
            code => self.settle(ctx, key, code, receipt.central),
        }
    }

    /// A neighbour withdrew a request it had forwarded to us.
    pub fn handle_unsubscription(
        &mut self,
        from: TransmitterId,
        request: &ResolutionRequest,
    ) -> Vec<ResolutionAction> {
        let key = (request.base, request.direction);
        let Some(entry) = self.entries.get_mut(&key) else {
            return Vec::new();
        };
        entry.requesters.remove(&from);
        self.drop_if_idle(key)
    }

    /// A neighbour link went down.
    pub fn neighbor_lost(
        &mut self,
        ctx: ResolutionContext<'_>,
        neighbor: TransmitterId,
    ) -> Vec<ResolutionAction> {
        let mut actions = Vec::new();
        let keys: Vec<Key> = self
            .entries
            .iter()
            .filter(|(_, e)| e.requesters.contains_key(&neighbor))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.requesters.remove(&neighbor);
            }
            actions.extend(self.drop_if_idle(key));
        }
        actions.extend(self.routes_changed(ctx));
        actions
    }

    /// The routing table changed; re-resolve entries whose upstream is no
    /// longer the best next hop.
    pub fn routes_changed(&mut self, ctx: ResolutionContext<'_>) -> Vec<ResolutionAction> {
        let stale: Vec<(Key, TransmitterId, TransmitterId)> = self
            .entries
            .iter()
            .filter_map(|(key, e)| {
                let upstream = e.upstream?;
                let toward = match e.state {
                    ResolutionState::Resolved { central, .. } => central,
                    ResolutionState::Pending { target } => target,
                    _ => return None,
                };
                (ctx.routing.next_hop(toward) != Some(upstream)).then_some((*key, upstream, toward))
            })
            .collect();

        let mut actions = Vec::new();
        for (key, old_upstream, toward) in stale {
            tracing::debug!(
                channel = %key.0,
                direction = ?key.1,
                %old_upstream,
                "Resolution invalidated by routing change"
            );
            if ctx.routing.neighbors().any(|n| n == old_upstream) {
                actions.push(ResolutionAction::Cancel {
                    to: old_upstream,
                    request: self.withdrawal(key),
                });
            }
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.upstream = None;
                entry.state = ResolutionState::Unresolved;
                entry.tried.retain(|t| *t != toward);
            }
            actions.extend(self.advance(ctx, key));
        }
        actions
    }

    fn central_departed(&mut self, ctx: ResolutionContext<'_>, key: Key) -> Vec<ResolutionAction> {
        tracing::debug!(channel = %key.0, direction = ?key.1, "Central application left, resolving again");
        let local = self.local;
        let Some(entry) = self.entries.get_mut(&key) else {
            return Vec::new();
        };
        let requesters = std::mem::take(&mut entry.requesters);
        let local_interest = entry.local_interest;
        entry.state = ResolutionState::Unresolved;
        entry.upstream = None;
        entry.tried.clear();

        let mut actions: Vec<ResolutionAction> = requesters
            .into_iter()
            .map(|(to, r)| self.reply(to, key, ReceiptCode::Negative, local, r.candidates))
            .collect();
        if local_interest {
            actions.extend(self.advance(ctx, key));
        } else {
            self.entries.remove(&key);
        }
        actions
    }

    fn local_receipt(&self, ctx: ResolutionContext<'_>, key: Key, origin: TransmitterId) -> Option<ReceiptCode> {
        let (base, direction) = key;
        match direction.opposing_attached(ctx.registry, &base) {
            0 => None,
            1 if ctx.directory.may_access(&base, direction, origin) => Some(ReceiptCode::Positive),
            1 => Some(ReceiptCode::PositiveNoRights),
            _ => Some(ReceiptCode::MoreThanOnePositive),
        }
    }

    /// Rights of `origin` on a channel resolved toward `central`.
    ///
    /// Away from the central distributor a cached receipt only speaks for the
    /// origin it was requested for, so every other origin is checked against
    /// the directory again.
    fn rights_for(
        &self,
        ctx: ResolutionContext<'_>,
        key: Key,
        origin: TransmitterId,
        central: TransmitterId,
        granted: ReceiptCode,
    ) -> ReceiptCode {
        if central == self.local {
            return self
                .local_receipt(ctx, key, origin)
                .filter(|code| code.is_positive())
                .unwrap_or(granted);
        }
        if ctx.directory.may_access(&key.0, key.1, origin) {
            ReceiptCode::Positive
        } else {
            ReceiptCode::PositiveNoRights
        }
    }

    /// Ask upstream again for an origin with access while the channel's
    /// data is not yet granted to this distributor.
    fn widen(&self, key: Key, candidates: Vec<TransmitterId>) -> Option<ResolutionAction> {
        let entry = self.entries.get(&key)?;
        let ResolutionState::Resolved {
            central,
            code: ReceiptCode::PositiveNoRights,
        } = entry.state
        else {
            return None;
        };
        if central == self.local {
            return None;
        }
        let to = entry.upstream?;
        tracing::debug!(channel = %key.0, direction = ?key.1, %to, "Requesting access for another origin");
        Some(ResolutionAction::Forward {
            to,
            request: ResolutionRequest {
                base: key.0,
                direction: key.1,
                candidates,
            },
        })
    }

    /// Forward toward the next untried potential central, or settle `Negative`.
    fn advance(&mut self, ctx: ResolutionContext<'_>, key: Key) -> Vec<ResolutionAction> {
        let local = self.local;
        let Some(entry) = self.entries.get(&key) else {
            return Vec::new();
        };

        let mut visited: Vec<TransmitterId> = entry
            .requesters
            .values()
            .flat_map(|r| r.candidates.iter().copied())
            .collect();
        visited.push(local);

        let mut path = if entry.local_interest {
            Vec::new()
        } else {
            entry
                .requesters
                .values()
                .next()
                .map(|r| r.candidates.clone())
                .unwrap_or_default()
        };
        path.push(local);

        let next = ctx
            .directory
            .potential_centrals(&key.0)
            .into_iter()
            .filter(|t| !visited.contains(t) && !entry.tried.contains(t))
            .filter_map(|t| {
                let hop = ctx.routing.next_hop(t)?;
                let weight = ctx.routing.weight_to(t)?;
                (!visited.contains(&hop)).then_some((weight, t, hop))
            })
            .min();

        let Some((_, target, hop)) = next else {
            return self.settle(ctx, key, ReceiptCode::Negative, local);
        };

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.tried.push(target);
            entry.state = ResolutionState::Pending { target };
            entry.upstream = Some(hop);
        }
        tracing::debug!(channel = %key.0, direction = ?key.1, %target, %hop, "Forwarding resolution request");
        vec![ResolutionAction::Forward {
            to: hop,
            request: ResolutionRequest {
                base: key.0,
                direction: key.1,
                candidates: path,
            },
        }]
    }

    /// Record a final outcome and notify everyone waiting on it.
    ///
    /// Positive outcomes are answered per requester with the rights of its
    /// origin. Requesters and local applications already holding that
    /// answer are not told again.
    fn settle(
        &mut self,
        ctx: ResolutionContext<'_>,
        key: Key,
        code: ReceiptCode,
        central: TransmitterId,
    ) -> Vec<ResolutionAction> {
        let Some(entry) = self.entries.get(&key) else {
            return Vec::new();
        };
        let was = entry.state;
        let local_interest = entry.local_interest;

        if !code.is_positive() {
            let requesters = match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.state = ResolutionState::Rejected { code };
                    entry.upstream = None;
                    entry.local_code = None;
                    std::mem::take(&mut entry.requesters)
                }
                None => BTreeMap::new(),
            };
            if code == ReceiptCode::MoreThanOnePositive {
                report_conflict(key, central);
            }
            let mut actions: Vec<ResolutionAction> = requesters
                .into_iter()
                .map(|(to, r)| self.reply(to, key, code, central, r.candidates))
                .collect();
            if local_interest {
                actions.push(local_outcome(key, code, central));
            } else {
                self.entries.remove(&key);
            }
            return actions;
        }

        let unchanged_central = matches!(was, ResolutionState::Resolved { central: c, .. } if c == central);
        let answers: Vec<(TransmitterId, Vec<TransmitterId>, ReceiptCode, bool)> = entry
            .requesters
            .iter()
            .map(|(to, r)| {
                let mut rights = self.rights_for(ctx, key, r.origin(*to), central, code);
                if let Some(old) = r.code.filter(|_| unchanged_central) {
                    rights = stronger(old, rights);
                }
                let known = unchanged_central && r.code == Some(rights);
                (*to, r.candidates.clone(), rights, known)
            })
            .collect();
        let local = local_interest.then(|| self.rights_for(ctx, key, self.local, central, code));
        let local_known = unchanged_central && local.is_some() && entry.local_code == local;

        // At the central distributor the entry grants what its best origin was granted.
        let state = if central == self.local {
            answers
                .iter()
                .map(|(_, _, rights, _)| *rights)
                .chain(local)
                .fold(code, stronger)
        } else {
            code
        };

        let widen_for = (central != self.local && state == ReceiptCode::PositiveNoRights)
            .then(|| {
                if local == Some(ReceiptCode::Positive) {
                    return Some(vec![self.local]);
                }
                answers
                    .iter()
                    .find(|(_, _, rights, _)| *rights == ReceiptCode::Positive)
                    .map(|(_, candidates, _, _)| {
                        let mut path = candidates.clone();
                        path.push(self.local);
                        path
                    })
            })
            .flatten();

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.state = ResolutionState::Resolved { central, code: state };
            entry.local_code = local;
            for (to, _, rights, _) in &answers {
                if let Some(requester) = entry.requesters.get_mut(to) {
                    requester.code = Some(*rights);
                }
            }
        }

        let mut actions: Vec<ResolutionAction> = answers
            .into_iter()
            .filter(|(_, _, _, known)| !known)
            .map(|(to, candidates, rights, _)| self.reply(to, key, rights, central, candidates))
            .collect();
        if let Some(local) = local.filter(|_| !local_known) {
            actions.push(local_outcome(key, local, central));
        }
        if let Some(path) = widen_for {
            actions.extend(self.widen(key, path));
        }
        actions
    }

    fn drop_if_idle(&mut self, key: Key) -> Vec<ResolutionAction> {
        if !self.entries.get(&key).is_some_and(ResolutionEntry::is_idle) {
            return Vec::new();
        }
        let request = self.withdrawal(key);
        match self.entries.remove(&key).and_then(|e| e.upstream) {
            Some(to) => vec![ResolutionAction::Cancel { to, request }],
            None => Vec::new(),
        }
    }

    fn withdrawal(&self, key: Key) -> ResolutionRequest {
        ResolutionRequest {
            base: key.0,
            direction: key.1,
            candidates: vec![self.local],
        }
    }

    fn reply(
        &self,
        to: TransmitterId,
        key: Key,
        code: ReceiptCode,
        central: TransmitterId,
        candidates: Vec<TransmitterId>,
    ) -> ResolutionAction {
        ResolutionAction::Reply {
            to,
            receipt: ResolutionReceipt {
                base: key.0,
                direction: key.1,
                code,
                central,
                candidates,
            },
        }
    }
}

fn local_outcome(key: Key, code: ReceiptCode, central: TransmitterId) -> ResolutionAction {
    let (base, direction) = key;
    let error = match code {
        ReceiptCode::Positive => {
            return ResolutionAction::Resolved {
                base,
                direction,
                central,
            }
        }
        ReceiptCode::Negative => ResolutionRejected::Negative { base },
        ReceiptCode::PositiveNoRights => ResolutionRejected::NoRights { base, central },
        ReceiptCode::MoreThanOnePositive => ResolutionRejected::MoreThanOnePositive { base, central },
    };
    ResolutionAction::Rejected { direction, error }
}

/// The more permissive of two positive codes.
fn stronger(a: ReceiptCode, b: ReceiptCode) -> ReceiptCode {
    if a == ReceiptCode::Positive || b == ReceiptCode::Positive {
        ReceiptCode::Positive
    } else {
        a
    }
}

fn report_conflict(key: Key, at: TransmitterId) {
    tracing::error!(
        channel = %key.0,
        direction = ?key.1,
        distributor = %at,
        "More than one authoritative application registered; check the topology"
    );
}
