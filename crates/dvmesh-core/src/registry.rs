//! Local subscription registry.
//!
//! Tracks, per channel, every local subscriber's registration and derives
//! the single upstream registration from them:
//! - the upstream receive registration is the fold of [`merge_receive`]
//! - the upstream send registration is the fold of [`merge_send`]
//!
//! A rejected registration leaves the registry untouched.

use std::collections::BTreeMap;

use crate::data_index::DataIndex;
use crate::ids::{BaseSubscriptionInfo, SubscriberId};
use crate::subscription::{
    merge_receive, merge_send, ReceiveSubscriptionInfo, ReceiverRole, RoleConflictError,
    SendSubscriptionInfo, SenderRole,
};

/// Effect of a registry operation on the upstream registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream<T> {
    /// The channel gained its first registration
    Added(T),
    /// The merged registration changed
    Changed(T),
    /// No upstream effect
    Unchanged,
    /// The last registration was removed
    Removed,
}

impl<T> Upstream<T> {
    /// Whether the upstream side must be told about this change.
    #[must_use]
    pub fn is_change(&self) -> bool {
        !matches!(self, Upstream::Unchanged)
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    receivers: BTreeMap<SubscriberId, ReceiveSubscriptionInfo>,
    senders: BTreeMap<SubscriberId, SendSubscriptionInfo>,
}

impl ChannelState {
    fn is_empty(&self) -> bool {
        self.receivers.is_empty() && self.senders.is_empty()
    }
}

/// Registry of local subscriptions, keyed by channel.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: BTreeMap<BaseSubscriptionInfo, ChannelState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a subscriber's receiving subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the role conflicts with other subscribers' roles.
    pub fn register_receiver(
        &mut self,
        subscriber: SubscriberId,
        info: ReceiveSubscriptionInfo,
    ) -> Result<Upstream<ReceiveSubscriptionInfo>, RoleConflictError> {
        let base = info.base;
        let before = self.aggregate_receive(&base);

        let mut candidate = self
            .channels
            .get(&base)
            .map(|c| c.receivers.clone())
            .unwrap_or_default();
        candidate.insert(subscriber, info);
        let after = fold_receive(candidate.values())?;

        self.channels.entry(base).or_default().receivers = candidate;
        Ok(receive_change(before, after))
    }

    /// Remove a subscriber's receiving subscription.
    pub fn unregister_receiver(
        &mut self,
        subscriber: SubscriberId,
        base: &BaseSubscriptionInfo,
    ) -> Upstream<ReceiveSubscriptionInfo> {
        let before = self.aggregate_receive(base);
        let Some(state) = self.channels.get_mut(base) else {
            return Upstream::Unchanged;
        };
        if state.receivers.remove(&subscriber).is_none() {
            return Upstream::Unchanged;
        }
        // Removing a subscriber never introduces a role conflict.
        let after = fold_receive(state.receivers.values()).ok().flatten();
        if state.is_empty() {
            self.channels.remove(base);
        }
        receive_change(before, after)
    }

    /// Register (or replace) a subscriber's sending subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the sender role differs from the channel's established role.
    pub fn register_sender(
        &mut self,
        subscriber: SubscriberId,
        info: SendSubscriptionInfo,
    ) -> Result<Upstream<SendSubscriptionInfo>, RoleConflictError> {
        let base = info.base;
        let before = self.aggregate_send(&base);

        let mut candidate = self
            .channels
            .get(&base)
            .map(|c| c.senders.clone())
            .unwrap_or_default();
        candidate.insert(subscriber, info);
        let after = fold_send(candidate.values())?;

        self.channels.entry(base).or_default().senders = candidate;
        Ok(send_change(before, after))
    }

    /// Remove a subscriber's sending subscription.
    pub fn unregister_sender(
        &mut self,
        subscriber: SubscriberId,
        base: &BaseSubscriptionInfo,
    ) -> Upstream<SendSubscriptionInfo> {
        let before = self.aggregate_send(base);
        let Some(state) = self.channels.get_mut(base) else {
            return Upstream::Unchanged;
        };
        if state.senders.remove(&subscriber).is_none() {
            return Upstream::Unchanged;
        }
        let after = fold_send(state.senders.values()).ok().flatten();
        if state.is_empty() {
            self.channels.remove(base);
        }
        send_change(before, after)
    }

    /// Remove every registration of a subscriber, e.g. when its connection closes.
    ///
    /// Returns the channels whose upstream registrations changed.
    pub fn remove_subscriber(
        &mut self,
        subscriber: SubscriberId,
    ) -> Vec<(BaseSubscriptionInfo, Upstream<ReceiveSubscriptionInfo>, Upstream<SendSubscriptionInfo>)>
    {
        let bases: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, s)| {
                s.receivers.contains_key(&subscriber) || s.senders.contains_key(&subscriber)
            })
            .map(|(b, _)| *b)
            .collect();

        bases
            .into_iter()
            .map(|base| {
                let receive = self.unregister_receiver(subscriber, &base);
                let send = self.unregister_sender(subscriber, &base);
                (base, receive, send)
            })
            .filter(|(_, r, s)| r.is_change() || s.is_change())
            .collect()
    }

    /// Merged receiving registration of a channel.
    #[must_use]
    pub fn aggregate_receive(&self, base: &BaseSubscriptionInfo) -> Option<ReceiveSubscriptionInfo> {
        self.channels
            .get(base)
            .and_then(|s| fold_receive(s.receivers.values()).ok().flatten())
    }

    /// Merged sending registration of a channel.
    #[must_use]
    pub fn aggregate_send(&self, base: &BaseSubscriptionInfo) -> Option<SendSubscriptionInfo> {
        self.channels
            .get(base)
            .and_then(|s| fold_send(s.senders.values()).ok().flatten())
    }

    /// Local receivers of a channel.
    pub fn receivers(
        &self,
        base: &BaseSubscriptionInfo,
    ) -> impl Iterator<Item = (SubscriberId, &ReceiveSubscriptionInfo)> {
        self.channels
            .get(base)
            .into_iter()
            .flat_map(|s| s.receivers.iter().map(|(id, info)| (*id, info)))
    }

    /// Local senders of a channel.
    pub fn senders(
        &self,
        base: &BaseSubscriptionInfo,
    ) -> impl Iterator<Item = (SubscriberId, &SendSubscriptionInfo)> {
        self.channels
            .get(base)
            .into_iter()
            .flat_map(|s| s.senders.iter().map(|(id, info)| (*id, info)))
    }

    /// Number of locally attached Sources for a channel.
    #[must_use]
    pub fn source_count(&self, base: &BaseSubscriptionInfo) -> usize {
        self.senders(base)
            .filter(|(_, s)| s.role == SenderRole::Source)
            .count()
    }

    /// Number of locally attached Drains for a channel.
    #[must_use]
    pub fn drain_count(&self, base: &BaseSubscriptionInfo) -> usize {
        self.receivers(base)
            .filter(|(_, r)| r.role == ReceiverRole::Drain)
            .count()
    }

    /// Record the delivery of a record to one subscriber.
    pub fn record_delivery(
        &mut self,
        subscriber: SubscriberId,
        base: &BaseSubscriptionInfo,
        index: DataIndex,
        error_code: u8,
    ) {
        if let Some(info) = self
            .channels
            .get_mut(base)
            .and_then(|s| s.receivers.get_mut(&subscriber))
        {
            info.record_delivery(index, error_code);
        }
    }

    /// Remember the trigger state last sent to a sender.
    ///
    /// Returns `false` if the sender already had this state or is unknown.
    pub fn record_trigger(
        &mut self,
        subscriber: SubscriberId,
        base: &BaseSubscriptionInfo,
        state: u8,
    ) -> bool {
        let Some(info) = self
            .channels
            .get_mut(base)
            .and_then(|s| s.senders.get_mut(&subscriber))
        else {
            return false;
        };
        if info.last_trigger_state == Some(state) {
            return false;
        }
        info.last_trigger_state = Some(state);
        true
    }

    /// All channels with at least one registration.
    pub fn channels(&self) -> impl Iterator<Item = &BaseSubscriptionInfo> {
        self.channels.keys()
    }

    /// Whether the registry holds no registrations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn fold_receive<'a>(
    mut infos: impl Iterator<Item = &'a ReceiveSubscriptionInfo>,
) -> Result<Option<ReceiveSubscriptionInfo>, RoleConflictError> {
    let Some(first) = infos.next() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for info in infos {
        acc = merge_receive(&acc, info)?.0;
    }
    Ok(Some(acc))
}

fn fold_send<'a>(
    mut infos: impl Iterator<Item = &'a SendSubscriptionInfo>,
) -> Result<Option<SendSubscriptionInfo>, RoleConflictError> {
    let Some(first) = infos.next() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for info in infos {
        acc = merge_send(&acc, info)?.0;
    }
    Ok(Some(acc))
}

fn receive_change(
    before: Option<ReceiveSubscriptionInfo>,
    after: Option<ReceiveSubscriptionInfo>,
) -> Upstream<ReceiveSubscriptionInfo> {
    match (before, after) {
        (None, None) => Upstream::Unchanged,
        (None, Some(a)) => Upstream::Added(a),
        (Some(_), None) => Upstream::Removed,
        (Some(b), Some(a)) if b.options == a.options && b.role == a.role => Upstream::Unchanged,
        (Some(_), Some(a)) => Upstream::Changed(a),
    }
}

fn send_change(
    before: Option<SendSubscriptionInfo>,
    after: Option<SendSubscriptionInfo>,
) -> Upstream<SendSubscriptionInfo> {
    match (before, after) {
        (None, None) => Upstream::Unchanged,
        (None, Some(a)) => Upstream::Added(a),
        (Some(_), None) => Upstream::Removed,
        (Some(b), Some(a)) if b.role == a.role && b.trigger_requested == a.trigger_requested => {
            Upstream::Unchanged
        }
        (Some(_), Some(a)) => Upstream::Changed(a),
    }
}
