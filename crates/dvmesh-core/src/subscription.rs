//! Subscription records and merge semantics.
//!
//! Many local subscribers of one channel share a single upstream
//! registration. The upstream registration is the merge of all local ones.
//!
//! # Merge Rules
//!
//! | Field | Rule |
//! |-------|------|
//! | `want_delayed_data` | OR: most permissive wins |
//! | `want_delta_only` | AND: any subscriber wanting full records forces full records |
//! | receiver role | at most one Drain; a Drain excludes Receivers |
//! | sender role | fixed at first registration |
//! | `trigger_requested` | OR |

use serde::{Deserialize, Serialize};

use crate::data_index::DataIndex;
use crate::ids::BaseSubscriptionInfo;

/// Role of a receiving subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiverRole {
    /// Best-effort subscriber
    Receiver,
    /// The single authoritative consumer of the channel
    Drain,
}

/// Role of a sending subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SenderRole {
    /// Best-effort publisher
    Sender,
    /// Authoritative publisher, able to report data availability
    Source,
}

/// Delivery options of a receiving subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReceiveOptions {
    /// Deliver records that arrive late (historic/delayed data)
    pub want_delayed_data: bool,
    /// Deliver only records whose content changed
    pub want_delta_only: bool,
}

impl ReceiveOptions {
    /// Options for plain online data.
    #[must_use]
    pub const fn online() -> Self {
        Self {
            want_delayed_data: false,
            want_delta_only: false,
        }
    }

    /// Combine two option sets.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            want_delayed_data: self.want_delayed_data || other.want_delayed_data,
            want_delta_only: self.want_delta_only && other.want_delta_only,
        }
    }
}

/// A receiving subscription with delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveSubscriptionInfo {
    /// Channel identity
    pub base: BaseSubscriptionInfo,
    /// Delivery options
    pub options: ReceiveOptions,
    /// Receiver or Drain
    pub role: ReceiverRole,
    /// Index of the last record delivered to the subscriber
    pub last_delivered_index: Option<DataIndex>,
    /// Error code of the last record delivered
    pub last_error_state: Option<u8>,
}

impl ReceiveSubscriptionInfo {
    /// Create a fresh receiving subscription.
    #[must_use]
    pub const fn new(base: BaseSubscriptionInfo, options: ReceiveOptions, role: ReceiverRole) -> Self {
        Self {
            base,
            options,
            role,
            last_delivered_index: None,
            last_error_state: None,
        }
    }

    /// Record the delivery of a record.
    pub fn record_delivery(&mut self, index: DataIndex, error_code: u8) {
        self.last_delivered_index = Some(index);
        self.last_error_state = Some(error_code);
    }
}

/// A sending subscription with trigger bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSubscriptionInfo {
    /// Channel identity
    pub base: BaseSubscriptionInfo,
    /// Sender or Source
    pub role: SenderRole,
    /// Sender wants to be told when someone needs its data
    pub trigger_requested: bool,
    /// Last trigger state delivered to the sender
    pub last_trigger_state: Option<u8>,
}

impl SendSubscriptionInfo {
    /// Create a fresh sending subscription.
    #[must_use]
    pub const fn new(base: BaseSubscriptionInfo, role: SenderRole, trigger_requested: bool) -> Self {
        Self {
            base,
            role,
            trigger_requested,
            last_trigger_state: None,
        }
    }
}

/// A registration that cannot coexist with the channel's current roles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoleConflictError {
    /// A Drain was requested while a Receiver or Drain is registered
    #[error("channel {channel}: drain cannot be added, a {existing:?} is already registered")]
    DrainExcluded {
        /// Channel concerned
        channel: BaseSubscriptionInfo,
        /// Role already registered
        existing: ReceiverRole,
    },
    /// A Receiver was requested while a Drain is registered
    #[error("channel {channel}: receiver cannot be added next to a drain")]
    ReceiverExcluded {
        /// Channel concerned
        channel: BaseSubscriptionInfo,
    },
    /// A sender role different from the established one was requested
    #[error("channel {channel}: sender role is fixed to {existing:?}, got {requested:?}")]
    SenderRoleFixed {
        /// Channel concerned
        channel: BaseSubscriptionInfo,
        /// Established role
        existing: SenderRole,
        /// Requested role
        requested: SenderRole,
    },
    /// The two registrations name different channels
    #[error("cannot merge subscriptions of {left} and {right}")]
    ChannelMismatch {
        /// Existing channel
        left: BaseSubscriptionInfo,
        /// Incoming channel
        right: BaseSubscriptionInfo,
    },
}

/// Merge an incoming receiving registration into an existing one.
///
/// Returns the merged registration and whether it differs from `existing`
/// in a way the upstream registration must reflect.
///
/// # Errors
///
/// Returns error if the roles cannot coexist or the channels differ.
pub fn merge_receive(
    existing: &ReceiveSubscriptionInfo,
    incoming: &ReceiveSubscriptionInfo,
) -> Result<(ReceiveSubscriptionInfo, bool), RoleConflictError> {
    if existing.base != incoming.base {
        return Err(RoleConflictError::ChannelMismatch {
            left: existing.base,
            right: incoming.base,
        });
    }
    match (existing.role, incoming.role) {
        (existing_role, ReceiverRole::Drain) => {
            return Err(RoleConflictError::DrainExcluded {
                channel: existing.base,
                existing: existing_role,
            })
        }
        (ReceiverRole::Drain, ReceiverRole::Receiver) => {
            return Err(RoleConflictError::ReceiverExcluded {
                channel: existing.base,
            })
        }
        (ReceiverRole::Receiver, ReceiverRole::Receiver) => {}
    }

    let options = existing.options.merge(incoming.options);
    let merged = ReceiveSubscriptionInfo {
        options,
        ..existing.clone()
    };
    Ok((merged, options != existing.options))
}

/// Merge an incoming sending registration into an existing one.
///
/// # Errors
///
/// Returns error if the sender role differs from the established one or the
/// channels differ.
pub fn merge_send(
    existing: &SendSubscriptionInfo,
    incoming: &SendSubscriptionInfo,
) -> Result<(SendSubscriptionInfo, bool), RoleConflictError> {
    if existing.base != incoming.base {
        return Err(RoleConflictError::ChannelMismatch {
            left: existing.base,
            right: incoming.base,
        });
    }
    if existing.role != incoming.role {
        return Err(RoleConflictError::SenderRoleFixed {
            channel: existing.base,
            existing: existing.role,
            requested: incoming.role,
        });
    }

    let trigger_requested = existing.trigger_requested || incoming.trigger_requested;
    let merged = SendSubscriptionInfo {
        trigger_requested,
        ..existing.clone()
    };
    Ok((merged, trigger_requested != existing.trigger_requested))
}
