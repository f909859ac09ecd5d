//! # dvmesh Core
//!
//! Protocol state shared by every distributor in a dvmesh mesh.
//!
//! This crate provides:
//! - Channel identity (`BaseSubscriptionInfo`) and per-channel `DataIndex` sequencing
//! - Subscription merge rules that fold many local registrations into one upstream registration
//! - A distance-vector routing table between distributors
//! - The hop-by-hop resolution state machine that finds a channel's central distributor
//! - Interest lists exchanged between neighbouring distributors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data_index;
pub mod ids;
pub mod interest;
pub mod registry;
pub mod resolution;
pub mod routing;
pub mod subscription;

pub use data_index::{DataIndex, DataIndexError, DataIndexSequencer, SequenceObserver};
pub use ids::{BaseSubscriptionInfo, SubscriberId, TransmitterId};
pub use interest::{AttributeGroupAspect, InterestDelta, InterestList, InterestSet, InterestTable};
pub use registry::{SubscriptionRegistry, Upstream};
pub use resolution::{
    Directory, ReceiptCode, ResolutionAction, ResolutionContext, ResolutionReceipt,
    Requester, ResolutionRejected, ResolutionRequest, ResolutionState, Resolver,
    SubscriptionDirection,
};
pub use routing::{RouteEntry, RoutingTable, RoutingUpdate};
pub use subscription::{
    merge_receive, merge_send, ReceiveOptions, ReceiveSubscriptionInfo, ReceiverRole,
    RoleConflictError, SendSubscriptionInfo, SenderRole,
};
