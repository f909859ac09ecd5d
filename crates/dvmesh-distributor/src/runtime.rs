//! Distributor runtime.
//!
//! [`Node`] owns the routing table, the resolution cache, the local
//! subscription registry and the interest lists. It is a synchronous state
//! machine: every input returns the telegrams to send. [`Distributor`] is the
//! single task feeding it link events and dispatching its output, so all
//! shared protocol state has exactly one writer.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use dvmesh_core::{
    BaseSubscriptionInfo, DataIndexSequencer, Directory, InterestList, InterestSet, ReceiptCode,
    ReceiveSubscriptionInfo, ReceiverRole, ResolutionAction, ResolutionContext, ResolutionRejected,
    Resolver, RoutingTable, SendSubscriptionInfo, SenderRole,
    SubscriberId, SubscriptionDirection, SubscriptionRegistry, TransmitterId, Upstream,
};
use dvmesh_proto::{
    error_code, BestPathUpdate, DataDirection, FragmentError, Fragmenter, InterestOwner,
    InterestUpdate, ReceiveSubscription, Record, RecordMetadata, RequestSenderData,
    SendSubscription, Telegram, TransmitterData, TriggerState,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{parse_peer_address, DistributorConfig, LinkSettings, NeighborConfig};
use crate::directory::StaticDirectory;
use crate::link::{self, LinkEvent, LinkHandle, LinkPeer};

/// A telegram to send and where to.
pub type Outgoing = (LinkPeer, Telegram);

const EVENT_CHANNEL: usize = 4096;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// State the resolver reads, kept apart from the resolver so both can be
/// borrowed at once.
#[derive(Debug)]
struct Tables {
    routing: RoutingTable,
    registry: SubscriptionRegistry,
    directory: StaticDirectory,
}

impl Tables {
    fn ctx(&self) -> ResolutionContext<'_> {
        ResolutionContext {
            routing: &self.routing,
            registry: &self.registry,
            directory: &self.directory,
        }
    }
}

/// Protocol state of one distributor.
#[derive(Debug)]
pub struct Node {
    local: TransmitterId,
    tables: Tables,
    resolver: Resolver,
    interest: InterestList,
    interest_subscribers: BTreeSet<TransmitterId>,
    weights: HashMap<TransmitterId, u16>,
    fragmenter: Fragmenter,
    sequencer: DataIndexSequencer,
    out: Vec<Outgoing>,
}

impl Node {
    /// Create the state for a configured distributor.
    ///
    /// # Errors
    ///
    /// Returns error if the configured segment size is invalid.
    pub fn new(config: &DistributorConfig) -> Result<Self, FragmentError> {
        let local = config.transmitter_id;
        Ok(Self {
            local,
            tables: Tables {
                routing: RoutingTable::new(local),
                registry: SubscriptionRegistry::new(),
                directory: StaticDirectory::from_config(config),
            },
            resolver: Resolver::new(local),
            interest: InterestList::new(),
            interest_subscribers: BTreeSet::new(),
            weights: config
                .neighbors
                .iter()
                .map(|n| (TransmitterId(n.id), n.weight))
                .collect(),
            fragmenter: Fragmenter::new(config.max_segment)?,
            sequencer: DataIndexSequencer::starting_now(),
            out: Vec::new(),
        })
    }

    /// Routing table.
    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.tables.routing
    }

    /// Resolution cache.
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Local registrations.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.tables.registry
    }

    /// Directory, including neighbours' interest lists.
    #[must_use]
    pub fn directory(&self) -> &StaticDirectory {
        &self.tables.directory
    }

    /// This distributor's own interest list.
    #[must_use]
    pub fn interest(&self) -> &InterestSet {
        self.interest.current()
    }

    /// A link completed its handshake.
    pub fn link_up(&mut self, peer: LinkPeer) -> Vec<Outgoing> {
        match peer {
            LinkPeer::Application(app) => {
                tracing::info!(application = %app, "Application connected");
            }
            LinkPeer::Distributor(neighbor) => {
                let weight = self.weights.get(&neighbor).copied().unwrap_or(1);
                tracing::info!(%neighbor, weight, "Neighbor connected");
                let changed = self.tables.routing.add_neighbor(neighbor, weight);

                self.send(
                    peer,
                    Telegram::InterestSubscription(InterestOwner { owner: neighbor }),
                );
                if changed.is_empty() {
                    self.advertise_to(neighbor);
                } else {
                    self.routes_changed();
                }
            }
        }
        self.take()
    }

    /// A link ended.
    pub fn link_down(&mut self, peer: LinkPeer) -> Vec<Outgoing> {
        match peer {
            LinkPeer::Application(app) => {
                tracing::info!(application = %app, "Application disconnected");
                for (base, receive, send) in self.tables.registry.remove_subscriber(app) {
                    let mut actions = self.resolver.local_roles_changed(self.tables.ctx(), base);
                    if receive == Upstream::Removed {
                        actions.extend(
                            self.resolver
                                .unsubscribe_local(base, SubscriptionDirection::Receiver),
                        );
                    }
                    if send == Upstream::Removed {
                        actions.extend(
                            self.resolver
                                .unsubscribe_local(base, SubscriptionDirection::Sender),
                        );
                    }
                    self.execute(actions);
                    self.refresh_triggers(base);
                }
                self.update_interest();
            }
            LinkPeer::Distributor(neighbor) => {
                tracing::info!(%neighbor, "Neighbor disconnected");
                let changed = self.tables.routing.remove_neighbor(neighbor);
                self.interest_subscribers.remove(&neighbor);
                self.tables.directory.interest_mut().remove_owner(neighbor);

                let actions = self.resolver.neighbor_lost(self.tables.ctx(), neighbor);
                self.execute(actions);
                if !changed.is_empty() {
                    self.advertise_all();
                }
                self.refresh_all_triggers();
            }
        }
        self.take()
    }

    /// A control telegram arrived.
    pub fn telegram(&mut self, peer: LinkPeer, telegram: Telegram) -> Vec<Outgoing> {
        match peer {
            LinkPeer::Application(app) => self.application_telegram(app, telegram),
            LinkPeer::Distributor(neighbor) => self.distributor_telegram(neighbor, telegram),
        }
        self.take()
    }

    /// A complete record arrived.
    pub fn record(
        &mut self,
        peer: LinkPeer,
        direction: Option<DataDirection>,
        record: Record,
    ) -> Vec<Outgoing> {
        match (peer, direction) {
            (LinkPeer::Application(app), _) => {
                let role = self
                    .tables
                    .registry
                    .senders(&record.base)
                    .find(|(id, _)| *id == app)
                    .map(|(_, info)| info.role);
                match role {
                    Some(SenderRole::Source) => self.toward_receivers(peer, &record),
                    Some(SenderRole::Sender) if self.denied(&record.base, SubscriptionDirection::Sender) => {
                        tracing::debug!(application = %app, channel = %record.base, "Sender data without access dropped");
                    }
                    Some(SenderRole::Sender) => self.toward_drain(peer, &record),
                    None => tracing::warn!(
                        application = %app,
                        channel = %record.base,
                        "Data from unregistered sender dropped"
                    ),
                }
            }
            (LinkPeer::Distributor(_), Some(DataDirection::TowardSource)) => {
                self.toward_receivers(peer, &record);
            }
            (LinkPeer::Distributor(neighbor), Some(DataDirection::TowardSink)) => {
                if self
                    .resolver
                    .granted(&record.base, SubscriptionDirection::Sender, neighbor)
                {
                    self.toward_drain(peer, &record);
                } else {
                    tracing::debug!(%neighbor, channel = %record.base, "Sender data without access dropped");
                }
            }
            (LinkPeer::Distributor(neighbor), None) => {
                tracing::warn!(%neighbor, channel = %record.base, "Application data from a distributor dropped");
            }
        }
        self.take()
    }

    fn take(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.out)
    }

    fn send(&mut self, peer: LinkPeer, telegram: Telegram) {
        self.out.push((peer, telegram));
    }

    fn application_telegram(&mut self, app: SubscriberId, telegram: Telegram) {
        match telegram {
            Telegram::SendSubscription(subscription) => self.register_sender(app, subscription),
            Telegram::ReceiveSubscription(subscription) => self.register_receiver(app, subscription),
            Telegram::SendUnsubscription(base) => self.unregister_sender(app, base),
            Telegram::ReceiveUnsubscription(base) => self.unregister_receiver(app, base),
            other => tracing::debug!(
                application = %app,
                telegram = %other.telegram_type(),
                "Ignoring telegram from application"
            ),
        }
    }

    fn register_sender(&mut self, app: SubscriberId, subscription: SendSubscription) {
        let base = subscription.base;
        let info = SendSubscriptionInfo::new(base, subscription.role, subscription.trigger_requested);
        let upstream = match self.tables.registry.register_sender(app, info) {
            Ok(upstream) => upstream,
            Err(error) => {
                tracing::warn!(application = %app, %error, "Send registration rejected");
                self.send(
                    LinkPeer::Application(app),
                    Telegram::RequestSenderData(RequestSenderData {
                        base,
                        state: TriggerState::InvalidSubscription,
                    }),
                );
                return;
            }
        };

        let actions = match subscription.role {
            SenderRole::Source => self.resolver.local_roles_changed(self.tables.ctx(), base),
            SenderRole::Sender if matches!(upstream, Upstream::Added(_)) => self
                .resolver
                .subscribe_local(self.tables.ctx(), base, SubscriptionDirection::Sender),
            SenderRole::Sender => Vec::new(),
        };
        self.execute(actions);
        self.refresh_triggers(base);
    }

    fn register_receiver(&mut self, app: SubscriberId, subscription: ReceiveSubscription) {
        let base = subscription.base;
        let info = ReceiveSubscriptionInfo::new(base, subscription.options, subscription.role);
        let upstream = match self.tables.registry.register_receiver(app, info) {
            Ok(upstream) => upstream,
            Err(error) => {
                tracing::warn!(application = %app, %error, "Receive registration rejected");
                let status = self.status_record(base, error_code::INVALID_SUBSCRIPTION);
                self.send_record(LinkPeer::Application(app), None, &status);
                return;
            }
        };

        let actions = match subscription.role {
            ReceiverRole::Drain => self.resolver.local_roles_changed(self.tables.ctx(), base),
            ReceiverRole::Receiver if matches!(upstream, Upstream::Added(_)) => self
                .resolver
                .subscribe_local(self.tables.ctx(), base, SubscriptionDirection::Receiver),
            ReceiverRole::Receiver => Vec::new(),
        };
        self.execute(actions);
        self.notify_receivers(base);
        self.refresh_triggers(base);
        self.update_interest();
    }

    fn unregister_sender(&mut self, app: SubscriberId, base: BaseSubscriptionInfo) {
        let upstream = self.tables.registry.unregister_sender(app, &base);
        let mut actions = self.resolver.local_roles_changed(self.tables.ctx(), base);
        if upstream == Upstream::Removed {
            actions.extend(
                self.resolver
                    .unsubscribe_local(base, SubscriptionDirection::Sender),
            );
        }
        self.execute(actions);
        self.refresh_triggers(base);
    }

    fn unregister_receiver(&mut self, app: SubscriberId, base: BaseSubscriptionInfo) {
        let upstream = self.tables.registry.unregister_receiver(app, &base);
        let mut actions = self.resolver.local_roles_changed(self.tables.ctx(), base);
        if upstream == Upstream::Removed {
            actions.extend(
                self.resolver
                    .unsubscribe_local(base, SubscriptionDirection::Receiver),
            );
        }
        self.execute(actions);
        self.refresh_triggers(base);
        self.update_interest();
    }

    fn distributor_telegram(&mut self, neighbor: TransmitterId, telegram: Telegram) {
        match telegram {
            Telegram::BestPathUpdate(update) => {
                let changed = self.tables.routing.apply_update(neighbor, update.updates);
                if !changed.is_empty() {
                    self.routes_changed();
                }
            }
            Telegram::DataSubscription(request) => {
                let base = request.base;
                let actions = self
                    .resolver
                    .handle_request(self.tables.ctx(), neighbor, request);
                self.execute(actions);
                self.refresh_triggers(base);
            }
            Telegram::DataSubscriptionReceipt(receipt) => {
                let base = receipt.base;
                let actions = self
                    .resolver
                    .handle_receipt(self.tables.ctx(), neighbor, receipt);
                self.execute(actions);
                self.refresh_triggers(base);
            }
            Telegram::DataUnsubscription(request) => {
                let actions = self.resolver.handle_unsubscription(neighbor, &request);
                self.execute(actions);
                self.refresh_triggers(request.base);
            }
            Telegram::InterestSubscription(InterestOwner { owner }) if owner == self.local => {
                self.interest_subscribers.insert(neighbor);
                self.send_full_interest(neighbor);
            }
            Telegram::InterestResyncRequest(InterestOwner { owner }) if owner == self.local => {
                self.send_full_interest(neighbor);
            }
            Telegram::InterestUnsubscription(InterestOwner { owner }) if owner == self.local => {
                self.interest_subscribers.remove(&neighbor);
            }
            Telegram::InterestDeliveryUnsubscription(InterestOwner { owner }) => {
                self.tables.directory.interest_mut().remove_owner(owner);
            }
            Telegram::InterestUpdate(update) => {
                self.tables
                    .directory
                    .interest_mut()
                    .apply(update.owner, &update.delta);
            }
            other => tracing::debug!(
                %neighbor,
                telegram = %other.telegram_type(),
                "Ignoring telegram from neighbor"
            ),
        }
    }

    fn execute(&mut self, actions: Vec<ResolutionAction>) {
        for action in actions {
            match action {
                ResolutionAction::Forward { to, request } => {
                    self.send(LinkPeer::Distributor(to), Telegram::DataSubscription(request));
                }
                ResolutionAction::Reply { to, receipt } => {
                    self.send(
                        LinkPeer::Distributor(to),
                        Telegram::DataSubscriptionReceipt(receipt),
                    );
                }
                ResolutionAction::Cancel { to, request } => {
                    self.send(LinkPeer::Distributor(to), Telegram::DataUnsubscription(request));
                }
                ResolutionAction::Resolved {
                    base,
                    direction,
                    central,
                } => {
                    tracing::info!(channel = %base, ?direction, %central, "Subscription resolved");
                }
                ResolutionAction::Rejected { direction, error } => {
                    tracing::warn!(?direction, %error, "Subscription rejected");
                    if direction == SubscriptionDirection::Receiver {
                        self.notify_receivers(rejected_base(&error));
                    }
                }
            }
        }
    }

    fn routes_changed(&mut self) {
        self.advertise_all();
        let actions = self.resolver.routes_changed(self.tables.ctx());
        self.execute(actions);
        self.refresh_all_triggers();
    }

    fn advertise_all(&mut self) {
        let neighbors: Vec<TransmitterId> = self.tables.routing.neighbors().collect();
        for neighbor in neighbors {
            self.advertise_to(neighbor);
        }
    }

    fn advertise_to(&mut self, neighbor: TransmitterId) {
        let updates = self.tables.routing.advertisement_for(neighbor);
        self.send(
            LinkPeer::Distributor(neighbor),
            Telegram::BestPathUpdate(BestPathUpdate { updates }),
        );
    }

    /// Recompute the own interest list from local receivers and publish changes.
    fn update_interest(&mut self) {
        let registry = &self.tables.registry;
        let mut content = InterestSet::default();
        for base in registry.channels() {
            if registry.receivers(base).next().is_none() {
                continue;
            }
            content.objects.insert(base.object_id);
            if let Some(aspect) = self.tables.directory.attribute_group_aspect(base.usage_id) {
                content.aspects.insert(aspect);
            }
        }

        if !self.interest.replace(content) {
            return;
        }
        let deltas = self.interest.publish(InterestUpdate::MAX_ELEMENTS);
        let subscribers: Vec<TransmitterId> = self.interest_subscribers.iter().copied().collect();
        for neighbor in subscribers {
            for delta in &deltas {
                self.send(
                    LinkPeer::Distributor(neighbor),
                    Telegram::InterestUpdate(InterestUpdate {
                        owner: self.local,
                        delta: delta.clone(),
                    }),
                );
            }
        }
    }

    fn send_full_interest(&mut self, neighbor: TransmitterId) {
        for delta in self.interest.full_sync(InterestUpdate::MAX_ELEMENTS) {
            self.send(
                LinkPeer::Distributor(neighbor),
                Telegram::InterestUpdate(InterestUpdate {
                    owner: self.local,
                    delta,
                }),
            );
        }
    }

    /// Trigger state the senders of a channel should be in.
    fn trigger_for(&self, base: &BaseSubscriptionInfo) -> TriggerState {
        let registry = &self.tables.registry;
        match registry.aggregate_send(base).map(|info| info.role) {
            Some(SenderRole::Source) => {
                let local = registry
                    .receivers(base)
                    .any(|(_, info)| info.role == ReceiverRole::Receiver);
                let remote = self
                    .resolver
                    .downstream(base, SubscriptionDirection::Receiver)
                    .next()
                    .is_some();
                if local || remote {
                    TriggerState::Start
                } else {
                    TriggerState::Stop
                }
            }
            Some(SenderRole::Sender) => {
                if registry.drain_count(base) > 0 {
                    return TriggerState::Start;
                }
                match self
                    .resolver
                    .local_rights(base, SubscriptionDirection::Sender)
                {
                    Some(ReceiptCode::Positive) => TriggerState::Start,
                    Some(ReceiptCode::PositiveNoRights) => TriggerState::NoRights,
                    _ => TriggerState::Stop,
                }
            }
            None => TriggerState::Stop,
        }
    }

    /// Tell senders that asked for triggers whether their data is needed.
    fn refresh_triggers(&mut self, base: BaseSubscriptionInfo) {
        let state = self.trigger_for(&base);
        let senders: Vec<SubscriberId> = self
            .tables
            .registry
            .senders(&base)
            .filter(|(_, info)| info.trigger_requested)
            .map(|(id, _)| id)
            .collect();
        for sender in senders {
            if self
                .tables
                .registry
                .record_trigger(sender, &base, state as u8)
            {
                self.send(
                    LinkPeer::Application(sender),
                    Telegram::RequestSenderData(RequestSenderData { base, state }),
                );
            }
        }
    }

    fn refresh_all_triggers(&mut self) {
        let channels: Vec<BaseSubscriptionInfo> =
            self.tables.registry.channels().copied().collect();
        for base in channels {
            self.refresh_triggers(base);
        }
    }

    /// Error code local receivers of a channel should see, if any.
    fn receive_status(&self, base: &BaseSubscriptionInfo) -> Option<u8> {
        match self
            .resolver
            .local_rights(base, SubscriptionDirection::Receiver)?
        {
            ReceiptCode::MoreThanOnePositive => Some(error_code::MULTIPLE_SOURCES),
            ReceiptCode::Negative => Some(error_code::NO_SOURCE),
            ReceiptCode::PositiveNoRights => Some(error_code::NO_RIGHTS),
            ReceiptCode::Positive => None,
        }
    }

    /// Whether local applications of the channel were refused access.
    fn denied(&self, base: &BaseSubscriptionInfo, direction: SubscriptionDirection) -> bool {
        self.resolver.local_rights(base, direction) == Some(ReceiptCode::PositiveNoRights)
    }

    /// Send a status record to receivers not yet told about the channel's state.
    fn notify_receivers(&mut self, base: BaseSubscriptionInfo) {
        let Some(code) = self.receive_status(&base) else {
            return;
        };
        let targets: Vec<SubscriberId> = self
            .tables
            .registry
            .receivers(&base)
            .filter(|(_, info)| info.role == ReceiverRole::Receiver)
            .filter(|(_, info)| info.last_error_state != Some(code))
            .map(|(id, _)| id)
            .collect();
        if targets.is_empty() {
            return;
        }

        let status = self.status_record(base, code);
        for app in targets {
            self.tables
                .registry
                .record_delivery(app, &base, status.data_index, code);
            self.send_record(LinkPeer::Application(app), None, &status);
        }
    }

    fn status_record(&mut self, base: BaseSubscriptionInfo, code: u8) -> Record {
        Record {
            base,
            data_index: self.sequencer.next_index(),
            delayed: false,
            metadata: RecordMetadata {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                error_code: code,
                changed: Vec::new(),
            },
            data: Vec::new(),
        }
    }

    /// Data of a Source: local Receivers and neighbours that resolved toward us.
    fn toward_receivers(&mut self, from: LinkPeer, record: &Record) {
        self.deliver_local(record, ReceiverRole::Receiver);
        let downstream: Vec<TransmitterId> = self
            .resolver
            .downstream(&record.base, SubscriptionDirection::Receiver)
            .filter(|n| LinkPeer::Distributor(*n) != from)
            .collect();
        for neighbor in downstream {
            self.send_record(
                LinkPeer::Distributor(neighbor),
                Some(DataDirection::TowardSource),
                record,
            );
        }
    }

    /// Data of a Sender: the local Drain, or the next hop toward it.
    fn toward_drain(&mut self, from: LinkPeer, record: &Record) {
        if self.tables.registry.drain_count(&record.base) > 0 {
            self.deliver_local(record, ReceiverRole::Drain);
            return;
        }
        match self
            .resolver
            .upstream(&record.base, SubscriptionDirection::Sender)
        {
            Some(upstream) if LinkPeer::Distributor(upstream) != from => {
                self.send_record(
                    LinkPeer::Distributor(upstream),
                    Some(DataDirection::TowardSink),
                    record,
                );
            }
            _ => tracing::debug!(channel = %record.base, "No drain reachable, record dropped"),
        }
    }

    fn deliver_local(&mut self, record: &Record, role: ReceiverRole) {
        let base = record.base;
        if role == ReceiverRole::Receiver && self.denied(&base, SubscriptionDirection::Receiver) {
            return;
        }
        let targets: Vec<SubscriberId> = self
            .tables
            .registry
            .receivers(&base)
            .filter(|(_, info)| info.role == role && wants(info, record))
            .map(|(id, _)| id)
            .collect();
        for app in targets {
            self.tables.registry.record_delivery(
                app,
                &base,
                record.data_index,
                record.metadata.error_code,
            );
            self.send_record(LinkPeer::Application(app), None, record);
        }
    }

    fn send_record(&mut self, peer: LinkPeer, direction: Option<DataDirection>, record: &Record) {
        let fragments = match self.fragmenter.split(record) {
            Ok(fragments) => fragments,
            Err(error) => {
                tracing::warn!(%peer, channel = %record.base, %error, "Record cannot be fragmented");
                return;
            }
        };
        for fragment in fragments {
            let telegram = match direction {
                None => Telegram::ApplicationData(fragment),
                Some(direction) => Telegram::TransmitterData(TransmitterData {
                    direction,
                    fragment,
                }),
            };
            self.send(peer, telegram);
        }
    }
}

/// Whether a receiver's options admit a record.
fn wants(info: &ReceiveSubscriptionInfo, record: &Record) -> bool {
    if record.delayed && !info.options.want_delayed_data {
        return false;
    }
    if info.options.want_delta_only {
        let changed = &record.metadata.changed;
        let unchanged = !changed.is_empty() && changed.iter().all(|b| *b == 0);
        if unchanged && info.last_error_state == Some(record.metadata.error_code) {
            return false;
        }
    }
    true
}

fn rejected_base(error: &ResolutionRejected) -> BaseSubscriptionInfo {
    match error {
        ResolutionRejected::Negative { base }
        | ResolutionRejected::NoRights { base, .. }
        | ResolutionRejected::MoreThanOnePositive { base, .. } => *base,
    }
}

/// The distributor: listeners, neighbour connectors and the event loop.
pub struct Distributor {
    config: DistributorConfig,
    node: Node,
    links: HashMap<LinkPeer, LinkHandle>,
}

impl Distributor {
    /// Create a distributor.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration cannot be turned into protocol state.
    pub fn new(config: DistributorConfig) -> Result<Self> {
        let node = Node::new(&config).context("Invalid segment size")?;
        Ok(Self {
            config,
            node,
            links: HashMap::new(),
        })
    }

    /// Run until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be bound.
    pub async fn run(mut self) -> Result<()> {
        let (events_tx, mut events) = mpsc::channel(EVENT_CHANNEL);

        let apps = TcpListener::bind(&self.config.app_listen)
            .await
            .with_context(|| format!("Failed to listen on {}", self.config.app_listen))?;
        let peers = TcpListener::bind(&self.config.peer_listen)
            .await
            .with_context(|| format!("Failed to listen on {}", self.config.peer_listen))?;

        let local = self.config.transmitter_id;
        let settings = self.config.link;
        tokio::spawn(accept_applications(apps, settings, events_tx.clone()));
        tokio::spawn(accept_distributors(peers, local, settings, events_tx.clone()));
        for neighbor in self.config.neighbors.clone() {
            tokio::spawn(maintain_neighbor(neighbor, local, settings, events_tx.clone()));
        }
        drop(events_tx);

        tracing::info!(
            transmitter = %local,
            app_listen = %self.config.app_listen,
            peer_listen = %self.config.peer_listen,
            "Distributor running"
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Dropping the handles lets every link send its closing telegram.
        self.links.clear();
        Ok(())
    }

    async fn handle(&mut self, event: LinkEvent) {
        let outgoing = match event {
            LinkEvent::Up { peer, handle } => {
                if self.links.contains_key(&peer) {
                    tracing::warn!(%peer, "Second link to the same peer dropped");
                    return;
                }
                self.links.insert(peer, handle);
                self.node.link_up(peer)
            }
            LinkEvent::Telegram { peer, telegram } => self.node.telegram(peer, telegram),
            LinkEvent::Record {
                peer,
                direction,
                record,
            } => self.node.record(peer, direction, record),
            LinkEvent::Down { peer, .. } => {
                // A refused duplicate may report its end while the registered link runs on.
                if !self.links.get(&peer).is_some_and(LinkHandle::is_closed) {
                    return;
                }
                self.links.remove(&peer);
                self.node.link_down(peer)
            }
        };

        for (peer, telegram) in outgoing {
            let Some(handle) = self.links.get(&peer) else {
                tracing::debug!(%peer, telegram = %telegram.telegram_type(), "No link, telegram dropped");
                continue;
            };
            if let Err(error) = handle.send(telegram).await {
                tracing::debug!(%peer, %error, "Link gone while sending");
            }
        }
    }
}

async fn accept_applications(
    listener: TcpListener,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut next_id = 1u64;
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Accepting application failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let id = SubscriberId(next_id);
        next_id += 1;

        let events = events.clone();
        tokio::spawn(async move {
            match link::accept_application(&mut stream, id, &settings).await {
                Ok(agreed) => {
                    tracing::debug!(application = %id, %addr, "Application handshake completed");
                    link::spawn_link(stream, LinkPeer::Application(id), agreed, events);
                }
                Err(error) => tracing::warn!(%addr, %error, "Application handshake failed"),
            }
        });
    }
}

async fn accept_distributors(
    listener: TcpListener,
    local: TransmitterId,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Accepting distributor failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let events = events.clone();
        tokio::spawn(async move {
            match link::accept_distributor(&mut stream, local, &settings).await {
                Ok((neighbor, agreed)) => {
                    tracing::debug!(%neighbor, %addr, "Distributor handshake completed");
                    link::spawn_link(stream, LinkPeer::Distributor(neighbor), agreed, events);
                }
                Err(error) => tracing::warn!(%addr, %error, "Distributor handshake failed"),
            }
        });
    }
}

/// Keep a configured neighbour connected, reconnecting after failures.
async fn maintain_neighbor(
    neighbor: NeighborConfig,
    local: TransmitterId,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
) {
    let expected = TransmitterId(neighbor.id);
    loop {
        match connect_neighbor(&neighbor, expected, local, &settings).await {
            Ok((stream, agreed)) => {
                let peer = LinkPeer::Distributor(expected);
                wait_for_link(peer, link::spawn_link(stream, peer, agreed, events.clone())).await;
            }
            Err(error) => {
                tracing::warn!(neighbor = %expected, address = %neighbor.address, error = %error, "Connecting to neighbor failed");
            }
        }
        if events.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Wait for a link task to end. Returns `false` if the task panicked or was cancelled.
async fn wait_for_link(peer: LinkPeer, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%peer, %error, "Link task failed");
            false
        }
    }
}

async fn connect_neighbor(
    neighbor: &NeighborConfig,
    expected: TransmitterId,
    local: TransmitterId,
    settings: &LinkSettings,
) -> Result<(TcpStream, LinkSettings)> {
    let (host, port) = parse_peer_address(&neighbor.address)?;
    let mut stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;
    stream.set_nodelay(true)?;

    let (id, agreed) = link::connect_distributor(&mut stream, local, settings).await?;
    if id != expected {
        anyhow::bail!("neighbor at {} identifies as {id}, expected {expected}", neighbor.address);
    }
    Ok((stream, agreed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessConfig, CentralConfig};
    use dvmesh_core::{DataIndex, ReceiveOptions};
    use dvmesh_proto::{Assembler, DataFragment};
    use std::collections::VecDeque;

    const A: TransmitterId = TransmitterId(1);
    const B: TransmitterId = TransmitterId(2);
    const C: TransmitterId = TransmitterId(3);

    fn channel() -> BaseSubscriptionInfo {
        BaseSubscriptionInfo::live(500, 7)
    }

    fn app(id: u64) -> LinkPeer {
        LinkPeer::Application(SubscriberId(id))
    }

    fn node(id: TransmitterId, denied: &[AccessConfig]) -> Node {
        let config = DistributorConfig {
            transmitter_id: id,
            centrals: vec![CentralConfig {
                object_id: 500,
                transmitters: vec![3],
            }],
            denied: denied.to_vec(),
            max_segment: 64,
            ..DistributorConfig::default()
        };
        Node::new(&config).unwrap()
    }

    /// Nodes wired in memory; telegrams between them are delivered in order.
    struct Mesh {
        nodes: HashMap<TransmitterId, Node>,
        app_inbox: Vec<(TransmitterId, SubscriberId, Telegram)>,
        assemblers: HashMap<TransmitterId, Assembler>,
    }

    impl Mesh {
        fn line(ids: &[TransmitterId]) -> Self {
            Self::line_denying(ids, &[])
        }

        /// A line of nodes sharing the same access configuration.
        fn line_denying(ids: &[TransmitterId], denied: &[AccessConfig]) -> Self {
            let mut mesh = Self {
                nodes: ids.iter().map(|id| (*id, node(*id, denied))).collect(),
                app_inbox: Vec::new(),
                assemblers: HashMap::new(),
            };
            for pair in ids.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                let out = mesh.nodes.get_mut(&a).unwrap().link_up(LinkPeer::Distributor(b));
                mesh.deliver(a, out);
                let out = mesh.nodes.get_mut(&b).unwrap().link_up(LinkPeer::Distributor(a));
                mesh.deliver(b, out);
            }
            mesh
        }

        fn deliver(&mut self, from: TransmitterId, out: Vec<Outgoing>) {
            let mut queue: VecDeque<(TransmitterId, Outgoing)> =
                out.into_iter().map(|o| (from, o)).collect();
            while let Some((from, (peer, telegram))) = queue.pop_front() {
                match peer {
                    LinkPeer::Application(app) => self.app_inbox.push((from, app, telegram)),
                    LinkPeer::Distributor(to) => {
                        let Some(node) = self.nodes.get_mut(&to) else {
                            continue;
                        };
                        let follow = match telegram {
                            Telegram::TransmitterData(data) => {
                                let assembler = self.assemblers.entry(to).or_default();
                                match assembler.push(data.fragment).unwrap() {
                                    Some(record) => node.record(
                                        LinkPeer::Distributor(from),
                                        Some(data.direction),
                                        record,
                                    ),
                                    None => Vec::new(),
                                }
                            }
                            telegram => node.telegram(LinkPeer::Distributor(from), telegram),
                        };
                        queue.extend(follow.into_iter().map(|o| (to, o)));
                    }
                }
            }
        }

        fn from_app(&mut self, at: TransmitterId, app: u64, telegram: Telegram) {
            let out = self.nodes.get_mut(&at).unwrap().telegram(LinkPeer::Application(SubscriberId(app)), telegram);
            self.deliver(at, out);
        }

        fn app_record(&mut self, at: TransmitterId, app: u64, record: Record) {
            let out = self.nodes.get_mut(&at).unwrap().record(LinkPeer::Application(SubscriberId(app)), None, record);
            self.deliver(at, out);
        }

        fn inbox(&self, at: TransmitterId, app: u64) -> Vec<&Telegram> {
            self.app_inbox
                .iter()
                .filter(|(node, id, _)| *node == at && *id == SubscriberId(app))
                .map(|(_, _, t)| t)
                .collect()
        }
    }

    fn source(trigger: bool) -> Telegram {
        Telegram::SendSubscription(SendSubscription {
            base: channel(),
            role: SenderRole::Source,
            trigger_requested: trigger,
        })
    }

    fn receiver() -> Telegram {
        Telegram::ReceiveSubscription(ReceiveSubscription {
            base: channel(),
            role: ReceiverRole::Receiver,
            options: ReceiveOptions::online(),
        })
    }

    fn record(payload: &[u8]) -> Record {
        Record {
            base: channel(),
            data_index: DataIndex::from_raw(0x1_0000_0004),
            delayed: false,
            metadata: RecordMetadata::default(),
            data: payload.to_vec(),
        }
    }

    fn data_fragments(telegrams: &[&Telegram]) -> Vec<DataFragment> {
        telegrams
            .iter()
            .filter_map(|t| match t {
                Telegram::ApplicationData(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn neighbors_converge_on_link_up() {
        let mesh = Mesh::line(&[A, B, C]);

        assert_eq!(mesh.nodes[&A].routing().next_hop(C), Some(B));
        assert_eq!(mesh.nodes[&A].routing().weight_to(C), Some(2));
        assert_eq!(mesh.nodes[&C].routing().next_hop(A), Some(B));
    }

    #[test]
    fn receiver_resolves_and_gets_source_data_across_two_hops() {
        let mut mesh = Mesh::line(&[A, B, C]);
        mesh.from_app(C, 10, source(true));
        assert_eq!(
            mesh.inbox(C, 10),
            vec![&Telegram::RequestSenderData(RequestSenderData {
                base: channel(),
                state: TriggerState::Stop,
            })]
        );

        mesh.from_app(A, 20, receiver());

        assert_eq!(
            mesh.nodes[&A]
                .resolver()
                .upstream(&channel(), SubscriptionDirection::Receiver),
            Some(B)
        );
        assert_eq!(
            mesh.inbox(C, 10).last(),
            Some(&&Telegram::RequestSenderData(RequestSenderData {
                base: channel(),
                state: TriggerState::Start,
            }))
        );

        let payload: Vec<u8> = (0..200u8).collect();
        mesh.app_record(C, 10, record(&payload));

        let fragments = data_fragments(&mesh.inbox(A, 20));
        assert_eq!(fragments.len(), 4);
        let mut assembler = Assembler::new();
        let delivered = fragments
            .into_iter()
            .find_map(|f| assembler.push(f).unwrap())
            .unwrap();
        assert_eq!(delivered.data, payload);
    }

    fn deny(origin: TransmitterId, direction: SubscriptionDirection) -> AccessConfig {
        AccessConfig {
            object_id: 500,
            transmitters: vec![origin.0],
            direction: Some(direction),
        }
    }

    fn records(telegrams: &[&Telegram]) -> Vec<Record> {
        let mut assembler = Assembler::new();
        data_fragments(telegrams)
            .into_iter()
            .filter_map(|f| assembler.push(f).unwrap())
            .collect()
    }

    #[test]
    fn denied_receiver_on_a_shared_hop_gets_no_data() {
        let mut mesh = Mesh::line_denying(&[A, B, C], &[deny(B, SubscriptionDirection::Receiver)]);
        mesh.from_app(C, 10, source(true));
        mesh.from_app(A, 20, receiver());
        mesh.from_app(B, 30, receiver());

        let payload: Vec<u8> = (0..200u8).collect();
        mesh.app_record(C, 10, record(&payload));

        let at_a = records(&mesh.inbox(A, 20));
        assert_eq!(at_a.len(), 1);
        assert_eq!(at_a[0].data, payload);

        let at_b = records(&mesh.inbox(B, 30));
        assert_eq!(at_b.len(), 1);
        assert_eq!(at_b[0].metadata.error_code, error_code::NO_RIGHTS);
        assert!(at_b[0].data.is_empty());
    }

    #[test]
    fn denied_sender_is_told_and_its_data_dropped() {
        let mut mesh = Mesh::line_denying(&[A, B, C], &[deny(A, SubscriptionDirection::Sender)]);
        mesh.from_app(
            C,
            1,
            Telegram::ReceiveSubscription(ReceiveSubscription {
                base: channel(),
                role: ReceiverRole::Drain,
                options: ReceiveOptions::online(),
            }),
        );
        mesh.from_app(
            A,
            2,
            Telegram::SendSubscription(SendSubscription {
                base: channel(),
                role: SenderRole::Sender,
                trigger_requested: true,
            }),
        );

        assert_eq!(
            mesh.inbox(A, 2).last(),
            Some(&&Telegram::RequestSenderData(RequestSenderData {
                base: channel(),
                state: TriggerState::NoRights,
            }))
        );

        mesh.app_record(A, 2, record(b"refused"));
        assert!(records(&mesh.inbox(C, 1)).is_empty());
    }

    #[test]
    fn unreachable_source_reports_no_source() {
        let mut mesh = Mesh::line(&[A, B]);

        mesh.from_app(A, 20, receiver());

        let fragments = data_fragments(&mesh.inbox(A, 20));
        assert_eq!(fragments.len(), 1);
        let mut assembler = Assembler::new();
        let status = assembler.push(fragments[0].clone()).unwrap().unwrap();
        assert_eq!(status.metadata.error_code, error_code::NO_SOURCE);
        assert!(status.data.is_empty());
    }

    #[test]
    fn second_drain_is_rejected_without_side_effects() {
        let mut mesh = Mesh::line(&[A]);
        let drain = Telegram::ReceiveSubscription(ReceiveSubscription {
            base: channel(),
            role: ReceiverRole::Drain,
            options: ReceiveOptions::online(),
        });

        mesh.from_app(A, 1, drain.clone());
        mesh.from_app(A, 2, drain);

        assert_eq!(mesh.nodes[&A].registry().drain_count(&channel()), 1);
        let fragments = data_fragments(&mesh.inbox(A, 2));
        let mut assembler = Assembler::new();
        let status = assembler.push(fragments[0].clone()).unwrap().unwrap();
        assert_eq!(status.metadata.error_code, error_code::INVALID_SUBSCRIPTION);
    }

    #[test]
    fn sender_data_reaches_local_drain() {
        let mut mesh = Mesh::line(&[A]);
        mesh.from_app(
            A,
            1,
            Telegram::ReceiveSubscription(ReceiveSubscription {
                base: channel(),
                role: ReceiverRole::Drain,
                options: ReceiveOptions::online(),
            }),
        );
        mesh.from_app(
            A,
            2,
            Telegram::SendSubscription(SendSubscription {
                base: channel(),
                role: SenderRole::Sender,
                trigger_requested: true,
            }),
        );
        assert_eq!(
            mesh.inbox(A, 2),
            vec![&Telegram::RequestSenderData(RequestSenderData {
                base: channel(),
                state: TriggerState::Start,
            })]
        );

        mesh.app_record(A, 2, record(b"hello"));

        assert_eq!(data_fragments(&mesh.inbox(A, 1)).len(), 1);
    }

    #[test]
    fn interest_list_follows_local_receivers() {
        let mut mesh = Mesh::line(&[A, B]);

        mesh.from_app(A, 20, receiver());
        assert!(mesh.nodes[&B]
            .directory()
            .interest()
            .list(A)
            .is_some_and(|set| set.contains_object(500)));

        mesh.from_app(A, 20, Telegram::ReceiveUnsubscription(channel()));
        assert!(!mesh.nodes[&B]
            .directory()
            .interest()
            .list(A)
            .is_some_and(|set| set.contains_object(500)));
        assert!(mesh.nodes[&A].interest().is_empty());
    }

    #[test]
    fn neighbor_loss_invalidates_routes_and_interest() {
        let mut mesh = Mesh::line(&[A, B, C]);
        mesh.from_app(C, 10, source(false));
        mesh.from_app(A, 20, receiver());

        let out = mesh.nodes.get_mut(&B).unwrap().link_down(LinkPeer::Distributor(C));
        mesh.deliver(B, out);

        assert_eq!(mesh.nodes[&B].routing().next_hop(C), None);
        assert_eq!(mesh.nodes[&A].routing().next_hop(C), None);
        assert!(mesh.nodes[&A]
            .resolver()
            .upstream(&channel(), SubscriptionDirection::Receiver)
            .is_none());
    }

    #[test]
    fn application_disconnect_withdraws_registrations() {
        let mut mesh = Mesh::line(&[A, B, C]);
        mesh.from_app(C, 10, source(false));
        mesh.from_app(A, 20, receiver());

        let out = mesh.nodes.get_mut(&A).unwrap().link_down(app(20));
        mesh.deliver(A, out);

        assert!(mesh.nodes[&A].registry().is_empty());
        for id in [A, B, C] {
            assert!(mesh.nodes[&id]
                .resolver()
                .entry(&channel(), SubscriptionDirection::Receiver)
                .is_none());
        }
    }

    #[test]
    fn delta_only_receivers_skip_unchanged_records() {
        let mut info = ReceiveSubscriptionInfo::new(
            channel(),
            ReceiveOptions {
                want_delayed_data: false,
                want_delta_only: true,
            },
            ReceiverRole::Receiver,
        );
        let mut unchanged = record(b"x");
        unchanged.metadata.changed = vec![0];

        assert!(wants(&info, &unchanged));
        info.record_delivery(DataIndex::from_raw(1), 0);
        assert!(!wants(&info, &unchanged));

        let mut delayed = record(b"x");
        delayed.delayed = true;
        assert!(!wants(&info, &delayed));
    }

    #[tokio::test]
    async fn panicked_link_task_is_reported() {
        let peer = LinkPeer::Distributor(B);

        assert!(wait_for_link(peer, tokio::spawn(async {})).await);
        assert!(!wait_for_link(peer, tokio::spawn(async { panic!("link task died") })).await);
    }
}
