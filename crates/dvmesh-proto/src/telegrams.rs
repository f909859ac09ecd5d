//! Telegram payloads and the codec.
//!
//! Framing: `[type code: u8][payload length: u16 BE][payload]`. The declared
//! length excludes the three header bytes.
//!
//! Decoding recomputes each payload's length from the fields actually read
//! and rejects the telegram when it disagrees with the declared length. This
//! is the only cross-check that a peer encoded what it claims, so any
//! mismatch is a [`FramingError`].

use serde::{Deserialize, Serialize};

use dvmesh_core::{
    AttributeGroupAspect, BaseSubscriptionInfo, InterestDelta, ReceiptCode, ReceiveOptions,
    ReceiverRole, ResolutionReceipt, ResolutionRequest, RoutingUpdate, SenderRole,
    SubscriptionDirection, TransmitterId,
};

use crate::fragment::DataFragment;
use crate::types::{PriorityClass, TelegramType};
use crate::wire::{
    prefixed_len, CodecError, DecodeError, FramingError, WireReader, WireWriter, HEADER_LEN,
};

/// A payload schema: its own length computation plus reader and writer.
pub trait WirePayload: Sized {
    /// Number of payload bytes the value encodes to.
    fn encoded_len(&self) -> usize;

    /// Append the payload.
    ///
    /// # Errors
    ///
    /// Returns error if a length-prefixed field is too long for its prefix.
    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError>;

    /// Read the payload.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted or a field is invalid.
    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError>;
}

/// Parsed telegram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw type code
    pub code: u8,
    /// Declared payload length
    pub len: u16,
}

impl FrameHeader {
    /// Parse the first three bytes of a telegram.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than three bytes are available.
    pub fn parse(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut r = WireReader::new(bytes);
        Ok(Self {
            code: r.u8()?,
            len: r.u16()?,
        })
    }

    /// Build from a header read off a stream.
    #[must_use]
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            code: bytes[0],
            len: u16::from_be_bytes([bytes[1], bytes[2]]),
        }
    }
}

fn invalid(field: &'static str, value: impl Into<u64>) -> CodecError {
    DecodeError::InvalidValue {
        field,
        value: value.into(),
    }
    .into()
}

fn list_len16(field: &'static str, len: usize, w: &mut WireWriter) -> Result<(), FramingError> {
    w.put_len16(field, len)
}

/// Which resolution chain a distributor data telegram follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataDirection {
    /// Chain resolved by receivers toward the channel's Source
    TowardSource = 0,
    /// Chain resolved by senders toward the channel's Drain
    TowardSink = 1,
}

impl DataDirection {
    /// Parse a wire value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::TowardSource),
            1 => Some(Self::TowardSink),
            _ => None,
        }
    }

    /// The resolution direction whose chain the data follows.
    #[must_use]
    pub fn resolution_direction(self) -> SubscriptionDirection {
        match self {
            Self::TowardSource => SubscriptionDirection::Receiver,
            Self::TowardSink => SubscriptionDirection::Sender,
        }
    }
}

impl From<SubscriptionDirection> for DataDirection {
    fn from(direction: SubscriptionDirection) -> Self {
        match direction {
            SubscriptionDirection::Receiver => Self::TowardSource,
            SubscriptionDirection::Sender => Self::TowardSink,
        }
    }
}

/// What a sender is asked to do with its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TriggerState {
    /// Somebody needs the data
    Start = 0,
    /// Nobody needs the data any more
    Stop = 1,
    /// The sender lacks the rights to publish
    NoRights = 2,
    /// The registration was rejected
    InvalidSubscription = 3,
}

impl TriggerState {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Start),
            1 => Some(Self::Stop),
            2 => Some(Self::NoRights),
            3 => Some(Self::InvalidSubscription),
            _ => None,
        }
    }
}

/// Protocol versions offered by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersionRequest {
    /// Supported versions, preferred first
    pub versions: Vec<i32>,
}

impl WirePayload for ProtocolVersionRequest {
    fn encoded_len(&self) -> usize {
        2 + 4 * self.versions.len()
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        list_len16("versions", self.versions.len(), w)?;
        for v in &self.versions {
            w.put_i32(*v);
        }
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let count = r.u16()?;
        let versions = (0..count).map(|_| r.i32()).collect::<Result<_, _>>()?;
        Ok(Self { versions })
    }
}

/// The protocol version chosen by the accepting side; `-1` if none fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersionAnswer {
    /// Chosen version
    pub version: i32,
}

impl WirePayload for ProtocolVersionAnswer {
    fn encoded_len(&self) -> usize {
        4
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_i32(self.version);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self { version: r.i32()? })
    }
}

/// Protocol versions offered by a connecting distributor, with its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorVersionRequest {
    /// Connecting distributor
    pub transmitter_id: TransmitterId,
    /// Supported versions, preferred first
    pub versions: Vec<i32>,
}

impl WirePayload for DistributorVersionRequest {
    fn encoded_len(&self) -> usize {
        8 + 2 + 4 * self.versions.len()
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_transmitter(self.transmitter_id);
        list_len16("versions", self.versions.len(), w)?;
        for v in &self.versions {
            w.put_i32(*v);
        }
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let transmitter_id = r.transmitter()?;
        let count = r.u16()?;
        let versions = (0..count).map(|_| r.i32()).collect::<Result<_, _>>()?;
        Ok(Self {
            transmitter_id,
            versions,
        })
    }
}

/// Version chosen by the accepting distributor, with its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorVersionAnswer {
    /// Chosen version
    pub version: i32,
    /// Accepting distributor
    pub transmitter_id: TransmitterId,
}

impl WirePayload for DistributorVersionAnswer {
    fn encoded_len(&self) -> usize {
        12
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_i32(self.version);
        w.put_transmitter(self.transmitter_id);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.i32()?,
            transmitter_id: r.transmitter()?,
        })
    }
}

/// Request for an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationTextRequest {
    /// Name of the connecting application or distributor
    pub application_name: String,
}

impl WirePayload for AuthenticationTextRequest {
    fn encoded_len(&self) -> usize {
        prefixed_len(self.application_name.len())
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_string("application name", &self.application_name)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            application_name: r.string("application name")?,
        })
    }
}

/// Authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationTextAnswer {
    /// Challenge text to encrypt with the password
    pub challenge: String,
}

impl WirePayload for AuthenticationTextAnswer {
    fn encoded_len(&self) -> usize {
        prefixed_len(self.challenge.len())
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_string("challenge", &self.challenge)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            challenge: r.string("challenge")?,
        })
    }
}

/// Credentials answering a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    /// User name
    pub user: String,
    /// Challenge encrypted with the password
    pub encrypted_password: Vec<u8>,
    /// Name of the connecting application or distributor
    pub application_name: String,
}

impl WirePayload for AuthenticationRequest {
    fn encoded_len(&self) -> usize {
        prefixed_len(self.user.len())
            + prefixed_len(self.encrypted_password.len())
            + prefixed_len(self.application_name.len())
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_string("user", &self.user)?;
        w.put_block("encrypted password", &self.encrypted_password)?;
        w.put_string("application name", &self.application_name)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            user: r.string("user")?,
            encrypted_password: r.block()?,
            application_name: r.string("application name")?,
        })
    }
}

/// Outcome of an authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationAnswer {
    /// Whether the credentials were accepted
    pub successful: bool,
    /// Id assigned to the application, or the accepting distributor's id
    pub id: u64,
}

impl WirePayload for AuthenticationAnswer {
    fn encoded_len(&self) -> usize {
        9
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_bool(self.successful);
        w.put_u64(self.id);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            successful: r.bool("successful")?,
            id: r.u64()?,
        })
    }
}

/// Link health parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Send a keep-alive after this long without outgoing traffic
    pub keep_alive_send_ms: u64,
    /// Terminate the link after this long without incoming traffic
    pub keep_alive_receive_ms: u64,
    /// Send buffer fill percentage that triggers throughput measurement
    pub fill_percent: u8,
    /// How long throughput may stay below the minimum
    pub throughput_interval_secs: u16,
    /// Minimum throughput in bytes per second
    pub min_throughput: u32,
}

impl ConnectionParameters {
    /// Encoded payload size.
    pub const ENCODED_LEN: usize = 8 + 8 + 1 + 2 + 4;

    /// Combine two sides' parameters; the more tolerant value wins.
    #[must_use]
    pub fn negotiate(self, other: Self) -> Self {
        Self {
            keep_alive_send_ms: self.keep_alive_send_ms.max(other.keep_alive_send_ms),
            keep_alive_receive_ms: self.keep_alive_receive_ms.max(other.keep_alive_receive_ms),
            fill_percent: self.fill_percent.max(other.fill_percent),
            throughput_interval_secs: self
                .throughput_interval_secs
                .max(other.throughput_interval_secs),
            min_throughput: self.min_throughput.min(other.min_throughput),
        }
    }
}

impl WirePayload for ConnectionParameters {
    fn encoded_len(&self) -> usize {
        Self::ENCODED_LEN
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_u64(self.keep_alive_send_ms);
        w.put_u64(self.keep_alive_receive_ms);
        w.put_u8(self.fill_percent);
        w.put_u16(self.throughput_interval_secs);
        w.put_u32(self.min_throughput);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let params = Self {
            keep_alive_send_ms: r.u64()?,
            keep_alive_receive_ms: r.u64()?,
            fill_percent: r.u8()?,
            throughput_interval_secs: r.u16()?,
            min_throughput: r.u32()?,
        };
        if params.fill_percent > 100 {
            return Err(invalid("fill percent", params.fill_percent));
        }
        Ok(params)
    }
}

/// Reason given when a link is closed or terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkClosure {
    /// Free-text reason
    pub reason: String,
}

impl WirePayload for LinkClosure {
    fn encoded_len(&self) -> usize {
        prefixed_len(self.reason.len())
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_string("reason", &self.reason)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            reason: r.string("reason")?,
        })
    }
}

/// Tells a sender whether its data is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSenderData {
    /// Channel
    pub base: BaseSubscriptionInfo,
    /// What the sender should do
    pub state: TriggerState,
}

impl WirePayload for RequestSenderData {
    fn encoded_len(&self) -> usize {
        BaseSubscriptionInfo::ENCODED_LEN + 1
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_base(&self.base);
        w.put_u8(self.state as u8);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let base = r.base()?;
        let raw = r.u8()?;
        let state = TriggerState::from_u8(raw).ok_or_else(|| invalid("trigger state", raw))?;
        Ok(Self { base, state })
    }
}

/// Round-trip timing probe used for throughput measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramTime {
    /// Sender's clock when the probe left, in milliseconds
    pub sent_at_ms: i64,
}

impl WirePayload for TelegramTime {
    fn encoded_len(&self) -> usize {
        8
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_i64(self.sent_at_ms);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sent_at_ms: r.i64()?,
        })
    }
}

/// Empty payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeepAlive;

impl WirePayload for KeepAlive {
    fn encoded_len(&self) -> usize {
        0
    }

    fn write(&self, _w: &mut WireWriter) -> Result<(), FramingError> {
        Ok(())
    }

    fn read(_r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// An application registers to send on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSubscription {
    /// Channel
    pub base: BaseSubscriptionInfo,
    /// Sender or Source
    pub role: SenderRole,
    /// Whether to be told when data is needed
    pub trigger_requested: bool,
}

impl WirePayload for SendSubscription {
    fn encoded_len(&self) -> usize {
        BaseSubscriptionInfo::ENCODED_LEN + 2
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_base(&self.base);
        w.put_bool(self.role == SenderRole::Source);
        w.put_bool(self.trigger_requested);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let base = r.base()?;
        let role = if r.bool("sender role")? {
            SenderRole::Source
        } else {
            SenderRole::Sender
        };
        Ok(Self {
            base,
            role,
            trigger_requested: r.bool("trigger requested")?,
        })
    }
}

/// An application registers to receive a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveSubscription {
    /// Channel
    pub base: BaseSubscriptionInfo,
    /// Receiver or Drain
    pub role: ReceiverRole,
    /// Delivery options
    pub options: ReceiveOptions,
}

impl WirePayload for ReceiveSubscription {
    fn encoded_len(&self) -> usize {
        BaseSubscriptionInfo::ENCODED_LEN + 3
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_base(&self.base);
        w.put_bool(self.role == ReceiverRole::Drain);
        w.put_bool(self.options.want_delayed_data);
        w.put_bool(self.options.want_delta_only);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let base = r.base()?;
        let role = if r.bool("receiver role")? {
            ReceiverRole::Drain
        } else {
            ReceiverRole::Receiver
        };
        let options = ReceiveOptions {
            want_delayed_data: r.bool("want delayed data")?,
            want_delta_only: r.bool("want delta only")?,
        };
        Ok(Self { base, role, options })
    }
}

impl WirePayload for BaseSubscriptionInfo {
    fn encoded_len(&self) -> usize {
        Self::ENCODED_LEN
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_base(self);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(r.base()?)
    }
}

fn put_direction(w: &mut WireWriter, direction: SubscriptionDirection) {
    w.put_u8(match direction {
        SubscriptionDirection::Sender => 0,
        SubscriptionDirection::Receiver => 1,
    });
}

fn read_direction(r: &mut WireReader<'_>) -> Result<SubscriptionDirection, CodecError> {
    match r.u8()? {
        0 => Ok(SubscriptionDirection::Sender),
        1 => Ok(SubscriptionDirection::Receiver),
        other => Err(invalid("subscription direction", other)),
    }
}

fn put_transmitters(w: &mut WireWriter, ids: &[TransmitterId]) -> Result<(), FramingError> {
    list_len16("transmitter list", ids.len(), w)?;
    for id in ids {
        w.put_transmitter(*id);
    }
    Ok(())
}

fn read_transmitters(r: &mut WireReader<'_>) -> Result<Vec<TransmitterId>, FramingError> {
    let count = r.u16()?;
    (0..count).map(|_| r.transmitter()).collect()
}

impl WirePayload for ResolutionRequest {
    fn encoded_len(&self) -> usize {
        BaseSubscriptionInfo::ENCODED_LEN + 1 + 2 + 8 * self.candidates.len()
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_base(&self.base);
        put_direction(w, self.direction);
        put_transmitters(w, &self.candidates)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            base: r.base()?,
            direction: read_direction(r)?,
            candidates: read_transmitters(r)?,
        })
    }
}

impl WirePayload for ResolutionReceipt {
    fn encoded_len(&self) -> usize {
        BaseSubscriptionInfo::ENCODED_LEN + 1 + 1 + 8 + 2 + 8 * self.candidates.len()
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_base(&self.base);
        put_direction(w, self.direction);
        w.put_u8(self.code as u8);
        w.put_transmitter(self.central);
        put_transmitters(w, &self.candidates)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let base = r.base()?;
        let direction = read_direction(r)?;
        let raw = r.u8()?;
        let code = ReceiptCode::from_u8(raw).ok_or_else(|| invalid("receipt code", raw))?;
        Ok(Self {
            base,
            direction,
            code,
            central: r.transmitter()?,
            candidates: read_transmitters(r)?,
        })
    }
}

/// A data fragment forwarded between distributors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitterData {
    /// Resolution chain followed
    pub direction: DataDirection,
    /// The fragment
    pub fragment: DataFragment,
}

impl WirePayload for TransmitterData {
    fn encoded_len(&self) -> usize {
        self.fragment.encoded_len_with(true)
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        self.fragment.write_with(w, Some(self.direction))
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let (direction, fragment) = DataFragment::read_with(r, true)?;
        let direction = direction.ok_or_else(|| invalid("data direction", 255u8))?;
        Ok(Self {
            direction,
            fragment,
        })
    }
}

/// A distributor's routing advertisement to one neighbour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestPathUpdate {
    /// Advertised routes
    pub updates: Vec<RoutingUpdate>,
}

impl WirePayload for BestPathUpdate {
    fn encoded_len(&self) -> usize {
        2 + self
            .updates
            .iter()
            .map(|u| 8 + 2 + 2 + 8 * u.involved.len())
            .sum::<usize>()
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        list_len16("routing updates", self.updates.len(), w)?;
        for update in &self.updates {
            w.put_transmitter(update.origin);
            w.put_u16(update.weight);
            put_transmitters(w, &update.involved)?;
        }
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let count = r.u16()?;
        let mut updates = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            updates.push(RoutingUpdate {
                origin: r.transmitter()?,
                weight: r.u16()?,
                involved: read_transmitters(r)?,
            });
        }
        Ok(Self { updates })
    }
}

/// Names the owner of an interest list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestOwner {
    /// List owner
    pub owner: TransmitterId,
}

impl WirePayload for InterestOwner {
    fn encoded_len(&self) -> usize {
        8
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_transmitter(self.owner);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            owner: r.transmitter()?,
        })
    }
}

/// A full or incremental interest-list update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestUpdate {
    /// List owner
    pub owner: TransmitterId,
    /// Change
    pub delta: InterestDelta,
}

impl InterestUpdate {
    /// Largest number of delta elements that always fits in one telegram.
    pub const MAX_ELEMENTS: usize = (u16::MAX as usize - 8 - 1 - 8) / 16;
}

fn put_aspects<'a>(
    w: &mut WireWriter,
    aspects: impl ExactSizeIterator<Item = &'a AttributeGroupAspect>,
) -> Result<(), FramingError> {
    list_len16("aspects", aspects.len(), w)?;
    for a in aspects {
        w.put_u64(a.attribute_group);
        w.put_u64(a.aspect);
    }
    Ok(())
}

fn put_objects<'a>(
    w: &mut WireWriter,
    objects: impl ExactSizeIterator<Item = &'a u64>,
) -> Result<(), FramingError> {
    list_len16("objects", objects.len(), w)?;
    for id in objects {
        w.put_u64(*id);
    }
    Ok(())
}

fn read_objects<C: FromIterator<u64>>(r: &mut WireReader<'_>) -> Result<C, FramingError> {
    let count = r.u16()?;
    (0..count).map(|_| r.u64()).collect()
}

fn read_aspects<C: FromIterator<AttributeGroupAspect>>(
    r: &mut WireReader<'_>,
) -> Result<C, FramingError> {
    let count = r.u16()?;
    (0..count)
        .map(|_| -> Result<_, FramingError> { Ok(AttributeGroupAspect::new(r.u64()?, r.u64()?)) })
        .collect()
}

impl WirePayload for InterestUpdate {
    fn encoded_len(&self) -> usize {
        let d = &self.delta;
        8 + 1
            + 2
            + 8 * d.objects_added.len()
            + 2
            + 8 * d.objects_removed.len()
            + 2
            + 16 * d.aspects_added.len()
            + 2
            + 16 * d.aspects_removed.len()
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        w.put_transmitter(self.owner);
        w.put_bool(self.delta.is_full_sync);
        put_objects(w, self.delta.objects_added.iter())?;
        put_objects(w, self.delta.objects_removed.iter())?;
        put_aspects(w, self.delta.aspects_added.iter())?;
        put_aspects(w, self.delta.aspects_removed.iter())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let owner = r.transmitter()?;
        let is_full_sync = r.bool("full sync")?;
        Ok(Self {
            owner,
            delta: InterestDelta {
                objects_added: read_objects(r)?,
                objects_removed: read_objects(r)?,
                aspects_added: read_aspects(r)?,
                aspects_removed: read_aspects(r)?,
                is_full_sync,
            },
        })
    }
}

macro_rules! telegrams {
    ($($variant:ident($payload:ty),)+) => {
        /// A decoded telegram. Variants are named after their [`TelegramType`].
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(tag = "type", content = "payload")]
        pub enum Telegram {
            $(
                #[allow(missing_docs)]
                $variant($payload),
            )+
        }

        impl Telegram {
            /// Registered type of the telegram.
            #[must_use]
            pub fn telegram_type(&self) -> TelegramType {
                match self {
                    $(Telegram::$variant(_) => TelegramType::$variant,)+
                }
            }

            /// Payload length computed from the fields.
            #[must_use]
            pub fn payload_len(&self) -> usize {
                match self {
                    $(Telegram::$variant(p) => p.encoded_len(),)+
                }
            }

            fn write_payload(&self, w: &mut WireWriter) -> Result<(), FramingError> {
                match self {
                    $(Telegram::$variant(p) => p.write(w),)+
                }
            }

            fn read_payload(ty: TelegramType, r: &mut WireReader<'_>) -> Result<Self, CodecError> {
                Ok(match ty {
                    $(TelegramType::$variant => Telegram::$variant(<$payload>::read(r)?),)+
                })
            }
        }
    };
}

telegrams! {
    ProtocolVersionRequest(ProtocolVersionRequest),
    ProtocolVersionAnswer(ProtocolVersionAnswer),
    AuthenticationTextRequest(AuthenticationTextRequest),
    AuthenticationTextAnswer(AuthenticationTextAnswer),
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationAnswer(AuthenticationAnswer),
    ConnectionParametersRequest(ConnectionParameters),
    ConnectionParametersAnswer(ConnectionParameters),
    Terminate(LinkClosure),
    Closing(LinkClosure),
    RequestSenderData(RequestSenderData),
    TelegramTimeRequest(TelegramTime),
    TelegramTimeAnswer(TelegramTime),
    KeepAlive(KeepAlive),
    SendSubscription(SendSubscription),
    ReceiveSubscription(ReceiveSubscription),
    SendUnsubscription(BaseSubscriptionInfo),
    ReceiveUnsubscription(BaseSubscriptionInfo),
    ApplicationData(DataFragment),
    DistributorVersionRequest(DistributorVersionRequest),
    DistributorVersionAnswer(DistributorVersionAnswer),
    DistributorAuthenticationTextRequest(AuthenticationTextRequest),
    DistributorAuthenticationTextAnswer(AuthenticationTextAnswer),
    DistributorAuthenticationRequest(AuthenticationRequest),
    DistributorAuthenticationAnswer(AuthenticationAnswer),
    DistributorConnectionParametersRequest(ConnectionParameters),
    DistributorConnectionParametersAnswer(ConnectionParameters),
    DistributorTerminate(LinkClosure),
    DistributorClosing(LinkClosure),
    DistributorTelegramTimeRequest(TelegramTime),
    DistributorTelegramTimeAnswer(TelegramTime),
    DistributorKeepAlive(KeepAlive),
    DataSubscription(ResolutionRequest),
    DataSubscriptionReceipt(ResolutionReceipt),
    DataUnsubscription(ResolutionRequest),
    TransmitterData(TransmitterData),
    BestPathUpdate(BestPathUpdate),
    InterestSubscription(InterestOwner),
    InterestUnsubscription(InterestOwner),
    InterestDeliveryUnsubscription(InterestOwner),
    InterestUpdate(InterestUpdate),
    InterestResyncRequest(InterestOwner),
}

impl Telegram {
    /// Priority class on the link.
    #[must_use]
    pub fn priority(&self) -> PriorityClass {
        self.telegram_type().priority()
    }

    /// Encode header and payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload does not fit in a 16-bit length.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let len = self.payload_len();
        let declared = u16::try_from(len).map_err(|_| FramingError::PayloadTooLarge { len })?;

        let mut w = WireWriter::with_capacity(HEADER_LEN + len);
        w.put_u8(self.telegram_type().code());
        w.put_u16(declared);
        self.write_payload(&mut w)?;
        debug_assert_eq!(w.len(), HEADER_LEN + len);
        Ok(w.into_inner())
    }

    /// Decode exactly one telegram occupying all of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] if the buffer is shorter than the declared
    /// length or the declared length disagrees with the payload, and a
    /// [`DecodeError`] for unknown type codes or invalid field values.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let header = FrameHeader::parse(bytes)?;
        let declared = usize::from(header.len);
        let payload = &bytes[HEADER_LEN..];

        if TelegramType::from_code(header.code).is_none() {
            return Err(DecodeError::UnknownTypeCode(header.code).into());
        }
        if payload.len() < declared {
            return Err(FramingError::Truncated {
                needed: declared,
                available: payload.len(),
            }
            .into());
        }
        if payload.len() > declared {
            return Err(FramingError::LengthMismatch {
                declared,
                computed: payload.len(),
            }
            .into());
        }
        Self::decode_payload(header.code, payload)
    }

    /// Decode a payload whose header was already read off a stream.
    ///
    /// # Errors
    ///
    /// Same as [`Telegram::decode`].
    pub fn decode_payload(code: u8, payload: &[u8]) -> Result<Self, CodecError> {
        let ty = TelegramType::from_code(code).ok_or(DecodeError::UnknownTypeCode(code))?;
        let declared = payload.len();
        let mut r = WireReader::new(payload);

        let telegram = Self::read_payload(ty, &mut r).map_err(|err| match err {
            CodecError::Framing(FramingError::Truncated { needed, available }) => {
                FramingError::LengthMismatch {
                    declared,
                    computed: declared - available + needed,
                }
                .into()
            }
            other => other,
        })?;

        // Length of the fields read, which a repeated set element would
        // make differ from the re-encoded length.
        let computed = r.position();
        if computed != declared {
            return Err(FramingError::LengthMismatch { declared, computed }.into());
        }
        Ok(telegram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FragmentHead, RecordMetadata};
    use dvmesh_core::DataIndex;
    use std::num::NonZeroU16;

    fn base() -> BaseSubscriptionInfo {
        BaseSubscriptionInfo::new(0x0102_0304_0506_0708, 42, -1)
    }

    fn first_fragment(total: u16) -> DataFragment {
        DataFragment {
            base: base(),
            data_index: DataIndex::from_parts(1_700_000_000, 9, 0).unwrap(),
            delayed: false,
            total,
            head: FragmentHead::First(RecordMetadata {
                timestamp_ms: 1_700_000_000_123,
                error_code: 0,
                changed: vec![0b1010_0000, 0x01],
            }),
            chunk: b"hello".to_vec(),
        }
    }

    fn sample_of(ty: TelegramType) -> Telegram {
        let params = ConnectionParameters {
            keep_alive_send_ms: 20_000,
            keep_alive_receive_ms: 60_000,
            fill_percent: 90,
            throughput_interval_secs: 60,
            min_throughput: 3000,
        };
        let request = ResolutionRequest {
            base: base(),
            direction: SubscriptionDirection::Receiver,
            candidates: vec![TransmitterId(1), TransmitterId(2)],
        };
        let closure = LinkClosure {
            reason: "shutdown".into(),
        };
        let time = TelegramTime { sent_at_ms: 99 };
        let auth_text = AuthenticationTextRequest {
            application_name: "app".into(),
        };
        let challenge = AuthenticationTextAnswer {
            challenge: "xyz".into(),
        };
        let auth = AuthenticationRequest {
            user: "operator".into(),
            encrypted_password: vec![1, 2, 3],
            application_name: "app".into(),
        };
        let answer = AuthenticationAnswer {
            successful: true,
            id: 77,
        };
        let owner = InterestOwner {
            owner: TransmitterId(5),
        };

        match ty {
            TelegramType::ProtocolVersionRequest => {
                Telegram::ProtocolVersionRequest(ProtocolVersionRequest { versions: vec![3, 2] })
            }
            TelegramType::ProtocolVersionAnswer => {
                Telegram::ProtocolVersionAnswer(ProtocolVersionAnswer { version: 3 })
            }
            TelegramType::AuthenticationTextRequest => Telegram::AuthenticationTextRequest(auth_text),
            TelegramType::AuthenticationTextAnswer => Telegram::AuthenticationTextAnswer(challenge),
            TelegramType::AuthenticationRequest => Telegram::AuthenticationRequest(auth),
            TelegramType::AuthenticationAnswer => Telegram::AuthenticationAnswer(answer),
            TelegramType::ConnectionParametersRequest => Telegram::ConnectionParametersRequest(params),
            TelegramType::ConnectionParametersAnswer => Telegram::ConnectionParametersAnswer(params),
            TelegramType::Terminate => Telegram::Terminate(closure),
            TelegramType::Closing => Telegram::Closing(closure),
            TelegramType::RequestSenderData => Telegram::RequestSenderData(RequestSenderData {
                base: base(),
                state: TriggerState::NoRights,
            }),
            TelegramType::TelegramTimeRequest => Telegram::TelegramTimeRequest(time),
            TelegramType::TelegramTimeAnswer => Telegram::TelegramTimeAnswer(time),
            TelegramType::KeepAlive => Telegram::KeepAlive(KeepAlive),
            TelegramType::SendSubscription => Telegram::SendSubscription(SendSubscription {
                base: base(),
                role: SenderRole::Source,
                trigger_requested: true,
            }),
            TelegramType::ReceiveSubscription => Telegram::ReceiveSubscription(ReceiveSubscription {
                base: base(),
                role: ReceiverRole::Drain,
                options: ReceiveOptions {
                    want_delayed_data: true,
                    want_delta_only: false,
                },
            }),
            TelegramType::SendUnsubscription => Telegram::SendUnsubscription(base()),
            TelegramType::ReceiveUnsubscription => Telegram::ReceiveUnsubscription(base()),
            TelegramType::ApplicationData => Telegram::ApplicationData(first_fragment(1)),
            TelegramType::DistributorVersionRequest => {
                Telegram::DistributorVersionRequest(DistributorVersionRequest {
                    transmitter_id: TransmitterId(9),
                    versions: vec![3],
                })
            }
            TelegramType::DistributorVersionAnswer => {
                Telegram::DistributorVersionAnswer(DistributorVersionAnswer {
                    version: 3,
                    transmitter_id: TransmitterId(10),
                })
            }
            TelegramType::DistributorAuthenticationTextRequest => {
                Telegram::DistributorAuthenticationTextRequest(auth_text)
            }
            TelegramType::DistributorAuthenticationTextAnswer => {
                Telegram::DistributorAuthenticationTextAnswer(challenge)
            }
            TelegramType::DistributorAuthenticationRequest => Telegram::DistributorAuthenticationRequest(auth),
            TelegramType::DistributorAuthenticationAnswer => Telegram::DistributorAuthenticationAnswer(answer),
            TelegramType::DistributorConnectionParametersRequest => {
                Telegram::DistributorConnectionParametersRequest(params)
            }
            TelegramType::DistributorConnectionParametersAnswer => {
                Telegram::DistributorConnectionParametersAnswer(params)
            }
            TelegramType::DistributorTerminate => Telegram::DistributorTerminate(closure),
            TelegramType::DistributorClosing => Telegram::DistributorClosing(closure),
            TelegramType::DistributorTelegramTimeRequest => Telegram::DistributorTelegramTimeRequest(time),
            TelegramType::DistributorTelegramTimeAnswer => Telegram::DistributorTelegramTimeAnswer(time),
            TelegramType::DistributorKeepAlive => Telegram::DistributorKeepAlive(KeepAlive),
            TelegramType::DataSubscription => Telegram::DataSubscription(request),
            TelegramType::DataSubscriptionReceipt => Telegram::DataSubscriptionReceipt(ResolutionReceipt {
                base: base(),
                direction: SubscriptionDirection::Sender,
                code: ReceiptCode::PositiveNoRights,
                central: TransmitterId(3),
                candidates: vec![TransmitterId(1)],
            }),
            TelegramType::DataUnsubscription => Telegram::DataUnsubscription(request),
            TelegramType::TransmitterData => Telegram::TransmitterData(TransmitterData {
                direction: DataDirection::TowardSink,
                fragment: DataFragment {
                    total: 3,
                    head: FragmentHead::Next(NonZeroU16::new(2).unwrap()),
                    ..first_fragment(3)
                },
            }),
            TelegramType::BestPathUpdate => Telegram::BestPathUpdate(BestPathUpdate {
                updates: vec![
                    RoutingUpdate {
                        origin: TransmitterId(4),
                        weight: 7,
                        involved: vec![TransmitterId(2), TransmitterId(3)],
                    },
                    RoutingUpdate {
                        origin: TransmitterId(2),
                        weight: 1,
                        involved: vec![TransmitterId(2)],
                    },
                ],
            }),
            TelegramType::InterestSubscription => Telegram::InterestSubscription(owner),
            TelegramType::InterestUnsubscription => Telegram::InterestUnsubscription(owner),
            TelegramType::InterestDeliveryUnsubscription => Telegram::InterestDeliveryUnsubscription(owner),
            TelegramType::InterestUpdate => Telegram::InterestUpdate(InterestUpdate {
                owner: TransmitterId(5),
                delta: InterestDelta {
                    objects_added: [1, 2].into_iter().collect(),
                    objects_removed: [3].into_iter().collect(),
                    aspects_added: [AttributeGroupAspect::new(10, 20)].into_iter().collect(),
                    aspects_removed: Default::default(),
                    is_full_sync: false,
                },
            }),
            TelegramType::InterestResyncRequest => Telegram::InterestResyncRequest(owner),
        }
    }

    #[test]
    fn every_registered_type_roundtrips() {
        for ty in TelegramType::ALL {
            let telegram = sample_of(*ty);
            assert_eq!(telegram.telegram_type(), *ty);

            let bytes = telegram.encode().unwrap();
            assert_eq!(bytes[0], ty.code());
            assert_eq!(
                usize::from(u16::from_be_bytes([bytes[1], bytes[2]])),
                bytes.len() - HEADER_LEN
            );
            assert_eq!(Telegram::decode(&bytes).unwrap(), telegram, "{ty}");
        }
    }

    #[test]
    fn connection_parameters_layout() {
        let bytes = sample_of(TelegramType::ConnectionParametersRequest)
            .encode()
            .unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 23);
        assert_eq!(&bytes[..3], &[7, 0, 23]);
        assert_eq!(bytes[HEADER_LEN + 16], 90);
    }

    #[test]
    fn routing_batch_layout() {
        let bytes = sample_of(TelegramType::BestPathUpdate).encode().unwrap();
        let payload = &bytes[HEADER_LEN..];

        assert_eq!(&payload[..2], &[0, 2]);
        assert_eq!(&payload[2..10], &4u64.to_be_bytes());
        assert_eq!(&payload[10..12], &7u16.to_be_bytes());
        assert_eq!(&payload[12..14], &2u16.to_be_bytes());
        assert_eq!(payload.len(), 2 + (12 + 16) + (12 + 8));
    }

    #[test]
    fn tampered_length_is_framing_error() {
        for ty in TelegramType::ALL {
            let bytes = sample_of(*ty).encode().unwrap();
            let declared = u16::from_be_bytes([bytes[1], bytes[2]]);

            // Declare one byte more and append a byte.
            let mut longer = bytes.clone();
            longer[1..3].copy_from_slice(&(declared + 1).to_be_bytes());
            longer.push(0);
            assert!(
                matches!(
                    Telegram::decode(&longer),
                    Err(CodecError::Framing(FramingError::LengthMismatch { .. }))
                ),
                "{ty} accepted an extra byte"
            );

            // Declare one byte less and drop the last byte.
            if declared > 0 {
                let mut shorter = bytes.clone();
                shorter[1..3].copy_from_slice(&(declared - 1).to_be_bytes());
                shorter.pop();
                assert!(
                    matches!(
                        Telegram::decode(&shorter),
                        Err(CodecError::Framing(FramingError::LengthMismatch { .. }))
                    ),
                    "{ty} accepted a missing byte"
                );
            }
        }
    }

    #[test]
    fn unknown_type_code_is_decode_error() {
        assert_eq!(
            Telegram::decode(&[200, 0, 0]),
            Err(CodecError::Decode(DecodeError::UnknownTypeCode(200)))
        );
    }

    #[test]
    fn short_buffer_is_truncated() {
        let bytes = sample_of(TelegramType::KeepAlive).encode().unwrap();
        assert_eq!(bytes, vec![14, 0, 0]);

        assert!(matches!(
            Telegram::decode(&[16, 0]),
            Err(CodecError::Framing(FramingError::Truncated { .. }))
        ));
        assert!(matches!(
            Telegram::decode(&[16, 0, 21, 1, 2]),
            Err(CodecError::Framing(FramingError::Truncated {
                needed: 21,
                available: 2
            }))
        ));
    }

    #[test]
    fn invalid_enum_value_is_decode_error() {
        let mut bytes = sample_of(TelegramType::DataSubscriptionReceipt)
            .encode()
            .unwrap();
        // receipt code follows base (18) and direction (1)
        bytes[HEADER_LEN + 19] = 9;

        assert_eq!(
            Telegram::decode(&bytes),
            Err(CodecError::Decode(DecodeError::InvalidValue {
                field: "receipt code",
                value: 9
            }))
        );
    }

    #[test]
    fn oversized_payload_cannot_be_encoded() {
        let telegram = Telegram::BestPathUpdate(BestPathUpdate {
            updates: vec![
                RoutingUpdate {
                    origin: TransmitterId(1),
                    weight: 1,
                    involved: vec![TransmitterId(1); 5000],
                };
                2
            ],
        });

        assert!(matches!(
            telegram.encode(),
            Err(CodecError::Framing(FramingError::PayloadTooLarge { .. }))
        ));
    }

    #[test]
    fn direction_maps_to_resolution_chain() {
        assert_eq!(
            DataDirection::from(SubscriptionDirection::Receiver),
            DataDirection::TowardSource
        );
        assert_eq!(
            DataDirection::TowardSink.resolution_direction(),
            SubscriptionDirection::Sender
        );
        assert_eq!(DataDirection::from_u8(2), None);
    }

    #[test]
    fn negotiation_takes_tolerant_values() {
        let strict = ConnectionParameters {
            keep_alive_send_ms: 10_000,
            keep_alive_receive_ms: 30_000,
            fill_percent: 80,
            throughput_interval_secs: 30,
            min_throughput: 5000,
        };
        let lax = ConnectionParameters {
            keep_alive_send_ms: 20_000,
            keep_alive_receive_ms: 60_000,
            fill_percent: 90,
            throughput_interval_secs: 60,
            min_throughput: 3000,
        };

        assert_eq!(strict.negotiate(lax), lax);
        assert_eq!(lax.negotiate(strict), lax);
    }

    #[test]
    fn repeated_interest_elements_collapse() {
        let update = InterestUpdate {
            owner: TransmitterId(5),
            delta: InterestDelta {
                objects_added: [7, 8].into_iter().collect(),
                ..InterestDelta::default()
            },
        };
        let mut bytes = Telegram::InterestUpdate(update).encode().unwrap();
        // header 3, owner 8, full-sync flag 1, count 2, then two u64 ids
        assert_eq!(bytes[HEADER_LEN + 8 + 1 + 2 + 15], 8);
        bytes[HEADER_LEN + 8 + 1 + 2 + 15] = 7;

        let Telegram::InterestUpdate(decoded) = Telegram::decode(&bytes).unwrap() else {
            panic!("wrong telegram type");
        };
        assert_eq!(decoded.delta.objects_added, std::collections::BTreeSet::from([7]));
    }
}
