//! Links to applications and neighbouring distributors.
//!
//! A link is a TCP stream carrying telegrams. After the handshake it runs
//! as two halves under one task:
//! - the reader decodes telegrams, reassembles data fragments and answers
//!   link-level traffic (keep-alive, time probes, termination) itself
//! - the writer drains a priority queue, sends keep-alives when idle and
//!   measures throughput while the queue is filling up
//!
//! Whichever half fails first ends the link; the runtime is told once.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use dvmesh_core::{SubscriberId, TransmitterId};
use dvmesh_proto::{
    Assembler, AuthenticationAnswer, AuthenticationTextAnswer, CodecError, DataDirection,
    DataFragment, DistributorVersionAnswer, DistributorVersionRequest, FrameHeader, KeepAlive,
    LinkClosure, PriorityClass, ProtocolVersionAnswer, Record, Telegram, TelegramTime, HEADER_LEN,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::config::LinkSettings;

/// Telegrams the runtime may queue on a link before sending blocks.
const OUTBOUND_CHANNEL: usize = 1024;

/// The other end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkPeer {
    /// A local application
    Application(SubscriberId),
    /// A neighbouring distributor
    Distributor(TransmitterId),
}

impl LinkPeer {
    fn keep_alive(self) -> Telegram {
        match self {
            Self::Application(_) => Telegram::KeepAlive(KeepAlive),
            Self::Distributor(_) => Telegram::DistributorKeepAlive(KeepAlive),
        }
    }

    fn time_request(self, time: TelegramTime) -> Telegram {
        match self {
            Self::Application(_) => Telegram::TelegramTimeRequest(time),
            Self::Distributor(_) => Telegram::DistributorTelegramTimeRequest(time),
        }
    }

    fn time_answer(self, time: TelegramTime) -> Telegram {
        match self {
            Self::Application(_) => Telegram::TelegramTimeAnswer(time),
            Self::Distributor(_) => Telegram::DistributorTelegramTimeAnswer(time),
        }
    }

    fn closing(self, reason: &str) -> Telegram {
        let closure = LinkClosure {
            reason: reason.to_string(),
        };
        match self {
            Self::Application(_) => Telegram::Closing(closure),
            Self::Distributor(_) => Telegram::DistributorClosing(closure),
        }
    }
}

impl fmt::Display for LinkPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application(id) => write!(f, "application {id}"),
            Self::Distributor(id) => write!(f, "distributor {id}"),
        }
    }
}

/// Link failures.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A telegram could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Socket failure
    #[error("link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Keep-alive or throughput supervision failed
    #[error(transparent)]
    Health(#[from] LinkHealthError),

    /// The other side closed the link
    #[error("link closed: {reason}")]
    Closed {
        /// Reason given by the other side
        reason: String,
    },

    /// The handshake did not complete
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Link supervision failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkHealthError {
    /// Nothing arrived within the keep-alive receive timeout
    #[error("nothing received for {after:?}")]
    ReceiveTimeout {
        /// Timeout that elapsed
        after: Duration,
    },

    /// The outbound queue stayed full while too little was sent
    #[error("throughput {measured} B/s stayed below {minimum} B/s for {interval:?}")]
    ThroughputTooLow {
        /// Last measured throughput in bytes per second
        measured: u64,
        /// Configured minimum
        minimum: u32,
        /// Configured interval
        interval: Duration,
    },
}

/// What a link reports to the runtime.
#[derive(Debug)]
pub enum LinkEvent {
    /// Handshake completed; telegrams for the peer go through `handle`
    Up {
        /// Other end
        peer: LinkPeer,
        /// Outbound handle
        handle: LinkHandle,
    },
    /// A control telegram arrived
    Telegram {
        /// Other end
        peer: LinkPeer,
        /// The telegram
        telegram: Telegram,
    },
    /// A complete record arrived
    Record {
        /// Other end
        peer: LinkPeer,
        /// Chain the record follows; `None` for application data
        direction: Option<DataDirection>,
        /// The record
        record: Record,
    },
    /// The link ended
    Down {
        /// Other end
        peer: LinkPeer,
        /// Why
        error: LinkError,
    },
}

/// Sending side of a running link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    peer: LinkPeer,
    outbound: mpsc::Sender<Telegram>,
}

impl LinkHandle {
    /// Other end of the link.
    #[must_use]
    pub fn peer(&self) -> LinkPeer {
        self.peer
    }

    /// Whether the link behind the handle has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queue a telegram. Waits while the link's outbound queue is full.
    ///
    /// # Errors
    ///
    /// Returns error if the link has ended.
    pub async fn send(&self, telegram: Telegram) -> Result<(), LinkError> {
        self.outbound
            .send(telegram)
            .await
            .map_err(|_| LinkError::Closed {
                reason: format!("{} is gone", self.peer),
            })
    }
}

/// Read one telegram off a stream.
///
/// # Errors
///
/// Returns [`LinkError::Closed`] on a clean end of stream before a header,
/// and I/O or codec errors otherwise.
pub async fn read_telegram<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Telegram, LinkError> {
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(LinkError::Closed {
                reason: "connection closed".to_string(),
            });
        }
        return Err(e.into());
    }
    let header = FrameHeader::from_bytes(header);

    let mut payload = vec![0u8; usize::from(header.len)];
    reader.read_exact(&mut payload).await?;
    Ok(Telegram::decode_payload(header.code, &payload)?)
}

/// Write one telegram to a stream.
///
/// # Errors
///
/// Returns error if the telegram cannot be encoded or written.
pub async fn write_telegram<W: AsyncWrite + Unpin>(
    writer: &mut W,
    telegram: &Telegram,
) -> Result<(), LinkError> {
    writer.write_all(&telegram.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_within<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<Telegram, LinkError> {
    timeout(limit, read_telegram(reader))
        .await
        .map_err(|_| LinkHealthError::ReceiveTimeout { after: limit })?
}

fn unexpected(telegram: &Telegram) -> LinkError {
    LinkError::Handshake(format!("unexpected {}", telegram.telegram_type()))
}

/// Run the distributor side of an application handshake.
///
/// The application offers protocol versions, may authenticate and finally
/// proposes connection parameters; the negotiated settings are returned.
///
/// # Errors
///
/// Returns error if no protocol version is shared or the application sends
/// anything out of order.
pub async fn accept_application<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    id: SubscriberId,
    settings: &LinkSettings,
) -> Result<LinkSettings, LinkError> {
    let mut versioned = false;
    loop {
        let telegram = read_within(stream, settings.keep_alive_receive).await?;
        match telegram {
            Telegram::ProtocolVersionRequest(request) => {
                if !request.versions.contains(&PROTOCOL_VERSION) {
                    let answer = ProtocolVersionAnswer { version: -1 };
                    write_telegram(stream, &Telegram::ProtocolVersionAnswer(answer)).await?;
                    return Err(LinkError::Handshake(format!(
                        "no common protocol version in {:?}",
                        request.versions
                    )));
                }
                let answer = ProtocolVersionAnswer {
                    version: PROTOCOL_VERSION,
                };
                write_telegram(stream, &Telegram::ProtocolVersionAnswer(answer)).await?;
                versioned = true;
            }
            Telegram::AuthenticationTextRequest(request) if versioned => {
                tracing::debug!(application = %id, name = %request.application_name, "Authentication requested");
                let answer = AuthenticationTextAnswer {
                    challenge: chrono::Utc::now().timestamp_millis().to_string(),
                };
                write_telegram(stream, &Telegram::AuthenticationTextAnswer(answer)).await?;
            }
            Telegram::AuthenticationRequest(request) if versioned => {
                tracing::info!(
                    application = %id,
                    user = %request.user,
                    name = %request.application_name,
                    "Application authenticated"
                );
                let answer = AuthenticationAnswer {
                    successful: true,
                    id: id.0,
                };
                write_telegram(stream, &Telegram::AuthenticationAnswer(answer)).await?;
            }
            Telegram::ConnectionParametersRequest(params) if versioned => {
                let agreed = settings.negotiated(params);
                write_telegram(stream, &Telegram::ConnectionParametersAnswer(agreed.parameters()))
                    .await?;
                return Ok(agreed);
            }
            Telegram::KeepAlive(_) => {}
            other => return Err(unexpected(&other)),
        }
    }
}

/// Run the connecting side of a distributor handshake.
///
/// Returns the neighbour's id and the negotiated settings.
///
/// # Errors
///
/// Returns error if the neighbour speaks another version or answers out of order.
pub async fn connect_distributor<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local: TransmitterId,
    settings: &LinkSettings,
) -> Result<(TransmitterId, LinkSettings), LinkError> {
    let request = DistributorVersionRequest {
        transmitter_id: local,
        versions: vec![PROTOCOL_VERSION],
    };
    write_telegram(stream, &Telegram::DistributorVersionRequest(request)).await?;

    let neighbor = match read_within(stream, settings.keep_alive_receive).await? {
        Telegram::DistributorVersionAnswer(answer) if answer.version == PROTOCOL_VERSION => {
            answer.transmitter_id
        }
        Telegram::DistributorVersionAnswer(answer) => {
            return Err(LinkError::Handshake(format!(
                "neighbor answered protocol version {}",
                answer.version
            )));
        }
        other => return Err(unexpected(&other)),
    };

    write_telegram(
        stream,
        &Telegram::DistributorConnectionParametersRequest(settings.parameters()),
    )
    .await?;

    match read_within(stream, settings.keep_alive_receive).await? {
        Telegram::DistributorConnectionParametersAnswer(params) => {
            Ok((neighbor, settings.negotiated(params)))
        }
        other => Err(unexpected(&other)),
    }
}

/// Run the accepting side of a distributor handshake.
///
/// # Errors
///
/// Returns error if no protocol version is shared, the neighbour claims
/// this distributor's own id, or telegrams arrive out of order.
pub async fn accept_distributor<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local: TransmitterId,
    settings: &LinkSettings,
) -> Result<(TransmitterId, LinkSettings), LinkError> {
    let request = match read_within(stream, settings.keep_alive_receive).await? {
        Telegram::DistributorVersionRequest(request) => request,
        other => return Err(unexpected(&other)),
    };

    let refuse = if request.transmitter_id == local {
        Some(format!("neighbor claims this distributor's id {local}"))
    } else if !request.versions.contains(&PROTOCOL_VERSION) {
        Some(format!("no common protocol version in {:?}", request.versions))
    } else {
        None
    };
    let answer = DistributorVersionAnswer {
        version: if refuse.is_some() { -1 } else { PROTOCOL_VERSION },
        transmitter_id: local,
    };
    write_telegram(stream, &Telegram::DistributorVersionAnswer(answer)).await?;
    if let Some(reason) = refuse {
        return Err(LinkError::Handshake(reason));
    }

    match read_within(stream, settings.keep_alive_receive).await? {
        Telegram::DistributorConnectionParametersRequest(params) => {
            let agreed = settings.negotiated(params);
            write_telegram(
                stream,
                &Telegram::DistributorConnectionParametersAnswer(agreed.parameters()),
            )
            .await?;
            Ok((request.transmitter_id, agreed))
        }
        other => Err(unexpected(&other)),
    }
}

/// Encoded telegrams waiting to be written, highest priority class first.
#[derive(Debug)]
pub struct OutboundQueue {
    lanes: [VecDeque<Vec<u8>>; 3],
    bytes: usize,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding about `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Default::default(),
            bytes: 0,
            capacity: capacity.max(1),
        }
    }

    /// Encode and queue a telegram.
    ///
    /// # Errors
    ///
    /// Returns error if the telegram cannot be encoded.
    pub fn push(&mut self, telegram: &Telegram) -> Result<(), CodecError> {
        let encoded = telegram.encode()?;
        self.bytes += encoded.len();
        self.lanes[lane(telegram.priority())].push_back(encoded);
        Ok(())
    }

    /// Next telegram to write.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let encoded = self.lanes.iter_mut().rev().find_map(VecDeque::pop_front)?;
        self.bytes -= encoded.len();
        Some(encoded)
    }

    /// Whether more telegrams should be pulled in.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.bytes < self.capacity
    }

    /// Queued bytes as a percentage of capacity, capped at 100.
    #[must_use]
    pub fn fill_percent(&self) -> u8 {
        u8::try_from((self.bytes * 100 / self.capacity).min(100)).unwrap_or(100)
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

fn lane(class: PriorityClass) -> usize {
    match class {
        PriorityClass::Data => 0,
        PriorityClass::Routing => 1,
        PriorityClass::System => 2,
    }
}

/// Throughput supervision.
///
/// While the outbound queue is at least `fill_percent` full, a time probe
/// is sent; when its answer comes back, the bytes written meanwhile over
/// the elapsed time give the throughput. A link whose throughput stays
/// below the minimum for the configured interval has failed.
#[derive(Debug)]
pub struct ThroughputMonitor {
    fill_percent: u8,
    min_throughput: u32,
    interval: Duration,
    sent: u64,
    probe: Option<(Instant, u64)>,
    below_since: Option<Instant>,
}

impl ThroughputMonitor {
    /// Create a monitor for a link's settings.
    #[must_use]
    pub fn new(settings: &LinkSettings) -> Self {
        Self {
            fill_percent: settings.fill_percent,
            min_throughput: settings.min_throughput,
            interval: settings.throughput_interval,
            sent: 0,
            probe: None,
            below_since: None,
        }
    }

    /// Account for bytes written to the socket.
    pub fn record_sent(&mut self, bytes: usize) {
        self.sent += bytes as u64;
    }

    /// Whether a probe should go out at this queue fill level.
    #[must_use]
    pub fn should_probe(&self, fill_percent: u8) -> bool {
        self.probe.is_none() && fill_percent >= self.fill_percent
    }

    /// A probe was queued.
    pub fn probe_sent(&mut self, now: Instant) {
        self.probe = Some((now, self.sent));
    }

    /// The outbound queue dropped below the threshold.
    pub fn relieved(&mut self) {
        self.below_since = None;
    }

    /// The probe's answer arrived. Returns the measured throughput.
    ///
    /// # Errors
    ///
    /// Returns error if throughput has been too low for the whole interval.
    pub fn probe_answered(&mut self, now: Instant) -> Result<Option<u64>, LinkHealthError> {
        let Some((started, sent_then)) = self.probe.take() else {
            return Ok(None);
        };
        let measured = self.rate(started, sent_then, now);
        self.judge(started, measured, now)?;
        Ok(Some(measured))
    }

    /// Fail a link whose probe has been outstanding for the whole interval
    /// without enough bytes leaving.
    ///
    /// # Errors
    ///
    /// Returns error if throughput has been too low for the whole interval.
    pub fn check(&mut self, now: Instant) -> Result<(), LinkHealthError> {
        let Some((started, sent_then)) = self.probe else {
            return Ok(());
        };
        if now.duration_since(started) < self.interval {
            return Ok(());
        }
        let measured = self.rate(started, sent_then, now);
        if measured < u64::from(self.min_throughput) {
            return Err(self.too_low(measured));
        }
        Ok(())
    }

    fn rate(&self, started: Instant, sent_then: u64, now: Instant) -> u64 {
        let elapsed_ms = u64::try_from(now.duration_since(started).as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        (self.sent - sent_then).saturating_mul(1000) / elapsed_ms
    }

    fn judge(&mut self, started: Instant, measured: u64, now: Instant) -> Result<(), LinkHealthError> {
        if measured >= u64::from(self.min_throughput) {
            self.below_since = None;
            return Ok(());
        }
        let since = *self.below_since.get_or_insert(started);
        if now.duration_since(since) >= self.interval {
            return Err(self.too_low(measured));
        }
        Ok(())
    }

    fn too_low(&self, measured: u64) -> LinkHealthError {
        LinkHealthError::ThroughputTooLow {
            measured,
            minimum: self.min_throughput,
            interval: self.interval,
        }
    }
}

/// Link-level traffic the reader hands to the writer.
#[derive(Debug)]
enum Control {
    Echo(TelegramTime),
    ProbeAnswered,
}

/// Start the reader and writer of a link whose handshake completed.
///
/// The runtime receives [`LinkEvent::Up`] before any telegram of the link.
/// The returned task finishes when the link ends.
pub fn spawn_link<S>(
    stream: S,
    peer: LinkPeer,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handle = LinkHandle {
        peer,
        outbound: outbound_tx,
    };

    tokio::spawn(async move {
        if events.send(LinkEvent::Up { peer, handle }).await.is_err() {
            return;
        }

        let result = tokio::select! {
            result = read_loop(reader, peer, settings, control_tx, events.clone()) => result,
            result = write_loop(writer, peer, settings, outbound_rx, control_rx) => result,
        };

        match result {
            Ok(()) => tracing::debug!(%peer, "Link closed"),
            Err(error) => {
                tracing::warn!(%peer, %error, "Link terminated");
                let _ = events.send(LinkEvent::Down { peer, error }).await;
            }
        }
    })
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    peer: LinkPeer,
    settings: LinkSettings,
    control: mpsc::UnboundedSender<Control>,
    events: mpsc::Sender<LinkEvent>,
) -> Result<(), LinkError> {
    let mut application_data = Assembler::new();
    let mut toward_source = Assembler::new();
    let mut toward_sink = Assembler::new();

    loop {
        let event = match read_within(&mut reader, settings.keep_alive_receive).await? {
            Telegram::KeepAlive(_) | Telegram::DistributorKeepAlive(_) => continue,
            Telegram::TelegramTimeRequest(time) | Telegram::DistributorTelegramTimeRequest(time) => {
                let _ = control.send(Control::Echo(time));
                continue;
            }
            Telegram::TelegramTimeAnswer(_) | Telegram::DistributorTelegramTimeAnswer(_) => {
                let _ = control.send(Control::ProbeAnswered);
                continue;
            }
            Telegram::Terminate(closure)
            | Telegram::Closing(closure)
            | Telegram::DistributorTerminate(closure)
            | Telegram::DistributorClosing(closure) => {
                return Err(LinkError::Closed {
                    reason: closure.reason,
                });
            }
            Telegram::ApplicationData(fragment) => {
                match reassemble(&mut application_data, fragment, peer) {
                    Some(record) => LinkEvent::Record {
                        peer,
                        direction: None,
                        record,
                    },
                    None => continue,
                }
            }
            Telegram::TransmitterData(data) => {
                let assembler = match data.direction {
                    DataDirection::TowardSource => &mut toward_source,
                    DataDirection::TowardSink => &mut toward_sink,
                };
                match reassemble(assembler, data.fragment, peer) {
                    Some(record) => LinkEvent::Record {
                        peer,
                        direction: Some(data.direction),
                        record,
                    },
                    None => continue,
                }
            }
            telegram => LinkEvent::Telegram { peer, telegram },
        };

        if events.send(event).await.is_err() {
            return Ok(());
        }
    }
}

fn reassemble(assembler: &mut Assembler, fragment: DataFragment, peer: LinkPeer) -> Option<Record> {
    match assembler.push(fragment) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "Dropping inconsistent record");
            None
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    peer: LinkPeer,
    settings: LinkSettings,
    mut outbound: mpsc::Receiver<Telegram>,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> Result<(), LinkError> {
    let mut queue = OutboundQueue::new(settings.send_buffer);
    let mut monitor = ThroughputMonitor::new(&settings);
    let mut last_sent = Instant::now();

    loop {
        while let Ok(ctl) = control.try_recv() {
            apply_control(ctl, peer, &mut queue, &mut monitor)?;
        }
        while queue.has_room() {
            match outbound.try_recv() {
                Ok(telegram) => enqueue(&mut queue, peer, &telegram),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return close(writer, peer, queue).await,
            }
        }

        let fill = queue.fill_percent();
        if monitor.should_probe(fill) {
            tracing::debug!(%peer, fill, "Outbound queue filling up, measuring throughput");
            let probe = TelegramTime {
                sent_at_ms: chrono::Utc::now().timestamp_millis(),
            };
            enqueue(&mut queue, peer, &peer.time_request(probe));
            monitor.probe_sent(Instant::now());
        } else if fill < settings.fill_percent {
            monitor.relieved();
        }
        monitor.check(Instant::now())?;

        if let Some(encoded) = queue.pop() {
            writer.write_all(&encoded).await?;
            monitor.record_sent(encoded.len());
            last_sent = Instant::now();
            continue;
        }
        writer.flush().await?;

        tokio::select! {
            telegram = outbound.recv() => match telegram {
                Some(telegram) => enqueue(&mut queue, peer, &telegram),
                None => return close(writer, peer, queue).await,
            },
            Some(ctl) = control.recv() => apply_control(ctl, peer, &mut queue, &mut monitor)?,
            () = tokio::time::sleep_until(last_sent + settings.keep_alive_send) => {
                enqueue(&mut queue, peer, &peer.keep_alive());
            }
        }
    }
}

fn enqueue(queue: &mut OutboundQueue, peer: LinkPeer, telegram: &Telegram) {
    if let Err(e) = queue.push(telegram) {
        tracing::warn!(%peer, telegram = %telegram.telegram_type(), error = %e, "Dropping unencodable telegram");
    }
}

fn apply_control(
    ctl: Control,
    peer: LinkPeer,
    queue: &mut OutboundQueue,
    monitor: &mut ThroughputMonitor,
) -> Result<(), LinkHealthError> {
    match ctl {
        Control::Echo(time) => enqueue(queue, peer, &peer.time_answer(time)),
        Control::ProbeAnswered => {
            if let Some(measured) = monitor.probe_answered(Instant::now())? {
                tracing::debug!(%peer, measured, "Throughput measured");
            }
        }
    }
    Ok(())
}

async fn close<W: AsyncWrite + Unpin>(
    mut writer: W,
    peer: LinkPeer,
    mut queue: OutboundQueue,
) -> Result<(), LinkError> {
    enqueue(&mut queue, peer, &peer.closing("distributor closed the link"));
    while let Some(encoded) = queue.pop() {
        writer.write_all(&encoded).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvmesh_core::{BaseSubscriptionInfo, DataIndex};
    use dvmesh_proto::{
        ConnectionParameters, DistributorVersionRequest, Fragmenter, ProtocolVersionRequest,
        RecordMetadata,
    };
    use tokio_test::io::Builder;

    fn encoded(telegram: &Telegram) -> Vec<u8> {
        telegram.encode().unwrap()
    }

    fn settings() -> LinkSettings {
        LinkSettings::default()
    }

    fn their_params() -> ConnectionParameters {
        ConnectionParameters {
            keep_alive_send_ms: 30_000,
            keep_alive_receive_ms: 90_000,
            fill_percent: 80,
            throughput_interval_secs: 60,
            min_throughput: 2000,
        }
    }

    #[tokio::test]
    async fn read_telegram_across_partial_reads() {
        let bytes = encoded(&Telegram::BestPathUpdate(dvmesh_proto::BestPathUpdate {
            updates: vec![],
        }));
        let mut mock = Builder::new()
            .read(&bytes[..1])
            .read(&bytes[1..])
            .read(&encoded(&Telegram::KeepAlive(KeepAlive)))
            .build();

        assert!(matches!(
            read_telegram(&mut mock).await.unwrap(),
            Telegram::BestPathUpdate(_)
        ));
        assert!(matches!(
            read_telegram(&mut mock).await.unwrap(),
            Telegram::KeepAlive(_)
        ));
        assert!(matches!(
            read_telegram(&mut mock).await,
            Err(LinkError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_type_code_fails_the_link() {
        let mut mock = Builder::new().read(&[200, 0, 0]).build();

        assert!(matches!(
            read_telegram(&mut mock).await,
            Err(LinkError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn application_handshake() {
        let agreed = settings().negotiated(their_params());
        let mut mock = Builder::new()
            .read(&encoded(&Telegram::ProtocolVersionRequest(
                ProtocolVersionRequest {
                    versions: vec![PROTOCOL_VERSION, 2],
                },
            )))
            .write(&encoded(&Telegram::ProtocolVersionAnswer(
                ProtocolVersionAnswer {
                    version: PROTOCOL_VERSION,
                },
            )))
            .read(&encoded(&Telegram::ConnectionParametersRequest(
                their_params(),
            )))
            .write(&encoded(&Telegram::ConnectionParametersAnswer(
                agreed.parameters(),
            )))
            .build();

        let result = accept_application(&mut mock, SubscriberId(1), &settings())
            .await
            .unwrap();

        assert_eq!(result, agreed);
        assert_eq!(result.keep_alive_receive, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn application_without_common_version_is_refused() {
        let mut mock = Builder::new()
            .read(&encoded(&Telegram::ProtocolVersionRequest(
                ProtocolVersionRequest { versions: vec![1] },
            )))
            .write(&encoded(&Telegram::ProtocolVersionAnswer(
                ProtocolVersionAnswer { version: -1 },
            )))
            .build();

        let err = accept_application(&mut mock, SubscriberId(1), &settings())
            .await
            .unwrap_err();

        assert!(matches!(err, LinkError::Handshake(_)));
    }

    #[tokio::test]
    async fn parameters_before_version_are_refused() {
        let mut mock = Builder::new()
            .read(&encoded(&Telegram::ConnectionParametersRequest(
                their_params(),
            )))
            .build();

        assert!(matches!(
            accept_application(&mut mock, SubscriberId(1), &settings()).await,
            Err(LinkError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn distributor_handshake_both_sides() {
        let local = settings();
        let agreed = local.negotiated(their_params());

        let mut connector = Builder::new()
            .write(&encoded(&Telegram::DistributorVersionRequest(
                DistributorVersionRequest {
                    transmitter_id: TransmitterId(1),
                    versions: vec![PROTOCOL_VERSION],
                },
            )))
            .read(&encoded(&Telegram::DistributorVersionAnswer(
                DistributorVersionAnswer {
                    version: PROTOCOL_VERSION,
                    transmitter_id: TransmitterId(2),
                },
            )))
            .write(&encoded(&Telegram::DistributorConnectionParametersRequest(
                local.parameters(),
            )))
            .read(&encoded(&Telegram::DistributorConnectionParametersAnswer(
                agreed.parameters(),
            )))
            .build();
        let (neighbor, result) = connect_distributor(&mut connector, TransmitterId(1), &local)
            .await
            .unwrap();
        assert_eq!(neighbor, TransmitterId(2));
        assert_eq!(result, agreed);

        let mut acceptor = Builder::new()
            .read(&encoded(&Telegram::DistributorVersionRequest(
                DistributorVersionRequest {
                    transmitter_id: TransmitterId(1),
                    versions: vec![PROTOCOL_VERSION],
                },
            )))
            .write(&encoded(&Telegram::DistributorVersionAnswer(
                DistributorVersionAnswer {
                    version: PROTOCOL_VERSION,
                    transmitter_id: TransmitterId(2),
                },
            )))
            .read(&encoded(&Telegram::DistributorConnectionParametersRequest(
                their_params(),
            )))
            .write(&encoded(&Telegram::DistributorConnectionParametersAnswer(
                agreed.parameters(),
            )))
            .build();
        let (neighbor, result) = accept_distributor(&mut acceptor, TransmitterId(2), &local)
            .await
            .unwrap();
        assert_eq!(neighbor, TransmitterId(1));
        assert_eq!(result, agreed);
    }

    #[tokio::test]
    async fn distributor_claiming_own_id_is_refused() {
        let mut acceptor = Builder::new()
            .read(&encoded(&Telegram::DistributorVersionRequest(
                DistributorVersionRequest {
                    transmitter_id: TransmitterId(2),
                    versions: vec![PROTOCOL_VERSION],
                },
            )))
            .write(&encoded(&Telegram::DistributorVersionAnswer(
                DistributorVersionAnswer {
                    version: -1,
                    transmitter_id: TransmitterId(2),
                },
            )))
            .build();

        assert!(matches!(
            accept_distributor(&mut acceptor, TransmitterId(2), &settings()).await,
            Err(LinkError::Handshake(_))
        ));
    }

    #[test]
    fn queue_sends_higher_classes_first() {
        let mut queue = OutboundQueue::new(1 << 20);
        let data = Telegram::ApplicationData(DataFragment {
            base: BaseSubscriptionInfo::live(1, 2),
            data_index: DataIndex::from_raw(4),
            delayed: false,
            total: 1,
            head: dvmesh_proto::FragmentHead::First(RecordMetadata::default()),
            chunk: vec![1, 2, 3],
        });
        let routing = Telegram::BestPathUpdate(dvmesh_proto::BestPathUpdate { updates: vec![] });
        let system = Telegram::KeepAlive(KeepAlive);

        queue.push(&data).unwrap();
        queue.push(&routing).unwrap();
        queue.push(&system).unwrap();

        assert_eq!(queue.pop().unwrap(), encoded(&system));
        assert_eq!(queue.pop().unwrap(), encoded(&routing));
        assert_eq!(queue.pop().unwrap(), encoded(&data));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
        assert_eq!(queue.fill_percent(), 0);
    }

    #[test]
    fn queue_fill_level() {
        let keep_alive = Telegram::KeepAlive(KeepAlive);
        let mut queue = OutboundQueue::new(HEADER_LEN * 4);

        queue.push(&keep_alive).unwrap();
        assert_eq!(queue.fill_percent(), 25);
        assert!(queue.has_room());

        for _ in 0..4 {
            queue.push(&keep_alive).unwrap();
        }
        assert_eq!(queue.fill_percent(), 100);
        assert!(!queue.has_room());
    }

    fn monitor() -> ThroughputMonitor {
        ThroughputMonitor::new(&LinkSettings {
            fill_percent: 90,
            min_throughput: 1000,
            throughput_interval: Duration::from_secs(10),
            ..LinkSettings::default()
        })
    }

    #[test]
    fn monitor_probes_only_when_full() {
        let mut m = monitor();
        assert!(!m.should_probe(50));
        assert!(m.should_probe(90));

        m.probe_sent(Instant::now());
        assert!(!m.should_probe(100));
    }

    #[test]
    fn healthy_throughput_passes() {
        let mut m = monitor();
        let t0 = Instant::now();

        m.probe_sent(t0);
        m.record_sent(5000);
        let measured = m.probe_answered(t0 + Duration::from_secs(1)).unwrap();

        assert_eq!(measured, Some(5000));
    }

    #[test]
    fn slow_link_fails_after_interval() {
        let mut m = monitor();
        let t0 = Instant::now();

        m.probe_sent(t0);
        m.record_sent(100);
        assert_eq!(m.probe_answered(t0 + Duration::from_secs(2)).unwrap(), Some(50));

        let t1 = t0 + Duration::from_secs(5);
        m.probe_sent(t1);
        m.record_sent(100);
        let err = m.probe_answered(t0 + Duration::from_secs(12)).unwrap_err();

        assert!(matches!(err, LinkHealthError::ThroughputTooLow { minimum: 1000, .. }));
    }

    #[test]
    fn relief_resets_slow_period() {
        let mut m = monitor();
        let t0 = Instant::now();

        m.probe_sent(t0);
        m.record_sent(100);
        m.probe_answered(t0 + Duration::from_secs(2)).unwrap();
        m.relieved();

        let t1 = t0 + Duration::from_secs(9);
        m.probe_sent(t1);
        m.record_sent(100);
        assert!(m.probe_answered(t0 + Duration::from_secs(12)).is_ok());
    }

    #[test]
    fn unanswered_probe_fails_after_interval() {
        let mut m = monitor();
        let t0 = Instant::now();

        m.probe_sent(t0);
        assert!(m.check(t0 + Duration::from_secs(5)).is_ok());
        assert!(m.check(t0 + Duration::from_secs(10)).is_err());
    }

    fn fast_settings() -> LinkSettings {
        LinkSettings {
            keep_alive_send: Duration::from_millis(50),
            keep_alive_receive: Duration::from_millis(300),
            ..LinkSettings::default()
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn running_link_answers_probes_and_reassembles() {
        let (ours, mut theirs) = tokio::io::duplex(1 << 16);
        let (tx, mut events) = mpsc::channel(16);
        let peer = LinkPeer::Distributor(TransmitterId(2));
        spawn_link(ours, peer, fast_settings(), tx);

        let LinkEvent::Up { handle, .. } = next_event(&mut events).await else {
            panic!("expected link up");
        };
        assert_eq!(handle.peer(), peer);

        let probe = TelegramTime { sent_at_ms: 42 };
        write_telegram(&mut theirs, &Telegram::DistributorTelegramTimeRequest(probe))
            .await
            .unwrap();
        let answer = loop {
            match read_telegram(&mut theirs).await.unwrap() {
                Telegram::DistributorKeepAlive(_) => continue,
                other => break other,
            }
        };
        assert_eq!(answer, Telegram::DistributorTelegramTimeAnswer(probe));

        let record = Record {
            base: BaseSubscriptionInfo::live(7, 1),
            data_index: DataIndex::from_raw(8),
            delayed: false,
            metadata: RecordMetadata::default(),
            data: (0..=255).collect(),
        };
        for fragment in Fragmenter::new(100).unwrap().split(&record).unwrap() {
            let data = dvmesh_proto::TransmitterData {
                direction: DataDirection::TowardSource,
                fragment,
            };
            write_telegram(&mut theirs, &Telegram::TransmitterData(data))
                .await
                .unwrap();
        }
        match next_event(&mut events).await {
            LinkEvent::Record {
                direction, record: got, ..
            } => {
                assert_eq!(direction, Some(DataDirection::TowardSource));
                assert_eq!(got, record);
            }
            other => panic!("unexpected {other:?}"),
        }

        handle
            .send(Telegram::BestPathUpdate(dvmesh_proto::BestPathUpdate {
                updates: vec![],
            }))
            .await
            .unwrap();
        let sent = loop {
            match read_telegram(&mut theirs).await.unwrap() {
                Telegram::DistributorKeepAlive(_) => continue,
                other => break other,
            }
        };
        assert!(matches!(sent, Telegram::BestPathUpdate(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (tx, mut events) = mpsc::channel(16);
        spawn_link(ours, LinkPeer::Application(SubscriberId(3)), fast_settings(), tx);

        assert!(matches!(next_event(&mut events).await, LinkEvent::Up { .. }));
        match next_event(&mut events).await {
            LinkEvent::Down {
                error: LinkError::Health(LinkHealthError::ReceiveTimeout { .. }),
                ..
            } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_termination_ends_link() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (tx, mut events) = mpsc::channel(16);
        let task = spawn_link(ours, LinkPeer::Application(SubscriberId(3)), fast_settings(), tx);
        let handle = match next_event(&mut events).await {
            LinkEvent::Up { handle, .. } => handle,
            other => panic!("unexpected {other:?}"),
        };
        assert!(!handle.is_closed());

        write_telegram(
            &mut theirs,
            &Telegram::Terminate(LinkClosure {
                reason: "bye".to_string(),
            }),
        )
        .await
        .unwrap();

        match next_event(&mut events).await {
            LinkEvent::Down {
                error: LinkError::Closed { reason },
                ..
            } => assert_eq!(reason, "bye"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handle.is_closed());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
