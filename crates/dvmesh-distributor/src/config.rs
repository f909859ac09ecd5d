//! Distributor configuration.
//!
//! Defaults, overlaid by an optional JSON file named in `DVMESH_CONFIG`,
//! overlaid by individual environment variables.

use anyhow::{bail, Context, Result};
use dvmesh_core::{SubscriptionDirection, TransmitterId};
use dvmesh_proto::{ConnectionParameters, Fragmenter};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default port distributors listen on for each other.
pub const DEFAULT_PEER_PORT: u16 = 8082;

/// Distributor configuration.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// This distributor's id
    pub transmitter_id: TransmitterId,

    /// Address applications connect to
    pub app_listen: String,

    /// Address other distributors connect to
    pub peer_listen: String,

    /// Distributors to connect to
    pub neighbors: Vec<NeighborConfig>,

    /// Static potential central distributors per object
    pub centrals: Vec<CentralConfig>,

    /// Attribute-group usage ids and what they stand for
    pub aspects: Vec<AspectConfig>,

    /// Origins refused access to objects
    pub denied: Vec<AccessConfig>,

    /// Link health settings
    pub link: LinkSettings,

    /// Largest data chunk per fragment
    pub max_segment: usize,
}

/// A configured neighbour distributor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NeighborConfig {
    /// Neighbour id
    pub id: u64,

    /// `tcp://host:port` or `host:port`
    pub address: String,

    /// Link weight
    #[serde(default = "default_weight")]
    pub weight: u16,
}

fn default_weight() -> u16 {
    1
}

/// Potential central distributors of one object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CentralConfig {
    /// Object id
    pub object_id: u64,

    /// Distributors that may be central for the object
    pub transmitters: Vec<u64>,
}

/// Meaning of an attribute-group usage id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AspectConfig {
    /// Usage id as found in channel identities
    pub usage_id: u64,

    /// Attribute group
    pub attribute_group: u64,

    /// Aspect
    pub aspect: u64,
}

/// Distributors whose applications may not use an object's channels.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessConfig {
    /// Object id
    pub object_id: u64,

    /// Refused origin distributors
    pub transmitters: Vec<u64>,

    /// Side refused; both when absent
    #[serde(default)]
    pub direction: Option<SubscriptionDirection>,
}

impl AccessConfig {
    /// Whether this entry refuses `origin` on `direction` of the object.
    #[must_use]
    pub fn denies(&self, object_id: u64, direction: SubscriptionDirection, origin: TransmitterId) -> bool {
        self.object_id == object_id
            && (self.direction.is_none() || self.direction == Some(direction))
            && self.transmitters.contains(&origin.0)
    }
}

/// Link health settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Send a keep-alive after this long without outgoing traffic
    pub keep_alive_send: Duration,

    /// Terminate after this long without incoming traffic
    pub keep_alive_receive: Duration,

    /// Outbound fill percentage that starts throughput measurement
    pub fill_percent: u8,

    /// How long throughput may stay below the minimum
    pub throughput_interval: Duration,

    /// Minimum throughput in bytes per second
    pub min_throughput: u32,

    /// Outbound queue capacity in bytes
    pub send_buffer: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            keep_alive_send: Duration::from_millis(20_000),
            keep_alive_receive: Duration::from_millis(60_000),
            fill_percent: 90,
            throughput_interval: Duration::from_secs(60),
            min_throughput: 3000,
            send_buffer: 1024 * 1024,
        }
    }
}

impl LinkSettings {
    /// Parameters offered in a connection-parameter telegram.
    #[must_use]
    pub fn parameters(&self) -> ConnectionParameters {
        ConnectionParameters {
            keep_alive_send_ms: u64::try_from(self.keep_alive_send.as_millis()).unwrap_or(u64::MAX),
            keep_alive_receive_ms: u64::try_from(self.keep_alive_receive.as_millis())
                .unwrap_or(u64::MAX),
            fill_percent: self.fill_percent,
            throughput_interval_secs: u16::try_from(self.throughput_interval.as_secs())
                .unwrap_or(u16::MAX),
            min_throughput: self.min_throughput,
        }
    }

    /// Settings after negotiating with the other side's parameters.
    #[must_use]
    pub fn negotiated(&self, theirs: ConnectionParameters) -> Self {
        let agreed = self.parameters().negotiate(theirs);
        Self {
            keep_alive_send: Duration::from_millis(agreed.keep_alive_send_ms),
            keep_alive_receive: Duration::from_millis(agreed.keep_alive_receive_ms),
            fill_percent: agreed.fill_percent,
            throughput_interval: Duration::from_secs(u64::from(agreed.throughput_interval_secs)),
            min_throughput: agreed.min_throughput,
            send_buffer: self.send_buffer,
        }
    }
}

/// Shape of the optional JSON configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    transmitter_id: Option<u64>,
    app_listen: Option<String>,
    peer_listen: Option<String>,
    neighbors: Option<Vec<NeighborConfig>>,
    centrals: Option<Vec<CentralConfig>>,
    aspects: Option<Vec<AspectConfig>>,
    denied: Option<Vec<AccessConfig>>,
    keepalive_send_ms: Option<u64>,
    keepalive_receive_ms: Option<u64>,
    send_fill_percent: Option<u8>,
    throughput_interval_secs: Option<u64>,
    min_throughput: Option<u32>,
    max_segment: Option<usize>,
    send_buffer: Option<usize>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            transmitter_id: TransmitterId(0),
            app_listen: "0.0.0.0:8083".to_string(),
            peer_listen: format!("0.0.0.0:{DEFAULT_PEER_PORT}"),
            neighbors: Vec::new(),
            centrals: Vec::new(),
            aspects: Vec::new(),
            denied: Vec::new(),
            link: LinkSettings::default(),
            max_segment: 4096,
        }
    }
}

impl DistributorConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DVMESH_CONFIG`: JSON file applied before the variables below
    /// - `DVMESH_TRANSMITTER_ID`: this distributor's id (required, non-zero)
    /// - `DVMESH_APP_LISTEN` / `DVMESH_PEER_LISTEN`: listen addresses
    /// - `DVMESH_NEIGHBORS`: JSON array of `{"id", "address", "weight"}`
    /// - `DVMESH_CENTRALS`: JSON array of `{"object_id", "transmitters"}`
    /// - `DVMESH_ASPECTS`: JSON array of `{"usage_id", "attribute_group", "aspect"}`
    /// - `DVMESH_DENY`: JSON array of `{"object_id", "transmitters", "direction"}`,
    ///   `direction` being `"Sender"`, `"Receiver"` or absent for both
    /// - `DVMESH_KEEPALIVE_SEND_MS`, `DVMESH_KEEPALIVE_RECEIVE_MS`,
    ///   `DVMESH_SEND_FILL_PERCENT`, `DVMESH_THROUGHPUT_INTERVAL_SECS`,
    ///   `DVMESH_MIN_THROUGHPUT`, `DVMESH_SEND_BUFFER`: link settings
    /// - `DVMESH_MAX_SEGMENT`: largest data chunk per fragment
    ///
    /// # Errors
    ///
    /// Returns error if a value does not parse or the configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a value does not parse or the configuration is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("DVMESH_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }

        if let Some(id) = lookup("DVMESH_TRANSMITTER_ID") {
            config.transmitter_id =
                TransmitterId(id.parse().context("Invalid DVMESH_TRANSMITTER_ID")?);
        }

        if let Some(addr) = lookup("DVMESH_APP_LISTEN") {
            config.app_listen = addr;
        }

        if let Some(addr) = lookup("DVMESH_PEER_LISTEN") {
            config.peer_listen = addr;
        }

        if let Some(json) = lookup("DVMESH_NEIGHBORS") {
            config.neighbors =
                serde_json::from_str(&json).context("Invalid DVMESH_NEIGHBORS JSON")?;
        }

        if let Some(json) = lookup("DVMESH_CENTRALS") {
            config.centrals = serde_json::from_str(&json).context("Invalid DVMESH_CENTRALS JSON")?;
        }

        if let Some(json) = lookup("DVMESH_ASPECTS") {
            config.aspects = serde_json::from_str(&json).context("Invalid DVMESH_ASPECTS JSON")?;
        }

        if let Some(json) = lookup("DVMESH_DENY") {
            config.denied = serde_json::from_str(&json).context("Invalid DVMESH_DENY JSON")?;
        }

        if let Some(ms) = lookup("DVMESH_KEEPALIVE_SEND_MS") {
            config.link.keep_alive_send =
                Duration::from_millis(ms.parse().context("Invalid DVMESH_KEEPALIVE_SEND_MS")?);
        }

        if let Some(ms) = lookup("DVMESH_KEEPALIVE_RECEIVE_MS") {
            config.link.keep_alive_receive =
                Duration::from_millis(ms.parse().context("Invalid DVMESH_KEEPALIVE_RECEIVE_MS")?);
        }

        if let Some(pct) = lookup("DVMESH_SEND_FILL_PERCENT") {
            config.link.fill_percent = pct.parse().context("Invalid DVMESH_SEND_FILL_PERCENT")?;
        }

        if let Some(secs) = lookup("DVMESH_THROUGHPUT_INTERVAL_SECS") {
            config.link.throughput_interval = Duration::from_secs(
                secs.parse()
                    .context("Invalid DVMESH_THROUGHPUT_INTERVAL_SECS")?,
            );
        }

        if let Some(min) = lookup("DVMESH_MIN_THROUGHPUT") {
            config.link.min_throughput = min.parse().context("Invalid DVMESH_MIN_THROUGHPUT")?;
        }

        if let Some(size) = lookup("DVMESH_SEND_BUFFER") {
            config.link.send_buffer = size.parse().context("Invalid DVMESH_SEND_BUFFER")?;
        }

        if let Some(size) = lookup("DVMESH_MAX_SEGMENT") {
            config.max_segment = size.parse().context("Invalid DVMESH_MAX_SEGMENT")?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: FileConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        if let Some(id) = file.transmitter_id {
            self.transmitter_id = TransmitterId(id);
        }
        if let Some(addr) = file.app_listen {
            self.app_listen = addr;
        }
        if let Some(addr) = file.peer_listen {
            self.peer_listen = addr;
        }
        if let Some(neighbors) = file.neighbors {
            self.neighbors = neighbors;
        }
        if let Some(centrals) = file.centrals {
            self.centrals = centrals;
        }
        if let Some(aspects) = file.aspects {
            self.aspects = aspects;
        }
        if let Some(denied) = file.denied {
            self.denied = denied;
        }
        if let Some(ms) = file.keepalive_send_ms {
            self.link.keep_alive_send = Duration::from_millis(ms);
        }
        if let Some(ms) = file.keepalive_receive_ms {
            self.link.keep_alive_receive = Duration::from_millis(ms);
        }
        if let Some(pct) = file.send_fill_percent {
            self.link.fill_percent = pct;
        }
        if let Some(secs) = file.throughput_interval_secs {
            self.link.throughput_interval = Duration::from_secs(secs);
        }
        if let Some(min) = file.min_throughput {
            self.link.min_throughput = min;
        }
        if let Some(size) = file.send_buffer {
            self.link.send_buffer = size;
        }
        if let Some(size) = file.max_segment {
            self.max_segment = size;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.transmitter_id.0 == 0 {
            bail!("DVMESH_TRANSMITTER_ID must be set to a non-zero id");
        }
        if self.link.fill_percent == 0 || self.link.fill_percent > 100 {
            bail!("DVMESH_SEND_FILL_PERCENT must be between 1 and 100");
        }
        if self.link.keep_alive_send >= self.link.keep_alive_receive {
            bail!("keep-alive send interval must be shorter than the receive timeout");
        }
        Fragmenter::new(self.max_segment).context("Invalid DVMESH_MAX_SEGMENT")?;
        for neighbor in &self.neighbors {
            if neighbor.id == self.transmitter_id.0 {
                bail!("neighbor {} has this distributor's own id", neighbor.id);
            }
            parse_peer_address(&neighbor.address)?;
        }
        Ok(())
    }
}

/// Parse a peer address into host and port.
///
/// Accepts `tcp://host:port`, `dvmesh://host:port` or bare `host[:port]`.
///
/// # Errors
///
/// Returns error if the address is malformed or uses another scheme.
pub fn parse_peer_address(input: &str) -> Result<(String, u16), ConfigError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| ConfigError::InvalidPeerAddress(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "dvmesh" => {}
            scheme => {
                return Err(ConfigError::InvalidPeerAddress(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidPeerAddress(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PEER_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::InvalidPeerAddress(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PEER_PORT,
        Some(port) => port.parse().map_err(|_| {
            ConfigError::InvalidPeerAddress(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(ConfigError::InvalidPeerAddress(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Configuration errors outside of `anyhow` contexts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Malformed neighbour address
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),
}
