//! Per-channel data indices.
//!
//! A `DataIndex` is a 64-bit sequence number owned by the sender of a
//! channel. Its layout is:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | 63..32 | time part (seconds since UNIX epoch when the sender's sequence started) |
//! | 31..2 | 30-bit sequence counter |
//! | 1..0 | flags |
//!
//! Indices never decrease for a given sender. Receivers only observe gaps;
//! they do not reject or re-request records.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::ids::BaseSubscriptionInfo;

const SEQUENCE_BITS: u32 = 30;
const FLAG_BITS: u32 = 2;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;

/// A 64-bit, monotonically non-decreasing record index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DataIndex(u64);

impl DataIndex {
    /// Largest value of the sequence counter.
    pub const MAX_SEQUENCE: u32 = (1 << SEQUENCE_BITS) - 1;

    /// Wrap a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an index from its parts.
    ///
    /// # Errors
    ///
    /// Returns error if `sequence` exceeds 30 bits or `flags` exceeds 2 bits.
    pub fn from_parts(time_part: u32, sequence: u32, flags: u8) -> Result<Self, DataIndexError> {
        if sequence > Self::MAX_SEQUENCE {
            return Err(DataIndexError::SequenceOverflow(sequence));
        }
        if u64::from(flags) > FLAG_MASK {
            return Err(DataIndexError::InvalidFlags(flags));
        }
        Ok(Self(
            (u64::from(time_part) << 32)
                | (u64::from(sequence) << FLAG_BITS)
                | u64::from(flags),
        ))
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Time-like high part.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn time_part(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// 30-bit sequence counter.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn sequence(self) -> u32 {
        ((self.0 >> FLAG_BITS) & SEQUENCE_MASK) as u32
    }

    /// 2-bit flag field.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn flags(self) -> u8 {
        (self.0 & FLAG_MASK) as u8
    }

    /// The time part as a wall-clock instant.
    #[must_use]
    pub fn started_at(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::from(self.time_part()), 0).single()
    }

    /// Index with the flags cleared; used for ordering comparisons.
    #[must_use]
    pub const fn without_flags(self) -> Self {
        Self(self.0 & !FLAG_MASK)
    }
}

impl fmt::Display for DataIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}",
            self.time_part(),
            self.sequence(),
            self.flags()
        )
    }
}

/// Index generator owned by the sender of one channel.
#[derive(Debug, Clone)]
pub struct DataIndexSequencer {
    time_part: u32,
    sequence: u32,
}

impl DataIndexSequencer {
    /// Start a sequence with the given time part.
    #[must_use]
    pub const fn new(time_part: u32) -> Self {
        Self {
            time_part,
            sequence: 0,
        }
    }

    /// Start a sequence stamped with the current wall-clock second.
    #[must_use]
    pub fn starting_now() -> Self {
        let secs = Utc::now().timestamp();
        Self::new(u32::try_from(secs).unwrap_or(u32::MAX))
    }

    /// Produce the next index.
    ///
    /// Guarantees the returned index is greater than any previously returned one.
    /// When the 30-bit counter is exhausted the time part is advanced.
    pub fn next_index(&mut self) -> DataIndex {
        if self.sequence == DataIndex::MAX_SEQUENCE {
            self.time_part = self.time_part.saturating_add(1);
            self.sequence = 0;
        }
        self.sequence += 1;
        DataIndex(
            (u64::from(self.time_part) << 32) | (u64::from(self.sequence) << FLAG_BITS),
        )
    }
}

/// What a receiver observed when comparing an index with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexObservation {
    /// First index seen on the channel
    First,
    /// Directly follows the previous index
    InOrder,
    /// One or more sequence numbers were skipped
    Gap {
        /// Number of missing sequence numbers
        missing: u32,
    },
    /// The sender restarted (new time part)
    Restarted,
    /// Not newer than the previous index
    Regression,
}

/// Gap and reordering observer for received records.
///
/// Purely observational: it counts anomalies and never rejects a record.
#[derive(Debug, Default)]
pub struct SequenceObserver {
    last: HashMap<BaseSubscriptionInfo, DataIndex>,
    gaps: u64,
    regressions: u64,
}

impl SequenceObserver {
    /// Create an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the arrival of `index` on `channel`.
    pub fn observe(&mut self, channel: BaseSubscriptionInfo, index: DataIndex) -> IndexObservation {
        let index = index.without_flags();
        let Some(previous) = self.last.get(&channel).copied() else {
            self.last.insert(channel, index);
            return IndexObservation::First;
        };

        let observation = if index <= previous {
            self.regressions += 1;
            IndexObservation::Regression
        } else if index.time_part() != previous.time_part() {
            IndexObservation::Restarted
        } else if index.sequence() == previous.sequence() + 1 {
            IndexObservation::InOrder
        } else {
            self.gaps += 1;
            IndexObservation::Gap {
                missing: index.sequence() - previous.sequence() - 1,
            }
        };

        if observation != IndexObservation::Regression {
            self.last.insert(channel, index);
        }
        if observation != IndexObservation::InOrder {
            tracing::debug!(
                %channel,
                previous = %previous,
                index = %index,
                ?observation,
                "Data index anomaly"
            );
        }
        observation
    }

    /// Forget the channel, e.g. after unsubscription.
    pub fn forget(&mut self, channel: &BaseSubscriptionInfo) {
        self.last.remove(channel);
    }

    /// Total number of gaps observed.
    #[must_use]
    pub fn gap_count(&self) -> u64 {
        self.gaps
    }

    /// Total number of regressions observed.
    #[must_use]
    pub fn regression_count(&self) -> u64 {
        self.regressions
    }
}

/// Errors constructing a data index.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataIndexError {
    /// Sequence counter does not fit in 30 bits
    #[error("sequence counter {0} exceeds 30 bits")]
    SequenceOverflow(u32),
    /// Flags do not fit in 2 bits
    #[error("flags {0:#x} exceed 2 bits")]
    InvalidFlags(u8),
}
