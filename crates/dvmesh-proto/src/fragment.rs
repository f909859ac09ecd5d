//! Splitting records across data telegrams and reassembling them.
//!
//! ## Payload layout
//!
//! ```text
//! index: u16 | total: u16 | channel: 18 bytes | [direction: u8] | data index: u64 | delayed: u8
//! index == 0 only: timestamp: i64 | error code: u8 | bitmap length: u8 | bitmap
//! chunk length: u32 | chunk
//! ```
//!
//! The direction byte is only present between distributors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU16;

use dvmesh_core::{BaseSubscriptionInfo, DataIndex, SequenceObserver};

use crate::telegrams::{DataDirection, WirePayload};
use crate::wire::{CodecError, DecodeError, FramingError, WireReader, WireWriter, MAX_PAYLOAD_LEN};

/// Largest changed-attribute bitmap, in bytes.
pub const MAX_BITMAP_LEN: usize = u8::MAX as usize;

/// Fragment payload bytes besides the chunk, worst case (first fragment
/// between distributors with a full bitmap).
const MAX_FRAGMENT_OVERHEAD: usize =
    2 + 2 + BaseSubscriptionInfo::ENCODED_LEN + 1 + 8 + 1 + 8 + 1 + 1 + MAX_BITMAP_LEN + 4;

/// Largest segment size that keeps every fragment within a 16-bit payload.
pub const MAX_SEGMENT_SIZE: usize = MAX_PAYLOAD_LEN - MAX_FRAGMENT_OVERHEAD;

/// Values of [`RecordMetadata::error_code`].
///
/// Records with a non-zero code carry no data; they tell a receiver why
/// no data arrives.
pub mod error_code {
    /// Regular data
    pub const DATA: u8 = 0;
    /// No Source was found for the channel
    pub const NO_SOURCE: u8 = 1;
    /// The receiver lacks the rights to read the channel
    pub const NO_RIGHTS: u8 = 2;
    /// The registration was rejected
    pub const INVALID_SUBSCRIPTION: u8 = 3;
    /// More than one Source claims the channel
    pub const MULTIPLE_SOURCES: u8 = 4;
}

/// Record metadata carried by the first fragment only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Record time in milliseconds since the UNIX epoch
    pub timestamp_ms: i64,
    /// 0 means data; anything else explains why there is none
    pub error_code: u8,
    /// One bit per attribute, 8 per byte, most significant bit first
    pub changed: Vec<u8>,
}

impl RecordMetadata {
    /// Whether attribute `n` (declaration order) changed.
    #[must_use]
    pub fn attribute_changed(&self, n: usize) -> bool {
        self.changed
            .get(n / 8)
            .is_some_and(|byte| byte & (0x80 >> (n % 8)) != 0)
    }

    /// Pack a per-attribute changed flag list into a bitmap.
    #[must_use]
    pub fn pack_changed(flags: &[bool]) -> Vec<u8> {
        let mut bitmap = vec![0u8; flags.len().div_ceil(8)];
        for (n, _) in flags.iter().enumerate().filter(|(_, f)| **f) {
            bitmap[n / 8] |= 0x80 >> (n % 8);
        }
        bitmap
    }
}

/// Position-dependent part of a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentHead {
    /// Fragment 0, carrying the record metadata
    First(RecordMetadata),
    /// Any later fragment
    Next(NonZeroU16),
}

/// One data telegram's worth of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFragment {
    /// Channel
    pub base: BaseSubscriptionInfo,
    /// Index shared by all fragments of the record
    pub data_index: DataIndex,
    /// Whether the record arrives late
    pub delayed: bool,
    /// Number of fragments in the record
    pub total: u16,
    /// Metadata or fragment position
    pub head: FragmentHead,
    /// Data bytes
    pub chunk: Vec<u8>,
}

impl DataFragment {
    /// Fragment number within the record.
    #[must_use]
    pub fn index(&self) -> u16 {
        match &self.head {
            FragmentHead::First(_) => 0,
            FragmentHead::Next(n) => n.get(),
        }
    }

    pub(crate) fn encoded_len_with(&self, distributor: bool) -> usize {
        let head = match &self.head {
            FragmentHead::First(meta) => 8 + 1 + 1 + meta.changed.len(),
            FragmentHead::Next(_) => 0,
        };
        2 + 2
            + BaseSubscriptionInfo::ENCODED_LEN
            + usize::from(distributor)
            + 8
            + 1
            + head
            + 4
            + self.chunk.len()
    }

    pub(crate) fn write_with(
        &self,
        w: &mut WireWriter,
        direction: Option<DataDirection>,
    ) -> Result<(), FramingError> {
        w.put_u16(self.index());
        w.put_u16(self.total);
        w.put_base(&self.base);
        if let Some(direction) = direction {
            w.put_u8(direction as u8);
        }
        w.put_u64(self.data_index.raw());
        w.put_bool(self.delayed);
        if let FragmentHead::First(meta) = &self.head {
            let bitmap_len = u8::try_from(meta.changed.len()).map_err(|_| FramingError::FieldTooLarge {
                field: "changed bitmap",
                len: meta.changed.len(),
                max: MAX_BITMAP_LEN,
            })?;
            w.put_i64(meta.timestamp_ms);
            w.put_u8(meta.error_code);
            w.put_u8(bitmap_len);
            w.put_bytes(&meta.changed);
        }
        let chunk_len = u32::try_from(self.chunk.len()).map_err(|_| FramingError::FieldTooLarge {
            field: "chunk",
            len: self.chunk.len(),
            max: u32::MAX as usize,
        })?;
        w.put_u32(chunk_len);
        w.put_bytes(&self.chunk);
        Ok(())
    }

    pub(crate) fn read_with(
        r: &mut WireReader<'_>,
        distributor: bool,
    ) -> Result<(Option<DataDirection>, Self), CodecError> {
        let index = r.u16()?;
        let total = r.u16()?;
        if index >= total {
            return Err(DecodeError::InvalidValue {
                field: "fragment index",
                value: u64::from(index),
            }
            .into());
        }
        let base = r.base()?;
        let direction = if distributor {
            let raw = r.u8()?;
            Some(DataDirection::from_u8(raw).ok_or(DecodeError::InvalidValue {
                field: "data direction",
                value: u64::from(raw),
            })?)
        } else {
            None
        };
        let data_index = DataIndex::from_raw(r.u64()?);
        let delayed = r.bool("delayed")?;
        let head = match NonZeroU16::new(index) {
            Some(n) => FragmentHead::Next(n),
            None => {
                let timestamp_ms = r.i64()?;
                let error_code = r.u8()?;
                let bitmap_len = usize::from(r.u8()?);
                FragmentHead::First(RecordMetadata {
                    timestamp_ms,
                    error_code,
                    changed: r.bytes(bitmap_len)?.to_vec(),
                })
            }
        };
        let chunk_len = r.u32()? as usize;
        let chunk = r.bytes(chunk_len)?.to_vec();

        Ok((
            direction,
            Self {
                base,
                data_index,
                delayed,
                total,
                head,
                chunk,
            },
        ))
    }
}

impl WirePayload for DataFragment {
    fn encoded_len(&self) -> usize {
        self.encoded_len_with(false)
    }

    fn write(&self, w: &mut WireWriter) -> Result<(), FramingError> {
        self.write_with(w, None)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self::read_with(r, false)?.1)
    }
}

/// A complete application record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Channel
    pub base: BaseSubscriptionInfo,
    /// Record index
    pub data_index: DataIndex,
    /// Whether the record arrives late
    pub delayed: bool,
    /// Timestamp, error code and changed bitmap
    pub metadata: RecordMetadata,
    /// Record bytes
    pub data: Vec<u8>,
}

impl Record {
    /// Check the record's consistency.
    ///
    /// # Errors
    ///
    /// Returns a warning if the record claims success but carries no data.
    pub fn check_quality(&self) -> Result<(), DataQualityWarning> {
        if self.data.is_empty() && self.metadata.error_code == error_code::DATA {
            return Err(DataQualityWarning {
                base: self.base,
                data_index: self.data_index,
            });
        }
        Ok(())
    }
}

/// A record declares success but carries no data. Delivery proceeds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record {data_index} on {base} has error code 0 but no data")]
pub struct DataQualityWarning {
    /// Channel
    pub base: BaseSubscriptionInfo,
    /// Record index
    pub data_index: DataIndex,
}

/// Fragmentation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    /// Segment size is zero or leaves no room for fragment headers
    #[error("segment size {size} must be between 1 and {max}")]
    InvalidSegmentSize {
        /// Requested size
        size: usize,
        /// Largest allowed size
        max: usize,
    },
    /// The record needs more than 65535 fragments
    #[error("record of {len} bytes needs more than 65535 fragments")]
    RecordTooLarge {
        /// Record length
        len: usize,
    },
    /// A fragment contradicts the record being assembled
    #[error("inconsistent fragment for {base}: {reason}")]
    Inconsistent {
        /// Channel
        base: BaseSubscriptionInfo,
        /// What disagreed
        reason: &'static str,
    },
}

/// Splits records into fragments of at most `max_segment` data bytes.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    max_segment: usize,
}

impl Fragmenter {
    /// Create a fragmenter.
    ///
    /// # Errors
    ///
    /// Returns error if `max_segment` is zero or exceeds [`MAX_SEGMENT_SIZE`].
    pub fn new(max_segment: usize) -> Result<Self, FragmentError> {
        if max_segment == 0 || max_segment > MAX_SEGMENT_SIZE {
            return Err(FragmentError::InvalidSegmentSize {
                size: max_segment,
                max: MAX_SEGMENT_SIZE,
            });
        }
        Ok(Self { max_segment })
    }

    /// Configured segment size.
    #[must_use]
    pub fn max_segment(&self) -> usize {
        self.max_segment
    }

    /// Number of fragments a record of `len` bytes needs; at least one.
    #[must_use]
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_segment).max(1)
    }

    /// Split a record.
    ///
    /// # Errors
    ///
    /// Returns error if the record needs more than 65535 fragments.
    pub fn split(&self, record: &Record) -> Result<Vec<DataFragment>, FragmentError> {
        let count = self.fragment_count(record.data.len());
        let total = u16::try_from(count).map_err(|_| FragmentError::RecordTooLarge {
            len: record.data.len(),
        })?;

        let mut chunks: Vec<&[u8]> = record.data.chunks(self.max_segment).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        Ok(chunks
            .into_iter()
            .zip(0..total)
            .map(|(chunk, index)| DataFragment {
                base: record.base,
                data_index: record.data_index,
                delayed: record.delayed,
                total,
                head: match NonZeroU16::new(index) {
                    Some(n) => FragmentHead::Next(n),
                    None => FragmentHead::First(record.metadata.clone()),
                },
                chunk: chunk.to_vec(),
            })
            .collect())
    }
}

#[derive(Debug)]
struct Partial {
    data_index: DataIndex,
    total: u16,
    delayed: bool,
    metadata: Option<RecordMetadata>,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl Partial {
    fn new(fragment: &DataFragment) -> Self {
        Self {
            data_index: fragment.data_index,
            total: fragment.total,
            delayed: fragment.delayed,
            metadata: None,
            chunks: vec![None; usize::from(fragment.total)],
            received: 0,
        }
    }
}

/// Reassembles records from fragments received on one link.
///
/// One buffer per channel: a fragment with a different data index discards
/// an incomplete record on the same channel.
#[derive(Debug, Default)]
pub struct Assembler {
    partial: HashMap<BaseSubscriptionInfo, Partial>,
    observer: SequenceObserver,
    quality_warnings: u64,
    discarded: u64,
}

impl Assembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment. Returns the record once all fragments arrived.
    ///
    /// # Errors
    ///
    /// Returns error if the fragment's total disagrees with the record being
    /// assembled; the buffer for the channel is discarded.
    pub fn push(&mut self, fragment: DataFragment) -> Result<Option<Record>, FragmentError> {
        let base = fragment.base;
        if fragment.index() >= fragment.total {
            return Err(FragmentError::Inconsistent {
                base,
                reason: "fragment index beyond total",
            });
        }

        let restart = match self.partial.get(&base) {
            Some(p) if p.data_index != fragment.data_index => {
                tracing::debug!(
                    channel = %base,
                    discarded = %p.data_index,
                    next = %fragment.data_index,
                    "Discarding incomplete record"
                );
                self.discarded += 1;
                true
            }
            Some(p) if p.total != fragment.total => {
                self.partial.remove(&base);
                self.discarded += 1;
                return Err(FragmentError::Inconsistent {
                    base,
                    reason: "fragment total changed within a record",
                });
            }
            Some(_) => false,
            None => true,
        };
        if restart {
            self.partial.insert(base, Partial::new(&fragment));
        }

        let Some(partial) = self.partial.get_mut(&base) else {
            return Ok(None);
        };
        let slot = usize::from(fragment.index());
        if partial.chunks[slot].is_some() {
            tracing::debug!(channel = %base, index = slot, "Duplicate fragment ignored");
            return Ok(None);
        }
        if let FragmentHead::First(meta) = fragment.head {
            partial.metadata = Some(meta);
        }
        partial.chunks[slot] = Some(fragment.chunk);
        partial.received += 1;

        if partial.received < usize::from(partial.total) {
            return Ok(None);
        }

        let Some(partial) = self.partial.remove(&base) else {
            return Ok(None);
        };
        let record = Record {
            base,
            data_index: partial.data_index,
            delayed: partial.delayed,
            metadata: partial.metadata.unwrap_or_default(),
            data: partial.chunks.into_iter().flatten().flatten().collect(),
        };

        if let Err(warning) = record.check_quality() {
            self.quality_warnings += 1;
            tracing::warn!(channel = %base, index = %record.data_index, "{warning}");
        }
        self.observer.observe(base, record.data_index);
        Ok(Some(record))
    }

    /// Number of records delivered despite a data-quality warning.
    #[must_use]
    pub fn quality_warnings(&self) -> u64 {
        self.quality_warnings
    }

    /// Number of incomplete records discarded.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Number of data-index gaps observed across channels.
    #[must_use]
    pub fn gap_count(&self) -> u64 {
        self.observer.gap_count()
    }

    /// Number of channels with an incomplete record.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegrams::Telegram;

    fn record(len: usize, error_code: u8) -> Record {
        Record {
            base: BaseSubscriptionInfo::live(11, 22),
            data_index: DataIndex::from_parts(1_700_000_000, 5, 0).unwrap(),
            delayed: false,
            metadata: RecordMetadata {
                timestamp_ms: 1_700_000_000_000,
                error_code,
                changed: RecordMetadata::pack_changed(&[true, false, true]),
            },
            data: (0..len).map(|i| u8::try_from(i % 251).unwrap_or(0)).collect(),
        }
    }

    #[test]
    fn fragment_count_is_ceiling() {
        let f = Fragmenter::new(100).unwrap();

        assert_eq!(f.fragment_count(0), 1);
        assert_eq!(f.fragment_count(1), 1);
        assert_eq!(f.fragment_count(100), 1);
        assert_eq!(f.fragment_count(101), 2);
        assert_eq!(f.fragment_count(1000), 10);
        assert_eq!(f.split(&record(1001, 0)).unwrap().len(), 11);
    }

    #[test]
    fn only_first_fragment_carries_metadata() {
        let fragments = Fragmenter::new(10).unwrap().split(&record(35, 0)).unwrap();

        assert!(matches!(fragments[0].head, FragmentHead::First(_)));
        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(usize::from(f.index()), i);
            assert_eq!(f.total, 4);
            if i > 0 {
                assert!(matches!(f.head, FragmentHead::Next(_)));
            }
        }
        assert_eq!(fragments[3].chunk.len(), 5);
    }

    #[test]
    fn reassembles_in_any_order() {
        let original = record(95, 0);
        let mut fragments = Fragmenter::new(10).unwrap().split(&original).unwrap();
        fragments.reverse();
        fragments.swap(2, 7);

        let mut assembler = Assembler::new();
        let mut done = None;
        for f in fragments {
            if let Some(r) = assembler.push(f).unwrap() {
                done = Some(r);
            }
        }

        assert_eq!(done, Some(original));
        assert_eq!(assembler.pending(), 0);
        assert_eq!(assembler.quality_warnings(), 0);
    }

    #[test]
    fn fragments_survive_the_codec() {
        let original = record(50, 0);
        let mut assembler = Assembler::new();
        let mut done = None;

        for f in Fragmenter::new(16).unwrap().split(&original).unwrap() {
            let bytes = Telegram::ApplicationData(f).encode().unwrap();
            let Telegram::ApplicationData(f) = Telegram::decode(&bytes).unwrap() else {
                panic!("wrong telegram type");
            };
            done = assembler.push(f).unwrap().or(done);
        }

        assert_eq!(done, Some(original));
    }

    #[test]
    fn new_index_discards_incomplete_record() {
        let fragmenter = Fragmenter::new(10).unwrap();
        let first = record(30, 0);
        let mut second = record(20, 0);
        second.data_index = DataIndex::from_parts(1_700_000_000, 6, 0).unwrap();

        let mut assembler = Assembler::new();
        let old = fragmenter.split(&first).unwrap();
        assert_eq!(assembler.push(old[0].clone()).unwrap(), None);
        assert_eq!(assembler.push(old[1].clone()).unwrap(), None);

        let mut done = None;
        for f in fragmenter.split(&second).unwrap() {
            done = assembler.push(f).unwrap().or(done);
        }
        // The stale last fragment of the first record starts a new buffer.
        assert_eq!(assembler.push(old[2].clone()).unwrap(), None);

        assert_eq!(done, Some(second));
        assert_eq!(assembler.discarded(), 1);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn empty_success_record_warns_but_delivers() {
        let mut assembler = Assembler::new();
        let empty = record(0, 0);

        for f in Fragmenter::new(10).unwrap().split(&empty).unwrap() {
            assert_eq!(assembler.push(f).unwrap(), Some(empty.clone()));
        }
        assert_eq!(assembler.quality_warnings(), 1);
    }

    #[test]
    fn empty_record_with_error_code_is_fine() {
        let no_source = record(0, 2);

        assert_eq!(no_source.check_quality(), Ok(()));
        let mut assembler = Assembler::new();
        for f in Fragmenter::new(10).unwrap().split(&no_source).unwrap() {
            assembler.push(f).unwrap();
        }
        assert_eq!(assembler.quality_warnings(), 0);
    }

    #[test]
    fn changing_total_is_inconsistent() {
        let mut fragments = Fragmenter::new(10).unwrap().split(&record(30, 0)).unwrap();
        let mut assembler = Assembler::new();
        assembler.push(fragments.remove(0)).unwrap();

        let mut bad = fragments.remove(0);
        bad.total = 5;

        assert!(matches!(
            assembler.push(bad),
            Err(FragmentError::Inconsistent { .. })
        ));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn segment_size_is_bounded() {
        assert!(Fragmenter::new(0).is_err());
        assert!(Fragmenter::new(MAX_SEGMENT_SIZE + 1).is_err());

        let f = Fragmenter::new(MAX_SEGMENT_SIZE).unwrap();
        let mut big = record(MAX_SEGMENT_SIZE, 0);
        big.metadata.changed = vec![0xFF; MAX_BITMAP_LEN];
        let first = f.split(&big).unwrap().remove(0);

        assert!(Telegram::ApplicationData(first).encode().is_ok());
    }

    #[test]
    fn index_beyond_total_is_rejected() {
        let mut bytes = Telegram::ApplicationData(
            Fragmenter::new(10).unwrap().split(&record(5, 0)).unwrap().remove(0),
        )
        .encode()
        .unwrap();
        // index = 1, total = 1
        bytes[4] = 1;

        assert!(matches!(
            Telegram::decode(&bytes),
            Err(CodecError::Decode(DecodeError::InvalidValue {
                field: "fragment index",
                ..
            }))
        ));
    }

    #[test]
    fn assembler_rejects_index_beyond_total() {
        let mut fragments = Fragmenter::new(10).unwrap().split(&record(20, 0)).unwrap();
        let mut assembler = Assembler::new();
        assembler.push(fragments.remove(0)).unwrap();

        let mut stray = fragments.remove(0);
        stray.head = FragmentHead::Next(NonZeroU16::new(7).unwrap());

        assert!(matches!(
            assembler.push(stray),
            Err(FragmentError::Inconsistent { .. })
        ));
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn bitmap_bits_in_declaration_order() {
        let meta = RecordMetadata {
            changed: RecordMetadata::pack_changed(&[
                true, false, false, false, false, false, false, false, false, true,
            ]),
            ..RecordMetadata::default()
        };

        assert_eq!(meta.changed, vec![0x80, 0x40]);
        assert!(meta.attribute_changed(0));
        assert!(!meta.attribute_changed(1));
        assert!(meta.attribute_changed(9));
        assert!(!meta.attribute_changed(20));
    }
}
