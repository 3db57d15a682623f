use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};

/// Hash of a stream's label set. Blocks shard the fingerprint space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Inclusive fingerprint range `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FingerprintBounds {
    pub min: Fingerprint,
    pub max: Fingerprint,
}

impl FingerprintBounds {
    pub fn new(min: impl Into<Fingerprint>, max: impl Into<Fingerprint>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.min <= fp && fp <= self.max
    }
}

impl fmt::Display for FingerprintBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRef {
    pub from: DateTime<Utc>,
    pub through: DateTime<Utc>,
    pub checksum: u32,
}

impl ChunkRef {
    /// Whether the chunk's `[from, through]` intersects `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.from <= end && self.through >= start
    }
}

/// The chunks of one stream a caller wants filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedChunkRefs {
    pub fingerprint: Fingerprint,
    pub refs: Vec<ChunkRef>,
}

/// Reference to one per-day bloom block of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub tenant: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bounds: FingerprintBounds,
    pub checksum: u32,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{:08x}",
            self.tenant,
            self.start.format("%Y-%m-%d"),
            self.bounds,
            self.checksum
        )
    }
}

/// Tokenization parameters a block was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    pub ngram_len: usize,
    pub ngram_skip: usize,
}

/// Chunks of one fingerprint that can be skipped by the downstream scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub fp: Fingerprint,
    pub removals: Vec<ChunkRef>,
}

impl Output {
    pub fn unfiltered(fp: Fingerprint) -> Self {
        Self {
            fp,
            removals: Vec::new(),
        }
    }
}

/// Receiver of the outputs a fused query produces for one caller.
pub trait OutputSink: Send + Sync {
    fn send(&self, output: Output);
}

/// One entry of a fused query's input stream.
pub struct Request {
    pub fp: Fingerprint,
    pub chunks: Vec<ChunkRef>,
    /// Tokens of each line filter; a chunk must contain every token of every filter to match.
    pub searches: Vec<Vec<String>>,
    pub response: Arc<dyn OutputSink>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("fp", &self.fp)
            .field("chunks", &self.chunks)
            .field("searches", &self.searches)
            .field("response", &"<OutputSink>")
            .finish()
    }
}
