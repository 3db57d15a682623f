//! Shared core abstractions for the bloom gateway.
//!
//! This crate defines the contracts consumed by the gateway worker: the multi-consumer request
//! queue, the bloom block store, and the per-block fused query engine.
//!
//! # API notes
//! `bloom-core` is an internal crate (`publish = false`). Its public API uses `chrono` types for
//! time bounds and `anyhow::Error` as the carrier inside [`Error`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{any::Any, fmt, iter::Peekable, sync::Arc, time::Duration};

pub mod day;
pub mod lite;
pub mod tokenizer;
mod types;

pub use types::{
    BlockRef, ChunkRef, Fingerprint, FingerprintBounds, GroupedChunkRefs, Output, OutputSink,
    Request, Schema,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The queue is permanently stopped.
    Stopped,
    Canceled,
    Store,
    Query,
    /// An upstream contract was breached (wrong item type, unexpected block).
    Invariant,
    Other,
}

/// Error shared between the worker and its collaborators.
///
/// A single failure is broadcast to every task of a day, so the inner error is reference counted
/// and the whole value is cheap to clone.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    inner: Arc<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, err: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            inner: Arc::new(err.into()),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, anyhow::anyhow!(message.into()))
    }

    pub fn stopped() -> Self {
        Self::new(ErrorKind::Stopped, anyhow::anyhow!("queue is stopped"))
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, anyhow::anyhow!("context canceled"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_stopped(&self) -> bool {
        self.kind == ErrorKind::Stopped
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// Wrap the error with additional context, keeping its kind.
    pub fn context<C>(self, context: C) -> Self
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(err) => err.context(context),
            Err(shared) => anyhow::anyhow!("{context}: {shared:#}"),
        };
        Self {
            kind: self.kind,
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::new(ErrorKind::Other, value)
    }
}

/// An opaque item handed out by the request queue.
///
/// The queue is shared by every producer of the gateway, so consumers downcast items to the
/// concrete type they expect.
pub type QueueItem = Arc<dyn Any + Send + Sync>;

/// Cursor into the queue's tenant rotation, threaded through successive dequeue calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIndex(pub i64);

impl QueueIndex {
    pub const START: Self = Self(-1);
    pub const START_WITH_LOCAL_QUEUE: Self = Self(-2);
}

/// Result of one `dequeue_many` call.
///
/// `items` is a checked-out buffer and must be handed back via
/// [`RequestQueue::release_requests`], including when it is empty. `error` may be set alongside
/// a partial batch.
#[derive(Debug)]
pub struct DequeueBatch {
    pub items: Vec<QueueItem>,
    pub next_index: QueueIndex,
    pub error: Option<Error>,
}

#[async_trait]
pub trait RequestQueue: Send + Sync {
    async fn enqueue(&self, tenant: &str, item: QueueItem) -> Result<()>;

    fn register_consumer_connection(&self, consumer: &str);

    fn unregister_consumer_connection(&self, consumer: &str);

    /// Wait at most `max_wait` for up to `max_items` items.
    async fn dequeue_many(
        &self,
        last: QueueIndex,
        consumer: &str,
        max_items: usize,
        max_wait: Duration,
    ) -> DequeueBatch;

    fn release_requests(&self, items: Vec<QueueItem>);
}

/// Callback invoked once per fetched block with its querier and fingerprint bounds.
pub type BlockCallback<'a> =
    dyn FnMut(&dyn BlockQuerier, FingerprintBounds) -> Result<()> + Send + 'a;

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Resolve the blocks of `tenant` whose day window intersects `[from, through]`.
    async fn get_block_refs(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        through: DateTime<Utc>,
    ) -> Result<Vec<BlockRef>>;

    /// Fetch `refs` and call `callback` synchronously for each block before returning.
    async fn fetch(
        &self,
        tenant: &str,
        refs: &[BlockRef],
        callback: &mut BlockCallback<'_>,
    ) -> Result<()>;
}

/// A request stream ordered by non-decreasing fingerprint.
pub type RequestStream<'a> = Peekable<Box<dyn Iterator<Item = Request> + Send + 'a>>;

pub fn request_stream<'a, I>(requests: I) -> RequestStream<'a>
where
    I: Iterator<Item = Request> + Send + 'a,
{
    let boxed: Box<dyn Iterator<Item = Request> + Send + 'a> = Box::new(requests);
    boxed.peekable()
}

pub trait BlockQuerier: Send + Sync {
    fn schema(&self) -> Result<Schema>;

    /// Merge-join `requests` against the block. Nothing is evaluated until [`FusedQuery::run`].
    fn fuse<'a>(&'a self, requests: RequestStream<'a>) -> Box<dyn FusedQuery + 'a>;
}

pub trait FusedQuery {
    /// Evaluate every request and write an [`Output`] to its response sink.
    fn run(&mut self) -> Result<()>;
}
