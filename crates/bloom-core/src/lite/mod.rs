//! Lite-mode implementations of `bloom-core` interfaces.
//!
//! This module provides an in-memory request queue and an in-memory bloom block store with a
//! reference fused querier, for local runs and tests.

pub mod queue;
pub mod store;

pub use queue::{MemoryQueue, QueueStats};
pub use store::{MemoryBlock, MemoryBlockBuilder, MemoryStore};
