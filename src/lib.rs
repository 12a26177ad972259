//! Kindle: page-delta write-ahead logging, free-list page chains, and MVCC
//! transaction acknowledgment for a paged storage engine.
//!
//! The crate is organized bottom-up:
//! - [`types`]: identifiers, WAL pointers, and the crate-wide error.
//! - [`primitives`]: byte helpers, positional I/O, the record log, and the
//!   in-memory page store.
//! - [`storage`]: page formats, WAL records, delta replay, the free list,
//!   and crash recovery.
//! - [`mvcc`]: version stamps, snapshots, and their wire codec.
//! - [`tx`]: per-update results and coordinator acknowledgment.
//! - [`config`]: TOML configuration.

#![warn(missing_docs)]

pub mod config;
pub mod mvcc;
pub mod primitives;
pub mod storage;
pub mod tx;
pub mod types;

pub use types::{GroupId, KindleError, Lsn, PageId, Result, WalPointer};
