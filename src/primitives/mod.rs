//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, I/O backends, completion cells, the write-ahead
//! log, and the in-memory page store.

/// Byte-level utilities and encoding/decoding.
///
/// Low-level utilities for working with raw bytes, buffers, and encoding operations.
pub mod bytes;

/// One-shot completion cells.
///
/// Outcomes produced on one thread and awaited, with an optional bound, on another.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// In-memory page store.
///
/// Fixed-size pages per group, each guarded by its own lock.
pub mod pager;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Checksummed, chained frames holding one encoded record each.
pub mod wal;
