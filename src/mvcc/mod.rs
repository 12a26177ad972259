#![forbid(unsafe_code)]
//! Multi-version concurrency control: version stamps, snapshots, and the
//! wire codec used to ship versions between nodes.
//!
//! A [`MvccVersion`] is issued by the elected coordinator. Pessimistic
//! transactions read through an [`MvccSnapshot`]; every row version carries
//! a stamp exposed through [`MvccVersionAware`].

mod message;
mod snapshot;
mod version;

pub use message::{decode_message, encode_message, DirectMessage, DirectReader, DirectWriter};
pub use snapshot::{MvccHistoryRow, MvccSnapshot};
pub use version::{MvccVersion, MvccVersionAware, MvccVersionMutable, RowVersion, TxState};
