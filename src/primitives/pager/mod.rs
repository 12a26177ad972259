#![forbid(unsafe_code)]
//! Page store capability and the in-memory page memory behind it.

mod frame;
mod memory;

pub use frame::{PageMut, PageRef};
pub use memory::{PageMemory, PageStore};
