use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::{KindleError, Result};

/// Transaction state hint stored next to a row version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxState {
    /// State unknown; consult the coordinator.
    #[default]
    Na = 0,
    /// Prepared, outcome pending.
    Prepared = 1,
    /// Rolled back.
    Aborted = 2,
    /// Committed.
    Committed = 3,
}

impl TxState {
    /// Decodes a stored state byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Na),
            1 => Ok(Self::Prepared),
            2 => Ok(Self::Aborted),
            3 => Ok(Self::Committed),
            _ => Err(KindleError::Corruption("unknown tx state")),
        }
    }
}

/// Version stamp `(coordinator_version, counter, operation_counter)`.
///
/// Two versions are equal, hash alike, and order by `(coordinator_version,
/// counter)` only; the operation counter tells sub-steps of one logical
/// version apart and never distinguishes versions. The all-zero value means
/// "unversioned".
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MvccVersion {
    pub(crate) coordinator_version: u64,
    pub(crate) counter: u64,
    pub(crate) op_counter: u32,
}

impl MvccVersion {
    /// The unversioned stamp.
    pub const NONE: MvccVersion = MvccVersion {
        coordinator_version: 0,
        counter: 0,
        op_counter: 0,
    };

    /// Builds a version from its three components.
    pub const fn new(coordinator_version: u64, counter: u64, op_counter: u32) -> Self {
        Self {
            coordinator_version,
            counter,
            op_counter,
        }
    }

    /// Version of the coordinator that issued this stamp.
    pub const fn coordinator_version(&self) -> u64 {
        self.coordinator_version
    }

    /// Transaction counter within the coordinator version.
    pub const fn counter(&self) -> u64 {
        self.counter
    }

    /// Operation step within the transaction.
    pub const fn operation_counter(&self) -> u32 {
        self.op_counter
    }

    /// Returns `true` unless this is the all-zero stamp.
    pub const fn is_initialized(&self) -> bool {
        self.coordinator_version != 0
    }

    /// Same version, different operation step.
    pub const fn with_operation_counter(self, op_counter: u32) -> Self {
        Self { op_counter, ..self }
    }
}

impl PartialEq for MvccVersion {
    fn eq(&self, other: &Self) -> bool {
        self.coordinator_version == other.coordinator_version && self.counter == other.counter
    }
}

impl Eq for MvccVersion {}

impl Hash for MvccVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.coordinator_version.hash(state);
        self.counter.hash(state);
    }
}

impl Ord for MvccVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.coordinator_version
            .cmp(&other.coordinator_version)
            .then(self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for MvccVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MvccVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MvccVersion [crdVer={}, cntr={}, opCntr={}]",
            self.coordinator_version, self.counter, self.op_counter
        )
    }
}

/// Read access to a version stamp carried by some value.
///
/// Mutation is optional: the default [`MvccVersionAware::try_set_mvcc_version`]
/// refuses with [`KindleError::Unsupported`]. Types that keep mutable version
/// state override it and also implement [`MvccVersionMutable`].
pub trait MvccVersionAware {
    /// Coordinator version component.
    fn coordinator_version(&self) -> u64;

    /// Counter component.
    fn counter(&self) -> u64;

    /// Operation counter component.
    fn operation_counter(&self) -> u32;

    /// Transaction state hint.
    fn tx_state(&self) -> TxState {
        TxState::Na
    }

    /// The stamp as a value.
    fn mvcc_version(&self) -> MvccVersion {
        MvccVersion::new(
            self.coordinator_version(),
            self.counter(),
            self.operation_counter(),
        )
    }

    /// Replaces the stamp, if this type supports mutation.
    fn try_set_mvcc_version(&mut self, _crd: u64, _cntr: u64, _op_cntr: u32) -> Result<()> {
        Err(KindleError::Unsupported("mvcc version is read-only"))
    }

    /// Copies all three components from `other`. The copy shares nothing with `other`.
    fn copy_mvcc_version_from(&mut self, other: &dyn MvccVersionAware) -> Result<()> {
        self.try_set_mvcc_version(
            other.coordinator_version(),
            other.counter(),
            other.operation_counter(),
        )
    }
}

/// Version-bearing values whose stamp can always be replaced.
pub trait MvccVersionMutable: MvccVersionAware {
    /// Replaces the stamp.
    fn set_mvcc_version(&mut self, crd: u64, cntr: u64, op_cntr: u32);

    /// Copies the stamp of `other`.
    fn set_mvcc_version_from(&mut self, other: &dyn MvccVersionAware) {
        self.set_mvcc_version(
            other.coordinator_version(),
            other.counter(),
            other.operation_counter(),
        );
    }
}

impl MvccVersionAware for MvccVersion {
    fn coordinator_version(&self) -> u64 {
        self.coordinator_version
    }

    fn counter(&self) -> u64 {
        self.counter
    }

    fn operation_counter(&self) -> u32 {
        self.op_counter
    }
}

/// Version stamp and state hint of one stored row.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RowVersion {
    /// Current stamp.
    pub version: MvccVersion,
    /// State of the writing transaction, if known.
    pub tx_state: TxState,
}

impl MvccVersionAware for RowVersion {
    fn coordinator_version(&self) -> u64 {
        self.version.coordinator_version
    }

    fn counter(&self) -> u64 {
        self.version.counter
    }

    fn operation_counter(&self) -> u32 {
        self.version.op_counter
    }

    fn tx_state(&self) -> TxState {
        self.tx_state
    }

    fn try_set_mvcc_version(&mut self, crd: u64, cntr: u64, op_cntr: u32) -> Result<()> {
        self.set_mvcc_version(crd, cntr, op_cntr);
        Ok(())
    }
}

impl MvccVersionMutable for RowVersion {
    fn set_mvcc_version(&mut self, crd: u64, cntr: u64, op_cntr: u32) {
        self.version = MvccVersion::new(crd, cntr, op_cntr);
    }
}
