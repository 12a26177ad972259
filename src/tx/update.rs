use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::mvcc::MvccHistoryRow;
use crate::primitives::concurrency::Completion;
use crate::types::{KindleError, Result, WalPointer};

/// Outcome of an entry processor invoked as part of an update.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InvokeResult {
    /// Value returned by the processor.
    pub result: Option<Bytes>,
    /// Error the processor raised, rendered as text.
    pub error: Option<String>,
}

impl InvokeResult {
    /// Successful invocation.
    pub fn ok(result: Option<Bytes>) -> Self {
        Self {
            result,
            error: None,
        }
    }

    /// Failed invocation.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Handle on an update whose result arrives asynchronously.
///
/// Clones share the same cell; whoever waits first takes the result.
#[derive(Clone, Default)]
pub struct UpdateFuture {
    cell: Completion<TxUpdateResult>,
}

impl UpdateFuture {
    /// An unresolved future.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the future. Returns `false` if it was already resolved.
    pub fn complete(&self, outcome: Result<TxUpdateResult>) -> bool {
        self.cell.finish(outcome)
    }

    /// Returns `true` once resolved.
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Waits up to `timeout` for the result.
    pub fn wait(&self, timeout: Duration) -> Result<TxUpdateResult> {
        self.cell.wait_for(timeout, "tx update future")
    }

    /// Waits up to `timeout` for resolution without taking the result.
    pub fn wait_done(&self, timeout: Duration) -> Result<()> {
        self.cell.wait_finished_for(timeout, "tx update future")
    }
}

impl fmt::Debug for UpdateFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Result of one transactional entry update.
///
/// The four constructors cover the shapes an update can finish in. The
/// remaining fields are filled in by the single writer that owns the
/// in-flight update; each may be set once, after which the result is
/// shared read-only.
#[derive(Debug, Default)]
pub struct TxUpdateResult {
    success: bool,
    wal_ptr: Option<WalPointer>,
    update_counter: Option<u64>,
    update_future: Option<UpdateFuture>,
    prev_value: Option<Bytes>,
    old_value: Option<Bytes>,
    new_value: Option<Bytes>,
    invoke_result: Option<InvokeResult>,
    filtered: Option<bool>,
    mvcc_history: Option<Vec<MvccHistoryRow>>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(KindleError::InvalidOwned(format!(
            "tx update field `{field}` is already set"
        )));
    }
    *slot = Some(value);
    Ok(())
}

impl TxUpdateResult {
    /// Update that finished with no log record.
    pub fn new(success: bool) -> Self {
        Self {
            success,
            ..Self::default()
        }
    }

    /// Update that produced a log record at `wal_ptr`.
    pub fn with_wal_pointer(success: bool, wal_ptr: WalPointer) -> Self {
        Self {
            success,
            wal_ptr: Some(wal_ptr),
            ..Self::default()
        }
    }

    /// Update whose outcome is still pending on `future`.
    pub fn pending(success: bool, future: UpdateFuture) -> Self {
        Self {
            success,
            update_future: Some(future),
            ..Self::default()
        }
    }

    /// Update that advanced the partition update counter and was logged at `wal_ptr`.
    pub fn with_counter(success: bool, update_counter: u64, wal_ptr: WalPointer) -> Self {
        Self {
            success,
            wal_ptr: Some(wal_ptr),
            update_counter: Some(update_counter),
            ..Self::default()
        }
    }

    /// Whether the update was applied.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Where the update's log record landed, if it was logged.
    pub fn logged_pointer(&self) -> Option<WalPointer> {
        self.wal_ptr
    }

    /// Partition update counter assigned to this update.
    pub fn update_counter(&self) -> Option<u64> {
        self.update_counter
    }

    /// Present only for results built with [`TxUpdateResult::pending`].
    pub fn update_future(&self) -> Option<&UpdateFuture> {
        self.update_future.as_ref()
    }

    /// Value the entry held before the transaction first touched it.
    pub fn prev_value(&self) -> Option<&Bytes> {
        self.prev_value.as_ref()
    }

    /// Value replaced by this particular update.
    pub fn old_value(&self) -> Option<&Bytes> {
        self.old_value.as_ref()
    }

    /// Value written by this update.
    pub fn new_value(&self) -> Option<&Bytes> {
        self.new_value.as_ref()
    }

    /// Entry processor outcome, for invoke updates.
    pub fn invoke_result(&self) -> Option<&InvokeResult> {
        self.invoke_result.as_ref()
    }

    /// `true` if a filter rejected the update. Unset means not filtered.
    pub fn filtered(&self) -> bool {
        self.filtered.unwrap_or(false)
    }

    /// Prior row versions relevant to this update, oldest first.
    pub fn mvcc_history(&self) -> Option<&[MvccHistoryRow]> {
        self.mvcc_history.as_deref()
    }

    /// Sets [`TxUpdateResult::prev_value`]. Fails if already set.
    pub fn set_prev_value(&mut self, value: Bytes) -> Result<()> {
        set_once(&mut self.prev_value, value, "prev_value")
    }

    /// Sets [`TxUpdateResult::old_value`]. Fails if already set.
    pub fn set_old_value(&mut self, value: Bytes) -> Result<()> {
        set_once(&mut self.old_value, value, "old_value")
    }

    /// Sets [`TxUpdateResult::new_value`]. Fails if already set.
    pub fn set_new_value(&mut self, value: Bytes) -> Result<()> {
        set_once(&mut self.new_value, value, "new_value")
    }

    /// Sets [`TxUpdateResult::invoke_result`]. Fails if already set.
    pub fn set_invoke_result(&mut self, result: InvokeResult) -> Result<()> {
        set_once(&mut self.invoke_result, result, "invoke_result")
    }

    /// Marks whether a filter rejected the update. Fails if already set.
    pub fn set_filtered(&mut self, filtered: bool) -> Result<()> {
        set_once(&mut self.filtered, filtered, "filtered")
    }

    /// Sets [`TxUpdateResult::mvcc_history`]. Fails if already set.
    pub fn set_mvcc_history(&mut self, history: Vec<MvccHistoryRow>) -> Result<()> {
        set_once(&mut self.mvcc_history, history, "mvcc_history")
    }
}
