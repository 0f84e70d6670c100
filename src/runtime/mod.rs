// ============================================================================
// Native Runtime Surface
// ============================================================================
//
// The fixed call surface of the message-passing runtime this crate wraps.
// Everything above this trait deals in tracked ids and typed results; the
// trait itself deals in raw handles and raw codes, exactly as the runtime
// hands them out.
//
// ============================================================================

pub mod loopback;

pub use loopback::{LoopbackConfig, LoopbackRuntime};

use crate::core::{NativeHandle, Result};
use std::time::Instant;

/// Wildcard source rank for receives
pub const ANY_SOURCE: i32 = -2;

/// Wildcard tag for receives
pub const ANY_TAG: i32 = -1;

/// Outcome of a bounded wait on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The operation finished
    Completed,
    /// A cancel took effect before the operation finished
    Cancelled,
    /// The deadline passed first; the request is still outstanding
    TimedOut,
}

/// Native call surface consumed by the binding layer
///
/// Implementations report their own failures as [`BindingError::Runtime`].
/// Raw comparison and thread-level codes are returned untranslated.
///
/// [`BindingError::Runtime`]: crate::core::BindingError::Runtime
pub trait NativeRuntime: Send + Sync {
    /// Initialize with a requested raw thread level; returns the granted code
    fn init_thread(&self, requested: i32) -> Result<i32>;

    fn finalize(&self) -> Result<()>;

    /// Predefined communicator spanning every process
    fn comm_world(&self) -> NativeHandle;

    /// Predefined communicator containing only the calling process
    fn comm_self(&self) -> NativeHandle;

    fn comm_rank(&self, comm: NativeHandle) -> Result<i32>;

    fn comm_size(&self, comm: NativeHandle) -> Result<i32>;

    /// Raw comparison code for two communicators
    fn comm_compare(&self, a: NativeHandle, b: NativeHandle) -> Result<i32>;

    fn comm_dup(&self, comm: NativeHandle) -> Result<NativeHandle>;

    fn comm_group(&self, comm: NativeHandle) -> Result<NativeHandle>;

    /// Create a communicator over `group`; `None` when the caller is not a member
    fn comm_create(&self, comm: NativeHandle, group: NativeHandle) -> Result<Option<NativeHandle>>;

    fn comm_free(&self, comm: NativeHandle) -> Result<()>;

    /// New group from the listed group-local ranks of `group`, in that order
    fn group_incl(&self, group: NativeHandle, ranks: &[i32]) -> Result<NativeHandle>;

    /// Raw comparison code for two groups
    fn group_compare(&self, a: NativeHandle, b: NativeHandle) -> Result<i32>;

    fn group_free(&self, group: NativeHandle) -> Result<()>;

    /// Start a non-blocking send of `len` bytes at `buf`
    ///
    /// # Safety
    /// `buf..buf+len` must stay valid and unmodified until the returned
    /// request completes or is cancelled and waited on.
    unsafe fn isend(
        &self,
        comm: NativeHandle,
        dest: i32,
        tag: i32,
        buf: *const u8,
        len: usize,
    ) -> Result<NativeHandle>;

    /// Start a non-blocking receive into `capacity` bytes at `buf`
    ///
    /// # Safety
    /// `buf..buf+capacity` must stay valid and must not be accessed by the
    /// caller until the returned request completes or is cancelled and
    /// waited on.
    unsafe fn irecv(
        &self,
        comm: NativeHandle,
        source: i32,
        tag: i32,
        buf: *mut u8,
        capacity: usize,
    ) -> Result<NativeHandle>;

    /// Block until the request finishes or `deadline` passes
    ///
    /// Waiting on a request that already finished returns its final status
    /// immediately, so a late second waiter never blocks forever.
    fn wait(&self, request: NativeHandle, deadline: Option<Instant>) -> Result<WaitStatus>;

    /// Try to cancel; `false` means the operation already finished
    fn cancel(&self, request: NativeHandle) -> Result<bool>;
}
