// ============================================================================
// Request Ledger
// ============================================================================
//
// Outstanding non-blocking operations keyed by request id. The ledger owns
// each operation's buffer token from `track` until the operation is
// resolved, and resolution happens at most once: whichever of completion or
// cancellation reaches `resolve` first retires the entry, every later
// attempt sees `AlreadyCompleted`.
//
// Resolved entries stay behind as tombstones until the session is
// finalized, so a repeated `complete` is distinguishable from a request the
// ledger never saw.
//
// ============================================================================

use super::completion::{Completion, OperationKind};
use crate::core::{BindingError, BufferToken, NativeHandle, Result, TrackedId};
use crate::runtime::WaitStatus;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug)]
struct PendingOperation {
    native: NativeHandle,
    kind: OperationKind,
    buffer: Option<BufferToken>,
    state: EntryState,
    tracked_at: Instant,
}

/// Tracks outstanding asynchronous operations
#[derive(Debug, Default)]
pub struct RequestLedger {
    entries: Mutex<HashMap<TrackedId, PendingOperation>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TrackedId, PendingOperation>>> {
        Ok(self.entries.lock()?)
    }

    /// Take ownership of `buffer` until `request` is resolved
    pub fn track(
        &self,
        request: TrackedId,
        native: NativeHandle,
        kind: OperationKind,
        buffer: BufferToken,
    ) -> Result<()> {
        let mut entries = self.lock()?;
        if entries.contains_key(&request) {
            return Err(BindingError::DuplicateHandle(native));
        }

        entries.insert(
            request,
            PendingOperation {
                native,
                kind,
                buffer: Some(buffer),
                state: EntryState::Pending,
                tracked_at: Instant::now(),
            },
        );
        event!(Level::DEBUG, %request, %native, %kind, "operation tracked");
        Ok(())
    }

    /// Native handle of a still-pending request
    pub fn lookup(&self, request: TrackedId) -> Result<NativeHandle> {
        let entries = self.lock()?;
        match entries.get(&request) {
            None => Err(BindingError::UnknownRequest(request)),
            Some(op) if op.state != EntryState::Pending => {
                Err(BindingError::AlreadyCompleted(request))
            }
            Some(op) => Ok(op.native),
        }
    }

    /// Wait for `request` through `wait` and hand its buffer back
    ///
    /// `wait` blocks until the runtime reports a final status or gives up.
    /// A timeout leaves the operation pending.
    pub fn complete<W>(&self, request: TrackedId, wait: W) -> Result<Completion>
    where
        W: FnOnce(NativeHandle) -> Result<WaitStatus>,
    {
        let native = self.lookup(request)?;
        match wait(native)? {
            WaitStatus::TimedOut => {
                event!(Level::TRACE, %request, "completion timed out");
                Err(BindingError::Timeout(request))
            }
            status => self.resolve(request, status),
        }
    }

    /// Cancel `request` and hand its buffer back
    ///
    /// `cancel` asks the runtime to cancel; `reap` then waits for the final
    /// status. If the operation finished before the cancel took effect the
    /// result is `Completion::Completed`. If another caller already observed
    /// the completion, `AlreadyCompleted`.
    pub fn cancel<C, W>(&self, request: TrackedId, cancel: C, reap: W) -> Result<Completion>
    where
        C: FnOnce(NativeHandle) -> Result<bool>,
        W: FnOnce(NativeHandle) -> Result<WaitStatus>,
    {
        let native = self.lookup(request)?;
        let accepted = cancel(native)?;
        let status = reap(native)?;
        event!(Level::DEBUG, %request, accepted, ?status, "cancel requested");

        match status {
            WaitStatus::TimedOut => Err(BindingError::Timeout(request)),
            status => self.resolve(request, status),
        }
    }

    /// The single authoritative retire step
    fn resolve(&self, request: TrackedId, status: WaitStatus) -> Result<Completion> {
        let mut entries = self.lock()?;
        let op = entries
            .get_mut(&request)
            .ok_or(BindingError::UnknownRequest(request))?;
        if op.state != EntryState::Pending {
            return Err(BindingError::AlreadyCompleted(request));
        }

        let buffer = op.buffer.take().unwrap_or_default();
        let completion = match status {
            WaitStatus::Cancelled => {
                op.state = EntryState::Cancelled;
                Completion::Cancelled(buffer)
            }
            _ => {
                op.state = EntryState::Completed;
                Completion::Completed(buffer)
            }
        };

        event!(
            Level::DEBUG,
            %request,
            kind = %op.kind,
            cancelled = completion.is_cancelled(),
            elapsed_us = op.tracked_at.elapsed().as_micros() as u64,
            "operation resolved"
        );
        Ok(completion)
    }

    pub fn is_pending(&self, request: TrackedId) -> bool {
        self.lock()
            .map(|entries| {
                entries
                    .get(&request)
                    .is_some_and(|op| op.state == EntryState::Pending)
            })
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|op| op.state == EntryState::Pending)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Pending requests, oldest first
    pub fn pending_requests(&self) -> Vec<TrackedId> {
        let Ok(entries) = self.lock() else {
            return Vec::new();
        };
        let mut pending: Vec<_> = entries
            .iter()
            .filter(|(_, op)| op.state == EntryState::Pending)
            .map(|(id, op)| (op.tracked_at, *id))
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, id)| id).collect()
    }

    /// Age of the oldest pending operation
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        let entries = self.lock().ok()?;
        entries
            .values()
            .filter(|op| op.state == EntryState::Pending)
            .map(|op| op.tracked_at.elapsed())
            .max()
    }

    /// Give up on every pending operation without freeing its buffer
    ///
    /// The runtime may still read or write those buffers, so they are leaked
    /// rather than dropped. Only for teardown paths that cannot wait.
    pub fn abandon_pending(&self) -> usize {
        let Ok(mut entries) = self.lock() else {
            return 0;
        };
        let mut abandoned = 0;
        for op in entries.values_mut() {
            if op.state == EntryState::Pending {
                if let Some(buffer) = op.buffer.take() {
                    std::mem::forget(buffer);
                }
                op.state = EntryState::Cancelled;
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Drop every tombstone; refuses while anything is pending
    pub fn clear(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let pending = entries
            .values()
            .filter(|op| op.state == EntryState::Pending)
            .count();
        if pending > 0 {
            return Err(BindingError::PendingOperationsRemain { count: pending });
        }

        let dropped = entries.len();
        entries.clear();
        Ok(dropped)
    }
}
