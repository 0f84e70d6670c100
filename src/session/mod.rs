// ============================================================================
// Session
// ============================================================================
//
// One runtime session: the runtime itself, the call gate, and the four
// bookkeeping components, constructed once and shared by reference. Every
// public operation goes through the gate, so the ordering discipline holds
// regardless of how many threads the caller brings.
//
// ============================================================================

pub mod config;

pub use config::SessionConfig;

use crate::core::{
    BindingError, BufferToken, ComparisonResult, HandleKind, NativeHandle, Provenance, Result,
    ThreadSupportLevel, TrackedId,
};
use crate::handle::{ComparisonOracle, DrainReport, HandleRecord, HandleRegistry};
use crate::request::{Completion, OperationKind, RequestLedger};
use crate::runtime::{NativeRuntime, WaitStatus};
use crate::thread::{CallGate, SessionState, ThreadSupportNegotiator};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{Level, event, info_span};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Predefined {
    world: TrackedId,
    solo: TrackedId,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub state: String,
    pub granted_level: Option<ThreadSupportLevel>,
    pub live_handles: usize,
    pub live_communicators: usize,
    pub live_groups: usize,
    pub live_requests: usize,
    pub pending_operations: usize,
    pub oldest_pending_ms: Option<u64>,
}

/// Safe lifecycle layer over one native runtime
///
/// # Examples
///
/// ```
/// use mpiguard::{BufferToken, LoopbackConfig, LoopbackRuntime, Session, ThreadSupportLevel};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = LoopbackRuntime::new(LoopbackConfig::new(2, 0))?;
/// let session = Session::with_defaults(runtime)?;
///
/// let granted = session.initialize(ThreadSupportLevel::Multiple)?;
/// assert!(granted <= ThreadSupportLevel::Multiple);
///
/// let world = session.world()?;
/// let recv = session.irecv(world, 0, 7, BufferToken::zeroed(5))?;
/// let send = session.isend(world, 0, 7, BufferToken::from(&b"hello"[..]))?;
///
/// session.complete(send, None)?;
/// let inbox = session.complete(recv, None)?;
/// assert_eq!(inbox.as_slice(), b"hello");
///
/// session.finalize()?;
/// # Ok(())
/// # }
/// ```
pub struct Session<R: NativeRuntime> {
    id: Uuid,
    config: SessionConfig,
    runtime: R,
    gate: CallGate,
    negotiator: ThreadSupportNegotiator,
    registry: HandleRegistry,
    ledger: RequestLedger,
    predefined: Mutex<Option<Predefined>>,
}

impl<R: NativeRuntime> Session<R> {
    pub fn new(runtime: R, config: SessionConfig) -> Result<Self> {
        config.validate().map_err(BindingError::Config)?;

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            runtime,
            gate: CallGate::new(),
            negotiator: ThreadSupportNegotiator::new(),
            registry: HandleRegistry::new(),
            ledger: RequestLedger::new(),
            predefined: Mutex::new(None),
        })
    }

    pub fn with_defaults(runtime: R) -> Result<Self> {
        Self::new(runtime, SessionConfig::default())
    }

    /// Session configured from `MPIGUARD_*` environment variables
    pub fn from_env(runtime: R) -> Result<Self> {
        let config = SessionConfig::from_env().map_err(BindingError::Config)?;
        Self::new(runtime, config)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initialize the runtime, returning the granted thread level
    pub fn initialize(&self, requested: ThreadSupportLevel) -> Result<ThreadSupportLevel> {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();
        if self.negotiator.state().is_initialized() {
            return Err(BindingError::AlreadyInitialized);
        }
        let _gate = self.gate.exclusive()?;

        let granted = self.negotiator.initialize(&self.runtime, requested)?;

        match self.register_predefined() {
            Ok(predefined) => {
                *self.predefined.lock()? = Some(predefined);
                Ok(granted)
            }
            Err(err) => {
                if let Err(undo) = self.negotiator.roll_back(&self.runtime) {
                    event!(Level::WARN, error = %undo, "rolling back initialization failed");
                }
                Err(BindingError::InitFailed(format!(
                    "predefined communicators could not be registered: {}",
                    err
                )))
            }
        }
    }

    /// Register world and self; on failure nothing stays registered
    fn register_predefined(&self) -> Result<Predefined> {
        let world = self.registry.register_with(
            self.runtime.comm_world(),
            HandleKind::Communicator,
            Provenance::Predefined,
        )?;
        let solo = match self.registry.register_with(
            self.runtime.comm_self(),
            HandleKind::Communicator,
            Provenance::Predefined,
        ) {
            Ok(solo) => solo,
            Err(err) => {
                self.registry.retire(world)?;
                return Err(err);
            }
        };
        Ok(Predefined { world, solo })
    }

    /// Initialize with the configured requested level
    pub fn init(&self) -> Result<ThreadSupportLevel> {
        self.initialize(self.config.requested_level)
    }

    /// Finalize the runtime
    ///
    /// Fails with `PendingOperationsRemain` while any tracked operation is
    /// unresolved; in-flight work is never abandoned.
    pub fn finalize(&self) -> Result<DrainReport> {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();

        // Checked before queueing on the gate: a waiter may hold it
        let pending = self.ledger.pending_count();
        if pending > 0 && self.negotiator.state().is_initialized() {
            return Err(BindingError::PendingOperationsRemain { count: pending });
        }
        let _gate = self.gate.exclusive()?;

        let report = self.negotiator.finalize(
            &self.runtime,
            &self.ledger,
            &self.registry,
            self.config.free_on_finalize,
        );
        if !self.negotiator.state().is_initialized() {
            *self.predefined.lock()? = None;
        }
        report
    }

    pub fn current_level(&self) -> Option<ThreadSupportLevel> {
        self.negotiator.current_level()
    }

    pub fn requested_level(&self) -> Option<ThreadSupportLevel> {
        self.negotiator.requested_level()
    }

    pub fn state(&self) -> SessionState {
        self.negotiator.state()
    }

    fn predefined(&self) -> Result<Predefined> {
        self.predefined.lock()?.ok_or(BindingError::NotInitialized)
    }

    /// Tracked id of the world communicator
    pub fn world(&self) -> Result<TrackedId> {
        Ok(self.predefined()?.world)
    }

    /// Tracked id of the communicator containing only this process
    pub fn self_comm(&self) -> Result<TrackedId> {
        Ok(self.predefined()?.solo)
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Register a native handle obtained outside this session
    pub fn register(&self, native: NativeHandle, kind: HandleKind) -> Result<TrackedId> {
        let _gate = self.gate.enter(&self.negotiator)?;
        self.registry.register(native, kind)
    }

    /// Release a handle through its native destructor
    pub fn release(&self, id: TrackedId) -> Result<()> {
        let _gate = self.gate.enter(&self.negotiator)?;
        if self.ledger.is_pending(id) {
            return Err(BindingError::RequestInFlight(id));
        }
        self.registry.release(id, &self.runtime)
    }

    pub fn is_live(&self, id: TrackedId) -> bool {
        self.registry.is_live(id)
    }

    pub fn handle(&self, id: TrackedId) -> Result<HandleRecord> {
        self.registry.record(id)
    }

    pub fn rank(&self, comm: TrackedId) -> Result<i32> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native = self.registry.resolve(comm, HandleKind::Communicator)?;
        self.runtime.comm_rank(native)
    }

    pub fn size(&self, comm: TrackedId) -> Result<i32> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native = self.registry.resolve(comm, HandleKind::Communicator)?;
        self.runtime.comm_size(native)
    }

    /// Duplicate a communicator: same members, new identity
    pub fn comm_dup(&self, comm: TrackedId) -> Result<TrackedId> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native = self.registry.resolve(comm, HandleKind::Communicator)?;
        let dup = self.runtime.comm_dup(native)?;
        self.registry.register(dup, HandleKind::Communicator)
    }

    /// Group of a communicator's members
    pub fn comm_group(&self, comm: TrackedId) -> Result<TrackedId> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native = self.registry.resolve(comm, HandleKind::Communicator)?;
        let group = self.runtime.comm_group(native)?;
        self.registry.register(group, HandleKind::Group)
    }

    /// Subgroup of the listed group-local ranks, in the listed order
    pub fn group_incl(&self, group: TrackedId, ranks: &[i32]) -> Result<TrackedId> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native = self.registry.resolve(group, HandleKind::Group)?;
        let sub = self.runtime.group_incl(native, ranks)?;
        self.registry.register(sub, HandleKind::Group)
    }

    /// Communicator over `group`; `None` if this process is not in it
    pub fn comm_create(&self, comm: TrackedId, group: TrackedId) -> Result<Option<TrackedId>> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let parent = self.registry.resolve(comm, HandleKind::Communicator)?;
        let members = self.registry.resolve(group, HandleKind::Group)?;
        match self.runtime.comm_create(parent, members)? {
            Some(created) => Ok(Some(
                self.registry.register(created, HandleKind::Communicator)?,
            )),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Comparison
    // ------------------------------------------------------------------

    /// Compare two communicators or two groups
    pub fn compare(&self, a: TrackedId, b: TrackedId) -> Result<ComparisonResult> {
        let _gate = self.gate.enter(&self.negotiator)?;
        ComparisonOracle::new(&self.registry, &self.runtime).compare(a, b)
    }

    pub fn is_equivalent(&self, a: TrackedId, b: TrackedId) -> Result<bool> {
        let _gate = self.gate.enter(&self.negotiator)?;
        ComparisonOracle::new(&self.registry, &self.runtime).is_equivalent(a, b)
    }

    pub fn has_same_membership(&self, a: TrackedId, b: TrackedId) -> Result<bool> {
        let _gate = self.gate.enter(&self.negotiator)?;
        ComparisonOracle::new(&self.registry, &self.runtime).has_same_membership(a, b)
    }

    // ------------------------------------------------------------------
    // Non-blocking operations
    // ------------------------------------------------------------------

    /// Start a send; the buffer is held by the session until completion
    pub fn isend(&self, comm: TrackedId, dest: i32, tag: i32, buffer: BufferToken) -> Result<TrackedId> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native_comm = self.registry.resolve(comm, HandleKind::Communicator)?;

        // SAFETY: the ledger keeps `buffer` alive and untouched until the
        // request resolves; its heap address does not move with the token.
        let request = unsafe {
            self.runtime
                .isend(native_comm, dest, tag, buffer.as_ptr(), buffer.len())?
        };
        self.adopt(request, OperationKind::Send, buffer)
    }

    /// Start a receive into `buffer`; it comes back filled on completion
    pub fn irecv(
        &self,
        comm: TrackedId,
        source: i32,
        tag: i32,
        mut buffer: BufferToken,
    ) -> Result<TrackedId> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native_comm = self.registry.resolve(comm, HandleKind::Communicator)?;

        // SAFETY: as for isend; nothing reads or writes the token until the
        // ledger hands it back.
        let request = unsafe {
            self.runtime
                .irecv(native_comm, source, tag, buffer.as_mut_ptr(), buffer.len())?
        };
        self.adopt(request, OperationKind::Receive, buffer)
    }

    fn adopt(&self, request: NativeHandle, kind: OperationKind, buffer: BufferToken) -> Result<TrackedId> {
        let id = match self
            .registry
            .register_with(request, HandleKind::Request, Provenance::Operation)
        {
            Ok(id) => id,
            Err(err) => {
                // The runtime may still touch the buffer
                std::mem::forget(buffer);
                event!(Level::ERROR, %request, error = %err, "request could not be registered, buffer leaked");
                return Err(err);
            }
        };
        self.ledger.track(id, request, kind, buffer)?;
        Ok(id)
    }

    /// Hand a buffer to a request issued outside this session
    pub fn track(&self, request: TrackedId, buffer: BufferToken) -> Result<()> {
        let _gate = self.gate.enter(&self.negotiator)?;
        let native = self.registry.resolve(request, HandleKind::Request)?;
        self.ledger
            .track(request, native, OperationKind::External, buffer)
    }

    /// Block until `request` finishes and take its buffer back
    ///
    /// `deadline` bounds the wait; on expiry the result is `Timeout` and the
    /// operation stays pending. `None` waits indefinitely.
    pub fn complete(&self, request: TrackedId, deadline: Option<Duration>) -> Result<BufferToken> {
        Ok(self.wait(request, deadline)?.into_token())
    }

    /// Like [`Self::complete`], but reports whether a cancel took effect
    pub fn wait(&self, request: TrackedId, deadline: Option<Duration>) -> Result<Completion> {
        let until = deadline.map(|d| Instant::now() + d);
        let completion = self
            .ledger
            .complete(request, |native| self.wait_native(native, until))?;
        self.retire(request);
        Ok(completion)
    }

    /// Cancel `request` and take its buffer back
    ///
    /// `Completion::Completed` means the operation finished before the
    /// cancel could take effect; `AlreadyCompleted` means another caller
    /// already observed that.
    pub fn cancel(&self, request: TrackedId) -> Result<Completion> {
        let completion = self.ledger.cancel(
            request,
            |native| {
                let _gate = self.gate.enter(&self.negotiator)?;
                self.runtime.cancel(native)
            },
            |native| self.wait_native(native, None),
        )?;
        self.retire(request);
        Ok(completion)
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.pending_count()
    }

    fn retire(&self, request: TrackedId) {
        if let Err(err) = self.registry.retire(request) {
            event!(Level::WARN, %request, error = %err, "resolved request was no longer live");
        }
    }

    /// Wait on a native request under the gate
    ///
    /// The runtime wait runs in `wait_slice` pieces and the gate is released
    /// between them, shared or exclusive. A blocked waiter therefore never
    /// keeps a lifecycle transition, or at lower levels another thread's
    /// call, queued behind it for longer than one slice.
    fn wait_native(&self, native: NativeHandle, until: Option<Instant>) -> Result<WaitStatus> {
        loop {
            let (gate, _) = self.gate.enter(&self.negotiator)?;
            let slice_end = Instant::now() + self.config.wait_slice;
            let bound = until.map_or(slice_end, |u| u.min(slice_end));
            let status = self.runtime.wait(native, Some(bound))?;
            drop(gate);

            match status {
                WaitStatus::TimedOut if until.is_none_or(|u| Instant::now() < u) => {
                    std::thread::yield_now();
                }
                status => return Ok(status),
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            state: self.state().to_string(),
            granted_level: self.current_level(),
            live_handles: self.registry.live_count(),
            live_communicators: self.registry.live_count_of(HandleKind::Communicator),
            live_groups: self.registry.live_count_of(HandleKind::Group),
            live_requests: self.registry.live_count_of(HandleKind::Request),
            pending_operations: self.ledger.pending_count(),
            oldest_pending_ms: self
                .ledger
                .oldest_pending_age()
                .map(|age| age.as_millis() as u64),
        }
    }
}

impl<R: NativeRuntime + 'static> Session<R> {
    /// [`Self::complete`] on the caller's tokio blocking pool
    ///
    /// At `Funneled` or `Single` the pool thread is not the initializing
    /// thread, so this fails with `ThreadLevelViolation`.
    pub async fn complete_async(
        self: &Arc<Self>,
        request: TrackedId,
        deadline: Option<Duration>,
    ) -> Result<BufferToken> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.complete(request, deadline))
            .await
            .map_err(|e| BindingError::Runtime(format!("completion task failed: {}", e)))?
    }
}

impl<R: NativeRuntime> Drop for Session<R> {
    fn drop(&mut self) {
        if !self.negotiator.state().is_initialized() {
            return;
        }

        let abandoned = self.ledger.abandon_pending();
        if abandoned > 0 {
            event!(Level::WARN, session = %self.id, abandoned, "session dropped with pending operations, buffers leaked");
        }

        if let Err(err) = self.finalize() {
            event!(Level::WARN, session = %self.id, error = %err, "finalize on drop failed");
        }
    }
}
