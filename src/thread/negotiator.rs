// ============================================================================
// Thread Support Negotiation
// ============================================================================
//
// Session lifecycle as an explicit state machine:
//
//   Uninitialized ──initialize──> Initialized ──finalize──> Finalized
//                                     ^                         │
//                                     └───────initialize────────┘
//
// The granted level is recorded once per epoch and is the only level the
// rest of the crate consults.
//
// ============================================================================

use crate::core::{BindingError, Result, ThreadSupportLevel};
use crate::handle::{DrainReport, HandleRegistry};
use crate::request::RequestLedger;
use crate::runtime::NativeRuntime;
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Instant;
use tracing::{Level, event};

/// What initialization negotiated for the current epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub requested: ThreadSupportLevel,
    pub granted: ThreadSupportLevel,
    /// Thread that called `initialize`
    pub owner: ThreadId,
    /// Increments on every successful initialization
    pub epoch: u64,
    pub since: Instant,
}

impl Negotiated {
    /// Reject calls the granted level does not permit from the current thread
    pub fn check_calling_thread(&self) -> Result<()> {
        if self.granted.allows_foreign_threads() {
            return Ok(());
        }

        let current = std::thread::current().id();
        if current != self.owner {
            return Err(BindingError::ThreadLevelViolation {
                level: self.granted,
                reason: format!(
                    "only the initializing thread {:?} may call the runtime, not {:?}",
                    self.owner, current
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized(Negotiated),
    Finalized,
}

impl SessionState {
    pub fn is_initialized(&self) -> bool {
        matches!(self, SessionState::Initialized(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "UNINITIALIZED"),
            SessionState::Initialized(n) => write!(f, "INITIALIZED({})", n.granted),
            SessionState::Finalized => write!(f, "FINALIZED"),
        }
    }
}

/// Wraps runtime initialization and records the granted thread level
#[derive(Debug)]
pub struct ThreadSupportNegotiator {
    state: Mutex<SessionState>,
    epochs: Mutex<u64>,
}

impl Default for ThreadSupportNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSupportNegotiator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Uninitialized),
            epochs: Mutex::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        Ok(self.state.lock()?)
    }

    /// Initialize the runtime and return the level actually granted
    ///
    /// A runtime that grants more than was requested is clamped to the
    /// request: callers asked for a weaker guarantee and only get that.
    pub fn initialize(
        &self,
        runtime: &dyn NativeRuntime,
        requested: ThreadSupportLevel,
    ) -> Result<ThreadSupportLevel> {
        let mut state = self.lock()?;
        if state.is_initialized() {
            return Err(BindingError::AlreadyInitialized);
        }

        let raw = runtime
            .init_thread(requested.raw())
            .map_err(|e| BindingError::InitFailed(e.to_string()))?;
        let offered = ThreadSupportLevel::from_raw(raw).ok_or_else(|| {
            BindingError::InitFailed(format!("runtime granted unknown thread level code {}", raw))
        })?;

        let granted = if offered > requested {
            event!(
                Level::WARN,
                %requested,
                %offered,
                "runtime granted more than requested, clamping"
            );
            requested
        } else {
            offered
        };

        let epoch = {
            let mut epochs = self.epochs.lock()?;
            *epochs += 1;
            *epochs
        };

        *state = SessionState::Initialized(Negotiated {
            requested,
            granted,
            owner: std::thread::current().id(),
            epoch,
            since: Instant::now(),
        });

        event!(Level::INFO, %requested, %granted, epoch, "runtime initialized");
        Ok(granted)
    }

    /// Granted level; `None` before initialization and after finalization
    pub fn current_level(&self) -> Option<ThreadSupportLevel> {
        match self.state() {
            SessionState::Initialized(n) => Some(n.granted),
            _ => None,
        }
    }

    pub fn requested_level(&self) -> Option<ThreadSupportLevel> {
        match self.state() {
            SessionState::Initialized(n) => Some(n.requested),
            _ => None,
        }
    }

    pub fn owner_thread(&self) -> Option<ThreadId> {
        match self.state() {
            SessionState::Initialized(n) => Some(n.owner),
            _ => None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Uninitialized)
    }

    /// Negotiated parameters, or `NotInitialized`
    pub fn admission(&self) -> Result<Negotiated> {
        match *self.lock()? {
            SessionState::Initialized(n) => Ok(n),
            _ => Err(BindingError::NotInitialized),
        }
    }

    /// Undo an initialization whose follow-up setup failed
    ///
    /// The session returns to the state it was in before `initialize`, and
    /// the runtime is finalized again so a later `initialize` can succeed.
    pub(crate) fn roll_back(&self, runtime: &dyn NativeRuntime) -> Result<()> {
        let mut state = self.lock()?;
        let negotiated = match *state {
            SessionState::Initialized(n) => n,
            _ => return Err(BindingError::NotInitialized),
        };

        // The epoch is handed back, so any earlier epoch was finalized
        *self.epochs.lock()? = negotiated.epoch - 1;
        *state = if negotiated.epoch > 1 {
            SessionState::Finalized
        } else {
            SessionState::Uninitialized
        };
        event!(Level::WARN, epoch = negotiated.epoch, "initialization rolled back");
        runtime.finalize()
    }

    /// Tear the runtime down
    ///
    /// Refuses while the ledger still holds pending operations. Otherwise
    /// drains the registry, drops ledger tombstones and finalizes the
    /// runtime. The session counts as finalized even if the native call
    /// fails; its error is still returned.
    pub fn finalize(
        &self,
        runtime: &dyn NativeRuntime,
        ledger: &RequestLedger,
        registry: &HandleRegistry,
        free_derived: bool,
    ) -> Result<DrainReport> {
        let mut state = self.lock()?;
        let negotiated = match *state {
            SessionState::Initialized(n) => n,
            _ => return Err(BindingError::NotInitialized),
        };

        let pending = ledger.pending_count();
        if pending > 0 {
            return Err(BindingError::PendingOperationsRemain { count: pending });
        }

        let report = registry.drain(runtime, free_derived)?;
        ledger.clear()?;
        *state = SessionState::Finalized;

        runtime.finalize()?;
        event!(
            Level::INFO,
            epoch = negotiated.epoch,
            invalidated = report.invalidated,
            freed = report.freed,
            uptime_ms = negotiated.since.elapsed().as_millis() as u64,
            "runtime finalized"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LoopbackConfig, LoopbackRuntime};

    fn runtime(max: ThreadSupportLevel) -> LoopbackRuntime {
        LoopbackRuntime::new(LoopbackConfig::default().max_level(max)).unwrap()
    }

    #[test]
    fn test_granted_never_exceeds_requested() {
        for max in ThreadSupportLevel::ALL {
            for requested in ThreadSupportLevel::ALL {
                let rt = runtime(max);
                let negotiator = ThreadSupportNegotiator::new();
                let granted = negotiator.initialize(&rt, requested).unwrap();
                assert!(granted <= requested);
                assert_eq!(granted, requested.min(max));
                assert_eq!(negotiator.current_level(), Some(granted));
            }
        }
    }

    #[test]
    fn test_overgrant_is_clamped() {
        let rt = LoopbackRuntime::new(
            LoopbackConfig::default().granted_override(ThreadSupportLevel::Multiple.raw()),
        )
        .unwrap();
        let negotiator = ThreadSupportNegotiator::new();
        let granted = negotiator
            .initialize(&rt, ThreadSupportLevel::Funneled)
            .unwrap();
        assert_eq!(granted, ThreadSupportLevel::Funneled);
    }

    #[test]
    fn test_unknown_level_code_fails_init() {
        let rt = LoopbackRuntime::new(LoopbackConfig::default().granted_override(17)).unwrap();
        let negotiator = ThreadSupportNegotiator::new();
        let err = negotiator
            .initialize(&rt, ThreadSupportLevel::Single)
            .unwrap_err();
        assert!(matches!(err, BindingError::InitFailed(_)));
        assert_eq!(negotiator.current_level(), None);
    }

    #[test]
    fn test_second_initialize_fails() {
        let rt = runtime(ThreadSupportLevel::Multiple);
        let negotiator = ThreadSupportNegotiator::new();
        negotiator
            .initialize(&rt, ThreadSupportLevel::Serialized)
            .unwrap();
        assert_eq!(
            negotiator.initialize(&rt, ThreadSupportLevel::Serialized),
            Err(BindingError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_finalize_lifecycle() {
        let rt = runtime(ThreadSupportLevel::Multiple);
        let negotiator = ThreadSupportNegotiator::new();
        let ledger = RequestLedger::new();
        let registry = HandleRegistry::new();

        assert_eq!(
            negotiator.finalize(&rt, &ledger, &registry, true),
            Err(BindingError::NotInitialized)
        );

        negotiator
            .initialize(&rt, ThreadSupportLevel::Multiple)
            .unwrap();
        let first_epoch = negotiator.admission().unwrap().epoch;
        negotiator.finalize(&rt, &ledger, &registry, true).unwrap();
        assert_eq!(negotiator.state(), SessionState::Finalized);
        assert_eq!(negotiator.current_level(), None);

        // A new epoch may start after finalization
        negotiator.initialize(&rt, ThreadSupportLevel::Single).unwrap();
        assert!(negotiator.admission().unwrap().epoch > first_epoch);
    }

    #[test]
    fn test_funneled_rejects_foreign_thread() {
        let rt = runtime(ThreadSupportLevel::Funneled);
        let negotiator = ThreadSupportNegotiator::new();
        negotiator
            .initialize(&rt, ThreadSupportLevel::Multiple)
            .unwrap();
        let negotiated = negotiator.admission().unwrap();
        assert!(negotiated.check_calling_thread().is_ok());

        let from_other = std::thread::spawn(move || negotiated.check_calling_thread())
            .join()
            .unwrap();
        assert!(matches!(
            from_other,
            Err(BindingError::ThreadLevelViolation {
                level: ThreadSupportLevel::Funneled,
                ..
            })
        ));
    }
}
