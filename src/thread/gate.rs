use super::negotiator::{Negotiated, ThreadSupportNegotiator};
use crate::core::Result;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Held for the duration of one runtime call
#[derive(Debug)]
pub enum GateGuard<'a> {
    /// Other callers may be inside the runtime at the same time
    Shared(RwLockReadGuard<'a, ()>),
    /// This caller is alone in the runtime
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl GateGuard<'_> {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, GateGuard::Exclusive(_))
    }
}

/// Ordering discipline for calls into the runtime
///
/// At `Multiple` calls share the gate and run concurrently. Below that every
/// call takes it exclusively, whatever concurrency the caller brings.
/// Initialization and finalization always take it exclusively, so no call
/// can straddle a lifecycle transition.
#[derive(Debug, Default)]
pub struct CallGate {
    lock: RwLock<()>,
}

impl CallGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive(&self) -> Result<GateGuard<'_>> {
        Ok(GateGuard::Exclusive(self.lock.write()?))
    }

    /// Admit one runtime call under the currently negotiated level
    ///
    /// The level is read, the gate taken accordingly, and the level read
    /// again under the gate; if a lifecycle transition slipped in between,
    /// admission starts over against the new state.
    pub fn enter<'a>(
        &'a self,
        negotiator: &ThreadSupportNegotiator,
    ) -> Result<(GateGuard<'a>, Negotiated)> {
        loop {
            let before = negotiator.admission()?;
            before.check_calling_thread()?;

            let guard = if before.granted.allows_concurrent_calls() {
                GateGuard::Shared(self.lock.read()?)
            } else {
                GateGuard::Exclusive(self.lock.write()?)
            };

            let after = negotiator.admission()?;
            if after.epoch == before.epoch {
                return Ok((guard, after));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BindingError, ThreadSupportLevel};
    use crate::runtime::{LoopbackConfig, LoopbackRuntime};

    fn negotiated(max: ThreadSupportLevel) -> (LoopbackRuntime, ThreadSupportNegotiator) {
        let rt = LoopbackRuntime::new(LoopbackConfig::default().max_level(max)).unwrap();
        let negotiator = ThreadSupportNegotiator::new();
        negotiator
            .initialize(&rt, ThreadSupportLevel::Multiple)
            .unwrap();
        (rt, negotiator)
    }

    #[test]
    fn test_not_initialized_is_refused() {
        let gate = CallGate::new();
        let negotiator = ThreadSupportNegotiator::new();
        assert!(matches!(
            gate.enter(&negotiator),
            Err(BindingError::NotInitialized)
        ));
    }

    #[test]
    fn test_multiple_shares_gate() {
        let (_rt, negotiator) = negotiated(ThreadSupportLevel::Multiple);
        let gate = CallGate::new();
        let (first, _) = gate.enter(&negotiator).unwrap();
        assert!(!first.is_exclusive());

        // Another thread gets in while the first guard is still held
        let second_shared = std::thread::scope(|s| {
            s.spawn(|| gate.enter(&negotiator).map(|(g, _)| !g.is_exclusive()))
                .join()
                .unwrap()
        });
        assert_eq!(second_shared, Ok(true));
    }

    #[test]
    fn test_serialized_is_exclusive() {
        let (_rt, negotiator) = negotiated(ThreadSupportLevel::Serialized);
        let gate = CallGate::new();
        let (guard, n) = gate.enter(&negotiator).unwrap();
        assert!(guard.is_exclusive());
        assert_eq!(n.granted, ThreadSupportLevel::Serialized);
        assert!(gate.lock.try_read().is_err());
    }
}
