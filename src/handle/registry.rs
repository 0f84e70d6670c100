// ============================================================================
// Handle Registry
// ============================================================================
//
// Arena of native handles with a liveness flag per slot. Callers only ever
// see `TrackedId`s; a released slot is recycled with a new generation, so
// use-after-release and double release become checked errors instead of
// calls into the runtime with a dangling handle.
//
// ============================================================================

use crate::core::{BindingError, HandleKind, NativeHandle, Provenance, Result, TrackedId};
use crate::runtime::NativeRuntime;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{Level, event};

#[derive(Debug, Clone)]
struct Slot {
    native: NativeHandle,
    kind: HandleKind,
    provenance: Provenance,
    live: bool,
    generation: u32,
}

#[derive(Debug, Default)]
struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_native: HashMap<NativeHandle, TrackedId>,
}

impl RegistryInner {
    /// Live slot for `id`, or the error describing why it is not live
    fn live_slot(&self, id: TrackedId) -> Result<&Slot> {
        match self.slots.get(id.index() as usize) {
            Some(slot) if slot.generation == id.generation() && slot.live => Ok(slot),
            _ => Err(BindingError::StaleHandle(id)),
        }
    }
}

/// Snapshot of one registered handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleRecord {
    pub id: TrackedId,
    pub native: NativeHandle,
    pub kind: HandleKind,
    pub provenance: Provenance,
}

/// Result of draining the registry at finalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Handles whose liveness flag was cleared
    pub invalidated: usize,
    /// Derived handles passed to their native destructor
    pub freed: usize,
    /// Native destructor calls that failed
    pub free_failures: usize,
}

/// Tracks live native handles and their provenance
#[derive(Debug, Default)]
pub struct HandleRegistry {
    inner: Mutex<RegistryInner>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>> {
        Ok(self.inner.lock()?)
    }

    /// Register a native handle obtained from the runtime
    ///
    /// Requests are recorded as operation handles, everything else as derived.
    pub fn register(&self, native: NativeHandle, kind: HandleKind) -> Result<TrackedId> {
        let provenance = match kind {
            HandleKind::Request => Provenance::Operation,
            HandleKind::Communicator | HandleKind::Group => Provenance::Derived,
        };
        self.register_with(native, kind, provenance)
    }

    pub(crate) fn register_with(
        &self,
        native: NativeHandle,
        kind: HandleKind,
        provenance: Provenance,
    ) -> Result<TrackedId> {
        let mut inner = self.lock()?;
        if inner.by_native.contains_key(&native) {
            return Err(BindingError::DuplicateHandle(native));
        }

        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.native = native;
                slot.kind = kind;
                slot.provenance = provenance;
                slot.live = true;
                TrackedId::new(index, slot.generation)
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    native,
                    kind,
                    provenance,
                    live: true,
                    generation: 1,
                });
                TrackedId::new(index, 1)
            }
        };

        inner.by_native.insert(native, id);
        event!(Level::TRACE, %id, %native, %kind, "handle registered");
        Ok(id)
    }

    pub fn is_live(&self, id: TrackedId) -> bool {
        self.lock()
            .map(|inner| inner.live_slot(id).is_ok())
            .unwrap_or(false)
    }

    /// Native handle behind a live id of the expected kind
    pub fn resolve(&self, id: TrackedId, kind: HandleKind) -> Result<NativeHandle> {
        let inner = self.lock()?;
        let slot = inner.live_slot(id)?;
        if slot.kind != kind {
            return Err(BindingError::KindMismatch {
                id,
                expected: kind,
                found: slot.kind,
            });
        }
        Ok(slot.native)
    }

    pub fn record(&self, id: TrackedId) -> Result<HandleRecord> {
        let inner = self.lock()?;
        let slot = inner.live_slot(id)?;
        Ok(HandleRecord {
            id,
            native: slot.native,
            kind: slot.kind,
            provenance: slot.provenance,
        })
    }

    /// Release a handle, invoking its native destructor exactly once
    ///
    /// The slot is marked dead before the destructor runs, so a concurrent
    /// second release observes `AlreadyReleased` rather than a second free.
    /// Requests have no destructor of their own: the runtime consumes them
    /// on completion, so releasing one only clears its liveness flag.
    pub fn release(&self, id: TrackedId, runtime: &dyn NativeRuntime) -> Result<()> {
        let (native, kind) = {
            let mut inner = self.lock()?;
            let slot = match inner.slots.get_mut(id.index() as usize) {
                Some(slot) => slot,
                None => return Err(BindingError::StaleHandle(id)),
            };
            // Generations only grow, so a newer one than the slot's was never issued
            if id.generation() > slot.generation || id.generation() == 0 {
                return Err(BindingError::StaleHandle(id));
            }
            if id.generation() < slot.generation || !slot.live {
                return Err(BindingError::AlreadyReleased(id));
            }
            if slot.provenance == Provenance::Predefined {
                return Err(BindingError::PredefinedHandle(id));
            }

            slot.live = false;
            let (native, kind) = (slot.native, slot.kind);
            inner.by_native.remove(&native);
            inner.free.push(id.index());
            (native, kind)
        };

        event!(Level::DEBUG, %id, %native, %kind, "handle released");
        match kind {
            HandleKind::Communicator => runtime.comm_free(native),
            HandleKind::Group => runtime.group_free(native),
            HandleKind::Request => Ok(()),
        }
    }

    /// Clear a request's liveness after the runtime consumed it
    pub(crate) fn retire(&self, id: TrackedId) -> Result<()> {
        let mut inner = self.lock()?;
        let native = inner.live_slot(id)?.native;
        let index = id.index();
        inner.slots[index as usize].live = false;
        inner.by_native.remove(&native);
        inner.free.push(index);
        event!(Level::TRACE, %id, %native, "handle retired");
        Ok(())
    }

    /// Invalidate every live handle; optionally free derived ones first
    ///
    /// Predefined handles and requests are only invalidated. Native free
    /// failures are counted, not propagated: finalization proceeds anyway.
    pub fn drain(&self, runtime: &dyn NativeRuntime, free_derived: bool) -> Result<DrainReport> {
        let doomed: Vec<(TrackedId, Slot)> = {
            let mut inner = self.lock()?;
            let mut doomed = Vec::new();
            for (index, slot) in inner.slots.iter_mut().enumerate() {
                if slot.live {
                    slot.live = false;
                    doomed.push((TrackedId::new(index as u32, slot.generation), slot.clone()));
                }
            }
            for (id, _) in &doomed {
                inner.free.push(id.index());
            }
            inner.by_native.clear();
            doomed
        };

        let mut report = DrainReport {
            invalidated: doomed.len(),
            ..DrainReport::default()
        };

        if free_derived {
            for (id, slot) in doomed
                .iter()
                .filter(|(_, slot)| slot.provenance == Provenance::Derived)
            {
                let freed = match slot.kind {
                    HandleKind::Communicator => runtime.comm_free(slot.native),
                    HandleKind::Group => runtime.group_free(slot.native),
                    HandleKind::Request => continue,
                };
                match freed {
                    Ok(()) => report.freed += 1,
                    Err(err) => {
                        report.free_failures += 1;
                        event!(Level::WARN, %id, native = %slot.native, error = %err, "free during drain failed");
                    }
                }
            }
        }

        event!(
            Level::DEBUG,
            invalidated = report.invalidated,
            freed = report.freed,
            "registry drained"
        );
        Ok(report)
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .map(|inner| inner.by_native.len())
            .unwrap_or(0)
    }

    pub fn live_count_of(&self, kind: HandleKind) -> usize {
        self.lock()
            .map(|inner| inner.slots.iter().filter(|s| s.live && s.kind == kind).count())
            .unwrap_or(0)
    }

    /// Snapshots of all live handles in slot order
    pub fn live_records(&self) -> Vec<HandleRecord> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(index, slot)| HandleRecord {
                id: TrackedId::new(index as u32, slot.generation),
                native: slot.native,
                kind: slot.kind,
                provenance: slot.provenance,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LoopbackConfig, LoopbackRuntime};

    fn runtime() -> LoopbackRuntime {
        LoopbackRuntime::new(LoopbackConfig::default()).unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = HandleRegistry::new();
        let id = registry
            .register(NativeHandle(40), HandleKind::Communicator)
            .unwrap();

        assert!(registry.is_live(id));
        assert_eq!(
            registry.resolve(id, HandleKind::Communicator).unwrap(),
            NativeHandle(40)
        );
        assert!(matches!(
            registry.resolve(id, HandleKind::Group),
            Err(BindingError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_native_rejected() {
        let registry = HandleRegistry::new();
        registry.register(NativeHandle(7), HandleKind::Group).unwrap();
        assert_eq!(
            registry.register(NativeHandle(7), HandleKind::Group),
            Err(BindingError::DuplicateHandle(NativeHandle(7)))
        );
    }

    #[test]
    fn test_double_release_fails_and_frees_once() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        let native = rt.comm_dup(rt.comm_world()).unwrap();
        let id = registry.register(native, HandleKind::Communicator).unwrap();

        registry.release(id, &rt).unwrap();
        assert_eq!(
            registry.release(id, &rt),
            Err(BindingError::AlreadyReleased(id))
        );
        assert_eq!(rt.free_count(native), 1);
        assert!(!registry.is_live(id));
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        let first_native = rt.comm_dup(rt.comm_world()).unwrap();
        let first = registry
            .register(first_native, HandleKind::Communicator)
            .unwrap();
        registry.release(first, &rt).unwrap();

        let second = registry
            .register(NativeHandle(900), HandleKind::Group)
            .unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());

        // The old id must not reach the new handle
        assert!(!registry.is_live(first));
        assert_eq!(
            registry.resolve(first, HandleKind::Group),
            Err(BindingError::StaleHandle(first))
        );
        assert_eq!(
            registry.release(first, &rt),
            Err(BindingError::AlreadyReleased(first))
        );
        assert!(registry.is_live(second));
    }

    #[test]
    fn test_native_value_reusable_after_release() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        let native = rt.comm_group(rt.comm_world()).unwrap();
        let id = registry.register(native, HandleKind::Group).unwrap();
        registry.release(id, &rt).unwrap();

        assert!(registry.register(native, HandleKind::Group).is_ok());
    }

    #[test]
    fn test_predefined_cannot_be_released() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        let world = registry
            .register_with(rt.comm_world(), HandleKind::Communicator, Provenance::Predefined)
            .unwrap();

        assert_eq!(
            registry.release(world, &rt),
            Err(BindingError::PredefinedHandle(world))
        );
        assert!(registry.is_live(world));
    }

    #[test]
    fn test_unknown_id_is_stale() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        let ghost = TrackedId::new(12, 1);
        assert!(!registry.is_live(ghost));
        assert_eq!(
            registry.release(ghost, &rt),
            Err(BindingError::StaleHandle(ghost))
        );
    }

    #[test]
    fn test_unissued_generation_is_stale() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        let dup = rt.comm_dup(rt.comm_world()).unwrap();
        let id = registry.register(dup, HandleKind::Communicator).unwrap();

        let forged = TrackedId::new(id.index(), id.generation() + 3);
        assert_eq!(
            registry.release(forged, &rt),
            Err(BindingError::StaleHandle(forged))
        );
        let zero = TrackedId::new(id.index(), 0);
        assert_eq!(registry.release(zero, &rt), Err(BindingError::StaleHandle(zero)));

        // The real handle is untouched
        assert!(registry.is_live(id));
        assert_eq!(rt.free_count(dup), 0);

        registry.release(id, &rt).unwrap();
        assert_eq!(registry.release(id, &rt), Err(BindingError::AlreadyReleased(id)));
    }

    #[test]
    fn test_drain_frees_derived_only() {
        let rt = runtime();
        let registry = HandleRegistry::new();
        registry
            .register_with(rt.comm_world(), HandleKind::Communicator, Provenance::Predefined)
            .unwrap();
        let dup = rt.comm_dup(rt.comm_world()).unwrap();
        let group = rt.comm_group(rt.comm_world()).unwrap();
        registry.register(dup, HandleKind::Communicator).unwrap();
        registry.register(group, HandleKind::Group).unwrap();
        registry.register(NativeHandle(5000), HandleKind::Request).unwrap();

        let report = registry.drain(&rt, true).unwrap();
        assert_eq!(report.invalidated, 4);
        assert_eq!(report.freed, 2);
        assert_eq!(report.free_failures, 0);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(rt.free_count(dup), 1);
        assert_eq!(rt.free_count(group), 1);
    }

    #[test]
    fn test_live_records_by_kind() {
        let registry = HandleRegistry::new();
        registry.register(NativeHandle(1), HandleKind::Communicator).unwrap();
        registry.register(NativeHandle(2), HandleKind::Request).unwrap();
        registry.register(NativeHandle(3), HandleKind::Request).unwrap();

        assert_eq!(registry.live_count(), 3);
        assert_eq!(registry.live_count_of(HandleKind::Request), 2);
        let records = registry.live_records();
        assert_eq!(records[1].provenance, Provenance::Operation);
    }
}
