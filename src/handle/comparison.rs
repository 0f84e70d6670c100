use super::registry::HandleRegistry;
use crate::core::{BindingError, ComparisonResult, HandleKind, Result, TrackedId};
use crate::runtime::NativeRuntime;

/// Communicator and group comparison over tracked handles
///
/// Borrowed view over a registry and the runtime it mirrors. Both handles
/// must be live and of the same kind; the raw runtime code is mapped 1:1
/// onto [`ComparisonResult`].
pub struct ComparisonOracle<'a> {
    registry: &'a HandleRegistry,
    runtime: &'a dyn NativeRuntime,
}

impl<'a> ComparisonOracle<'a> {
    pub fn new(registry: &'a HandleRegistry, runtime: &'a dyn NativeRuntime) -> Self {
        Self { registry, runtime }
    }

    pub fn compare(&self, a: TrackedId, b: TrackedId) -> Result<ComparisonResult> {
        let left = self.registry.record(a)?;
        let right = self.registry.record(b)?;

        if left.kind != right.kind {
            return Err(BindingError::KindMismatch {
                id: b,
                expected: left.kind,
                found: right.kind,
            });
        }

        if a == b && left.kind != HandleKind::Request {
            return Ok(ComparisonResult::Identical);
        }

        let raw = match left.kind {
            HandleKind::Communicator => self.runtime.comm_compare(left.native, right.native)?,
            HandleKind::Group => self.runtime.group_compare(left.native, right.native)?,
            HandleKind::Request => {
                return Err(BindingError::KindMismatch {
                    id: a,
                    expected: HandleKind::Communicator,
                    found: HandleKind::Request,
                });
            }
        };

        ComparisonResult::from_raw(raw).ok_or_else(|| {
            BindingError::Runtime(format!(
                "comparison of {} and {} returned unknown code {}",
                a, b, raw
            ))
        })
    }

    /// Identical or congruent
    pub fn is_equivalent(&self, a: TrackedId, b: TrackedId) -> Result<bool> {
        Ok(self.compare(a, b)?.is_equivalent())
    }

    /// Same members, in any order
    pub fn has_same_membership(&self, a: TrackedId, b: TrackedId) -> Result<bool> {
        Ok(self.compare(a, b)?.has_same_membership())
    }
}
