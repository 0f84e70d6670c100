use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Opaque identifier owned by the native runtime
///
/// The binding layer never frees or dereferences it on its own; it only
/// forwards it to the runtime while the corresponding registry slot is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native#{:#x}", self.0)
    }
}

/// Caller-facing token for a registered handle
///
/// Indexes a registry slot. The generation changes every time the slot is
/// reused, so an id that outlived its handle can never resolve to a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackedId {
    index: u32,
    generation: u32,
}

impl TrackedId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TrackedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}v{}", self.index, self.generation)
    }
}

/// What a native handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    Communicator,
    Group,
    Request,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Communicator => write!(f, "communicator"),
            HandleKind::Group => write!(f, "group"),
            HandleKind::Request => write!(f, "request"),
        }
    }
}

/// Where a registered handle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Created by initialization (world, self). Only finalization destroys it.
    Predefined,
    /// Duplicated, constructed, or registered by the caller.
    Derived,
    /// Request produced by a non-blocking call; consumed by completion.
    Operation,
}

// ============================================================================
// Communicator comparison
// ============================================================================

/// Outcome of comparing two communicators or groups
///
/// Raw codes match `MPI_IDENT`, `MPI_CONGRUENT`, `MPI_SIMILAR` and
/// `MPI_UNEQUAL`. Ordering is by strictness, not by raw code:
///
/// ```text
/// Identical > Congruent > Similar > Unequal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ComparisonResult {
    /// Same handle
    Identical = 0,
    /// Same members in the same order
    Congruent = 1,
    /// Same members in a different order
    Similar = 2,
    /// Different membership
    Unequal = 3,
}

impl ComparisonResult {
    /// Map a raw runtime code. Unknown codes are not approximated.
    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(ComparisonResult::Identical),
            1 => Some(ComparisonResult::Congruent),
            2 => Some(ComparisonResult::Similar),
            3 => Some(ComparisonResult::Unequal),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        self as i32
    }

    fn strictness(self) -> u8 {
        match self {
            ComparisonResult::Identical => 3,
            ComparisonResult::Congruent => 2,
            ComparisonResult::Similar => 1,
            ComparisonResult::Unequal => 0,
        }
    }

    /// True if `self` is at least as strict a relation as `other`
    pub fn is_at_least(self, other: ComparisonResult) -> bool {
        self >= other
    }

    /// Identical or congruent
    pub fn is_equivalent(self) -> bool {
        self.is_at_least(ComparisonResult::Congruent)
    }

    /// Anything but unequal
    pub fn has_same_membership(self) -> bool {
        self != ComparisonResult::Unequal
    }
}

impl PartialOrd for ComparisonResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComparisonResult {
    fn cmp(&self, other: &Self) -> Ordering {
        self.strictness().cmp(&other.strictness())
    }
}

impl fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonResult::Identical => write!(f, "identical"),
            ComparisonResult::Congruent => write!(f, "congruent"),
            ComparisonResult::Similar => write!(f, "similar"),
            ComparisonResult::Unequal => write!(f, "unequal"),
        }
    }
}

// ============================================================================
// Thread support
// ============================================================================

/// Graded guarantee about which threads may call into the runtime
///
/// Raw codes match `MPI_THREAD_SINGLE` through `MPI_THREAD_MULTIPLE`, and
/// the derived ordering follows permissiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ThreadSupportLevel {
    /// Only one thread exists
    Single = 0,
    /// Only the initializing thread calls the runtime
    Funneled = 1,
    /// Any thread, one at a time
    Serialized = 2,
    /// Any thread, concurrently
    Multiple = 3,
}

impl ThreadSupportLevel {
    pub const ALL: [ThreadSupportLevel; 4] = [
        ThreadSupportLevel::Single,
        ThreadSupportLevel::Funneled,
        ThreadSupportLevel::Serialized,
        ThreadSupportLevel::Multiple,
    ];

    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(ThreadSupportLevel::Single),
            1 => Some(ThreadSupportLevel::Funneled),
            2 => Some(ThreadSupportLevel::Serialized),
            3 => Some(ThreadSupportLevel::Multiple),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Whether unsynchronized calls from several threads may reach the runtime
    pub fn allows_concurrent_calls(self) -> bool {
        self == ThreadSupportLevel::Multiple
    }

    /// Whether threads other than the initializing one may call at all
    pub fn allows_foreign_threads(self) -> bool {
        self >= ThreadSupportLevel::Serialized
    }
}

impl fmt::Display for ThreadSupportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadSupportLevel::Single => write!(f, "single"),
            ThreadSupportLevel::Funneled => write!(f, "funneled"),
            ThreadSupportLevel::Serialized => write!(f, "serialized"),
            ThreadSupportLevel::Multiple => write!(f, "multiple"),
        }
    }
}

impl FromStr for ThreadSupportLevel {
    type Err = String;

    /// Accepts `serialized`, `MPI_THREAD_SERIALIZED`, `thread_serialized` or `2`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let name = lowered
            .strip_prefix("mpi_thread_")
            .or_else(|| lowered.strip_prefix("thread_"))
            .unwrap_or(&lowered);

        match name {
            "single" | "0" => Ok(ThreadSupportLevel::Single),
            "funneled" | "1" => Ok(ThreadSupportLevel::Funneled),
            "serialized" | "2" => Ok(ThreadSupportLevel::Serialized),
            "multiple" | "3" => Ok(ThreadSupportLevel::Multiple),
            _ => Err(format!("unknown thread support level '{}'", s)),
        }
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// Ownership token for a buffer handed to a non-blocking operation
///
/// Wraps a heap allocation, so the address the runtime was given stays
/// valid while the token is moved into and out of the request ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufferToken {
    bytes: Vec<u8>,
}

impl BufferToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Zero-filled receive buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self { bytes: vec![0; len] }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }
}

impl From<Vec<u8>> for BufferToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for BufferToken {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}
