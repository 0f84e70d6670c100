// ============================================================================
// mpiguard Library
// ============================================================================
//
// Safety layer between a message-passing runtime's native handle API and
// the code that uses it:
//
//   handle   - registry of live communicator/group/request handles and the
//              comparison oracle over them
//   thread   - thread-level negotiation and the call gate it drives
//   request  - ledger of in-flight non-blocking operations and their buffers
//   session  - the facade tying one runtime to all of the above
//   runtime  - the native call surface, plus an in-process loopback runtime
//
// ============================================================================

pub mod core;
pub mod handle;
pub mod request;
pub mod runtime;
pub mod session;
pub mod thread;

// Re-export main types for convenience
pub use core::{
    BindingError, BufferToken, ComparisonResult, HandleKind, NativeHandle, Provenance, Result,
    ThreadSupportLevel, TrackedId,
};
pub use handle::{ComparisonOracle, DrainReport, HandleRecord, HandleRegistry};
pub use request::{Completion, OperationKind, RequestLedger};
pub use runtime::{ANY_SOURCE, ANY_TAG, LoopbackConfig, LoopbackRuntime, NativeRuntime, WaitStatus};
pub use session::{Session, SessionConfig, SessionStats};
pub use thread::{SessionState, ThreadSupportNegotiator};
