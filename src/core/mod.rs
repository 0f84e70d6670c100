pub mod error;
pub mod types;

pub use error::{BindingError, Result};
pub use types::{
    BufferToken, ComparisonResult, HandleKind, NativeHandle, Provenance, ThreadSupportLevel,
    TrackedId,
};
