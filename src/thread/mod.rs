pub mod gate;
pub mod negotiator;

pub use gate::{CallGate, GateGuard};
pub use negotiator::{Negotiated, SessionState, ThreadSupportNegotiator};
