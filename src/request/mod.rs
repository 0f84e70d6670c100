pub mod completion;
pub mod ledger;

pub use completion::{Completion, OperationKind};
pub use ledger::RequestLedger;
