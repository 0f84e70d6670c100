pub mod comparison;
pub mod registry;

pub use comparison::ComparisonOracle;
pub use registry::{DrainReport, HandleRecord, HandleRegistry};
