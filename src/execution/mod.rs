// =============================================================================
// Execution subsystem — order lifecycle engine and broker reconciliation
// =============================================================================

pub mod engine;
pub mod reconcile;

pub use engine::{ExecutionEngine, ExecutionReport, OrderResult};
