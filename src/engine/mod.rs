//! Probe/receipt correlation engine
//!
//! The pipeline: a session runner sends probes through its adapter, the
//! correlator matches receipts (or timeouts) back to them and classifies
//! the device, the insights aggregator summarizes the point stream, and
//! the supervisor owns the per-session task trees.

pub mod classifier;
pub mod correlator;
pub mod insights;
pub mod runner;
pub mod supervisor;

pub use classifier::Classifier;
pub use correlator::Correlator;
pub use insights::InsightsAggregator;
pub use runner::SessionRunner;
pub use supervisor::SessionSupervisor;
