//! Scan Deletion Engine (C10).

mod deletion;

pub use deletion::{run_scan_deletion, DeletionPlan, ScanDeletionRequest, ScanDeletionResult};
