//! Domain model for exposure reports.
//!
//! # Responsibility
//! - Define canonical data structures used by the repository layer.
//! - Keep owner exclusivity enforced in one place (`Owner`).
//!
//! # Invariants
//! - Every report is identified by a stable `ReportId`.
//! - Backend-specific column types never appear in these types.

pub mod report;
