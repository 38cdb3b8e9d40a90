//! Duplicate resolution and cross-catalog linking pipeline.

pub mod grouping;
pub mod linker;
pub mod planner;
pub mod report;
pub mod runner;

pub use report::{ReportEvent, ReportTotals, RunMode, RunReport};
pub use runner::{run, ReconDeps, RunOptions, RunScope};
