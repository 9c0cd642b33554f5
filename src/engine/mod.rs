//! Interactive layer over the orchestrator
//!
//! 1. Planning - show the change set with prop diffs
//! 2. Executing - confirm, then apply or destroy with progress

pub mod differ;
pub mod executor;

pub use differ::display_plan;
pub use executor::{ExecuteOptions, apply, destroy};
