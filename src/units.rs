//! Built-in work units.
//!
//! These are ordinary nodes exercising the framework: none of them is
//! special-cased by the scheduler.

mod file_loader;
mod log_aggregator;
mod sorter;

pub use file_loader::AsyncFileLoader;
pub use log_aggregator::LogAggregator;
pub use sorter::WorkUnitSorter;
