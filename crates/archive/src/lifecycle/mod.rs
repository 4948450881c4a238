//! Lifecycle helpers for retention and partition spans.

pub mod partition;
pub mod retention;

pub use partition::{PartitionSize, PartitionSpan};
pub use retention::{DaysRetention, RetentionPolicy};
