pub mod diff;
pub mod schedule;
pub mod snapshot;
pub mod source;
