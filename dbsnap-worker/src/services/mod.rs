pub mod processors;
pub mod queue;
pub mod retention;
pub mod scheduler;
