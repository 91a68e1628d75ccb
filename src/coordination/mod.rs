//! Table scheduling and the threaded insertion pipeline

pub mod coordinator;
pub mod scheduler;
pub mod worker;

pub use coordinator::{Coordinator, InsertionState};
pub use scheduler::Schema;
