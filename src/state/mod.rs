//! State module for tracking fetch task progress
//!
//! # Components
//!
//! - `TaskState`: lifecycle of a single fetch task (queued, dispatched, succeeded, failed, cancelled)

mod task_state;

pub use task_state::TaskState;
