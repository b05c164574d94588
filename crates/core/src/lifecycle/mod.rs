pub mod task;
pub mod time_entry;

pub use task::{TaskLifecycleManager, TaskUpdate};
pub use time_entry::TimeEntryLifecycleManager;
