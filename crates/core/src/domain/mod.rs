pub mod conversation;
pub mod task;
pub mod time_entry;
pub mod user;
