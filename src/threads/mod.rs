//! Conversation threads: data model, lifecycle, and human-driven operations.

pub mod model;
pub mod service;
pub mod state;

pub use model::{Classification, Priority, Thread};
pub use service::ThreadService;
pub use state::ThreadStatus;
