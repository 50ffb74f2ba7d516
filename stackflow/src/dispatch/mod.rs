//! Event dispatcher.
//!
//! Accepts object-created notifications for the ingest bucket, drops
//! redeliveries within a bounded window and starts one workflow execution
//! per new event.

mod dedup;
mod dispatcher;
mod event;

pub use dedup::DedupWindow;
pub use dispatcher::{Dispatched, DispatcherConfig, EventDispatcher};
pub use event::IngestEvent;
