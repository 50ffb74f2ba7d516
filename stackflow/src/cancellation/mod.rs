//! Cooperative cancellation for workflow executions and polling loops.

mod token;

pub use token::CancellationToken;
