//! Failure taxonomy shared by every planner and command: classify an error
//! message, turn the class into operator advice, and keep an append-only
//! JSON-lines log that can be queried afterwards.

pub mod classify;
pub mod error;
pub mod event;
pub mod recorder;

pub use classify::{advise, classify, Advice, Category, Classification};
pub use error::FailureError;
pub use event::{FailureEvent, Phase};
pub use recorder::{find_event, list_events, record_best_effort, EventQuery, Recorded, Recorder};
