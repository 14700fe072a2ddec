//! Data models for the fieldsync engine.
//!
//! These models match the wire shape of the upstream system of record (camelCase JSON).

mod assignment;
mod event;
mod intervention;
mod notification;

pub use assignment::*;
pub use event::*;
pub use intervention::*;
pub use notification::*;
