//! Core domain types: readings, relay actions, summaries, hub messages.

mod reading;
mod relay;
mod summary;
pub mod hub;

pub use reading::{PumpStatus, Reading};
pub use relay::{RelayAction, RelayActionKind};
pub use summary::{Summary, SummaryPeriod};
