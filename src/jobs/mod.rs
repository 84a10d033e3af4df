//! Background jobs
//!
//! The dispatcher gives every periodic worker the same shape: interval
//! timer, immediate first run, atomic claim of due items, isolated
//! per-item processing, graceful shutdown. The three domain jobs
//! (reminders, popularity refresh, data export) plus the dead-letter
//! sweep and the instance poller all plug into it.

mod dispatcher;
mod export;
mod popularity;
mod reminders;

pub use dispatcher::{Dispatcher, DispatcherSet, JobCycle};
pub use export::ExportDispatcher;
pub use popularity::PopularityRefresher;
pub use reminders::ReminderDispatcher;
