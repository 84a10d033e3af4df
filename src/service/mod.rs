//! Collaborator services
//!
//! Side-effect interfaces the job dispatchers depend on, kept behind
//! traits so tests can substitute recording fakes.

mod mailer;
mod notifier;

pub use mailer::{LogMailer, Mailer};
pub use notifier::{DbNotifier, Notifier};
