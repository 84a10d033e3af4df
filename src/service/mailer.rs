//! Outbound email
//!
//! Email is a best-effort side effect for reminders: send failures are
//! recorded as a note on the job, never failed. `LogMailer` stands in
//! for a real SMTP relay and just writes the message to the log.

use futures::future::BoxFuture;

use crate::error::AppError;

/// Sends plain-text email.
pub trait Mailer: Send + Sync {
    fn send<'a>(
        &'a self,
        to: &'a str,
        subject: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), AppError>>;
}

/// Mailer that logs instead of sending.
#[derive(Clone, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send<'a>(
        &'a self,
        to: &'a str,
        subject: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move {
            tracing::info!(to = %to, subject = %subject, body_len = text.len(), "Email send (log only)");
            Ok(())
        })
    }
}
