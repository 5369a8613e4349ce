//! Job completion notices.
//!
//! The worker only needs "tell someone job X finished with status Y". The
//! shipped [`LogNotifier`] composes the confirmation email and logs it rather
//! than handing it to a mail transport.

use crate::error::{Error, Result};
use crate::model::Status;
use tracing::info;

/// Side-effecting notification capability injected into workers.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, job_id: &str, status: Status, details: &str, target: Option<&str>)
    -> Result<()>;
}

/// A composed confirmation email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    /// Build the notice for a finished job. A missing or blank `target`
    /// falls back to `default_to`.
    pub fn compose(
        from: &str,
        default_to: &str,
        job_id: &str,
        status: Status,
        details: &str,
        target: Option<&str>,
    ) -> Self {
        let to = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(default_to);
        Self {
            from: from.to_string(),
            to: to.to_string(),
            subject: format!("[Work Confirmation] jobId={job_id} status={status}"),
            body: format!(
                "Hello,\n\nYour job has completed.\n\nJob ID: {job_id}\nStatus: {status}\nDetails: {details}\n\nRegards,\nRelay"
            ),
        }
    }
}

/// Composes the email and logs it.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    from: String,
    default_to: String,
}

impl LogNotifier {
    pub fn new(from: impl Into<String>, default_to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            default_to: default_to.into(),
        }
    }
}

impl Notifier for LogNotifier {
    fn notify(
        &self,
        job_id: &str,
        status: Status,
        details: &str,
        target: Option<&str>,
    ) -> Result<()> {
        let msg = EmailMessage::compose(&self.from, &self.default_to, job_id, status, details, target);
        if msg.to.is_empty() {
            return Err(Error::NotificationFailure(format!(
                "no recipient for job {job_id}"
            )));
        }
        info!(
            to = %msg.to,
            from = %msg.from,
            subject = %msg.subject,
            job_id,
            "confirmation email composed"
        );
        Ok(())
    }
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _: &str, _: Status, _: &str, _: Option<&str>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_target_falls_back_to_default() {
        let msg = EmailMessage::compose(
            "relay@example.com",
            "ops@example.com",
            "J1",
            Status::Success,
            "ok",
            Some("   "),
        );
        assert_eq!(msg.to, "ops@example.com");
        assert_eq!(msg.subject, "[Work Confirmation] jobId=J1 status=SUCCESS");
        assert!(msg.body.contains("Details: ok"));
    }

    #[test]
    fn explicit_target_wins() {
        let msg = EmailMessage::compose("f", "d", "J1", Status::Failure, "x", Some("u@example.com"));
        assert_eq!(msg.to, "u@example.com");
    }

    #[test]
    fn log_notifier_needs_a_recipient() {
        let notifier = LogNotifier::new("relay@example.com", "");
        assert!(notifier.notify("J1", Status::Success, "ok", None).is_err());
        assert!(
            notifier
                .notify("J1", Status::Success, "ok", Some("u@example.com"))
                .is_ok()
        );
    }
}
