//! Mail delivery seam
//!
//! Notification delivery is best-effort and fire-and-forget; the SMTP
//! submission itself lives in an external collaborator behind this trait.

use tracing::info;

pub trait Mailer: Send + Sync {
    /// Must not block the caller; implementations hand the message off to
    /// their own background machinery.
    fn send(&self, to: &str, subject: &str, body: &str);
}

/// Default mailer: records the submission in the log stream.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) {
        info!("mail queued to={} subject={}", to, subject);
    }
}
