//! Outbound notifications.
//!
//! The engine only ever talks to the [`Notifier`] trait. The production
//! implementation delivers mail over SMTP ([`smtp::SmtpNotifier`]); the
//! subject and body of every message come from [`message::MessageFormatter`].

use async_trait::async_trait;

pub mod message;
pub mod smtp;

pub use message::MessageFormatter;
pub use smtp::SmtpNotifier;

/// A rendered message, ready to be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("Unable to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("Templating error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("No recipients configured")]
    NoRecipients,
    #[error("Invalid SMTP timeout: {0}")]
    Timeout(#[from] std::time::TryFromFloatSecsError),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Keeps every delivered notification in memory. Can be switched into a
    /// failing mode to simulate transport errors.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        failing: AtomicBool,
    }

    impl RecordingNotifier {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().expect("Poisoned mutex").clone()
        }

        pub fn subjects(&self) -> Vec<String> {
            self.sent().into_iter().map(|n| n.subject).collect()
        }

        pub fn count_containing(&self, needle: &str) -> usize {
            self.subjects()
                .iter()
                .filter(|subject| subject.contains(needle))
                .count()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError::NoRecipients);
            }
            self.sent
                .lock()
                .expect("Poisoned mutex")
                .push(notification.clone());
            Ok(())
        }
    }
}
