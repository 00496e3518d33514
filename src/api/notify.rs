//! Outbound account notifications.
//!
//! Tokens reach the notifier as content-free strings; links and subjects are
//! rendered here. Dispatch happens after the state change is stored, and a
//! delivery failure is logged without undoing it.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Confirmation { token: String },
    PasswordReset { token: String },
    Welcome { username: String },
}

impl Notification {
    #[must_use]
    pub const fn template(&self) -> &'static str {
        match self {
            Self::Confirmation { .. } => "confirmation",
            Self::PasswordReset { .. } => "password_reset",
            Self::Welcome { .. } => "welcome",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: &'static str,
    pub subject: String,
    pub body: String,
    pub link: Option<String>,
}

/// Render `notification` for `to_email`, building links under `base_url`.
#[must_use]
pub fn render(notification: &Notification, to_email: &str, base_url: &str) -> EmailMessage {
    let base = base_url.trim_end_matches('/');
    let (subject, body, link) = match notification {
        Notification::Confirmation { token } => {
            let link = format!("{base}/confirm-email/{token}");
            (
                "Confirm Your Email Address",
                format!(
                    "Thanks for signing up. Confirm your email address by opening {link}\n\
                     If you did not create an account, ignore this email."
                ),
                Some(link),
            )
        }
        Notification::PasswordReset { token } => {
            let link = format!("{base}/reset-password/{token}");
            (
                "Reset Your Password",
                format!(
                    "A password reset was requested for your account. Open {link} to choose a new password.\n\
                     The link is valid for a short time only. If you did not request it, ignore this email."
                ),
                Some(link),
            )
        }
        Notification::Welcome { username } => (
            "Welcome! Email Confirmed",
            format!("Hi {username}, your email address is confirmed and your account is ready."),
            None,
        ),
    };

    EmailMessage {
        to_email: to_email.to_string(),
        template: notification.template(),
        subject: subject.to_string(),
        body,
        link,
    }
}

/// Delivery abstraction for rendered messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev notifier that logs instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = message.template,
            subject = %message.subject,
            "email send stub"
        );
        if let Some(link) = &message.link {
            debug!(link = %link, "email link");
        }
        Ok(())
    }
}

/// Keeps every message in memory. Used by the HTTP flow tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<EmailMessage> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// Token from the newest message of `template` sent to `to_email`.
    #[must_use]
    pub fn last_token(&self, to_email: &str, template: &str) -> Option<String> {
        self.messages()
            .into_iter()
            .rev()
            .find(|message| message.to_email == to_email && message.template == template)
            .and_then(|message| message.link)
            .and_then(|link| link.rsplit('/').next().map(str::to_string))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    base_url: String,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, base_url: impl Into<String>) -> Self {
        Self {
            notifier,
            base_url: base_url.into(),
        }
    }

    /// Render and deliver. Failures are logged and swallowed.
    pub async fn dispatch(&self, to_email: &str, notification: Notification) {
        let message = render(&notification, to_email, &self.base_url);
        if let Err(err) = self.notifier.send(&message).await {
            error!(
                to_email = %to_email,
                template = message.template,
                "Failed to deliver notification: {err:#}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _message: &EmailMessage) -> Result<()> {
            Err(anyhow!("smtp unreachable"))
        }
    }

    #[test]
    fn confirmation_link_uses_base_url() {
        let message = render(
            &Notification::Confirmation {
                token: "ab12".to_string(),
            },
            "alice@x.com",
            "https://app.example.com/",
        );
        assert_eq!(message.subject, "Confirm Your Email Address");
        assert_eq!(
            message.link.as_deref(),
            Some("https://app.example.com/confirm-email/ab12")
        );
        assert!(message.body.contains("https://app.example.com/confirm-email/ab12"));
    }

    #[test]
    fn reset_and_welcome_subjects() {
        let reset = render(
            &Notification::PasswordReset {
                token: "cd34".to_string(),
            },
            "alice@x.com",
            "http://localhost:3000",
        );
        assert_eq!(reset.subject, "Reset Your Password");
        assert_eq!(
            reset.link.as_deref(),
            Some("http://localhost:3000/reset-password/cd34")
        );

        let welcome = render(
            &Notification::Welcome {
                username: "alice".to_string(),
            },
            "alice@x.com",
            "http://localhost:3000",
        );
        assert_eq!(welcome.subject, "Welcome! Email Confirmed");
        assert!(welcome.link.is_none());
    }

    #[tokio::test]
    async fn recording_notifier_exposes_last_token() {
        let recorder = Arc::new(RecordingNotifier::new());
        let dispatcher = NotificationDispatcher::new(recorder.clone(), "http://localhost:3000");
        for token in ["first", "second"] {
            dispatcher
                .dispatch(
                    "alice@x.com",
                    Notification::Confirmation {
                        token: token.to_string(),
                    },
                )
                .await;
        }
        assert_eq!(
            recorder.last_token("alice@x.com", "confirmation").as_deref(),
            Some("second")
        );
        assert!(recorder.last_token("bob@x.com", "confirmation").is_none());
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let dispatcher = NotificationDispatcher::new(Arc::new(FailingNotifier), "http://x");
        dispatcher
            .dispatch(
                "alice@x.com",
                Notification::Welcome {
                    username: "alice".to_string(),
                },
            )
            .await;
    }
}
