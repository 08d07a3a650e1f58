use std::sync::Arc;

use url::Url;

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Delivery backend for outgoing mail.
pub trait EmailSender: Send + Sync {
    fn send(&self, email: &OutgoingEmail) -> Result<(), AppError>;
}

/// Writes messages to the log instead of delivering them.
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, email: &OutgoingEmail) -> Result<(), AppError> {
        log::info!(
            "Email to {} | {}\n{}",
            email.to,
            email.subject,
            email.html_body
        );
        Ok(())
    }
}

/// Composes the account emails and hands them to an [`EmailSender`].
///
/// Delivery failures are logged; they never fail the operation that
/// triggered the email.
#[derive(Clone)]
pub struct Mailer {
    sender: Arc<dyn EmailSender>,
    app_url: Url,
}

impl Mailer {
    pub fn new(sender: Arc<dyn EmailSender>, app_url: Url) -> Self {
        Mailer { sender, app_url }
    }

    fn link(&self, path: &str, params: &[(&str, &str)]) -> String {
        let mut url = self.app_url.clone();
        url.set_path(&format!("{}/{}", self.app_url.path().trim_end_matches('/'), path));
        url.query_pairs_mut().clear().extend_pairs(params);
        url.to_string()
    }

    fn deliver(&self, email: OutgoingEmail) {
        if let Err(e) = self.sender.send(&email) {
            log::error!("Failed to send '{}' to {}: {}", email.subject, email.to, e);
        }
    }

    pub fn send_two_factor_code(&self, to: &str, code: &str) {
        self.deliver(OutgoingEmail {
            to: to.to_owned(),
            subject: "Your Two-Factor Authentication Code".into(),
            html_body: format!(
                "<h2>Two-Factor Authentication</h2>\
                 <p>Your verification code is: <strong>{}</strong></p>\
                 <p>This code will expire in 10 minutes.</p>\
                 <p>If you didn't request this code, please ignore this email.</p>",
                code
            ),
        });
    }

    pub fn send_password_reset(&self, to: &str, token: &str) {
        let link = self.link("reset-password", &[("token", token), ("email", to)]);
        self.deliver(OutgoingEmail {
            to: to.to_owned(),
            subject: "Reset Your Password".into(),
            html_body: format!(
                "<h2>Password Reset Request</h2>\
                 <p>You requested to reset your password.</p>\
                 <p><a href='{}'>Reset Password</a></p>\
                 <p>This link will expire in 1 hour.</p>\
                 <p>If you didn't request this, please ignore this email.</p>",
                link
            ),
        });
    }

    pub fn send_invitation(&self, to: &str, token: &str, inviter_name: &str) {
        let link = self.link("accept-invitation", &[("token", token)]);
        self.deliver(OutgoingEmail {
            to: to.to_owned(),
            subject: "You've Been Invited!".into(),
            html_body: format!(
                "<h2>Team Invitation</h2>\
                 <p>{} has invited you to join their team.</p>\
                 <p><a href='{}'>Accept Invitation</a></p>\
                 <p>This invitation will expire in 7 days.</p>",
                inviter_name, link
            ),
        });
    }

    pub fn send_welcome(&self, to: &str, name: &str) {
        self.deliver(OutgoingEmail {
            to: to.to_owned(),
            subject: "Welcome to Our Platform!".into(),
            html_body: format!(
                "<h2>Welcome, {}!</h2>\
                 <p>Thank you for joining our platform.</p>",
                name
            ),
        });
    }
}

/// Keeps every message in memory; lets tests read codes and tokens.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryOutbox {
    sent: std::sync::Mutex<Vec<OutgoingEmail>>,
}

#[cfg(test)]
impl MemoryOutbox {
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_to(&self, to: &str) -> Option<OutgoingEmail> {
        self.sent().into_iter().rev().find(|email| email.to == to)
    }
}

#[cfg(test)]
impl EmailSender for MemoryOutbox {
    fn send(&self, email: &OutgoingEmail) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
