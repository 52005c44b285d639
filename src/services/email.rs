//! Email delivery for reminders, newsletters and password resets

use std::str::FromStr;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, Message, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    SmtpTransport, Transport,
};

use crate::{
    config::EmailConfig,
    error::{AppError, AppResult},
};

/// Delivers one message to a list of recipients
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[String], subject: &str, body: &str) -> AppResult<()>;
}

#[derive(Clone)]
pub struct EmailService {
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn from_mailbox(&self) -> AppResult<Mailbox> {
        let from_name = self.config.smtp_from_name.as_deref().unwrap_or("Libris");
        Mailbox::from_str(&format!("{} <{}>", from_name, self.config.smtp_from))
            .map_err(|e| AppError::Internal(format!("Invalid from address: {}", e)))
    }

    /// Recipients go in Bcc so members never see each other's address
    fn build_message(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> AppResult<Message> {
        let from = self.from_mailbox()?;
        let mut builder = Message::builder()
            .from(from.clone())
            .to(from)
            .subject(subject);

        for recipient in recipients {
            let mailbox = Mailbox::from_str(recipient)
                .map_err(|e| {
                    AppError::Validation(format!("Invalid address {}: {}", recipient, e))
                })?;
            builder = builder.bcc(mailbox);
        }

        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(body.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(format!(
                                r#"<!DOCTYPE html><html lang="en"><body>{}</body></html>"#,
                                body.replace('\n', "<br>")
                            )),
                    ),
            )
            .map_err(|e| AppError::Internal(format!("Failed to build email: {}", e)))
    }

    fn transport(&self) -> AppResult<SmtpTransport> {
        let builder = if self.config.smtp_use_tls {
            SmtpTransport::starttls_relay(&self.config.smtp_host)
                .map_err(|e| AppError::Internal(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            SmtpTransport::builder_dangerous(&self.config.smtp_host)
        }
        .port(self.config.smtp_port);

        let builder = match (&self.config.smtp_username, &self.config.smtp_password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        Ok(builder.build())
    }
}

#[async_trait]
impl Notifier for EmailService {
    async fn notify(&self, recipients: &[String], subject: &str, body: &str) -> AppResult<()> {
        let email = self.build_message(recipients, subject, body)?;
        let mailer = self.transport()?;

        // SmtpTransport blocks on the socket
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::Internal(format!("Mail task failed: {}", e)))?
            .map_err(|e| AppError::UpstreamUnavailable(format!("Failed to send email: {}", e)))?;

        tracing::debug!("Sent \"{}\" to {} recipients", subject, recipients.len());
        Ok(())
    }
}
