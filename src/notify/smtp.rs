//! SMTP mailer on lettre's tokio transport.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use super::{Mailer, NotifyError};
use crate::report::ReportMessage;

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub sender: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub starttls: bool,
    pub timeout: Duration,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    relay: String,
}

fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|source| NotifyError::Address {
        address: address.to_string(),
        source,
    })
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        let sender = mailbox(&settings.sender)?;

        let builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        let mut builder = builder.port(settings.port).timeout(Some(settings.timeout));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            sender,
            relay: format!("{}:{}", settings.host, settings.port),
        })
    }

    /// Build the MIME message for `report`.
    pub fn compose(&self, report: &ReportMessage) -> Result<Message, NotifyError> {
        if report.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let mut builder = Message::builder().from(self.sender.clone()).subject(report.subject.as_str());
        for addr in &report.recipients {
            builder = builder.to(mailbox(addr)?);
        }
        Ok(builder.header(ContentType::TEXT_HTML).body(report.html_body.clone())?)
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &ReportMessage) -> Result<(), NotifyError> {
        let email = self.compose(message)?;
        self.transport.send(email).await?;
        info!(relay = %self.relay, subject = %message.subject, recipients = message.recipients.len(), "report mailed");
        Ok(())
    }
}
