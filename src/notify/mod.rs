//! Report delivery.

pub mod smtp;

use thiserror::Error;

pub use self::smtp::{SmtpMailer, SmtpSettings};

use crate::report::ReportMessage;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("report has no recipients")]
    NoRecipients,

    #[error("invalid mail address '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("building mail failed: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("mail relay error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers rendered reports. Delivery is attempted once; callers decide
/// whether a failure is logged or surfaced.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &ReportMessage) -> Result<(), NotifyError>;
}

/// Split comma-separated recipient lists, trimming blanks and duplicates.
pub fn parse_recipients<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        for addr in value.as_ref().split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if !out.iter().any(|seen| seen == addr) {
                out.push(addr.to_string());
            }
        }
    }
    out
}
