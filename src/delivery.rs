//! Mail delivery of export files with account fallback.

use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("Failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("Gave up after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Mail account as configured. Every field except `name` may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Account {
    pub name: String,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub sender_email: Option<String>,
    pub app_password: Option<String>,
    pub recipient_email: Option<String>,
}

impl Account {
    /// All credential fields, or `None` if any is missing or blank.
    pub fn resolve(&self) -> Option<ResolvedAccount> {
        fn field(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        Some(ResolvedAccount {
            name: self.name.clone(),
            smtp_server: field(&self.smtp_server)?,
            smtp_port: self.smtp_port?,
            sender_email: field(&self.sender_email)?,
            app_password: field(&self.app_password)?,
            recipient_email: field(&self.recipient_email)?,
        })
    }
}

/// Account with every credential present.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedAccount {
    pub name: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub sender_email: String,
    pub app_password: String,
    pub recipient_email: String,
}

impl fmt::Debug for ResolvedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAccount")
            .field("name", &self.name)
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("sender_email", &self.sender_email)
            .field("app_password", &"***")
            .field("recipient_email", &self.recipient_email)
            .finish()
    }
}

/// File attached to an outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// Mail content, independent of the account it goes out through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl Envelope {
    /// Compose the export mail for `period` with `files` attached.
    ///
    /// Files that do not exist are skipped.
    pub fn compose(files: &[PathBuf], period: &str) -> Result<Self, DeliveryError> {
        let mut attachments = Vec::with_capacity(files.len());
        for path in files {
            match std::fs::read(path) {
                Ok(content) => attachments.push(Attachment {
                    filename: file_name(path),
                    content,
                }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!("Attachment {} not found, skipping", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let listing: String = attachments
            .iter()
            .enumerate()
            .map(|(i, a)| format!("{}. {}\n", i + 1, a.filename))
            .collect();

        Ok(Self {
            subject: format!("Location track ({period})"),
            body: format!(
                "Location history for the requested period.\n\
                 - Period: {period}\n\n\
                 Attachments:\n{listing}"
            ),
            attachments,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Sends one mail through one account.
pub trait Mailer {
    fn send(
        &self,
        account: &ResolvedAccount,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// SMTP mailer using STARTTLS and password authentication.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_message(
        account: &ResolvedAccount,
        envelope: &Envelope,
    ) -> Result<Message, DeliveryError> {
        let from: Mailbox = account.sender_email.parse()?;
        let to: Mailbox = account.recipient_email.parse()?;
        let octet_stream = ContentType::parse("application/octet-stream")
            .unwrap_or(ContentType::TEXT_PLAIN);

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(envelope.body.clone()));
        for attachment in &envelope.attachments {
            parts = parts.singlepart(
                MailAttachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), octet_stream.clone()),
            );
        }

        Ok(Message::builder()
            .from(from)
            .to(to)
            .subject(envelope.subject.clone())
            .multipart(parts)?)
    }
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Mailer for SmtpMailer {
    async fn send(&self, account: &ResolvedAccount, envelope: &Envelope) -> Result<(), DeliveryError> {
        let message = Self::build_message(account, envelope)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.smtp_server)?
            .port(account.smtp_port)
            .credentials(Credentials::new(
                account.sender_email.clone(),
                account.app_password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build();

        match tokio::time::timeout(self.timeout, transport.send(message)).await {
            Ok(response) => {
                let response = response?;
                tracing::debug!(code = %response.code(), "SMTP accepted message");
                Ok(())
            }
            Err(_) => Err(DeliveryError::Timeout(self.timeout)),
        }
    }
}

/// Result of a delivery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent through the named account.
    Delivered { account: String },
    /// Every usable account was tried and failed.
    AllFailed { attempted: usize },
    /// No account had a complete set of credentials.
    NoUsableAccount,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Send `files` through the first account that works, then delete `files`.
///
/// Accounts missing a credential are skipped without counting as a failure.
/// Each usable account is tried at most once. The files are removed whether
/// or not delivery succeeded.
pub async fn send<M: Mailer>(
    mailer: &M,
    files: &[PathBuf],
    accounts: &[Account],
    period: &str,
) -> DeliveryOutcome {
    let outcome = match Envelope::compose(files, period) {
        Ok(envelope) => try_accounts(mailer, &envelope, accounts).await,
        Err(e) => {
            tracing::error!("Failed to read attachments: {}", e);
            DeliveryOutcome::AllFailed { attempted: 0 }
        }
    };

    remove_files(files);
    outcome
}

async fn try_accounts<M: Mailer>(
    mailer: &M,
    envelope: &Envelope,
    accounts: &[Account],
) -> DeliveryOutcome {
    let mut attempted = 0;

    for account in accounts {
        let Some(resolved) = account.resolve() else {
            tracing::warn!(account = %account.name, "Account is missing credentials, skipping");
            continue;
        };

        attempted += 1;
        tracing::info!(account = %resolved.name, "Sending via {}:{}", resolved.smtp_server, resolved.smtp_port);

        match mailer.send(&resolved, envelope).await {
            Ok(()) => {
                tracing::info!(account = %resolved.name, "Mail sent");
                return DeliveryOutcome::Delivered {
                    account: resolved.name,
                };
            }
            Err(e) => {
                tracing::warn!(account = %resolved.name, "Send failed: {}", e);
            }
        }
    }

    if attempted == 0 {
        DeliveryOutcome::NoUsableAccount
    } else {
        DeliveryOutcome::AllFailed { attempted }
    }
}

fn remove_files(files: &[PathBuf]) {
    for path in files {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
