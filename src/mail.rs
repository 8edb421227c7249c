//! Email delivery for bridged notifications.
//!
//! Each notification becomes one HTML message addressed to every configured
//! recipient. There is no retry at this layer; a failed send is reported to
//! the caller and the next notification proceeds.
//!
//! The transport sits behind [`EmailTransport`] so tests can inject a
//! recording double instead of talking to an SMTP server.

use crate::config::MailSettings;
use crate::error::MailError;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::{AutoEscape, Environment, context};
use std::sync::Arc;

const BODY_TEMPLATE_NAME: &str = "body.html";
const BODY_TEMPLATE: &str = "<div><h3>{{ title }}</h3><p>{{ body }}</p></div>";

/// Async email transport abstraction.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send one message. The error string is the transport's description.
    async fn send_email(&self, message: Message) -> Result<(), String>;
}

/// SMTP authentication policy.
///
/// Three-way switch driven by the password and the `insecure` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSelection {
    /// No password configured.
    Unauthenticated,
    /// Password with `insecure`: challenge-response `LOGIN` exchange.
    ChallengeResponse,
    /// Password without `insecure`: `PLAIN`, expected over a secure channel.
    Plain,
}

impl AuthSelection {
    pub fn for_settings(settings: &MailSettings) -> Self {
        match (&settings.password, settings.insecure) {
            (None, _) => AuthSelection::Unauthenticated,
            (Some(_), true) => AuthSelection::ChallengeResponse,
            (Some(_), false) => AuthSelection::Plain,
        }
    }

    /// SMTP mechanism offered to the server, if any.
    pub fn mechanism(&self) -> Option<Mechanism> {
        match self {
            AuthSelection::Unauthenticated => None,
            AuthSelection::ChallengeResponse => Some(Mechanism::Login),
            AuthSelection::Plain => Some(Mechanism::Plain),
        }
    }
}

/// Real SMTP transport wrapper implementing `EmailTransport`.
///
/// Plain submission to `host:port`; no TLS upgrade is negotiated.
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
    auth: AuthSelection,
}

impl SmtpTransport {
    pub fn from_settings(settings: &MailSettings) -> Self {
        let auth = AuthSelection::for_settings(settings);
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(settings.host.as_str())
                .port(settings.port);

        if let (Some(password), Some(mechanism)) = (&settings.password, auth.mechanism()) {
            builder = builder
                .credentials(Credentials::new(
                    settings.auth_identity().to_string(),
                    password.expose().to_string(),
                ))
                .authentication(vec![mechanism]);
        }

        Self {
            inner: builder.build(),
            auth,
        }
    }

    /// Authentication policy this transport was built with.
    pub fn auth(&self) -> AuthSelection {
        self.auth
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send_email(&self, message: Message) -> Result<(), String> {
        self.inner
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Formats and sends one email per notification.
pub struct Mailer {
    transport: Arc<dyn EmailTransport>,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_prefix: Option<String>,
    /// Right-hand side of generated Message-IDs.
    host: String,
    env: Environment<'static>,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject_prefix", &self.subject_prefix)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Mailer {
    /// Creates a mailer with an SMTP transport built from `settings`.
    pub fn from_settings(settings: &MailSettings) -> Result<Self, MailError> {
        let transport = SmtpTransport::from_settings(settings);
        tracing::debug!(
            host = %settings.host,
            port = settings.port,
            auth = ?transport.auth(),
            "SMTP transport ready"
        );
        Self::with_transport(settings, Arc::new(transport))
    }

    /// Creates a mailer that sends through `transport`.
    pub fn with_transport(
        settings: &MailSettings,
        transport: Arc<dyn EmailTransport>,
    ) -> Result<Self, MailError> {
        let from = settings
            .sender()
            .map_err(|e| MailError::InvalidAddress(e.to_string()))?;
        let to = settings
            .recipients()
            .map_err(|e| MailError::InvalidAddress(e.to_string()))?;

        let mut env = Environment::new();
        env.add_template(BODY_TEMPLATE_NAME, BODY_TEMPLATE)
            .map_err(|e| MailError::Build(format!("body template: {}", e)))?;
        let escape = settings.escape_html;
        env.set_auto_escape_callback(move |_| {
            if escape {
                AutoEscape::Html
            } else {
                AutoEscape::None
            }
        });

        Ok(Self {
            transport,
            from,
            to,
            subject_prefix: settings.subject.clone(),
            host: settings.host.clone(),
            env,
        })
    }

    /// Subject line: the title, prefixed when a prefix is configured.
    pub fn subject_for(&self, title: &str) -> String {
        match &self.subject_prefix {
            Some(prefix) => format!("{}: {}", prefix, title),
            None => title.to_string(),
        }
    }

    /// Minimal HTML fragment: heading with the title, paragraph with the body.
    pub fn render_body(&self, title: &str, body: &str) -> Result<String, MailError> {
        let template = self
            .env
            .get_template(BODY_TEMPLATE_NAME)
            .map_err(|e| MailError::Build(e.to_string()))?;
        template
            .render(context! { title => title, body => body })
            .map_err(|e| MailError::Build(format!("body render: {}", e)))
    }

    /// Best-effort unique id: random 63-bit integer at the mail host.
    fn message_id(&self) -> String {
        format!("<{}@{}>", rand::random::<u64>() >> 1, self.host)
    }

    pub fn build_message(&self, title: &str, body: &str) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.subject_for(title))
            .message_id(Some(self.message_id()))
            .header(ContentType::TEXT_HTML);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        builder
            .body(self.render_body(title, body)?)
            .map_err(|e| MailError::Build(e.to_string()))
    }

    /// Sends one notification. No retry.
    pub async fn send(&self, title: &str, body: &str) -> Result<(), MailError> {
        let message = self.build_message(title, body)?;

        match self.transport.send_email(message).await {
            Ok(()) => {
                tracing::debug!(title = %title, recipients = self.to.len(), "Email sent");
                metrics::counter!("pushmail_emails_sent_total").increment(1);
                Ok(())
            }
            Err(error) => {
                metrics::counter!("pushmail_email_errors_total").increment(1);
                Err(MailError::TransportFailure(error))
            }
        }
    }
}
