use crate::{
    config::SmtpConfig,
    transport::{
        DeliveryFailure, DeliveryResult, MailTransport, MessageBody, OutboundMessage,
        TransportKind,
    },
};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{Tls, TlsParameters},
        Error as SmtpError,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, info};

pub struct SmtpMailTransport {
    config: SmtpConfig,
    timeout: Duration,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// Builds a fresh transport. Connections are not pooled, so every call opens its own and
    /// drops it when done.
    fn open(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, SmtpError> {
        let SmtpConfig {
            host,
            port,
            secure,
            credentials,
        } = &self.config;
        info!("Connecting to SMTP server {host}:{port} (secure: {secure})");
        let mut builder = if *secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
                .tls(Tls::Opportunistic(TlsParameters::new(host.clone())?))
        };
        builder = builder.port(*port).timeout(Some(self.timeout));
        if let Some(credentials) = credentials {
            builder = builder
                .credentials(Credentials::new(
                    credentials.username.clone(),
                    credentials.password.clone(),
                ))
                .authentication(vec![Mechanism::Plain, Mechanism::Login]);
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Smtp
    }

    async fn verify(&self) -> Result<(), DeliveryFailure> {
        let mailer = self.open().map_err(DeliveryFailure::verify)?;
        match mailer.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryFailure::verify(
                "SMTP server did not respond to NOOP",
            )),
            Err(error) => Err(DeliveryFailure::verify(error)),
        }
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let email = match build_message(message) {
            Ok(email) => email,
            Err(cause) => return DeliveryResult::Failed(DeliveryFailure::send(cause)),
        };
        let mailer = match self.open() {
            Ok(mailer) => mailer,
            Err(error) => return DeliveryResult::Failed(DeliveryFailure::send(error)),
        };
        match mailer.send(email).await {
            Ok(response) => {
                debug!("SMTP server accepted message with code {}", response.code());
                DeliveryResult::Sent {
                    provider_message_id: None,
                }
            }
            Err(error) => DeliveryResult::Failed(DeliveryFailure::send(format!(
                "Error sending message: {error}"
            ))),
        }
    }
}

fn build_message(message: &OutboundMessage) -> Result<Message, String> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&message.sender)?)
        .subject(message.subject.as_str());
    for recipient in &message.recipients {
        builder = builder.to(parse_mailbox(recipient)?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to)?);
    }
    let (content_type, body) = match &message.body {
        MessageBody::Html(body) => (ContentType::TEXT_HTML, body),
        MessageBody::Text(body) => (ContentType::TEXT_PLAIN, body),
    };
    builder
        .header(content_type)
        .body(body.clone())
        .map_err(|error| format!("Error building message: {error}"))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, String> {
    address
        .parse()
        .map_err(|error| format!("Invalid address {address:?}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::{build_message, SmtpMailTransport};
    use crate::{
        config::SmtpConfig,
        transport::{
            DeliveryFailure, DeliveryResult, DeliveryStage, MailTransport, MessageBody,
            OutboundMessage,
        },
    };
    use googletest::prelude::*;
    use serial_test::serial;
    use std::time::Duration;
    use test_support::fake_smtp::{
        fake_smtp, start_poisoned_smtp_server, start_rejecting_smtp_server,
        POISONED_SMTP_PORT, REJECTING_SMTP_PORT, SMTP_PORT, UNUSED_SMTP_PORT,
    };
    use tokio::time::timeout;

    fn transport(port: u16) -> SmtpMailTransport {
        SmtpMailTransport::new(
            SmtpConfig {
                host: "localhost".into(),
                port,
                secure: false,
                credentials: None,
            },
            Duration::from_secs(2),
        )
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            sender: "Web contact form <noreply@example.com>".into(),
            recipients: vec!["ops@example.com".into(), "sales@example.com".into()],
            subject: "New inquiry: Window cleaning".into(),
            body: MessageBody::Html("<p>Hello</p>".into()),
            reply_to: Some("ola@example.com".into()),
        }
    }

    #[test]
    fn builds_html_message_with_reply_to() -> Result<()> {
        let formatted = String::from_utf8(build_message(&message()).unwrap().formatted()).unwrap();

        verify_that!(
            formatted,
            all!(
                contains_substring("From: \"Web contact form\" <noreply@example.com>"),
                contains_substring("Reply-To: ola@example.com"),
                contains_substring("Content-Type: text/html"),
                contains_substring("ops@example.com"),
                contains_substring("sales@example.com")
            )
        )
    }

    #[test]
    fn rejects_unparseable_address() -> Result<()> {
        let message = OutboundMessage {
            reply_to: Some("not an address".into()),
            ..message()
        };

        verify_that!(build_message(&message), err(contains_substring("not an address")))
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn delivers_message_to_smtp_server() {
        fake_smtp().start();
        fake_smtp().flush().await;

        let result = transport(SMTP_PORT).send(&message()).await;

        expect_that!(
            result,
            eq(DeliveryResult::Sent {
                provider_message_id: None
            })
        );
        expect_that!(
            timeout(Duration::from_secs(1), fake_smtp().last_mail_content()).await,
            ok(ok(all!(
                contains_substring("Subject: New inquiry: Window cleaning"),
                contains_substring("<p>Hello</p>")
            )))
        );
    }

    #[tokio::test]
    #[serial]
    async fn verifies_reachable_server() -> Result<()> {
        fake_smtp().start();

        verify_that!(transport(SMTP_PORT).verify().await, ok(eq(())))
    }

    #[tokio::test]
    #[serial]
    async fn verify_fails_when_server_rejects_greeting() -> Result<()> {
        start_poisoned_smtp_server();

        verify_that!(
            transport(POISONED_SMTP_PORT).verify().await,
            err(field!(DeliveryFailure.stage, eq(DeliveryStage::TransportVerify)))
        )
    }

    #[tokio::test]
    #[serial]
    async fn verify_fails_when_nothing_listens() -> Result<()> {
        verify_that!(
            transport(UNUSED_SMTP_PORT).verify().await,
            err(field!(DeliveryFailure.stage, eq(DeliveryStage::TransportVerify)))
        )
    }

    #[tokio::test]
    #[serial]
    async fn send_fails_when_server_rejects_sender() -> Result<()> {
        start_rejecting_smtp_server();

        verify_that!(
            transport(REJECTING_SMTP_PORT).send(&message()).await,
            matches_pattern!(DeliveryResult::Failed(field!(
                DeliveryFailure.stage,
                eq(DeliveryStage::TransportSend)
            )))
        )
    }
}
