use crate::{
    config::{ConfigError, MailConfig, TransportConfig},
    resend::ResendMailTransport,
    smtp::SmtpMailTransport,
};
use async_trait::async_trait;
use std::fmt::{self, Display};

/// A message ready to hand to a transport. `recipients` is never empty and `sender` is always
/// the configured address; a submitter's address only ever appears as `reply_to`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: MessageBody,
    pub reply_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Html(String),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryResult {
    Sent { provider_message_id: Option<String> },
    Failed(DeliveryFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStage {
    TransportVerify,
    TransportSend,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub stage: DeliveryStage,
    pub cause: String,
}

impl DeliveryFailure {
    pub fn verify(cause: impl Display) -> Self {
        Self {
            stage: DeliveryStage::TransportVerify,
            cause: cause.to_string(),
        }
    }

    pub fn send(cause: impl Display) -> Self {
        Self {
            stage: DeliveryStage::TransportSend,
            cause: cause.to_string(),
        }
    }
}

impl Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStage::TransportVerify => write!(f, "transport-verify"),
            DeliveryStage::TransportSend => write!(f, "transport-send"),
        }
    }
}

impl Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.cause)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Smtp,
    Api,
}

/// Something which can deliver an [`OutboundMessage`].
///
/// Neither operation may fail past this boundary: every problem is reported as a
/// [`DeliveryFailure`]. Each call makes a single attempt.
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Checks that the transport is reachable and accepts our credentials. Transports which
    /// report failures synchronously on send may skip the check.
    async fn verify(&self) -> Result<(), DeliveryFailure>;

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult;
}

/// The transport chosen by configuration at start-up.
pub enum ConfiguredTransport {
    Smtp(SmtpMailTransport),
    Resend(ResendMailTransport),
}

impl ConfiguredTransport {
    pub fn from_config(config: &MailConfig) -> Result<Self, ConfigError> {
        match &config.transport {
            TransportConfig::Smtp(smtp) => Ok(Self::Smtp(SmtpMailTransport::new(
                smtp.clone(),
                config.timeout,
            ))),
            TransportConfig::Resend(resend) => ResendMailTransport::new(resend, config.timeout)
                .map(Self::Resend)
                .map_err(|error| ConfigError::Transport(error.to_string())),
        }
    }
}

#[async_trait]
impl MailTransport for ConfiguredTransport {
    fn kind(&self) -> TransportKind {
        match self {
            ConfiguredTransport::Smtp(transport) => transport.kind(),
            ConfiguredTransport::Resend(transport) => transport.kind(),
        }
    }

    async fn verify(&self) -> Result<(), DeliveryFailure> {
        match self {
            ConfiguredTransport::Smtp(transport) => transport.verify().await,
            ConfiguredTransport::Resend(transport) => transport.verify().await,
        }
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        match self {
            ConfiguredTransport::Smtp(transport) => transport.send(message).await,
            ConfiguredTransport::Resend(transport) => transport.send(message).await,
        }
    }
}
