use crate::{
    config::ResendConfig,
    transport::{
        DeliveryFailure, DeliveryResult, MailTransport, MessageBody, OutboundMessage,
        TransportKind,
    },
};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Sends mail through a Resend-compatible HTTP API.
pub struct ResendMailTransport {
    client: Client,
    api_key: String,
    api_url: String,
}

impl ResendMailTransport {
    pub fn new(config: &ResendConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key: config.api_key.clone(),
            api_url: config.api_url.clone(),
        })
    }

    async fn process_response(response: Response) -> DeliveryResult {
        let status = response.status();
        let body: ResendResponse = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                warn!("Error reading response from email provider: {error}");
                return DeliveryResult::Failed(DeliveryFailure::send(if status.is_success() {
                    format!("Unreadable response from email provider: {error}")
                } else {
                    format!("Email provider returned {status}")
                }));
            }
        };
        if let Some(error) = body.error {
            return DeliveryResult::Failed(DeliveryFailure::send(describe_error(&error)));
        }
        if !status.is_success() {
            return DeliveryResult::Failed(DeliveryFailure::send(format!(
                "Email provider returned {status}: {}",
                body.message.as_deref().unwrap_or("no message")
            )));
        }
        DeliveryResult::Sent {
            provider_message_id: body.id,
        }
    }
}

#[async_trait]
impl MailTransport for ResendMailTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Api
    }

    /// The API reports bad credentials on the send itself, so there is nothing to check ahead.
    async fn verify(&self) -> Result<(), DeliveryFailure> {
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let (html, text) = match &message.body {
            MessageBody::Html(body) => (Some(body.as_str()), None),
            MessageBody::Text(body) => (None, Some(body.as_str())),
        };
        let payload = ResendEmailPayload {
            from: &message.sender,
            to: &message.recipients,
            subject: &message.subject,
            html,
            text,
            reply_to: message.reply_to.as_deref(),
        };
        match self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => Self::process_response(response).await,
            Err(error) => DeliveryResult::Failed(DeliveryFailure::send(format!(
                "Error calling email provider: {error}"
            ))),
        }
    }
}

#[derive(Serialize)]
struct ResendEmailPayload<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

#[derive(Deserialize)]
struct ResendResponse {
    id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    message: Option<String>,
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => match (fields.get("name"), fields.get("message")) {
            (Some(Value::String(name)), Some(Value::String(message))) => {
                format!("{name}: {message}")
            }
            (_, Some(Value::String(message))) => message.clone(),
            _ => error.to_string(),
        },
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::ResendMailTransport;
    use crate::{
        config::ResendConfig,
        transport::{
            DeliveryFailure, DeliveryResult, DeliveryStage, MailTransport, MessageBody,
            OutboundMessage,
        },
    };
    use googletest::prelude::*;
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;
    use test_support::fake_resend::FakeResendApi;

    const API_KEY: &str = "re_test_key";

    fn transport(api_key: &str) -> ResendMailTransport {
        ResendMailTransport::new(
            &ResendConfig {
                api_key: api_key.into(),
                api_url: FakeResendApi::url(),
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            sender: "noreply@example.com".into(),
            recipients: vec!["ops@example.com".into()],
            subject: "New inquiry from website".into(),
            body: MessageBody::Html("<p>Hi</p>".into()),
            reply_to: Some("ola@example.com".into()),
        }
    }

    #[tokio::test]
    #[serial]
    async fn reports_provider_message_id() -> Result<()> {
        let fake_api = FakeResendApi::new(API_KEY).with_message_id("msg_123");
        fake_api.start().await;

        let result = transport(API_KEY).send(&message()).await;

        verify_that!(
            result,
            eq(DeliveryResult::Sent {
                provider_message_id: Some("msg_123".into())
            })
        )
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn sends_payload_in_provider_format() {
        let fake_api = FakeResendApi::new(API_KEY);
        fake_api.start().await;

        transport(API_KEY).send(&message()).await;

        expect_that!(
            fake_api.received(),
            elements_are![eq(json!({
                "from": "noreply@example.com",
                "to": ["ops@example.com"],
                "subject": "New inquiry from website",
                "html": "<p>Hi</p>",
                "reply_to": "ola@example.com",
            }))]
        );
    }

    #[tokio::test]
    #[serial]
    async fn sends_text_body_without_reply_to() -> Result<()> {
        let fake_api = FakeResendApi::new(API_KEY);
        fake_api.start().await;
        let message = OutboundMessage {
            body: MessageBody::Text("Thanks".into()),
            reply_to: None,
            ..message()
        };

        transport(API_KEY).send(&message).await;

        verify_that!(
            fake_api.received(),
            elements_are![eq(json!({
                "from": "noreply@example.com",
                "to": ["ops@example.com"],
                "subject": "New inquiry from website",
                "text": "Thanks",
            }))]
        )
    }

    #[tokio::test]
    #[serial]
    async fn fails_on_error_field_in_successful_response() -> Result<()> {
        let fake_api = FakeResendApi::new(API_KEY).report_error_in_body();
        fake_api.start().await;

        let result = transport(API_KEY).send(&message()).await;

        verify_that!(
            result,
            eq(DeliveryResult::Failed(DeliveryFailure {
                stage: DeliveryStage::TransportSend,
                cause: "validation_error: The from address is not verified".into(),
            }))
        )
    }

    #[tokio::test]
    #[serial]
    async fn fails_on_rejected_api_key() -> Result<()> {
        let fake_api = FakeResendApi::new(API_KEY);
        fake_api.start().await;

        let result = transport("wrong key").send(&message()).await;

        verify_that!(
            result,
            matches_pattern!(DeliveryResult::Failed(matches_pattern!(DeliveryFailure {
                stage: eq(DeliveryStage::TransportSend),
                cause: contains_substring("401"),
            })))
        )
    }

    #[tokio::test]
    #[serial]
    async fn fails_on_unreadable_response() -> Result<()> {
        let fake_api = FakeResendApi::new(API_KEY).return_invalid_response();
        fake_api.start().await;

        let result = transport(API_KEY).send(&message()).await;

        verify_that!(
            result,
            matches_pattern!(DeliveryResult::Failed(matches_pattern!(DeliveryFailure {
                stage: eq(DeliveryStage::TransportSend),
                cause: contains_substring("Unreadable response"),
            })))
        )
    }

    #[tokio::test]
    async fn fails_when_provider_is_unreachable() -> Result<()> {
        let transport = ResendMailTransport::new(
            &ResendConfig {
                api_key: API_KEY.into(),
                api_url: "http://localhost:1/emails".into(),
            },
            Duration::from_secs(2),
        )
        .unwrap();

        let result = transport.send(&message()).await;

        verify_that!(
            result,
            matches_pattern!(DeliveryResult::Failed(field!(
                DeliveryFailure.stage,
                eq(DeliveryStage::TransportSend)
            )))
        )
    }

    #[tokio::test]
    async fn verify_needs_no_network() -> Result<()> {
        verify_that!(transport(API_KEY).verify().await, ok(eq(())))
    }
}
