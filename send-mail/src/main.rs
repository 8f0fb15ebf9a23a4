mod compose;
mod config;
mod resend;
mod smtp;
mod submission;
mod transport;

use compose::{ComposeError, MessageComposer};
use config::{AppConfig, ConfigError, Environment, MailConfig, DEFAULT_ALLOW_ORIGIN};
use lambda_http::{
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, StatusCode},
    run, service_fn, Body, Error, Request, Response,
};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use submission::{NormalizeError, Submission, ValidSubmission, ValidationError};
use thiserror::Error;
use tracing::{error, info, warn};
use transport::{
    ConfiguredTransport, DeliveryFailure, DeliveryResult, DeliveryStage, MailTransport,
    TransportKind,
};

const HANDLER_CRASH: &str = "HANDLER_CRASH";

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let handler = ContactFormMessageHandler::from_config(AppConfig::from_env());
    run(service_fn(|event| handler.handle(event))).await
}

struct ContactFormMessageHandler<TransportT: MailTransport> {
    allow_origin: String,
    environment: Environment,
    mailer: Result<Mailer<TransportT>, ConfigError>,
}

impl ContactFormMessageHandler<ConfiguredTransport> {
    fn from_config(config: AppConfig) -> Self {
        let mailer = config.mail.and_then(|mail| {
            let transport = ConfiguredTransport::from_config(&mail)?;
            Mailer::new(transport, &mail)
        });
        match &mailer {
            Ok(mailer) => info!(
                "Sending mail via {:?} transport ({} environment)",
                mailer.transport.kind(),
                config.environment
            ),
            Err(error) => error!("Mail transport is not configured: {error}"),
        }
        Self::new(config.allow_origin, config.environment, mailer)
    }
}

impl<TransportT: MailTransport> ContactFormMessageHandler<TransportT> {
    fn new(
        allow_origin: String,
        environment: Environment,
        mailer: Result<Mailer<TransportT>, ConfigError>,
    ) -> Self {
        Self {
            allow_origin,
            environment,
            mailer,
        }
    }

    async fn handle(&self, event: Request) -> Result<Response<Body>, Error> {
        info!("Handling {} {}", event.method(), event.uri().path());
        match self.route(&event).await {
            Ok(response) => Ok(response),
            Err(error) => {
                error!("Unable to build response: {error}");
                Ok(self.crash_response())
            }
        }
    }

    async fn route(&self, event: &Request) -> Result<Response<Body>, Error> {
        if event.method() == Method::OPTIONS {
            return self.response(StatusCode::OK, None);
        }
        if event.uri().path().ends_with("/health") {
            return self.health_response();
        }
        match self.process_message(event).await {
            Ok(Outcome::Discarded) => self.response(StatusCode::OK, Some(json!({ "ok": true }))),
            Ok(Outcome::Sent {
                provider_message_id,
            }) => self.response(
                StatusCode::OK,
                Some(json!({ "ok": true, "id": provider_message_id })),
            ),
            Err(error) => {
                error.log();
                self.error_response(&error)
            }
        }
    }

    async fn process_message(&self, event: &Request) -> Result<Outcome, DispatchError> {
        if event.method() != Method::POST {
            return Err(DispatchError::MethodNotAllowed(event.method().clone()));
        }
        if !has_json_content_type(event.headers()) {
            return Err(DispatchError::UnsupportedContentType(
                event
                    .headers()
                    .get(CONTENT_TYPE)
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned()),
            ));
        }
        let payload: &[u8] = match event.body() {
            Body::Empty => &[],
            Body::Text(text) => text.as_bytes(),
            Body::Binary(bytes) => bytes,
        };
        let submission = Submission::from_payload(payload)?;
        if submission.is_spam() {
            info!("Discarding submission with filled honeypot");
            return Ok(Outcome::Discarded);
        }
        let submission = submission.validate()?;
        let mailer = self
            .mailer
            .as_ref()
            .map_err(|error| DispatchError::Configuration(error.clone()))?;
        mailer.dispatch(&submission).await
    }

    fn health_response(&self) -> Result<Response<Body>, Error> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());
        self.response(StatusCode::OK, Some(json!({ "ok": true, "now": now })))
    }

    fn error_response(&self, error: &DispatchError) -> Result<Response<Body>, Error> {
        let mut body = json!({ "ok": false, "error": error.code() });
        if self.environment.exposes_details() {
            if let Some(details) = error.details() {
                body["details"] = Value::String(details);
            }
        }
        self.response(error.status(), Some(body))
    }

    /// Assembled by hand so that it cannot fail the way the builder did.
    fn crash_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::Text(
            json!({ "ok": false, "error": HANDLER_CRASH }).to_string(),
        ));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Access-Control-Allow-Origin",
            HeaderValue::from_str(&self.allow_origin)
                .unwrap_or(HeaderValue::from_static(DEFAULT_ALLOW_ORIGIN)),
        );
        headers.insert(
            "Access-Control-Allow-Methods",
            HeaderValue::from_static("POST, OPTIONS"),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static("Content-Type"),
        );
        response
    }

    fn response(&self, status: StatusCode, body: Option<Value>) -> Result<Response<Body>, Error> {
        let builder = Response::builder()
            .status(status)
            .header("Access-Control-Allow-Origin", self.allow_origin.as_str())
            .header("Access-Control-Allow-Methods", "POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type");
        let response = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::Text(body.to_string()))?,
            None => builder.body(Body::Empty)?,
        };
        Ok(response)
    }
}

/// The transport together with everything needed to address mail through it.
struct Mailer<TransportT: MailTransport> {
    transport: TransportT,
    composer: MessageComposer,
}

impl<TransportT: MailTransport> Mailer<TransportT> {
    fn new(transport: TransportT, config: &MailConfig) -> Result<Self, ConfigError> {
        let composer = MessageComposer::new(
            config.from.clone(),
            config.to.clone(),
            config.send_acknowledgement,
        )
        .map_err(|_| ConfigError::Missing(vec!["TO_EMAIL"]))?;
        Ok(Self {
            transport,
            composer,
        })
    }

    /// Sends the notification, then the acknowledgement if there is one. Only the notification
    /// decides the outcome.
    async fn dispatch(&self, submission: &ValidSubmission) -> Result<Outcome, DispatchError> {
        let notification = self.composer.notification(submission)?;
        self.transport
            .verify()
            .await
            .map_err(|failure| self.transport_error(failure))?;
        let provider_message_id = match self.transport.send(&notification).await {
            DeliveryResult::Sent {
                provider_message_id,
            } => provider_message_id,
            DeliveryResult::Failed(failure) => return Err(self.transport_error(failure)),
        };
        info!(
            "Sent notification to {} recipient(s), provider id {provider_message_id:?}",
            notification.recipients.len()
        );
        self.send_acknowledgement(submission).await;
        Ok(Outcome::Sent {
            provider_message_id,
        })
    }

    async fn send_acknowledgement(&self, submission: &ValidSubmission) {
        let acknowledgement = match self.composer.acknowledgement(submission) {
            Ok(Some(acknowledgement)) => acknowledgement,
            Ok(None) => return,
            Err(error) => {
                warn!("Could not compose acknowledgement: {error}");
                return;
            }
        };
        match self.transport.send(&acknowledgement).await {
            DeliveryResult::Sent { .. } => info!("Sent acknowledgement to submitter"),
            DeliveryResult::Failed(failure) => {
                warn!("Acknowledgement was not delivered, ignoring: {failure}")
            }
        }
    }

    fn transport_error(&self, failure: DeliveryFailure) -> DispatchError {
        DispatchError::Transport {
            kind: self.transport.kind(),
            failure,
        }
    }
}

enum Outcome {
    Discarded,
    Sent { provider_message_id: Option<String> },
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

#[derive(Error, Debug)]
enum DispatchError {
    #[error("Method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("Unsupported content type {0:?}")]
    UnsupportedContentType(Option<String>),
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] NormalizeError),
    #[error("Invalid submission: {0}")]
    Invalid(#[from] ValidationError),
    #[error("{0}")]
    Configuration(ConfigError),
    #[error("{kind:?} transport error: {failure}")]
    Transport {
        kind: TransportKind,
        failure: DeliveryFailure,
    },
    #[error("Unexpected error: {0}")]
    Unexpected(#[from] ComposeError),
}

impl DispatchError {
    fn status(&self) -> StatusCode {
        match self {
            DispatchError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            DispatchError::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DispatchError::MalformedPayload(_) | DispatchError::Invalid(_) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::Configuration(_) | DispatchError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DispatchError::Transport { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// The stable `error` discriminator sent to the client.
    fn code(&self) -> &'static str {
        match self {
            DispatchError::MethodNotAllowed(_) => "Method Not Allowed",
            DispatchError::UnsupportedContentType(_) => "Unsupported Content-Type",
            DispatchError::MalformedPayload(_) => "Invalid JSON",
            DispatchError::Invalid(ValidationError::MissingRequiredField) => {
                "Missing name or phone"
            }
            DispatchError::Invalid(ValidationError::InvalidEmailFormat(_)) => "Invalid email",
            DispatchError::Configuration(_) => "ENV_MISSING",
            DispatchError::Transport { kind, failure } => match (failure.stage, *kind) {
                (DeliveryStage::TransportVerify, _) => "SMTP_VERIFY_FAILED",
                (DeliveryStage::TransportSend, TransportKind::Smtp) => "SMTP_SEND_FAILED",
                (DeliveryStage::TransportSend, TransportKind::Api) => "SEND_FAILED",
            },
            DispatchError::Unexpected(_) => HANDLER_CRASH,
        }
    }

    /// Internal detail, only ever shown outside production.
    fn details(&self) -> Option<String> {
        match self {
            DispatchError::Configuration(error) => Some(error.to_string()),
            DispatchError::Transport { failure, .. } => Some(failure.cause.clone()),
            DispatchError::Unexpected(error) => Some(error.to_string()),
            _ => None,
        }
    }

    fn log(&self) {
        if self.status().is_client_error() {
            warn!("Client error handling contact form message: {self}");
        } else {
            error!("Internal error handling contact form message: {self}");
        }
    }
}
