use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Router,
};
use serde_json::{json, Value};
use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;

pub const RESEND_PORT: u16 = 5284;
const EMAILS_PATH: &str = "/emails";

/// A stand-in for the transactional email API. Requests must carry the configured API key;
/// everything it receives is recorded for inspection.
#[derive(Clone)]
pub struct FakeResendApi {
    required_api_key: Cow<'static, str>,
    message_id: Option<String>,
    report_error_in_body: bool,
    return_invalid_response: bool,
    fail_sends_after: Option<usize>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl FakeResendApi {
    pub fn new(required_api_key: impl Into<Cow<'static, str>>) -> Self {
        Self {
            required_api_key: required_api_key.into(),
            message_id: None,
            report_error_in_body: false,
            return_invalid_response: false,
            fail_sends_after: None,
            received: Default::default(),
        }
    }

    pub fn url() -> String {
        format!("http://localhost:{RESEND_PORT}{EMAILS_PATH}")
    }

    pub fn with_message_id(self, message_id: impl AsRef<str>) -> Self {
        Self {
            message_id: Some(message_id.as_ref().into()),
            ..self
        }
    }

    /// Answers 200 but with an `error` object instead of an id.
    pub fn report_error_in_body(self) -> Self {
        Self {
            report_error_in_body: true,
            ..self
        }
    }

    pub fn return_invalid_response(self) -> Self {
        Self {
            return_invalid_response: true,
            ..self
        }
    }

    /// Accepts the first `count` emails and answers every later one with a 500.
    pub fn fail_sends_after(self, count: usize) -> Self {
        Self {
            fail_sends_after: Some(count),
            ..self
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Binds the port and serves in the background until the test's runtime shuts down.
    pub async fn start(&self) {
        let app = Router::new()
            .route(EMAILS_PATH, post(send_email))
            .with_state(self.clone());
        let listener = TcpListener::bind(("0.0.0.0", RESEND_PORT)).await.unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }
}

async fn send_email(
    State(state): State<FakeResendApi>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    let expected_authorization = format!("Bearer {}", state.required_api_key);
    if headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        != Some(expected_authorization.as_str())
    {
        return json_response(
            StatusCode::UNAUTHORIZED,
            json!({
                "statusCode": 401,
                "name": "missing_api_key",
                "message": "Missing API key in the authorization header",
            }),
        );
    }

    let sent_before = {
        let mut received = state.received.lock().unwrap();
        received.push(payload);
        received.len() - 1
    };

    if state.return_invalid_response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            "Invalid response".into(),
        )
    } else if state.report_error_in_body {
        json_response(
            StatusCode::OK,
            json!({
                "error": {
                    "name": "validation_error",
                    "message": "The from address is not verified",
                },
            }),
        )
    } else if state
        .fail_sends_after
        .is_some_and(|count| sent_before >= count)
    {
        json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "statusCode": 500,
                "name": "internal_server_error",
                "message": "Something went wrong",
            }),
        )
    } else {
        json_response(StatusCode::OK, json!({ "id": state.message_id }))
    }
}

fn json_response(
    status: StatusCode,
    body: Value,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}
