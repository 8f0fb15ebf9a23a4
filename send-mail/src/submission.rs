use regex::Regex;
use serde_json::{Map, Value};
use std::{ops::Deref, sync::OnceLock};
use thiserror::Error;

/// Placeholder for optional fields the submitter left blank.
pub const PLACEHOLDER: &str = "-";

const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";

static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();

#[derive(Clone, Copy, Debug)]
enum Field {
    Name,
    Phone,
    Email,
    Service,
    Address,
    RequestedDate,
    Note,
    Honeypot,
}

impl Field {
    /// Keys the contact forms have used for each field over time. The first alias holding a
    /// non-empty value wins.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::Name => &["navn", "name"],
            Field::Phone => &["telefon", "tlf", "phone"],
            Field::Email => &["epost", "e-post", "email"],
            Field::Service => &["tjeneste", "service"],
            Field::Address => &["adresse", "address"],
            Field::RequestedDate => &["dato", "date", "requestedDate"],
            Field::Note => &["melding", "message", "note"],
            Field::Honeypot => &["honeypot", "_gotcha"],
        }
    }
}

/// One contact form submission with every field trimmed. Required fields which were not
/// provided are empty; optional ones hold [`PLACEHOLDER`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub service: String,
    pub address: String,
    pub requested_date: String,
    pub note: String,
    pub honeypot: String,
}

impl Submission {
    /// Parses a request body. The body is either a JSON object or a JSON string which itself
    /// encodes an object, as some form scripts double-encode their payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, NormalizeError> {
        let fields = match serde_json::from_slice(payload)? {
            Value::Object(fields) => fields,
            Value::String(encoded) => match serde_json::from_str(&encoded)? {
                Value::Object(fields) => fields,
                _ => return Err(NormalizeError::NotAMapping),
            },
            _ => return Err(NormalizeError::NotAMapping),
        };
        Ok(Self::from_fields(&fields))
    }

    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let required = |field| lookup(fields, field).unwrap_or_default();
        let optional = |field| lookup(fields, field).unwrap_or_else(|| PLACEHOLDER.into());
        Self {
            name: required(Field::Name),
            phone: required(Field::Phone),
            email: required(Field::Email),
            service: optional(Field::Service),
            address: optional(Field::Address),
            requested_date: optional(Field::RequestedDate),
            note: optional(Field::Note),
            honeypot: required(Field::Honeypot),
        }
    }

    /// A filled honeypot means the form was submitted by a bot.
    pub fn is_spam(&self) -> bool {
        !self.honeypot.is_empty()
    }

    pub fn validate(self) -> Result<ValidSubmission, ValidationError> {
        if self.name.is_empty() || self.phone.is_empty() {
            return Err(ValidationError::MissingRequiredField);
        }
        if !self.email.is_empty() && !is_valid_email(&self.email) {
            return Err(ValidationError::InvalidEmailFormat(self.email));
        }
        Ok(ValidSubmission(self))
    }
}

/// A submission which passed [`Submission::validate`]. Only these are ever turned into mail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidSubmission(Submission);

impl ValidSubmission {
    pub fn reply_to(&self) -> Option<&str> {
        (!self.0.email.is_empty()).then_some(self.0.email.as_str())
    }

    pub fn service(&self) -> Option<&str> {
        (self.0.service != PLACEHOLDER).then_some(self.0.service.as_str())
    }
}

impl Deref for ValidSubmission {
    type Target = Submission;

    fn deref(&self) -> &Submission {
        &self.0
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX
        .get_or_init(|| Regex::new(EMAIL_PATTERN).expect("email pattern compiles"))
        .is_match(email)
}

fn lookup(fields: &Map<String, Value>, field: Field) -> Option<String> {
    field
        .aliases()
        .iter()
        .filter_map(|alias| fields.get(*alias))
        .filter_map(coerce)
        .find(|value| !value.is_empty())
}

fn coerce(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Payload is not a key/value mapping")]
    NotAMapping,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing name or phone")]
    MissingRequiredField,
    #[error("Invalid email address {0:?}")]
    InvalidEmailFormat(String),
}

#[cfg(test)]
mod tests {
    use super::{is_valid_email, NormalizeError, Submission, ValidationError};
    use googletest::prelude::*;

    fn submission(json: &str) -> Submission {
        Submission::from_payload(json.as_bytes()).unwrap()
    }

    #[test]
    fn normalizes_norwegian_field_names() -> Result<()> {
        let result = submission(
            r#"{
                "navn": "Ola Nordmann",
                "telefon": "12345678",
                "epost": "ola@example.com",
                "tjeneste": "Rengjøring"
            }"#,
        );

        verify_that!(
            result,
            eq(Submission {
                name: "Ola Nordmann".into(),
                phone: "12345678".into(),
                email: "ola@example.com".into(),
                service: "Rengjøring".into(),
                address: "-".into(),
                requested_date: "-".into(),
                note: "-".into(),
                honeypot: "".into(),
            })
        )
    }

    #[test]
    fn first_non_empty_alias_wins() -> Result<()> {
        let result = submission(r#"{"telefon": "  ", "tlf": "555", "phone": "777"}"#);

        verify_that!(result.phone.as_str(), eq("555"))
    }

    #[test]
    fn accepts_english_field_names() -> Result<()> {
        let result = submission(
            r#"{"name": "Kari", "phone": "1", "message": "Hello", "date": "2024-05-01"}"#,
        );

        verify_that!(result.name.as_str(), eq("Kari"))?;
        verify_that!(result.note.as_str(), eq("Hello"))?;
        verify_that!(result.requested_date.as_str(), eq("2024-05-01"))
    }

    #[test]
    fn trims_values() -> Result<()> {
        let result = submission(r#"{"navn": "  Ola \n", "adresse": " Storgata 1 "}"#);

        verify_that!(result.name.as_str(), eq("Ola"))?;
        verify_that!(result.address.as_str(), eq("Storgata 1"))
    }

    #[test]
    fn coerces_numbers_to_strings() -> Result<()> {
        let result = submission(r#"{"navn": "Ola", "telefon": 12345678}"#);

        verify_that!(result.phone.as_str(), eq("12345678"))
    }

    #[test]
    fn ignores_structured_values() -> Result<()> {
        let result = submission(r#"{"navn": ["Ola"], "name": "Kari", "note": null}"#);

        verify_that!(result.name.as_str(), eq("Kari"))?;
        verify_that!(result.note.as_str(), eq("-"))
    }

    #[test]
    fn accepts_double_encoded_payload() -> Result<()> {
        let result = submission(r#""{\"navn\":\"Ola\",\"telefon\":\"1\"}""#);

        verify_that!(result.name.as_str(), eq("Ola"))
    }

    #[test]
    fn rejects_invalid_json() -> Result<()> {
        verify_that!(
            Submission::from_payload(b"navn=Ola"),
            err(matches_pattern!(NormalizeError::InvalidJson(anything())))
        )
    }

    #[test]
    fn rejects_non_mapping_payload() -> Result<()> {
        verify_that!(
            Submission::from_payload(b"[1, 2, 3]"),
            err(matches_pattern!(NormalizeError::NotAMapping))
        )
    }

    #[test]
    fn rejects_string_which_does_not_encode_a_mapping() -> Result<()> {
        verify_that!(
            Submission::from_payload(br#""42""#),
            err(matches_pattern!(NormalizeError::NotAMapping))
        )
    }

    #[test]
    fn honeypot_marks_spam() -> Result<()> {
        verify_that!(submission(r#"{"honeypot": "http://spam"}"#).is_spam(), eq(true))?;
        verify_that!(submission(r#"{"honeypot": "  "}"#).is_spam(), eq(false))
    }

    #[test]
    fn missing_name_fails_validation() -> Result<()> {
        verify_that!(
            submission(r#"{"telefon": "1"}"#).validate(),
            err(eq(ValidationError::MissingRequiredField))
        )
    }

    #[test]
    fn missing_phone_fails_validation() -> Result<()> {
        verify_that!(
            submission(r#"{"navn": "Ola", "epost": "not an email"}"#).validate(),
            err(eq(ValidationError::MissingRequiredField))
        )
    }

    #[test]
    fn invalid_email_fails_validation() -> Result<()> {
        verify_that!(
            submission(r#"{"navn": "Ola", "telefon": "1", "epost": "ola@example"}"#).validate(),
            err(eq(ValidationError::InvalidEmailFormat("ola@example".into())))
        )
    }

    #[test]
    fn absent_email_passes_validation() -> Result<()> {
        let valid = submission(r#"{"navn": "Ola", "telefon": "1"}"#).validate();

        verify_that!(valid.as_ref().map(|v| v.reply_to()), ok(none()))
    }

    #[test]
    fn service_is_absent_when_placeholder() -> Result<()> {
        let valid = submission(r#"{"navn": "Ola", "telefon": "1"}"#)
            .validate()
            .unwrap();

        verify_that!(valid.service(), none())
    }

    #[test]
    fn email_pattern() -> Result<()> {
        for email in ["ola@example.com", "a.b+c@sub.example.no", "x@y.z"] {
            verify_that!(is_valid_email(email), eq(true))?;
        }
        for email in [
            "ola",
            "ola@example",
            "@example.com",
            "ola@.",
            "ola nordmann@example.com",
            "ola@@example.com",
        ] {
            verify_that!(is_valid_email(email), eq(false))?;
        }
        Ok(())
    }
}
