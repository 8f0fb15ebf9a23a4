use lambda_http::http::HeaderValue;
use std::{fmt, time::Duration};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_ALLOW_ORIGIN: &str = "*";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Process-wide settings, read once when the lambda starts.
///
/// The mail settings are kept as a `Result` so that a misconfigured deployment still answers
/// requests: client errors are reported as usual and valid submissions get `ENV_MISSING`.
pub struct AppConfig {
    pub allow_origin: String,
    pub environment: Environment,
    pub mail: Result<MailConfig, ConfigError>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            allow_origin: get("ALLOW_ORIGIN")
                .and_then(valid_origin)
                .unwrap_or_else(|| DEFAULT_ALLOW_ORIGIN.into()),
            environment: get("APP_ENVIRONMENT")
                .map(|value| Environment::parse(&value))
                .unwrap_or(Environment::Production),
            mail: MailConfig::from_lookup(&get),
        }
    }
}

/// Every response carries the origin as a header, so a value which cannot be one is dropped.
fn valid_origin(origin: String) -> Option<String> {
    match HeaderValue::from_str(&origin) {
        Ok(_) => Some(origin),
        Err(_) => {
            warn!(
                "ALLOW_ORIGIN {origin:?} is not a valid header value, using {DEFAULT_ALLOW_ORIGIN}"
            );
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    /// Anything not explicitly a development environment is treated as production, so that
    /// internal error details are never echoed by accident.
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "local" | "development" | "dev" => Environment::Local,
            _ => Environment::Production,
        }
    }

    pub fn exposes_details(self) -> bool {
        self == Environment::Local
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Local => write!(f, "local"),
            Environment::Production => write!(f, "production"),
        }
    }
}

#[derive(Debug)]
pub struct MailConfig {
    pub from: String,
    pub to: Vec<String>,
    pub send_acknowledgement: bool,
    pub timeout: Duration,
    pub transport: TransportConfig,
}

#[derive(Debug)]
pub enum TransportConfig {
    Smtp(SmtpConfig),
    Resend(ResendConfig),
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS from the first byte. Otherwise the connection is upgraded with STARTTLS when
    /// the server offers it.
    pub secure: bool,
    pub credentials: Option<SmtpCredentials>,
}

#[derive(Clone)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

pub struct ResendConfig {
    pub api_key: String,
    pub api_url: String,
}

impl MailConfig {
    fn from_lookup(get: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();

        let from = get("FROM_EMAIL");
        if from.is_none() {
            missing.push("FROM_EMAIL");
        }
        let to = get("TO_EMAIL")
            .map(|value| split_addresses(&value))
            .unwrap_or_default();
        if to.is_empty() {
            missing.push("TO_EMAIL");
        }

        let transport = match get("MAIL_TRANSPORT").map(|value| value.to_ascii_lowercase()) {
            Some(kind) if kind == "smtp" => TransportKindConfig::Smtp,
            Some(kind) if kind == "resend" || kind == "api" => TransportKindConfig::Resend,
            Some(kind) => {
                return Err(ConfigError::Invalid {
                    key: "MAIL_TRANSPORT",
                    value: kind,
                })
            }
            None if get("RESEND_API_KEY").is_some() => TransportKindConfig::Resend,
            None => TransportKindConfig::Smtp,
        };

        let transport = match transport {
            TransportKindConfig::Smtp => {
                let host = get("SMTP_HOST");
                if host.is_none() {
                    missing.push("SMTP_HOST");
                }
                let port = match get("SMTP_PORT") {
                    Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                        key: "SMTP_PORT",
                        value,
                    })?,
                    None => DEFAULT_SMTP_PORT,
                };
                let secure = parse_flag(get, "SMTP_SECURE")?.unwrap_or(false);
                let credentials = get("SMTP_USER").map(|username| SmtpCredentials {
                    username,
                    password: get("SMTP_PASS").unwrap_or_default(),
                });
                host.map(|host| {
                    TransportConfig::Smtp(SmtpConfig {
                        host,
                        port,
                        secure,
                        credentials,
                    })
                })
            }
            TransportKindConfig::Resend => {
                let api_key = get("RESEND_API_KEY");
                if api_key.is_none() {
                    missing.push("RESEND_API_KEY");
                }
                api_key.map(|api_key| {
                    TransportConfig::Resend(ResendConfig {
                        api_key,
                        api_url: get("RESEND_API_URL").unwrap_or_else(|| RESEND_API_URL.into()),
                    })
                })
            }
        };

        let send_acknowledgement = parse_flag(get, "SEND_ACKNOWLEDGEMENT")?.unwrap_or(false);
        let timeout = match get("MAIL_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(value.parse().map_err(|_| ConfigError::Invalid {
                key: "MAIL_TIMEOUT_SECS",
                value,
            })?),
            None => DEFAULT_TIMEOUT,
        };

        match (from, transport) {
            (Some(from), Some(transport)) if missing.is_empty() => Ok(Self {
                from,
                to,
                send_acknowledgement,
                timeout,
                transport,
            }),
            _ => Err(ConfigError::Missing(missing)),
        }
    }
}

enum TransportKindConfig {
    Smtp,
    Resend,
}

fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    let Some(value) = get(key) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("Unable to set up mail transport: {0}")]
    Transport(String),
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field(
                "username",
                &self.credentials.as_ref().map(|c| c.username.as_str()),
            )
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ResendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResendConfig")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}
