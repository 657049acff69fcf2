use std::path::PathBuf;

use bytes::Bytes;
use http::Method;
use serde::Deserialize;
use thiserror::Error;

use crate::util::truncate_body;

pub(crate) const DEFAULT_ERROR_TITLE: &str = "Error";
pub(crate) const GENERIC_ERROR_MESSAGE: &str = "Please try again later.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    ConnectionAborted,
    Tls,
    Read,
    Timeout,
    Io,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::ConnectionAborted => "connection_aborted",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Io => "io",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_connection_abort(&self) -> bool {
        self.kind == TransportErrorKind::ConnectionAborted
            || self
                .message
                .to_ascii_lowercase()
                .contains("connection abort")
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::ConnectionAborted => TransportErrorKind::ConnectionAborted,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, error.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeForm,
    ReadFile,
    ImageEncode,
    Transport,
    HttpStatus,
    Deserialize,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeForm => "serialize_form",
            Self::ReadFile => "read_file",
            Self::ImageEncode => "image_encode",
            Self::Transport => "transport",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to read upload file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode image for field {field}: {message}")]
    ImageEncode { field: String, message: String },
    #[error("http transport error for {method} {url}: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("http status error {status} for {method} {url}: {}", truncate_body(body))]
    HttpStatus {
        status: u16,
        method: Method,
        url: String,
        body: Bytes,
    },
    #[error("failed to decode response json: {source}; body={}", truncate_body(body))]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: Bytes,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::ReadFile { .. } => ErrorCode::ReadFile,
            Self::ImageEncode { .. } => ErrorCode::ImageEncode,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    /// Response payload attached to the failure, if the server sent one.
    pub fn response_body(&self) -> Option<&Bytes> {
        match self {
            Self::HttpStatus { body, .. } | Self::Deserialize { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Error payload returned by the backend on application-level failures.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerErrorPayload {
    #[serde(default)]
    pub key: Option<String>,
    pub message: String,
}

impl ServerErrorPayload {
    pub fn user_message(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.message)
    }
}

/// User-facing failure delivered through [`RequestOutcome::Failure`](crate::RequestOutcome).
///
/// Carries display text plus hints telling the presentation layer whether the
/// current screen should be dismissed or popped once the message is shown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedError {
    pub title: String,
    pub message: String,
    pub requires_dismiss: bool,
    pub requires_pop: bool,
    code: Option<ErrorCode>,
}

impl NormalizedError {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            requires_dismiss: false,
            requires_pop: false,
            code: None,
        }
    }

    pub fn generic() -> Self {
        Self::new(DEFAULT_ERROR_TITLE, GENERIC_ERROR_MESSAGE)
    }

    pub fn with_dismiss(mut self) -> Self {
        self.requires_dismiss = true;
        self
    }

    pub fn with_pop(mut self) -> Self {
        self.requires_pop = true;
        self
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    /// Decodes a `{key?, message}` server payload, preferring `key`.
    pub fn from_server_payload(body: &[u8]) -> Option<Self> {
        let payload: ServerErrorPayload = serde_json::from_slice(body).ok()?;
        Some(Self::new(DEFAULT_ERROR_TITLE, payload.user_message()))
    }

    /// Normalizes a failed call.
    ///
    /// Exchanges with the server prefer the decoded server payload and fall
    /// back to the generic retry-later message. Failures raised before
    /// anything was sent keep their own description.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Transport { .. } | Error::HttpStatus { .. } | Error::Deserialize { .. } => error
                .response_body()
                .and_then(|body| Self::from_server_payload(body))
                .unwrap_or_else(Self::generic)
                .with_code(error.code()),
            _ => Self::describing(error),
        }
    }

    /// Normalizes a failure using the error's own description as the message.
    pub fn describing(error: &Error) -> Self {
        let message = match error {
            Error::Transport { source, .. } => source.message.clone(),
            other => other.to_string(),
        };
        Self::new(DEFAULT_ERROR_TITLE, message).with_code(error.code())
    }
}

impl std::fmt::Display for NormalizedError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {}", self.title, self.message)
    }
}

impl std::error::Error for NormalizedError {}
