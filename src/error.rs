//! Error types for the admission webhook.
//!
//! Request-scoped errors are classified by the HTTP status they are
//! answered with. None of them is fatal to the process.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors raised while handling a single admission request
#[derive(Error, Debug)]
pub enum Error {
    /// Request body was empty
    #[error("empty body")]
    EmptyBody,

    /// Content-Type was not `application/json`
    #[error("invalid Content-Type {0:?}, expect `application/json`")]
    UnsupportedMediaType(String),

    /// Body could not be parsed as an AdmissionReview request
    #[error("couldn't decode AdmissionReview: {0}")]
    Decode(String),

    /// The embedded object is not a usable Pod
    #[error("invalid pod payload: {0}")]
    InvalidPodPayload(String),

    /// The JSON patch could not be serialized
    #[error("couldn't encode patch: {0}")]
    PatchEncode(String),

    /// The AdmissionReview answer could not be serialized
    #[error("couldn't encode response: {0}")]
    ResponseWrite(#[from] serde_json::Error),
}

impl From<kube::core::admission::SerializePatchError> for Error {
    fn from(err: kube::core::admission::SerializePatchError) -> Self {
        let source = std::error::Error::source(&err)
            .map(ToString::to_string)
            .unwrap_or_else(|| err.to_string());
        Error::PatchEncode(source)
    }
}

impl Error {
    /// HTTP status the request is answered with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::EmptyBody | Error::Decode(_) => StatusCode::BAD_REQUEST,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            // The API server only reads the review message on a 200
            Error::InvalidPodPayload(_) | Error::PatchEncode(_) => StatusCode::OK,
            Error::ResponseWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::EmptyBody => "EmptyBody",
            Error::UnsupportedMediaType(_) => "UnsupportedMediaType",
            Error::Decode(_) => "DecodeError",
            Error::InvalidPodPayload(_) => "InvalidPodPayload",
            Error::PatchEncode(_) => "PatchEncodeError",
            Error::ResponseWrite(_) => "ResponseWriteError",
        }
    }
}

/// Errors that abort startup of the webhook process
#[derive(Error, Debug)]
pub enum ServerError {
    /// TLS material could not be loaded
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[source] std::io::Error),

    /// A listener failed to bind or serve
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for request handling
pub type Result<T> = std::result::Result<T, Error>;
