use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::{error::Error as _, fmt::Write as _};
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure categories with stable numeric codes.
///
/// Codes in the `0x8000_xxxx` range are server faults, `0x8101_xxxx` are caller mistakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("unexpected fault while handling the request")]
    Panic,
    #[error("unknown error")]
    Unknown,
    #[error("invalid configuration")]
    Config,
    #[error("disk access failed")]
    Disk,
    #[error("invalid identity provider metadata")]
    InvalidIdpMetadata,
    #[error("identity provider metadata could not be downloaded")]
    DownloadIdpMetadata,
    #[error("failed to create the authentication request")]
    SsoAuthnRequest,
    #[error("failed to write the HTML response")]
    HtmlWriting,
    #[error("session cookie is missing or invalid")]
    CookieNone,
    #[error("failed to parse the SAML response")]
    SsoParseResponse,
    #[error("failed to parse the request")]
    RequestParse,
    #[error("unexpected SAML assertion")]
    UnexpectedAssertion,
    #[error("failed to open the database")]
    DbOpen,
    #[error("failed to begin a transaction")]
    DbBegin,
    #[error("failed to roll back a transaction")]
    DbRollback,
    #[error("failed to commit a transaction")]
    DbCommit,
    #[error("database query failed")]
    DbQuery,
    #[error("unexpected database query result")]
    DbQueryResult,
    #[error("invalid session")]
    Session,
    #[error("failed to create the logout request")]
    SloAuthnRequest,
    #[error("logout response validation failed")]
    SloValidation,
    #[error("failed to sign the session token")]
    JwtSign,
    #[error("SAMLRequest is not valid base64")]
    Base64SamlRequest,
    #[error("SAMLResponse is not valid base64")]
    Base64SamlResponse,
    #[error("SAMLRequest is not a valid logout request")]
    UnmarshalSamlRequest,
    #[error("SAMLResponse is not a valid logout response")]
    UnmarshalSamlResponse,
    #[error("failed to create the logout response")]
    SamlLogoutResponseCreation,
    #[error("logout request has no NameID")]
    EmptyNameId,
    #[error("logout response does not match the pending logout request")]
    InvalidNameId,
    #[error("logout response has no InResponseTo")]
    EmptyLogoutRequestId,
    #[error("operation not allowed")]
    OperationNotAllowed,
    #[error("missing required parameter")]
    MissingParameter,
    #[error("invalid parameter")]
    InvalidParameter,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Panic => 0x8000_0001,
            Self::Unknown => 0x8000_0002,
            Self::Config => 0x8000_0003,
            Self::Disk => 0x8000_0004,
            Self::InvalidIdpMetadata => 0x8000_0005,
            Self::DownloadIdpMetadata => 0x8000_0006,
            Self::SsoAuthnRequest => 0x8000_0007,
            Self::HtmlWriting => 0x8000_0008,
            Self::CookieNone => 0x8000_0009,
            Self::SsoParseResponse => 0x8000_0010,
            Self::RequestParse => 0x8000_0011,
            Self::UnexpectedAssertion => 0x8000_0012,
            Self::DbOpen => 0x8000_0013,
            Self::DbBegin => 0x8000_0014,
            Self::DbRollback => 0x8000_0015,
            Self::DbCommit => 0x8000_0016,
            Self::DbQuery => 0x8000_0017,
            Self::DbQueryResult => 0x8000_0018,
            Self::Session => 0x8000_0019,
            Self::SloAuthnRequest => 0x8000_0020,
            Self::SloValidation => 0x8000_0021,
            Self::JwtSign => 0x8000_0022,
            Self::Base64SamlRequest => 0x8000_0023,
            Self::Base64SamlResponse => 0x8000_0024,
            Self::UnmarshalSamlRequest => 0x8000_0025,
            Self::UnmarshalSamlResponse => 0x8000_0026,
            Self::SamlLogoutResponseCreation => 0x8000_0027,
            Self::EmptyNameId => 0x8000_0028,
            Self::InvalidNameId => 0x8000_0029,
            Self::EmptyLogoutRequestId => 0x8000_0030,
            Self::OperationNotAllowed => 0x8000_0031,
            Self::MissingParameter => 0x8101_0001,
            Self::InvalidParameter => 0x8101_0002,
        }
    }

    #[must_use]
    pub const fn status(self) -> StatusCode {
        if self.code() & 0xFFFF_0000 == 0x8101_0000 {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Error raised by the SAML flows: a stable kind plus an optional upstream cause.
///
/// The cause is only ever logged. Clients see the code and a generic message.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SamlError {
    kind: ErrorKind,
    #[source]
    cause: Option<BoxError>,
}

impl SamlError {
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause(kind: ErrorKind, cause: impl Into<BoxError>) -> Self {
        Self {
            kind,
            cause: Some(cause.into()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn code(&self) -> u32 {
        self.kind.code()
    }

    /// Render the error and its whole cause chain on one line, for logs.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = format!("{:#010x}: {self}", self.code());
        let mut source = self.source();
        while let Some(cause) = source {
            let _ = write!(out, ": {cause}");
            source = cause.source();
        }
        out
    }
}

impl From<ErrorKind> for SamlError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Client-facing error payload.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

impl ErrorBody {
    #[must_use]
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            code: kind.code(),
            message: format!("{kind} ({:#010x})", kind.code()),
        }
    }
}

impl From<&SamlError> for ErrorBody {
    fn from(err: &SamlError) -> Self {
        Self::from_kind(err.kind())
    }
}

impl IntoResponse for SamlError {
    fn into_response(self) -> Response {
        error!("{}", self.report());
        (self.kind.status(), Json(ErrorBody::from(&self))).into_response()
    }
}
