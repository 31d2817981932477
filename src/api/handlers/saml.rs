//! HTTP bindings of the SAML flows.

use crate::saml::{
    error::{ErrorBody, ErrorKind, SamlError},
    session::SamlErrorSession,
    SamlOrchestrator,
};
use axum::{
    body::Bytes,
    extract::{Extension, Query},
    http::{HeaderMap, HeaderValue},
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;
use utoipa::IntoParams;

/// Where the browser goes once the IdP round trip is over.
#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct RedirectQuery {
    /// Target after success.
    redirect_url: Option<String>,
    /// Target after failure, `saml_error=1` is appended.
    redirect_url_on_error: Option<String>,
}

/// Origins allowed as redirect targets and for CORS. Empty means any target.
#[derive(Debug, Clone, Default)]
pub struct FrontendOrigins(Arc<Vec<String>>);

impl FrontendOrigins {
    /// Normalize each configured origin to `scheme://host[:port]`.
    ///
    /// # Errors
    /// Returns `Config` if an origin is not an absolute URL.
    pub fn new<S: AsRef<str>>(origins: &[S]) -> Result<Self, SamlError> {
        let origins = origins
            .iter()
            .map(|origin| {
                let origin = origin.as_ref();
                Url::parse(origin)
                    .map(|url| url.origin().ascii_serialization())
                    .map_err(|e| {
                        SamlError::with_cause(
                            ErrorKind::Config,
                            format!("invalid frontend origin {origin}: {e}"),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(Arc::new(origins)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    fn check(&self, name: &str, target: Option<&str>) -> Result<String, SamlError> {
        let target = target
            .filter(|target| !target.is_empty())
            .ok_or_else(|| {
                SamlError::with_cause(ErrorKind::MissingParameter, format!("{name} is required"))
            })?;

        // Ends up in a Location header once the IdP round trip is over.
        HeaderValue::from_str(target)
            .map_err(|e| SamlError::with_cause(ErrorKind::InvalidParameter, format!("{name}: {e}")))?;

        if self.0.is_empty() {
            return Ok(target.to_string());
        }

        let origin = Url::parse(target)
            .map(|url| url.origin().ascii_serialization())
            .map_err(|e| SamlError::with_cause(ErrorKind::InvalidParameter, format!("{name}: {e}")))?;

        if self.0.contains(&origin) {
            Ok(target.to_string())
        } else {
            Err(SamlError::with_cause(
                ErrorKind::InvalidParameter,
                format!("{name} origin {origin} is not allowed"),
            ))
        }
    }

    /// Both redirect targets, present and allowed.
    ///
    /// # Errors
    /// `MissingParameter` for an absent target, `InvalidParameter` for a foreign one or one
    /// that cannot be sent back in a `Location` header.
    pub fn validate(&self, query: &RedirectQuery) -> Result<(String, String), SamlError> {
        Ok((
            self.check("redirect_url", query.redirect_url.as_deref())?,
            self.check(
                "redirect_url_on_error",
                query.redirect_url_on_error.as_deref(),
            )?,
        ))
    }
}

#[utoipa::path(
    get,
    path= "/saml/login",
    params(RedirectQuery),
    responses (
        (status = 200, description = "Auto-submitting AuthnRequest form for the IdP", body = String, content_type = "text/html"),
        (status = 400, description = "Missing or foreign redirect target", body = ErrorBody),
        (status = 500, description = "AuthnRequest could not be created", body = ErrorBody),
    ),
    tag= "saml"
)]
pub async fn login(
    saml: Extension<Arc<SamlOrchestrator>>,
    origins: Extension<FrontendOrigins>,
    Query(query): Query<RedirectQuery>,
) -> Result<Response, SamlError> {
    let (redirect_url, redirect_url_on_error) = origins.validate(&query)?;
    saml.execute_saml_login(&redirect_url, &redirect_url_on_error)
}

#[utoipa::path(
    post,
    path= "/saml/acs",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "SAMLResponse posted by the IdP"),
    responses (
        (status = 302, description = "Redirect to the frontend, with saml_error=1 on failure"),
        (status = 500, description = "Unreadable form or no pending login", body = ErrorBody),
    ),
    tag= "saml"
)]
pub async fn acs(
    saml: Extension<Arc<SamlOrchestrator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SamlError> {
    saml.execute_saml_acs(&headers, &body).await
}

#[utoipa::path(
    get,
    path= "/saml/logout",
    params(RedirectQuery),
    responses (
        (status = 200, description = "Auto-submitting LogoutRequest form for the IdP", body = String, content_type = "text/html"),
        (status = 400, description = "Missing or foreign redirect target", body = ErrorBody),
        (status = 500, description = "Not signed in or LogoutRequest could not be created", body = ErrorBody),
    ),
    tag= "saml"
)]
pub async fn logout(
    saml: Extension<Arc<SamlOrchestrator>>,
    origins: Extension<FrontendOrigins>,
    headers: HeaderMap,
    Query(query): Query<RedirectQuery>,
) -> Result<Response, SamlError> {
    let (redirect_url, redirect_url_on_error) = origins.validate(&query)?;
    saml.execute_saml_logout(&headers, &redirect_url, &redirect_url_on_error)
}

#[utoipa::path(
    post,
    path= "/saml/slo",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "SAMLRequest or SAMLResponse posted by the IdP"),
    responses (
        (status = 200, description = "Auto-submitting LogoutResponse form for an IdP-initiated logout", body = String, content_type = "text/html"),
        (status = 302, description = "Redirect to the frontend after a logout started here"),
        (status = 500, description = "Logout message rejected", body = ErrorBody),
    ),
    tag= "saml"
)]
pub async fn slo(
    saml: Extension<Arc<SamlOrchestrator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SamlError> {
    saml.execute_saml_slo(&headers, &body).await
}

#[utoipa::path(
    get,
    path= "/saml/error",
    responses (
        (status = 200, description = "Outcome of the last login or logout", body = SamlErrorSession),
        (status = 500, description = "No outcome to report", body = ErrorBody),
    ),
    tag= "saml"
)]
pub async fn error(
    saml: Extension<Arc<SamlOrchestrator>>,
    headers: HeaderMap,
) -> Result<Response, SamlError> {
    saml.execute_saml_error(&headers)
}

#[utoipa::path(
    get,
    path= "/saml/metadata",
    responses (
        (status = 200, description = "Service provider metadata", body = String, content_type = "application/samlmetadata+xml"),
    ),
    tag= "saml"
)]
pub async fn metadata(saml: Extension<Arc<SamlOrchestrator>>) -> Response {
    debug!("Serving SP metadata for {}", saml.config().entity_id);
    saml.execute_saml_metadata()
}

#[utoipa::path(
    post,
    path= "/auth/refresh",
    responses (
        (status = 204, description = "New access and refresh cookies"),
        (status = 500, description = "Refresh token missing, revoked or rotated", body = ErrorBody),
    ),
    tag= "auth"
)]
pub async fn refresh(
    saml: Extension<Arc<SamlOrchestrator>>,
    headers: HeaderMap,
) -> Result<Response, SamlError> {
    saml.execute_refresh(&headers).await
}
