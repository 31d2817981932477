#![allow(clippy::needless_for_each)]

use super::handlers::{health, saml};
use crate::saml::{error::ErrorBody, session::SamlErrorSession};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        saml::login,
        saml::acs,
        saml::logout,
        saml::slo,
        saml::error,
        saml::metadata,
        saml::refresh,
    ),
    components(
        schemas(health::Health, ErrorBody, SamlErrorSession)
    ),
    tags(
        (name = "saml", description = "SAML 2.0 single sign-on and single logout"),
        (name = "auth", description = "Session token rotation"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
