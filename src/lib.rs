//! # samlsp (SAML SSO/SLO test backend)
//!
//! `samlsp` is a SAML 2.0 service provider used to exercise federated login and logout
//! flows against an external identity provider without a server-side session database.
//!
//! ## Session model
//!
//! Correlation state travels in signed, short-lived cookies, one per flow, each scoped to
//! the single endpoint that consumes it:
//!
//! - **SSO:** the `AuthnRequest` id and the redirect targets, read back by `/saml/acs`.
//! - **SLO:** the `LogoutRequest` id and the redirect targets, read back by `/saml/slo`.
//! - **Auth:** an access/refresh token pair issued after a successful assertion.
//! - **Error:** the outcome of the last ACS/SLO hop, read once by `/saml/error`.
//!
//! Every kind is signed with its own secret, generated at startup and kept in memory, so
//! sessions do not survive a restart.
//!
//! ## Users
//!
//! The `NameID` of the assertion is used as the user's email. Unknown users are created on
//! their first successful login, and the current token pair is stored with the user row.

pub mod api;
pub mod cli;
pub mod saml;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
