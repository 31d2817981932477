//! Cookie-carried session state, one signed cookie per flow.

use crate::saml::{
    error::{ErrorBody, ErrorKind, SamlError},
    token::TokenCodec,
};
use axum::http::{
    header::{InvalidHeaderValue, COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use chrono::{SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::error;
use utoipa::ToSchema;

pub const ACS_PATH: &str = "/saml/acs";
pub const SLO_PATH: &str = "/saml/slo";
pub const ERROR_PATH: &str = "/saml/error";
pub const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Sso,
    Slo,
    AccessToken,
    RefreshToken,
    SamlError,
}

impl SessionKind {
    #[must_use]
    pub const fn cookie_name(self) -> &'static str {
        match self {
            Self::Sso => "sso_token",
            Self::Slo => "slo_token",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::SamlError => "saml_error_token",
        }
    }

    /// The only path the browser sends the cookie back to.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Sso => ACS_PATH,
            Self::Slo => SLO_PATH,
            Self::AccessToken => "/",
            Self::RefreshToken => REFRESH_PATH,
            Self::SamlError => ERROR_PATH,
        }
    }

    #[must_use]
    pub const fn ttl(self) -> Duration {
        match self {
            Self::Sso | Self::Slo => Duration::from_secs(60 * 60),
            Self::AccessToken => Duration::from_secs(15 * 60),
            Self::RefreshToken => Duration::from_secs(7 * 24 * 60 * 60),
            Self::SamlError => Duration::from_secs(5 * 60),
        }
    }
}

/// Payload stored in a session cookie of a fixed kind.
pub trait SessionPayload: Serialize + DeserializeOwned {
    const KIND: SessionKind;
}

/// Pending `AuthnRequest`, read back by the assertion consumer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SsoSession {
    pub authn_request_id: String,
    pub redirect_url: String,
    pub redirect_url_on_error: String,
}

impl SessionPayload for SsoSession {
    const KIND: SessionKind = SessionKind::Sso;
}

/// Pending `LogoutRequest` sent by this service provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SloSession {
    pub user_id: i64,
    pub authn_request_id: String,
    pub redirect_url: String,
    pub redirect_url_on_error: String,
}

impl SessionPayload for SloSession {
    const KIND: SessionKind = SessionKind::Slo;
}

/// Authenticated user, carried by the access token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: i64,
    pub email: String,
}

impl SessionPayload for AuthSession {
    const KIND: SessionKind = SessionKind::AccessToken;
}

/// Outcome of the last ACS/SLO hop, delivered once to the frontend.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SamlErrorSession {
    pub error: ErrorBody,
    /// RFC 3339 time the outcome was recorded.
    pub time: String,
}

impl SamlErrorSession {
    #[must_use]
    pub fn new(error: ErrorBody) -> Self {
        Self {
            error,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Success marker, an empty error.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(ErrorBody::default())
    }
}

impl SessionPayload for SamlErrorSession {
    const KIND: SessionKind = SessionKind::SamlError;
}

/// Freshly signed access/refresh token pair.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// One codec per session kind so a token from one flow never verifies in another.
#[derive(Debug)]
pub struct SessionSecrets {
    sso: TokenCodec,
    slo: TokenCodec,
    access_token: TokenCodec,
    refresh_token: TokenCodec,
    saml_error: TokenCodec,
}

impl SessionSecrets {
    /// Random secrets for every kind, valid for the lifetime of the process.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            sso: TokenCodec::random(),
            slo: TokenCodec::random(),
            access_token: TokenCodec::random(),
            refresh_token: TokenCodec::random(),
            saml_error: TokenCodec::random(),
        }
    }

    #[must_use]
    pub const fn codec(&self, kind: SessionKind) -> &TokenCodec {
        match kind {
            SessionKind::Sso => &self.sso,
            SessionKind::Slo => &self.slo,
            SessionKind::AccessToken => &self.access_token,
            SessionKind::RefreshToken => &self.refresh_token,
            SessionKind::SamlError => &self.saml_error,
        }
    }
}

#[derive(Debug)]
pub struct SessionStore {
    secrets: SessionSecrets,
}

impl SessionStore {
    #[must_use]
    pub fn new(secrets: SessionSecrets) -> Self {
        Self { secrets }
    }

    /// Sign `payload` and append its `Set-Cookie` header to `cookies`.
    ///
    /// # Errors
    /// Returns `JwtSign` if the token cannot be signed.
    pub fn create<P: SessionPayload>(
        &self,
        cookies: &mut HeaderMap,
        payload: &P,
    ) -> Result<(), SamlError> {
        let token = self
            .secrets
            .codec(P::KIND)
            .generate(payload, P::KIND.ttl())?;
        set_cookie(cookies, P::KIND, &token)
    }

    /// Read and verify the session of kind `P` from the request headers.
    ///
    /// # Errors
    /// Returns `CookieNone` if the cookie is absent or does not verify.
    pub fn get<P: SessionPayload>(&self, headers: &HeaderMap) -> Result<P, SamlError> {
        let name = P::KIND.cookie_name();
        let token = extract_cookie(headers, name).ok_or_else(|| {
            SamlError::with_cause(ErrorKind::CookieNone, format!("cookie {name} not present"))
        })?;
        self.secrets
            .codec(P::KIND)
            .verify(&token)
            .map_err(|e| SamlError::with_cause(ErrorKind::CookieNone, e))
    }

    /// Expire the session of kind `P` on its own path.
    pub fn delete<P: SessionPayload>(&self, cookies: &mut HeaderMap) {
        expire_cookie(cookies, P::KIND);
    }

    /// Sign a new access/refresh pair for `session` without setting any cookie yet.
    ///
    /// # Errors
    /// Returns `JwtSign` if either token cannot be signed.
    pub fn issue_auth_session(&self, session: &AuthSession) -> Result<AuthTokens, SamlError> {
        let access_kind = SessionKind::AccessToken;
        let refresh_kind = SessionKind::RefreshToken;
        Ok(AuthTokens {
            access_token: self
                .secrets
                .codec(access_kind)
                .generate(session, access_kind.ttl())?,
            refresh_token: self
                .secrets
                .codec(refresh_kind)
                .generate(session, refresh_kind.ttl())?,
        })
    }

    /// # Errors
    /// Returns `Session` if a token cannot be carried in a header.
    pub fn set_auth_session(
        &self,
        cookies: &mut HeaderMap,
        tokens: &AuthTokens,
    ) -> Result<(), SamlError> {
        set_cookie(cookies, SessionKind::AccessToken, &tokens.access_token)?;
        set_cookie(cookies, SessionKind::RefreshToken, &tokens.refresh_token)
    }

    /// # Errors
    /// Returns `CookieNone` if the access token is absent or does not verify.
    pub fn auth_session(&self, headers: &HeaderMap) -> Result<AuthSession, SamlError> {
        self.get::<AuthSession>(headers)
    }

    /// Verify a refresh token, returning its session and the raw token so it can be
    /// compared with the stored one.
    ///
    /// # Errors
    /// Returns `CookieNone` if the refresh token is absent or does not verify.
    pub fn refresh_session(
        &self,
        headers: &HeaderMap,
    ) -> Result<(AuthSession, String), SamlError> {
        let kind = SessionKind::RefreshToken;
        let token = extract_cookie(headers, kind.cookie_name()).ok_or_else(|| {
            SamlError::with_cause(ErrorKind::CookieNone, "refresh token not present")
        })?;
        let session = self
            .secrets
            .codec(kind)
            .verify(&token)
            .map_err(|e| SamlError::with_cause(ErrorKind::CookieNone, e))?;
        Ok((session, token))
    }

    pub fn delete_auth_session(&self, cookies: &mut HeaderMap) {
        expire_cookie(cookies, SessionKind::AccessToken);
        expire_cookie(cookies, SessionKind::RefreshToken);
    }
}

fn cookie_header(
    kind: SessionKind,
    value: &str,
    max_age: u64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let name = kind.cookie_name();
    let path = kind.path();
    HeaderValue::from_str(&format!(
        "{name}={value}; Path={path}; Max-Age={max_age}; HttpOnly; Secure; SameSite=None"
    ))
}

fn set_cookie(cookies: &mut HeaderMap, kind: SessionKind, token: &str) -> Result<(), SamlError> {
    let header = cookie_header(kind, token, kind.ttl().as_secs())
        .map_err(|e| SamlError::with_cause(ErrorKind::Session, e))?;
    cookies.append(SET_COOKIE, header);
    Ok(())
}

fn expire_cookie(cookies: &mut HeaderMap, kind: SessionKind) {
    match cookie_header(kind, "", 0) {
        Ok(header) => {
            cookies.append(SET_COOKIE, header);
        }
        Err(e) => error!("Failed to expire cookie {}: {e}", kind.cookie_name()),
    }
}

fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            (key == name && !val.is_empty()).then(|| val.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::testing::{cookie_from, request_cookies};

    fn sso() -> SsoSession {
        SsoSession {
            authn_request_id: "id-1234".to_string(),
            redirect_url: "https://app/x".to_string(),
            redirect_url_on_error: "https://app/err".to_string(),
        }
    }

    #[test]
    fn test_cookie_attributes() {
        let store = SessionStore::new(SessionSecrets::generate());
        let mut cookies = HeaderMap::new();
        store.create(&mut cookies, &sso()).unwrap();

        let header = cookies.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(header.starts_with("sso_token="));
        assert!(header.contains("; Path=/saml/acs;"));
        assert!(header.contains("; Max-Age=3600;"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("Secure"));
        assert!(header.ends_with("SameSite=None"));
    }

    #[test]
    fn test_create_then_get() {
        let store = SessionStore::new(SessionSecrets::generate());
        let mut cookies = HeaderMap::new();
        store.create(&mut cookies, &sso()).unwrap();

        let headers = request_cookies(&cookies);
        let session: SsoSession = store.get(&headers).unwrap();
        assert_eq!(session, sso());
    }

    #[test]
    fn test_missing_cookie() {
        let store = SessionStore::new(SessionSecrets::generate());
        let err = store.get::<SsoSession>(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CookieNone);
    }

    #[test]
    fn test_token_from_other_kind_is_rejected() {
        let store = SessionStore::new(SessionSecrets::generate());
        let mut cookies = HeaderMap::new();
        store.create(&mut cookies, &sso()).unwrap();
        let token = cookie_from(&cookies, "sso_token").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("slo_token={token}")).unwrap(),
        );
        let err = store.get::<SloSession>(&headers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CookieNone);
        assert!(err.report().contains("invalid session"));
    }

    #[test]
    fn test_delete_expires_on_same_path() {
        let store = SessionStore::new(SessionSecrets::generate());
        let mut cookies = HeaderMap::new();
        store.delete::<SloSession>(&mut cookies);

        let header = cookies.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(header.starts_with("slo_token=;"));
        assert!(header.contains("Path=/saml/slo"));
        assert!(header.contains("Max-Age=0"));
    }

    #[test]
    fn test_auth_session_pair() {
        let store = SessionStore::new(SessionSecrets::generate());
        let session = AuthSession {
            user_id: 7,
            email: "alice@example.com".to_string(),
        };
        let tokens = store.issue_auth_session(&session).unwrap();
        let mut cookies = HeaderMap::new();
        store.set_auth_session(&mut cookies, &tokens).unwrap();

        let headers: Vec<&str> = cookies
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(headers.len(), 2);
        assert!(headers[0].starts_with("access_token="));
        assert!(headers[0].contains("Path=/;"));
        assert!(headers[0].contains("Max-Age=900"));
        assert!(headers[1].starts_with("refresh_token="));
        assert!(headers[1].contains("Path=/auth/refresh"));
        assert!(headers[1].contains("Max-Age=604800"));

        let request = request_cookies(&cookies);
        assert_eq!(store.auth_session(&request).unwrap(), session);
        assert_eq!(
            store.refresh_session(&request).unwrap(),
            (session, tokens.refresh_token)
        );
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let store = SessionStore::new(SessionSecrets::generate());
        let tokens = store
            .issue_auth_session(&AuthSession {
                user_id: 7,
                email: "alice@example.com".to_string(),
            })
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("access_token={}", tokens.refresh_token)).unwrap(),
        );
        assert!(store.auth_session(&headers).is_err());
    }

    #[test]
    fn test_extract_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; sso_token=abc.def.ghi; lang=en"),
        );
        assert_eq!(
            extract_cookie(&headers, "sso_token"),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(extract_cookie(&headers, "slo_token"), None);
    }

    #[test]
    fn test_empty_error_session() {
        let session = SamlErrorSession::empty();
        assert_eq!(session.error.code, 0);
        assert!(session.error.message.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&session.time).is_ok());
    }
}
