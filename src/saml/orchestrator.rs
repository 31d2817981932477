//! SSO/SLO state machine.
//!
//! Login: `Idle -> AwaitingIdPResponse (SSO cookie) -> Authenticated | Failed`.
//! SP-initiated logout: `Idle -> AwaitingIdPLogoutResponse (SLO cookie) -> LoggedOut | Failed`.
//! IdP-initiated logout is a single stateless exchange.

use crate::saml::{
    error::{ErrorBody, ErrorKind, SamlError},
    form::post_form_response,
    metadata::{IdentityProviderMetadataLoader, MetadataReader},
    provider::{
        MessageParameter, OutboundMessage, SamaelProvider, SamlProvider, ServiceProviderConfig,
    },
    repository::{UserRepository, UserTransaction},
    session::{AuthSession, AuthTokens, SamlErrorSession, SessionStore, SloSession, SsoSession},
};
use axum::{
    http::{
        header::{CONTENT_TYPE, LOCATION},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use base64ct::{Base64, Encoding};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, instrument, warn};
use url::Url;

pub const URL_PARAM_SAML_ERROR: &str = "saml_error";

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// What to do when committing fails after the body succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnCommitError {
    Fail,
    Warn,
}

pub struct SamlOrchestrator {
    config: ServiceProviderConfig,
    provider: Arc<dyn SamlProvider>,
    users: Arc<dyn UserRepository>,
    sessions: SessionStore,
}

impl SamlOrchestrator {
    pub fn new(
        config: ServiceProviderConfig,
        provider: Arc<dyn SamlProvider>,
        users: Arc<dyn UserRepository>,
        sessions: SessionStore,
    ) -> Self {
        Self {
            config,
            provider,
            users,
            sessions,
        }
    }

    /// Load the IdP metadata and build the `samael` backed orchestrator.
    ///
    /// # Errors
    /// Returns the metadata loader error, or `Config` if the SP cannot be built.
    pub async fn bootstrap<R: MetadataReader>(
        config: ServiceProviderConfig,
        idp_metadata_url: &str,
        loader: &IdentityProviderMetadataLoader<R>,
        users: Arc<dyn UserRepository>,
        sessions: SessionStore,
    ) -> Result<Self, SamlError> {
        let idp_metadata = loader.fetch_idp_metadata(idp_metadata_url).await?;
        let provider = SamaelProvider::new(config.clone(), idp_metadata)?;
        Ok(Self::new(config, Arc::new(provider), users, sessions))
    }

    #[must_use]
    pub const fn config(&self) -> &ServiceProviderConfig {
        &self.config
    }

    /// Start SSO: remember the `AuthnRequest` in the SSO cookie and post it to the IdP.
    ///
    /// # Errors
    /// `InvalidParameter` if a target cannot be a header value, `SsoAuthnRequest` if the
    /// request cannot be built, `JwtSign` for the cookie, `HtmlWriting` for the form.
    #[instrument(skip(self))]
    pub fn execute_saml_login(
        &self,
        redirect_url: &str,
        redirect_url_on_error: &str,
    ) -> Result<Response, SamlError> {
        check_redirect_targets(redirect_url, redirect_url_on_error)?;

        let idp_url = self.provider.sso_binding_location().ok_or_else(|| {
            SamlError::with_cause(
                ErrorKind::SsoAuthnRequest,
                "IdP metadata has no HTTP-POST SingleSignOnService",
            )
        })?;

        let request = self
            .provider
            .make_authentication_request(&idp_url)
            .map_err(|e| SamlError::with_cause(ErrorKind::SsoAuthnRequest, e))?;

        // The cookie header must be in place before the body is produced.
        let mut cookies = HeaderMap::new();
        self.sessions.create(
            &mut cookies,
            &SsoSession {
                authn_request_id: request.id.clone(),
                redirect_url: redirect_url.to_string(),
                redirect_url_on_error: redirect_url_on_error.to_string(),
            },
        )?;

        info!("Posting AuthnRequest {} to {idp_url}", request.id);

        html_form(&request, cookies)
    }

    /// Consume the IdP's `SAMLResponse` posted to the ACS endpoint.
    ///
    /// Without a valid SSO cookie there is nowhere to redirect, so that error is returned.
    /// Every later outcome ends in a redirect that also clears the SSO cookie.
    ///
    /// # Errors
    /// `RequestParse` for an unreadable form, `CookieNone` without SSO session.
    #[instrument(skip_all)]
    pub async fn execute_saml_acs(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, SamlError> {
        let form = parse_form(headers, body)?;
        let session: SsoSession = self.sessions.get(headers)?;

        let mut cookies = HeaderMap::new();
        let outcome = self.consume_assertion(&form, &session, &mut cookies).await;

        self.sessions.delete::<SsoSession>(&mut cookies);
        self.finish_with_redirect(
            cookies,
            outcome,
            &session.redirect_url,
            &session.redirect_url_on_error,
        )
    }

    async fn consume_assertion(
        &self,
        form: &HashMap<String, String>,
        session: &SsoSession,
        cookies: &mut HeaderMap,
    ) -> Result<(), SamlError> {
        let saml_response = form
            .get(MessageParameter::SamlResponse.as_str())
            .ok_or_else(|| {
                SamlError::with_cause(ErrorKind::SsoParseResponse, "SAMLResponse is missing")
            })?;

        let assertion = self
            .provider
            .parse_response(saml_response, &[session.authn_request_id.as_str()])
            .map_err(|e| SamlError::with_cause(ErrorKind::SsoParseResponse, e))?;

        // NameID is the email when the IdP client is configured as expected.
        let email = assertion
            .subject
            .and_then(|subject| subject.name_id)
            .map(|name_id| name_id.value)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SamlError::new(ErrorKind::UnexpectedAssertion))?;

        let mut tx = self.users.begin().await?;
        let result = self.establish_auth_session(tx.as_mut(), &email).await;
        let tokens = finish_transaction(tx, result, OnCommitError::Fail).await?;

        info!("Signed in {email}");

        self.sessions.set_auth_session(cookies, &tokens)
    }

    async fn establish_auth_session(
        &self,
        tx: &mut dyn UserTransaction,
        email: &str,
    ) -> Result<AuthTokens, SamlError> {
        let user = match tx.select_by_email(email).await? {
            Some(user) => user,
            None => {
                info!("Creating user {email}");
                tx.create_user(email).await?
            }
        };

        let tokens = self.sessions.issue_auth_session(&AuthSession {
            user_id: user.id,
            email: user.email.clone(),
        })?;

        tx.update_token(user.id, &tokens.access_token, &tokens.refresh_token)
            .await?;

        Ok(tokens)
    }

    /// Start SP-initiated logout for the signed-in user.
    ///
    /// # Errors
    /// `InvalidParameter` if a target cannot be a header value, `CookieNone` without auth
    /// session, `SloAuthnRequest` if the request cannot be built, `JwtSign` for the cookie,
    /// `HtmlWriting` if the form cannot be rendered.
    #[instrument(skip(self, headers))]
    pub fn execute_saml_logout(
        &self,
        headers: &HeaderMap,
        redirect_url: &str,
        redirect_url_on_error: &str,
    ) -> Result<Response, SamlError> {
        check_redirect_targets(redirect_url, redirect_url_on_error)?;
        let session = self.sessions.auth_session(headers)?;

        let idp_url = self.provider.slo_binding_location().ok_or_else(|| {
            SamlError::with_cause(
                ErrorKind::SloAuthnRequest,
                "IdP metadata has no HTTP-POST SingleLogoutService",
            )
        })?;

        let request = self
            .provider
            .make_logout_request(&idp_url, &session.email)
            .map_err(|e| SamlError::with_cause(ErrorKind::SloAuthnRequest, e))?;

        let mut cookies = HeaderMap::new();
        self.sessions.create(
            &mut cookies,
            &SloSession {
                user_id: session.user_id,
                authn_request_id: request.id.clone(),
                redirect_url: redirect_url.to_string(),
                redirect_url_on_error: redirect_url_on_error.to_string(),
            },
        )?;

        info!("Posting LogoutRequest {} to {idp_url}", request.id);

        html_form(&request, cookies)
    }

    /// SLO endpoint: a `SAMLRequest` is an IdP-initiated logout, a `SAMLResponse` answers
    /// the logout this SP started.
    ///
    /// # Errors
    /// `RequestParse` for an unreadable form, `OperationNotAllowed` if neither field is
    /// present, otherwise the errors of the selected path.
    #[instrument(skip_all)]
    pub async fn execute_saml_slo(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, SamlError> {
        let form = parse_form(headers, body)?;

        if let Some(encoded) = form.get(MessageParameter::SamlRequest.as_str()) {
            return self.slo_initiated_by_other(headers, encoded).await;
        }

        if let Some(encoded) = form.get(MessageParameter::SamlResponse.as_str()) {
            return self.slo_initiated_by_self(headers, encoded).await;
        }

        Err(SamlError::new(ErrorKind::OperationNotAllowed))
    }

    async fn slo_initiated_by_other(
        &self,
        headers: &HeaderMap,
        encoded: &str,
    ) -> Result<Response, SamlError> {
        let mut tx = self.users.begin().await?;
        let result = self
            .answer_logout_request(headers, encoded, tx.as_mut())
            .await;
        finish_transaction(tx, result, OnCommitError::Warn).await
    }

    async fn answer_logout_request(
        &self,
        headers: &HeaderMap,
        encoded: &str,
        tx: &mut dyn UserTransaction,
    ) -> Result<Response, SamlError> {
        let xml = decode_base64_xml(encoded)
            .map_err(|e| SamlError::with_cause(ErrorKind::Base64SamlRequest, e))?;

        let request = self
            .provider
            .unmarshal_logout_request(&xml)
            .map_err(|e| SamlError::with_cause(ErrorKind::UnmarshalSamlRequest, e))?;

        let name_id = request
            .name_id
            .map(|name_id| name_id.value)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SamlError::new(ErrorKind::EmptyNameId))?;

        // Best effort: the IdP gets a success response even if nothing matched here.
        let mut cookies = HeaderMap::new();
        match self.sessions.auth_session(headers) {
            Ok(session) if session.email == name_id => {
                self.sessions.delete_auth_session(&mut cookies);
                clear_stored_tokens(tx, &session.email).await;
            }
            Ok(session) => warn!(
                "Cannot delete the auth session: mismatch NameID {} vs {name_id}",
                session.email
            ),
            Err(_) => warn!("Cannot delete the auth session: no active session"),
        }

        let idp_url = self.provider.slo_binding_location().ok_or_else(|| {
            SamlError::with_cause(
                ErrorKind::SamlLogoutResponseCreation,
                "IdP metadata has no HTTP-POST SingleLogoutService",
            )
        })?;

        let response = self
            .provider
            .make_logout_response(&idp_url, request.id.as_deref().unwrap_or_default())
            .map_err(|e| SamlError::with_cause(ErrorKind::SamlLogoutResponseCreation, e))?;

        info!("Answering LogoutRequest for {name_id}");

        html_form(&response, cookies)
    }

    async fn slo_initiated_by_self(
        &self,
        headers: &HeaderMap,
        encoded: &str,
    ) -> Result<Response, SamlError> {
        let session: SloSession = self.sessions.get(headers)?;
        let mut tx = self.users.begin().await?;

        let mut cookies = HeaderMap::new();
        let result = self
            .complete_logout(encoded, &session, tx.as_mut(), &mut cookies)
            .await;
        let outcome = finish_transaction(tx, result, OnCommitError::Warn).await;

        self.finish_with_redirect(
            cookies,
            outcome,
            &session.redirect_url,
            &session.redirect_url_on_error,
        )
    }

    async fn complete_logout(
        &self,
        encoded: &str,
        session: &SloSession,
        tx: &mut dyn UserTransaction,
        cookies: &mut HeaderMap,
    ) -> Result<(), SamlError> {
        let xml = decode_base64_xml(encoded)
            .map_err(|e| SamlError::with_cause(ErrorKind::Base64SamlResponse, e))?;

        let response = self
            .provider
            .unmarshal_logout_response(&xml)
            .map_err(|e| SamlError::with_cause(ErrorKind::UnmarshalSamlResponse, e))?;

        let in_response_to = response
            .in_response_to
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SamlError::new(ErrorKind::EmptyLogoutRequestId))?;

        if in_response_to != session.authn_request_id {
            return Err(SamlError::with_cause(
                ErrorKind::InvalidNameId,
                format!(
                    "InResponseTo {in_response_to} does not match {}",
                    session.authn_request_id
                ),
            ));
        }

        self.provider
            .validate_logout_response(&xml, &response)
            .map_err(|e| SamlError::with_cause(ErrorKind::SloValidation, e))?;

        self.sessions.delete_auth_session(cookies);
        self.sessions.delete::<SloSession>(cookies);
        tx.update_token(session.user_id, "", "").await?;

        info!("Signed out user {}", session.user_id);

        Ok(())
    }

    /// Hand the last ACS/SLO outcome to the frontend once.
    ///
    /// # Errors
    /// `CookieNone` if there is no outcome to report.
    pub fn execute_saml_error(&self, headers: &HeaderMap) -> Result<Response, SamlError> {
        let session: SamlErrorSession = self.sessions.get(headers)?;

        let mut cookies = HeaderMap::new();
        self.sessions.delete::<SamlErrorSession>(&mut cookies);

        Ok((StatusCode::OK, cookies, Json(session)).into_response())
    }

    /// Rotate the access/refresh pair if the presented refresh token is the stored one.
    ///
    /// # Errors
    /// `CookieNone` without refresh token, `Session` if it was revoked or rotated,
    /// database errors otherwise.
    #[instrument(skip_all)]
    pub async fn execute_refresh(&self, headers: &HeaderMap) -> Result<Response, SamlError> {
        let (session, presented) = self.sessions.refresh_session(headers)?;

        let mut tx = self.users.begin().await?;
        let result = self.rotate_tokens(tx.as_mut(), &session, &presented).await;
        let tokens = finish_transaction(tx, result, OnCommitError::Fail).await?;

        let mut cookies = HeaderMap::new();
        self.sessions.set_auth_session(&mut cookies, &tokens)?;

        Ok((StatusCode::NO_CONTENT, cookies).into_response())
    }

    async fn rotate_tokens(
        &self,
        tx: &mut dyn UserTransaction,
        session: &AuthSession,
        presented: &str,
    ) -> Result<AuthTokens, SamlError> {
        let user = tx
            .select_by_email(&session.email)
            .await?
            .filter(|user| user.id == session.user_id)
            .ok_or_else(|| SamlError::with_cause(ErrorKind::Session, "unknown user"))?;

        if user.refresh_token.is_empty() || user.refresh_token != presented {
            return Err(SamlError::with_cause(
                ErrorKind::Session,
                "refresh token was revoked or rotated",
            ));
        }

        let tokens = self.sessions.issue_auth_session(session)?;
        tx.update_token(user.id, &tokens.access_token, &tokens.refresh_token)
            .await?;

        Ok(tokens)
    }

    /// This SP's metadata document.
    #[must_use]
    pub fn execute_saml_metadata(&self) -> Response {
        (
            StatusCode::OK,
            [(
                CONTENT_TYPE,
                HeaderValue::from_static("application/samlmetadata+xml"),
            )],
            self.config.metadata_xml(),
        )
            .into_response()
    }

    /// Single exit of the ACS and self-initiated SLO flows: record the outcome in the
    /// error cookie and redirect to the matching target.
    fn finish_with_redirect(
        &self,
        mut cookies: HeaderMap,
        outcome: Result<(), SamlError>,
        redirect_url: &str,
        redirect_url_on_error: &str,
    ) -> Result<Response, SamlError> {
        let (error_session, location) = match outcome {
            Ok(()) => (SamlErrorSession::empty(), redirect_url.to_string()),
            Err(e) => {
                error!("{}", e.report());
                (
                    SamlErrorSession::new(ErrorBody::from(&e)),
                    error_redirect_url(redirect_url_on_error),
                )
            }
        };

        if let Err(e) = self.sessions.create(&mut cookies, &error_session) {
            error!("Failed to record the SAML outcome: {}", e.report());
        }

        let location = HeaderValue::from_str(&location)
            .map_err(|e| SamlError::with_cause(ErrorKind::InvalidParameter, e))?;
        cookies.insert(LOCATION, location);

        Ok((StatusCode::FOUND, cookies).into_response())
    }
}

/// Both targets end up in the `Location` header that closes the flow.
fn check_redirect_targets(
    redirect_url: &str,
    redirect_url_on_error: &str,
) -> Result<(), SamlError> {
    for target in [redirect_url, error_redirect_url(redirect_url_on_error).as_str()] {
        HeaderValue::from_str(target)
            .map_err(|e| SamlError::with_cause(ErrorKind::InvalidParameter, e))?;
    }
    Ok(())
}

/// Commit if `result` is a success, roll back otherwise; exactly one of the two runs.
/// A rollback failure never replaces the error that caused it.
async fn finish_transaction<T>(
    mut tx: Box<dyn UserTransaction>,
    result: Result<T, SamlError>,
    on_commit_error: OnCommitError,
) -> Result<T, SamlError> {
    match result {
        Ok(value) => match tx.commit().await {
            Ok(()) => Ok(value),
            Err(e) if on_commit_error == OnCommitError::Warn => {
                warn!("Error in commit: {}", e.report());
                Ok(value)
            }
            Err(e) => Err(e),
        },
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("Error in rollback: {}", rollback.report());
            }
            Err(e)
        }
    }
}

async fn clear_stored_tokens(tx: &mut dyn UserTransaction, email: &str) {
    match tx.select_by_email(email).await {
        Ok(Some(user)) => {
            if let Err(e) = tx.update_token(user.id, "", "").await {
                warn!("Cannot update token: user_id={}: {}", user.id, e.report());
            }
        }
        Ok(None) => warn!("Cannot select user: email={email}"),
        Err(e) => warn!("Cannot select user: email={email}: {}", e.report()),
    }
}

fn html_form(message: &OutboundMessage, cookies: HeaderMap) -> Result<Response, SamlError> {
    post_form_response(message, cookies)
        .map_err(|e| SamlError::with_cause(ErrorKind::HtmlWriting, e))
}

/// Decode an `application/x-www-form-urlencoded` body.
fn parse_form(headers: &HeaderMap, body: &[u8]) -> Result<HashMap<String, String>, SamlError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let mime = content_type.split(';').next().unwrap_or_default().trim();

    if !mime.eq_ignore_ascii_case(FORM_URLENCODED) {
        return Err(SamlError::with_cause(
            ErrorKind::RequestParse,
            format!("unexpected content type: {content_type:?}"),
        ));
    }

    std::str::from_utf8(body).map_err(|e| SamlError::with_cause(ErrorKind::RequestParse, e))?;

    Ok(url::form_urlencoded::parse(body).into_owned().collect())
}

/// Standard base64 as used by the HTTP-POST binding, line breaks tolerated.
fn decode_base64_xml(encoded: &str) -> Result<String, String> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = Base64::decode_vec(&compact).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

/// `redirect_url_on_error` with `saml_error=1` appended to its query.
fn error_redirect_url(redirect_url_on_error: &str) -> String {
    match Url::parse(redirect_url_on_error) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair(URL_PARAM_SAML_ERROR, "1");
            url.to_string()
        }
        Err(_) => format!("{redirect_url_on_error}?{URL_PARAM_SAML_ERROR}=1"),
    }
}
