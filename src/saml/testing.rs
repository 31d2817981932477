//! Fixtures and in-memory fakes shared by the unit tests.

use crate::saml::{
    error::{BoxError, ErrorKind, SamlError},
    metadata::parse_metadata,
    provider::{
        Assertion, LogoutRequest, LogoutResponse, MessageParameter, NameId, OutboundMessage,
        SamaelProvider, SamlProvider, ServiceProviderConfig, Subject, STATUS_SUCCESS,
    },
    repository::{UserEntity, UserRepository, UserTransaction},
    session::{SessionSecrets, SessionStore},
    SamlOrchestrator,
};
use async_trait::async_trait;
use axum::http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use base64ct::{Base64, Encoding};
use chrono::Utc;
use samael::{
    crypto,
    idp::response_builder::build_response_template,
    schema::{Issuer, Response, Status, StatusCode},
    signature::Signature,
    traits::ToXml,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use url::Url;

pub const IDP_URL: &str = "https://idp.example.com/realms/samlsp/protocol/saml";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/realms/samlsp";
pub const ACS_URL: &str = "https://backend.example.com/saml/acs";
pub const SLO_URL: &str = "https://backend.example.com/saml/slo";

/// PKCS#1 key behind the certificate of `IDP_METADATA_XML`.
const IDP_SIGNING_KEY: &str = "
MIIEpAIBAAKCAQEAqP9NPUYqoVdZZpxaU4egL4MrGu0wRR+9r/B9Fe+Lk2M4fXNz
ytarUxXrENVsop9/BBrR+hlO0/t/9X5UoESIJJA2vUJ4WjLdFwTFx1spGYvwDlth
KDS2MPPFDf7Om/2O6SRA4muoogixDc3dnytz801qSbyzu9Ej44Th2YEiSlrk92Yx
rvTpHlVbow25uR7ctjZtYa611ME6r7nWjP3DDIMaYfplo5Tca6VXueQnAZpcnhqC
NYtAHfESfrW791BKvZudZVK8oru2e/r9ERQpo889GRGrUFzyA/EzqHudLVOV5vn7
QzRru1FbEo3TOlN401W/bhiBI7JVQfPKwWBlPwIDAQABAoIBAA+mCExutV7YPEaE
ntaSPfJ4VmL5aJlV/ZYPkj2YP1fn/aCcMrIrG5Und+tIn/UVCMlkBGKAumxlou0k
BAkNH4AnPHJc99D+WbuabQfvOIiNjS5/Jql27BHvWKVZnV8TZQrQmRN+PZC3dlGd
aPKmruduGTP3vbrb/FNCiDlAPGEfD/Aj+vMM66d8dLcE/Zb1S20Wp6VkkyC9B4lg
oFRUSXWyNlZwMSRz7qehAyKoFXZI0TVdXwn/FybDO3GOLOfc+WT3qsGX1FiU6YTq
Yk0BM7cx0TqX79ILQDIXUPlpkNcMTV+svQBcOaqLOJKyR0mY8gbZhqIgmL0RS03n
A4yPl30CgYEA3cFZsUAfx/nqaJvM1wuUSkTh+rZusq2S1SWig09R9ryPa1h9TZNT
/gDZn+db5o5ayHOyTRa+NkiLLaA2QMC4ylvRe8Zm96pUISDPKFjYvhPBL46Ah9pc
SR7Mat0a0TVIcyQ1t9046teCj0/2N97F3il6lTOtnhEtRJh4E909L80CgYEAwxhF
Bp9PA7jcwZFA0UzAqH1Dy8hpZR1YcYuEvpUocVdI6s6TctxXbutjzhwtl1CU4JOB
/JOrTiMry+eQD8mR0RWfMteoAG8U1Ut7gmZ0zbtQdJUAMb3MbK6+3M02IxOFZDDY
BQCk9bBeLZHVImsWqHzdEGIlafO+kZeliv6U5TsCgYEAthTwxK3Waqk2ZDapd1m2
pVTyCJ6LPoNvMTz5t8AFmQcy6/14xZ3XNZUVHEsoFqOEv1rgaJPoE0J1pT0Lzxdv
pBjIZU1/dpSRB7Kc5pAtR8WItrfXqbUOWavERWrPfkC2AHUW9qXa+lmChpItpapx
5f1A/gm04TlRZiWbUxQyDXECgYEAsTNsDrXISPMx38cU/oYeP2t3lrKzuBnNaWR1
77z+/ONw4YU8PAmSiLbY8i554oRYlRql6EogQFqFvzDWkuBcx3JCJSXn/GzomUt0
JV72HJ9UVm+3u3ZPJTAbP+ZMk9N5RyVuMC0Dp/zHrdBVrGtkKykuiWD75p5zqz34
KKVPjF0CgYBRzssGQ7uWC0Ia3TsEvOFpswBtkVNjqQ0npVMXGaH+QH6RQKaoBwo6
l0zTcGX4I3TBa3RZRd243TJaTDDx1bYAGEp6pent15M8cjoSxmb49fluoSrS+jnb
9Ue57xuG/IKdyiXN/cIk9sL5ywEbu2Zotpp/zjz5GX06ftZ981YvSg==
";

pub const IDP_METADATA_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="https://idp.example.com/realms/samlsp">
  <md:IDPSSODescriptor WantAuthnRequestsSigned="false" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo>
        <ds:KeyName>samlsp</ds:KeyName>
        <ds:X509Data>
          <ds:X509Certificate>
            MIIDBTCCAe2gAwIBAgIUDh+8+S/dvNs278hoGezM5XDu1zAwDQYJKoZIhvcNAQEL
            BQAwETEPMA0GA1UEAwwGc2FtbHNwMCAXDTI2MTAxOTExNDYwOVoYDzIxMjYwOTI1
            MTE0NjA5WjARMQ8wDQYDVQQDDAZzYW1sc3AwggEiMA0GCSqGSIb3DQEBAQUAA4IB
            DwAwggEKAoIBAQCo/009RiqhV1lmnFpTh6Avgysa7TBFH72v8H0V74uTYzh9c3PK
            1qtTFesQ1Wyin38EGtH6GU7T+3/1flSgRIgkkDa9QnhaMt0XBMXHWykZi/AOW2Eo
            NLYw88UN/s6b/Y7pJEDia6iiCLENzd2fK3PzTWpJvLO70SPjhOHZgSJKWuT3ZjGu
            9OkeVVujDbm5Hty2Nm1hrrXUwTqvudaM/cMMgxph+mWjlNxrpVe55CcBmlyeGoI1
            i0Ad8RJ+tbv3UEq9m51lUryiu7Z7+v0RFCmjzz0ZEatQXPID8TOoe50tU5Xm+ftD
            NGu7UVsSjdM6U3jTVb9uGIEjslVB88rBYGU/AgMBAAGjUzBRMB0GA1UdDgQWBBTN
            uh+/YyGN2r+kaAaIm6QhiEmDNzAfBgNVHSMEGDAWgBTNuh+/YyGN2r+kaAaIm6Qh
            iEmDNzAPBgNVHRMBAf8EBTADAQH/MA0GCSqGSIb3DQEBCwUAA4IBAQASR58p6xVN
            mK7VwW3gPmHeoX4UZ2skjRWELpuPNmWy+ijw7hJb5LQMjMaybQUNns66UuzxDDuv
            +dbkWoaGP+y6QgmlZPufA6FekgEJVTO1gvHvBt5I2QC6ojPKHynrWHXZ/MInNLKu
            NBoqDrgZWJBtPIxoG6AQFBJRnrBfWjEjUUcE0jdzTHV2JFSwiFqy10+Oe71h/8YM
            xGzR4jDRUe+Wkl0K4Mcgn6tDTycji5Gabu4psJeButWL3VYgNiLSvdVp8zlv5WvQ
            gss7BGlvGLKcknDpsGSs0pyFkBhMa6rZrxumMh9xh+QWzPmUALOwTiBmFVEHBkZ3
            YZfC1FzSnrc4
          </ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/realms/samlsp/protocol/saml"/>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/realms/samlsp/protocol/saml"/>
    <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified</md:NameIDFormat>
    <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</md:NameIDFormat>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/realms/samlsp/protocol/saml"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/realms/samlsp/protocol/saml"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>
"#;

pub fn idp_signing_key_der() -> Vec<u8> {
    let key: String = IDP_SIGNING_KEY.split_whitespace().collect();
    Base64::decode_vec(&key).unwrap()
}

/// DER of the signing certificate published in `IDP_METADATA_XML`.
pub fn idp_certificate_der() -> Vec<u8> {
    let metadata = parse_metadata(IDP_METADATA_XML.as_bytes()).unwrap();
    let descriptors = metadata.idp_sso_descriptors.unwrap();
    let data = descriptors[0].key_descriptors[0]
        .key_info
        .x509_data
        .clone()
        .unwrap();
    crypto::decode_x509_cert(&data.certificates[0]).unwrap()
}

/// `Response` the IdP would send for `in_response_to`, with an empty signature template.
pub fn idp_response(in_response_to: &str, name_id: &str) -> Response {
    build_response_template(
        &idp_certificate_der(),
        name_id,
        "samlsp",
        IDP_ENTITY_ID,
        ACS_URL,
        in_response_to,
        &[],
    )
}

/// Sign the template embedded in `xml` with the IdP key.
pub fn idp_sign(xml: &str) -> String {
    crypto::sign_xml(xml, &idp_signing_key_der()).unwrap()
}

/// Signed `SAMLResponse` XML answering `in_response_to`.
pub fn signed_saml_response(in_response_to: &str, name_id: &str) -> String {
    let response = idp_response(in_response_to, name_id);
    idp_sign(&ToXml::to_string(&response).unwrap())
}

/// `SAMLResponse` XML without any signature.
pub fn unsigned_saml_response(in_response_to: &str, name_id: &str) -> String {
    let mut response = idp_response(in_response_to, name_id);
    response.signature = None;
    ToXml::to_string(&response).unwrap()
}

/// `LogoutResponse` XML from the IdP, signed when `signed` is set.
pub fn idp_logout_response(in_response_to: &str, status: &str, signed: bool) -> String {
    let id = "id-idp-logout-response";
    let response = samael::schema::LogoutResponse {
        id: Some(id.to_string()),
        in_response_to: Some(in_response_to.to_string()),
        version: Some("2.0".to_string()),
        issue_instant: Some(Utc::now()),
        destination: Some(SLO_URL.to_string()),
        consent: None,
        issuer: Some(Issuer {
            value: Some(IDP_ENTITY_ID.to_string()),
            ..Issuer::default()
        }),
        signature: signed.then(|| Signature::template(id, &idp_certificate_der())),
        status: Some(Status {
            status_code: StatusCode {
                value: Some(status.to_string()),
            },
            status_message: None,
            status_detail: None,
        }),
    };
    let xml = ToXml::to_string(&response).unwrap();
    if signed {
        idp_sign(&xml)
    } else {
        xml
    }
}

/// Browser side of `Set-Cookie`: the `Cookie` header the next request would carry.
/// Expired cookies are dropped and later values replace earlier ones.
pub fn request_cookies(set_cookies: &HeaderMap) -> HeaderMap {
    let mut jar: Vec<(String, String)> = Vec::new();
    for value in set_cookies.get_all(SET_COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let Some((name, rest)) = value.split_once('=') else {
            continue;
        };
        let token = rest.split(';').next().unwrap_or_default().to_string();
        jar.retain(|(existing, _)| existing != name);
        if !token.is_empty() && !value.contains("Max-Age=0") {
            jar.push((name.to_string(), token));
        }
    }

    let mut headers = HeaderMap::new();
    if !jar.is_empty() {
        let cookie = jar
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
    }
    headers
}

/// Value of the last `Set-Cookie` for `name`, empty when it was expired.
pub fn cookie_from(set_cookies: &HeaderMap, name: &str) -> Option<String> {
    set_cookies
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| {
            let (key, rest) = value.split_once('=')?;
            (key == name).then(|| rest.split(';').next().unwrap_or_default().to_string())
        })
        .last()
}

/// Every `Set-Cookie` header rendered as a string.
pub fn set_cookie_headers(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|value| value.to_str().unwrap().to_string())
        .collect()
}

/// What the fake IdP signs: the assertion and the request it answers.
#[derive(Serialize, Deserialize)]
struct FakeSamlResponse {
    in_response_to: String,
    assertion: Assertion,
}

/// Base64 `SAMLResponse` understood by `FakeProvider::parse_response`.
pub fn fake_saml_response(in_response_to: &str, name_id: Option<&str>) -> String {
    let response = FakeSamlResponse {
        in_response_to: in_response_to.to_string(),
        assertion: Assertion {
            subject: Some(Subject {
                name_id: name_id.map(|value| NameId {
                    value: value.to_string(),
                }),
            }),
        },
    };
    Base64::encode_string(serde_json::to_string(&response).unwrap().as_bytes())
}

/// Base64 `SAMLRequest` carrying a logout request, as the IdP would post it.
pub fn fake_logout_request(id: &str, name_id: Option<&str>) -> String {
    let request = LogoutRequest {
        id: Some(id.to_string()),
        issuer: Some("https://idp.example.com/realms/samlsp".to_string()),
        name_id: name_id.map(|value| NameId {
            value: value.to_string(),
        }),
    };
    Base64::encode_string(serde_json::to_string(&request).unwrap().as_bytes())
}

/// Base64 `SAMLResponse` carrying a logout response.
pub fn fake_logout_response(in_response_to: Option<&str>, status: &str) -> String {
    let response = LogoutResponse {
        id: Some("id-idp-logout-response".to_string()),
        in_response_to: in_response_to.map(str::to_string),
        issuer: Some("https://idp.example.com/realms/samlsp".to_string()),
        destination: None,
        status: Some(status.to_string()),
    };
    Base64::encode_string(serde_json::to_string(&response).unwrap().as_bytes())
}

/// Provider speaking JSON instead of XML, with switchable failures.
#[derive(Debug)]
pub struct FakeProvider {
    pub sso_location: Option<String>,
    pub slo_location: Option<String>,
    pub fail_requests: bool,
    pub authn_request_id: String,
    pub logout_request_id: String,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            sso_location: Some(IDP_URL.to_string()),
            slo_location: Some(IDP_URL.to_string()),
            fail_requests: false,
            authn_request_id: "id-authn-request".to_string(),
            logout_request_id: "id-logout-request".to_string(),
        }
    }
}

impl FakeProvider {
    fn fail_if_asked(&self) -> Result<(), BoxError> {
        if self.fail_requests {
            return Err("request building disabled".into());
        }
        Ok(())
    }
}

impl SamlProvider for FakeProvider {
    fn sso_binding_location(&self) -> Option<String> {
        self.sso_location.clone()
    }

    fn slo_binding_location(&self) -> Option<String> {
        self.slo_location.clone()
    }

    fn make_authentication_request(&self, idp_url: &str) -> Result<OutboundMessage, BoxError> {
        self.fail_if_asked()?;
        Ok(OutboundMessage {
            id: self.authn_request_id.clone(),
            destination: idp_url.to_string(),
            parameter: MessageParameter::SamlRequest,
            xml: format!("<samlp:AuthnRequest ID=\"{}\"/>", self.authn_request_id),
        })
    }

    fn make_logout_request(
        &self,
        idp_url: &str,
        name_id: &str,
    ) -> Result<OutboundMessage, BoxError> {
        self.fail_if_asked()?;
        Ok(OutboundMessage {
            id: self.logout_request_id.clone(),
            destination: idp_url.to_string(),
            parameter: MessageParameter::SamlRequest,
            xml: format!(
                "<samlp:LogoutRequest ID=\"{}\"><saml:NameID>{name_id}</saml:NameID></samlp:LogoutRequest>",
                self.logout_request_id
            ),
        })
    }

    fn make_logout_response(
        &self,
        idp_url: &str,
        in_response_to: &str,
    ) -> Result<OutboundMessage, BoxError> {
        self.fail_if_asked()?;
        Ok(OutboundMessage {
            id: "id-logout-response".to_string(),
            destination: idp_url.to_string(),
            parameter: MessageParameter::SamlResponse,
            xml: format!("<samlp:LogoutResponse InResponseTo=\"{in_response_to}\"/>"),
        })
    }

    fn parse_response(
        &self,
        saml_response: &str,
        possible_request_ids: &[&str],
    ) -> Result<Assertion, BoxError> {
        let bytes = Base64::decode_vec(saml_response).map_err(|e| e.to_string())?;
        let response: FakeSamlResponse = serde_json::from_slice(&bytes)?;
        if !possible_request_ids.contains(&response.in_response_to.as_str()) {
            return Err(format!("unsolicited response to {}", response.in_response_to).into());
        }
        Ok(response.assertion)
    }

    fn unmarshal_logout_request(&self, xml: &str) -> Result<LogoutRequest, BoxError> {
        Ok(serde_json::from_str(xml)?)
    }

    fn unmarshal_logout_response(&self, xml: &str) -> Result<LogoutResponse, BoxError> {
        Ok(serde_json::from_str(xml)?)
    }

    fn validate_logout_response(
        &self,
        _xml: &str,
        response: &LogoutResponse,
    ) -> Result<(), BoxError> {
        match response.status.as_deref() {
            Some(STATUS_SUCCESS) => Ok(()),
            other => Err(format!("logout failed: {other:?}").into()),
        }
    }
}

/// Shared state of `MemoryUserRepository`.
#[derive(Debug, Default)]
pub struct MemoryState {
    pub users: Vec<UserEntity>,
    pub events: Vec<&'static str>,
    pub fail_begin: bool,
    pub fail_select: bool,
    pub fail_update: bool,
    pub fail_commit: bool,
}

/// Transactions work on a copy of the users, published on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserRepository {
    pub state: Arc<Mutex<MemoryState>>,
}

impl MemoryUserRepository {
    pub fn with_user(id: i64, email: &str) -> Self {
        let repository = Self::default();
        repository.state.lock().unwrap().users.push(UserEntity {
            id,
            email: email.to_string(),
            access_token: String::new(),
            refresh_token: String::new(),
        });
        repository
    }

    pub fn set(&self, update: impl FnOnce(&mut MemoryState)) {
        update(&mut self.state.lock().unwrap());
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn user(&self, email: &str) -> Option<UserEntity> {
        self.state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|user| user.email == email)
            .cloned()
    }

    /// Store `tokens` for the user as if it had signed in before.
    pub fn store_tokens(&self, email: &str, access_token: &str, refresh_token: &str) {
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .iter_mut()
            .find(|user| user.email == email)
            .unwrap();
        user.access_token = access_token.to_string();
        user.refresh_token = refresh_token.to_string();
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, SamlError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_begin {
            return Err(SamlError::with_cause(ErrorKind::DbBegin, "pool closed"));
        }
        state.events.push("begin");
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            users: state.users.clone(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    users: Vec<UserEntity>,
}

impl MemoryTransaction {
    fn record(&self, event: &'static str) {
        self.state.lock().unwrap().events.push(event);
    }

    fn fails(&self, check: impl FnOnce(&MemoryState) -> bool) -> bool {
        check(&self.state.lock().unwrap())
    }
}

#[async_trait]
impl UserTransaction for MemoryTransaction {
    async fn select_by_email(&mut self, email: &str) -> Result<Option<UserEntity>, SamlError> {
        self.record("select");
        if self.fails(|state| state.fail_select) {
            return Err(SamlError::with_cause(ErrorKind::DbQuery, "select failed"));
        }
        Ok(self.users.iter().find(|user| user.email == email).cloned())
    }

    async fn create_user(&mut self, email: &str) -> Result<UserEntity, SamlError> {
        self.record("create");
        let id = self.users.iter().map(|user| user.id).max().unwrap_or(0) + 1;
        let user = UserEntity {
            id,
            email: email.to_string(),
            access_token: String::new(),
            refresh_token: String::new(),
        };
        self.users.push(user.clone());
        Ok(user)
    }

    async fn update_token(
        &mut self,
        user_id: i64,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), SamlError> {
        self.record("update");
        if self.fails(|state| state.fail_update) {
            return Err(SamlError::with_cause(ErrorKind::DbQuery, "update failed"));
        }
        let user = self
            .users
            .iter_mut()
            .find(|user| user.id == user_id)
            .ok_or_else(|| SamlError::new(ErrorKind::DbQueryResult))?;
        user.access_token = access_token.to_string();
        user.refresh_token = refresh_token.to_string();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SamlError> {
        let mut state = self.state.lock().unwrap();
        state.events.push("commit");
        if state.fail_commit {
            return Err(SamlError::with_cause(ErrorKind::DbCommit, "commit failed"));
        }
        state.users = std::mem::take(&mut self.users);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SamlError> {
        self.record("rollback");
        Ok(())
    }
}

pub fn config() -> ServiceProviderConfig {
    ServiceProviderConfig::new(
        "samlsp",
        &Url::parse("https://backend.example.com/").unwrap(),
    )
    .unwrap()
}

/// `samael` provider trusting the IdP of `IDP_METADATA_XML`.
pub fn samael_provider() -> SamaelProvider {
    let metadata = parse_metadata(IDP_METADATA_XML.as_bytes()).unwrap();
    SamaelProvider::new(config(), metadata).unwrap()
}

/// Orchestrator wired to the fakes, with the repository handle kept for assertions.
pub fn orchestrator(
    provider: impl SamlProvider + 'static,
    users: MemoryUserRepository,
) -> (SamlOrchestrator, MemoryUserRepository) {
    let orchestrator = SamlOrchestrator::new(
        config(),
        Arc::new(provider),
        Arc::new(users.clone()),
        SessionStore::new(SessionSecrets::generate()),
    );
    (orchestrator, users)
}
