//! Boundary to the SAML protocol library.
//!
//! The orchestrator only sees the `SamlProvider` trait and the small message types below,
//! `SamaelProvider` implements it with `samael`.

use crate::saml::error::{BoxError, ErrorKind, SamlError};
use chrono::Utc;
use samael::{
    crypto,
    metadata::{EntityDescriptor, KeyDescriptor},
    schema::{Issuer, NameID, Status, StatusCode},
    service_provider::{ServiceProvider, ServiceProviderBuilder},
    traits::ToXml,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

/// This service provider's identity and endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub acs_url: Url,
    pub slo_url: Url,
    pub metadata_url: Url,
}

impl ServiceProviderConfig {
    /// Derive the endpoint URLs from the public base URL of the backend.
    ///
    /// # Errors
    /// Returns `Config` if the entity id is empty or the base URL cannot carry a path.
    pub fn new(entity_id: &str, backend_url: &Url) -> Result<Self, SamlError> {
        if entity_id.trim().is_empty() {
            return Err(SamlError::with_cause(ErrorKind::Config, "empty entity id"));
        }
        if backend_url.cannot_be_a_base() {
            return Err(SamlError::with_cause(
                ErrorKind::Config,
                format!("backend URL cannot be a base: {backend_url}"),
            ));
        }

        let endpoint = |path: &str| -> Result<Url, SamlError> {
            let base = backend_url.as_str().trim_end_matches('/');
            Url::parse(&format!("{base}{path}"))
                .map_err(|e| SamlError::with_cause(ErrorKind::Config, e))
        };

        Ok(Self {
            entity_id: entity_id.to_string(),
            acs_url: endpoint("/saml/acs")?,
            slo_url: endpoint("/saml/slo")?,
            metadata_url: endpoint("/saml/metadata")?,
        })
    }

    /// SP metadata advertising the HTTP-POST ACS and SLO endpoints.
    #[must_use]
    pub fn metadata_xml(&self) -> String {
        let mut xml = String::new();
        let _ = write!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <md:EntityDescriptor xmlns:md=\"urn:oasis:names:tc:SAML:2.0:metadata\" entityID=\"{entity_id}\">\
             <md:SPSSODescriptor AuthnRequestsSigned=\"false\" WantAssertionsSigned=\"true\" \
             protocolSupportEnumeration=\"urn:oasis:names:tc:SAML:2.0:protocol\">\
             <md:SingleLogoutService Binding=\"{HTTP_POST_BINDING}\" Location=\"{slo}\"/>\
             <md:NameIDFormat>{NAME_ID_FORMAT_UNSPECIFIED}</md:NameIDFormat>\
             <md:AssertionConsumerService Binding=\"{HTTP_POST_BINDING}\" Location=\"{acs}\" index=\"1\"/>\
             </md:SPSSODescriptor></md:EntityDescriptor>",
            entity_id = xml_escape(&self.entity_id),
            slo = xml_escape(self.slo_url.as_str()),
            acs = xml_escape(self.acs_url.as_str()),
        );
        xml
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Form field carrying the encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageParameter {
    SamlRequest,
    SamlResponse,
}

impl MessageParameter {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SamlRequest => "SAMLRequest",
            Self::SamlResponse => "SAMLResponse",
        }
    }
}

/// Serialized protocol message ready for the HTTP-POST binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: String,
    pub destination: String,
    pub parameter: MessageParameter,
    pub xml: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub name_id: Option<NameId>,
}

/// Validated assertion, reduced to what the flows consume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub subject: Option<Subject>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub id: Option<String>,
    pub issuer: Option<String>,
    pub name_id: Option<NameId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponse {
    pub id: Option<String>,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub destination: Option<String>,
    pub status: Option<String>,
}

/// SAML protocol operations used by the orchestrator.
pub trait SamlProvider: Send + Sync {
    /// IdP endpoint for `AuthnRequest` over HTTP-POST.
    fn sso_binding_location(&self) -> Option<String>;

    /// IdP endpoint for logout messages over HTTP-POST.
    fn slo_binding_location(&self) -> Option<String>;

    /// # Errors
    /// Returns an error if the request cannot be built or serialized.
    fn make_authentication_request(&self, idp_url: &str) -> Result<OutboundMessage, BoxError>;

    /// # Errors
    /// Returns an error if the request cannot be built or serialized.
    fn make_logout_request(&self, idp_url: &str, name_id: &str)
        -> Result<OutboundMessage, BoxError>;

    /// Success `LogoutResponse` answering `in_response_to`.
    ///
    /// # Errors
    /// Returns an error if the response cannot be built or serialized.
    fn make_logout_response(
        &self,
        idp_url: &str,
        in_response_to: &str,
    ) -> Result<OutboundMessage, BoxError>;

    /// Parse and validate a base64 `SAMLResponse`, accepting only `possible_request_ids`.
    ///
    /// # Errors
    /// Returns an error if the response is malformed, forged, expired or unsolicited.
    fn parse_response(
        &self,
        saml_response: &str,
        possible_request_ids: &[&str],
    ) -> Result<Assertion, BoxError>;

    /// # Errors
    /// Returns an error if `xml` is not a `LogoutRequest`.
    fn unmarshal_logout_request(&self, xml: &str) -> Result<LogoutRequest, BoxError>;

    /// # Errors
    /// Returns an error if `xml` is not a `LogoutResponse`.
    fn unmarshal_logout_response(&self, xml: &str) -> Result<LogoutResponse, BoxError>;

    /// Check `response`, unmarshalled from `xml`, is a success the IdP signed and addressed
    /// to this SP.
    ///
    /// # Errors
    /// Returns an error if the signature, the status, the issuer or the destination is wrong.
    fn validate_logout_response(&self, xml: &str, response: &LogoutResponse)
        -> Result<(), BoxError>;
}

pub struct SamaelProvider {
    config: ServiceProviderConfig,
    idp_entity_id: Option<String>,
    // DER
    signing_certs: Vec<Vec<u8>>,
    sp: ServiceProvider,
}

impl SamaelProvider {
    /// # Errors
    /// Returns `Config` if an IdP certificate is not base64 or `samael` rejects the service
    /// provider definition.
    pub fn new(
        config: ServiceProviderConfig,
        idp_metadata: EntityDescriptor,
    ) -> Result<Self, SamlError> {
        let idp_entity_id = idp_metadata.entity_id.clone();
        let signing_certs = signing_certificates(&idp_metadata)?;
        if signing_certs.is_empty() {
            warn!("IdP metadata has no signing certificate, SAML signatures are not checked");
        }

        let sp = ServiceProviderBuilder::default()
            .entity_id(config.entity_id.clone())
            .acs_url(config.acs_url.to_string())
            .slo_url(config.slo_url.to_string())
            .metadata_url(config.metadata_url.to_string())
            .idp_metadata(idp_metadata)
            .authn_name_id_format(NAME_ID_FORMAT_UNSPECIFIED.to_string())
            .build()
            .map_err(|e| SamlError::with_cause(ErrorKind::Config, e.to_string()))?;

        Ok(Self {
            config,
            idp_entity_id,
            signing_certs,
            sp,
        })
    }

    fn issuer(&self) -> Issuer {
        Issuer {
            value: Some(self.config.entity_id.clone()),
            ..Issuer::default()
        }
    }

    /// Accept `xml` only when its single signature covers the root element and verifies
    /// against one of the IdP signing certificates.
    fn verify_signature(&self, xml: &str) -> Result<(), BoxError> {
        if self.signing_certs.is_empty() {
            return Ok(());
        }

        let message: samael::schema::LogoutResponse =
            xml.parse().map_err(|e| format!("{e:?}"))?;
        let root = message
            .id
            .as_deref()
            .map(|id| format!("#{id}"))
            .ok_or("LogoutResponse has no ID")?;
        let covers_root = message.signature.as_ref().is_some_and(|signature| {
            signature
                .signed_info
                .reference
                .iter()
                .any(|reference| reference.uri.as_deref() == Some(root.as_str()))
        });
        if !covers_root {
            return Err("LogoutResponse is not signed".into());
        }
        // xmlsec checks the first signature in document order, it has to be the root one.
        if xml.matches("SignatureValue").count() > 2 {
            return Err("LogoutResponse carries more than one signature".into());
        }

        let mut rejected = Vec::new();
        for cert in &self.signing_certs {
            match crypto::verify_signed_xml(xml, cert, Some("ID")) {
                Ok(()) => return Ok(()),
                Err(e) => rejected.push(e.to_string()),
            }
        }
        Err(format!("LogoutResponse signature rejected: {}", rejected.join(", ")).into())
    }
}

/// DER certificates of the `signing` keys, or of the keys without a use when none is marked.
fn signing_certificates(metadata: &EntityDescriptor) -> Result<Vec<Vec<u8>>, SamlError> {
    let keys: Vec<&KeyDescriptor> = metadata
        .idp_sso_descriptors
        .iter()
        .flatten()
        .flat_map(|descriptor| descriptor.key_descriptors.iter())
        .collect();

    let signing: Vec<&KeyDescriptor> = keys.iter().copied().filter(|key| key.is_signing()).collect();
    let selected = if signing.is_empty() {
        keys.into_iter()
            .filter(|key| key.key_use.as_deref().map_or(true, str::is_empty))
            .collect()
    } else {
        signing
    };

    selected
        .iter()
        .filter_map(|key| key.key_info.x509_data.as_ref())
        .flat_map(|data| data.certificates.iter())
        .map(|cert| {
            crypto::decode_x509_cert(cert).map_err(|e| {
                SamlError::with_cause(ErrorKind::Config, format!("invalid IdP certificate: {e}"))
            })
        })
        .collect()
}

fn message_id() -> String {
    format!("id-{}", Uuid::new_v4().simple())
}

impl SamlProvider for SamaelProvider {
    fn sso_binding_location(&self) -> Option<String> {
        self.sp.sso_binding_location(HTTP_POST_BINDING)
    }

    fn slo_binding_location(&self) -> Option<String> {
        self.sp.slo_binding_location(HTTP_POST_BINDING)
    }

    fn make_authentication_request(&self, idp_url: &str) -> Result<OutboundMessage, BoxError> {
        let request = self
            .sp
            .make_authentication_request(idp_url)
            .map_err(|e| e.to_string())?;
        let xml = ToXml::to_string(&request).map_err(|e| format!("{e:?}"))?;

        debug!("Created AuthnRequest {} for {idp_url}", request.id);

        Ok(OutboundMessage {
            id: request.id.clone(),
            destination: idp_url.to_string(),
            parameter: MessageParameter::SamlRequest,
            xml,
        })
    }

    fn make_logout_request(
        &self,
        idp_url: &str,
        name_id: &str,
    ) -> Result<OutboundMessage, BoxError> {
        let id = message_id();
        let request = samael::schema::LogoutRequest {
            id: Some(id.clone()),
            version: Some("2.0".to_string()),
            issue_instant: Some(Utc::now()),
            destination: Some(idp_url.to_string()),
            issuer: Some(self.issuer()),
            name_id: Some(NameID {
                value: name_id.to_string(),
                format: Some(NAME_ID_FORMAT_UNSPECIFIED.to_string()),
            }),
            session_index: None,
            signature: None,
        };
        let xml = ToXml::to_string(&request).map_err(|e| format!("{e:?}"))?;

        Ok(OutboundMessage {
            id,
            destination: idp_url.to_string(),
            parameter: MessageParameter::SamlRequest,
            xml,
        })
    }

    fn make_logout_response(
        &self,
        idp_url: &str,
        in_response_to: &str,
    ) -> Result<OutboundMessage, BoxError> {
        let id = message_id();
        let response = samael::schema::LogoutResponse {
            id: Some(id.clone()),
            in_response_to: Some(in_response_to.to_string()),
            version: Some("2.0".to_string()),
            issue_instant: Some(Utc::now()),
            destination: Some(idp_url.to_string()),
            consent: None,
            issuer: Some(self.issuer()),
            signature: None,
            status: Some(Status {
                status_code: StatusCode {
                    value: Some(STATUS_SUCCESS.to_string()),
                },
                status_message: None,
                status_detail: None,
            }),
        };
        let xml = ToXml::to_string(&response).map_err(|e| format!("{e:?}"))?;

        Ok(OutboundMessage {
            id,
            destination: idp_url.to_string(),
            parameter: MessageParameter::SamlResponse,
            xml,
        })
    }

    fn parse_response(
        &self,
        saml_response: &str,
        possible_request_ids: &[&str],
    ) -> Result<Assertion, BoxError> {
        let assertion = self
            .sp
            .parse_base64_response(saml_response, Some(possible_request_ids))
            .map_err(|e| e.to_string())?;

        Ok(Assertion {
            subject: assertion.subject.map(|subject| Subject {
                name_id: subject.name_id.map(|name_id| NameId {
                    value: name_id.value,
                }),
            }),
        })
    }

    fn unmarshal_logout_request(&self, xml: &str) -> Result<LogoutRequest, BoxError> {
        unmarshal_logout_request(xml)
    }

    fn unmarshal_logout_response(&self, xml: &str) -> Result<LogoutResponse, BoxError> {
        unmarshal_logout_response(xml)
    }

    fn validate_logout_response(
        &self,
        xml: &str,
        response: &LogoutResponse,
    ) -> Result<(), BoxError> {
        self.verify_signature(xml)?;
        validate_logout_response(
            response,
            self.idp_entity_id.as_deref(),
            self.config.slo_url.as_str(),
        )
    }
}

fn unmarshal_logout_request(xml: &str) -> Result<LogoutRequest, BoxError> {
    let request: samael::schema::LogoutRequest = xml.parse().map_err(|e| format!("{e:?}"))?;
    Ok(LogoutRequest {
        id: request.id,
        issuer: request.issuer.and_then(|issuer| issuer.value),
        name_id: request.name_id.map(|name_id| NameId {
            value: name_id.value,
        }),
    })
}

fn unmarshal_logout_response(xml: &str) -> Result<LogoutResponse, BoxError> {
    let response: samael::schema::LogoutResponse = xml.parse().map_err(|e| format!("{e:?}"))?;
    Ok(LogoutResponse {
        id: response.id,
        in_response_to: response.in_response_to,
        issuer: response.issuer.and_then(|issuer| issuer.value),
        destination: response.destination,
        status: response.status.and_then(|status| status.status_code.value),
    })
}

fn validate_logout_response(
    response: &LogoutResponse,
    idp_entity_id: Option<&str>,
    slo_url: &str,
) -> Result<(), BoxError> {
    match response.status.as_deref() {
        Some(STATUS_SUCCESS) => {}
        Some(status) => return Err(format!("logout failed at the IdP: {status}").into()),
        None => return Err("logout response has no status".into()),
    }

    if let (Some(expected), Some(issuer)) = (idp_entity_id, response.issuer.as_deref()) {
        if expected != issuer {
            return Err(format!("unexpected issuer {issuer}, expected {expected}").into());
        }
    }

    if let Some(destination) = response.destination.as_deref() {
        if destination != slo_url {
            return Err(format!("unexpected destination {destination}, expected {slo_url}").into());
        }
    }

    Ok(())
}
