//! Auto-submitting HTML forms for the HTTP-POST binding.

use crate::saml::provider::{MessageParameter, OutboundMessage};
use axum::{
    http::{
        header::{CONTENT_SECURITY_POLICY, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use base64ct::{Base64, Encoding};

const REQUEST_SCRIPT: &str = "document.getElementById('SAMLSubmitButton').style.visibility=\"hidden\";document.getElementById('SAMLRequestForm').submit();";
const RESPONSE_SCRIPT: &str = "document.getElementById('SAMLSubmitButton').style.visibility=\"hidden\";document.getElementById('SAMLResponseForm').submit();";

/// CSP allowing only the inline script of the request form.
pub const REQUEST_FORM_CSP: &str = "default-src; script-src 'sha256-AjPdJSbZmeWHnEc5ykvJFay8FTWeTeRbs9dutfZ0HqE='; reflected-xss block; referrer no-referrer;";
/// CSP allowing only the inline script of the response form.
pub const RESPONSE_FORM_CSP: &str = "default-src; script-src 'sha256-ae3F9sw3MnGNUqmT+7gdyojm/I6ukOUOr9mHRkJJvCU='; reflected-xss block; referrer no-referrer;";

impl MessageParameter {
    const fn form_id(self) -> &'static str {
        match self {
            Self::SamlRequest => "SAMLRequestForm",
            Self::SamlResponse => "SAMLResponseForm",
        }
    }

    const fn script(self) -> &'static str {
        match self {
            Self::SamlRequest => REQUEST_SCRIPT,
            Self::SamlResponse => RESPONSE_SCRIPT,
        }
    }

    #[must_use]
    pub const fn csp(self) -> &'static str {
        match self {
            Self::SamlRequest => REQUEST_FORM_CSP,
            Self::SamlResponse => RESPONSE_FORM_CSP,
        }
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the form that posts `message` to its destination as soon as it loads.
#[must_use]
pub fn post_form(message: &OutboundMessage, relay_state: &str) -> String {
    let parameter = message.parameter;
    let encoded = Base64::encode_string(message.xml.as_bytes());
    format!(
        "<form method=\"post\" action=\"{action}\" id=\"{form_id}\">\
         <input type=\"hidden\" name=\"RelayState\" value=\"{relay_state}\" />\
         <input type=\"hidden\" name=\"{name}\" value=\"{encoded}\" />\
         <input id=\"SAMLSubmitButton\" type=\"submit\" value=\"Submit\" />\
         </form><script>{script}</script>",
        action = escape_attr(&message.destination),
        form_id = parameter.form_id(),
        relay_state = escape_attr(relay_state),
        name = parameter.as_str(),
        script = parameter.script(),
    )
}

/// Full HTML page carrying the auto-submit form, with its CSP and content type.
///
/// # Errors
/// Returns the header error if the CSP cannot be encoded.
pub fn post_form_response(
    message: &OutboundMessage,
    mut headers: HeaderMap,
) -> Result<Response, axum::http::header::InvalidHeaderValue> {
    const EMPTY_RELAY_STATE: &str = "";

    headers.insert(
        CONTENT_SECURITY_POLICY,
        HeaderValue::from_str(message.parameter.csp())?,
    );
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );

    let body = format!(
        "<!DOCTYPE html><html><body>{}</body></html>",
        post_form(message, EMPTY_RELAY_STATE)
    );

    Ok((StatusCode::OK, headers, body).into_response())
}
