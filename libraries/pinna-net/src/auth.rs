//! Authentication challenge hooks.
//!
//! When a server answers `401 Unauthorized` with a `WWW-Authenticate` header,
//! the request promise describes the challenge and asks its
//! [`AuthenticationHandler`] what to do about it.

use crate::request::{HttpResponse, RequestDescriptor};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pinna_core::Error;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};

/// Default number of credentials tried for one request
pub const DEFAULT_MAX_AUTHENTICATION_ATTEMPTS: u32 = 3;

/// The protected area a challenge applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSpace {
    pub host: String,
    pub port: Option<u16>,
    /// Authentication scheme, lower-cased (`basic`, `bearer`, ...)
    pub scheme: String,
    pub realm: Option<String>,
}

impl ProtectionSpace {
    /// Build the protection space from a `401` response.
    ///
    /// Returns `None` when the response carries no usable `WWW-Authenticate`.
    pub fn from_response(response: &HttpResponse) -> Option<Self> {
        let header = response.header(WWW_AUTHENTICATE.as_str())?;
        let (scheme, params) = match header.trim().split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (header.trim(), ""),
        };
        if scheme.is_empty() {
            return None;
        }

        Some(Self {
            host: response.url.host_str().unwrap_or_default().to_string(),
            port: response.url.port_or_known_default(),
            scheme: scheme.to_ascii_lowercase(),
            realm: parse_realm(params),
        })
    }
}

fn parse_realm(params: &str) -> Option<String> {
    params.split(',').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("realm")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// A challenge raised while performing a request.
#[derive(Debug, Clone)]
pub struct AuthenticationChallenge {
    pub protection_space: ProtectionSpace,
    /// How many credentials already failed for this request
    pub previous_failure_count: u32,
    pub failure_response: HttpResponse,
}

/// Credentials answering a challenge.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { user: String, password: String },
    Bearer(String),
}

impl Credential {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    /// Write the `Authorization` header for this credential.
    pub fn apply(&self, headers: &mut HeaderMap) -> pinna_core::Result<()> {
        let value = match self {
            Self::Basic { user, password } => {
                format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
            }
            Self::Bearer(token) => format!("Bearer {}", token),
        };
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| Error::other("credential cannot be sent as a header"))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}

/// What to do about a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeResponse {
    /// Retry the request with this credential
    UseCredential(Credential),
    /// Give up on the challenge and deliver the `401` response as is
    PerformDefaultHandling,
    /// Cancel the request
    Cancel,
}

/// Answers authentication challenges for request promises.
pub trait AuthenticationHandler: Send + Sync {
    /// Whether the handler wants to deal with challenges for `space`.
    fn can_authenticate(&self, request: &RequestDescriptor, space: &ProtectionSpace) -> bool;

    fn handle_challenge(
        &self,
        request: &RequestDescriptor,
        challenge: &AuthenticationChallenge,
    ) -> ChallengeResponse;
}

/// Handler answering every challenge of one host with a fixed credential.
///
/// Gives up after the first rejected credential.
#[derive(Debug, Clone)]
pub struct StaticCredentialHandler {
    host: String,
    credential: Credential,
}

impl StaticCredentialHandler {
    pub fn new(host: impl Into<String>, credential: Credential) -> Self {
        Self {
            host: host.into(),
            credential,
        }
    }
}

impl AuthenticationHandler for StaticCredentialHandler {
    fn can_authenticate(&self, _request: &RequestDescriptor, space: &ProtectionSpace) -> bool {
        space.host.eq_ignore_ascii_case(&self.host)
    }

    fn handle_challenge(
        &self,
        _request: &RequestDescriptor,
        challenge: &AuthenticationChallenge,
    ) -> ChallengeResponse {
        if challenge.previous_failure_count == 0 {
            ChallengeResponse::UseCredential(self.credential.clone())
        } else {
            ChallengeResponse::PerformDefaultHandling
        }
    }
}
