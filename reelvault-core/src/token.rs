use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::AssetId;
use crate::config::TokensSection;
use crate::error::ErrorKind;

pub const TOKEN_QUERY_PARAM: &str = "token";

/// Client-visible messages stay short; the cause is only logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("no token provided")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token not valid for this asset")]
    AssetMismatch,
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unauthorized
    }
}

pub type TokenResult<T> = Result<T, TokenError>;

/// Claims carried by a playback token. Issued elsewhere; only verified here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub asset_id: String,
    pub subject_id: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Request attributes compared against the optional token binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMismatch {
    Ip,
    UserAgent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub claims: AccessClaims,
    /// Soft-binding mismatches that were logged but not enforced.
    pub mismatches: Vec<BindingMismatch>,
}

#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("issuer", &self.validation.iss)
            .field("audience", &self.validation.aud)
            .field("leeway", &self.validation.leeway)
            .finish()
    }
}

impl TokenValidator {
    pub fn new(section: &TokensSection) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = section.leeway_seconds;
        validation.set_issuer(&[section.issuer.as_str()]);
        validation.set_audience(&[section.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(section.secret.as_bytes())),
            validation,
        }
    }

    /// Checks signature, issuer, audience and expiry, then the asset scope.
    /// IP and user-agent bindings are advisory: a mismatch is logged and
    /// reported in the result, never rejected.
    pub fn verify(
        &self,
        token: &str,
        expected_asset: Option<&AssetId>,
        request: &RequestMeta,
    ) -> TokenResult<VerifiedToken> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation).map_err(
            |err| {
                let mapped = match err.kind() {
                    JwtErrorKind::ExpiredSignature => TokenError::Expired,
                    _ => TokenError::Invalid,
                };
                debug!(error = %err, "token rejected");
                mapped
            },
        )?;
        let claims = data.claims;

        if let Some(expected) = expected_asset {
            if claims.asset_id != expected.as_str() {
                warn!(
                    asset_id = %expected,
                    token_asset_id = %claims.asset_id,
                    subject_id = %claims.subject_id,
                    "token scoped to a different asset"
                );
                return Err(TokenError::AssetMismatch);
            }
        }

        let mismatches = binding_mismatches(&claims, request);
        Ok(VerifiedToken { claims, mismatches })
    }
}

fn binding_mismatches(claims: &AccessClaims, request: &RequestMeta) -> Vec<BindingMismatch> {
    let mut mismatches = Vec::new();
    if let Some(claimed) = claims.ip.as_deref() {
        let same = match (claimed.parse::<IpAddr>(), request.ip) {
            (Ok(claimed_ip), Some(actual)) => claimed_ip == actual,
            _ => false,
        };
        if !same {
            warn!(
                asset_id = %claims.asset_id,
                subject_id = %claims.subject_id,
                claimed_ip = %claimed,
                request_ip = ?request.ip,
                "token ip mismatch; allowing request"
            );
            mismatches.push(BindingMismatch::Ip);
        }
    }
    if let Some(claimed) = claims.user_agent.as_deref() {
        if request.user_agent.as_deref() != Some(claimed) {
            warn!(
                asset_id = %claims.asset_id,
                subject_id = %claims.subject_id,
                "token user-agent mismatch; allowing request"
            );
            mismatches.push(BindingMismatch::UserAgent);
        }
    }
    mismatches
}

/// Pulls the token from the query string first (players often cannot set
/// headers), then from `Authorization: Bearer`.
pub fn extract_token(query: Option<&str>, authorization: Option<&str>) -> TokenResult<String> {
    if let Some(query) = query {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
        if let Some((_, value)) = pairs
            .into_iter()
            .find(|(name, value)| name == TOKEN_QUERY_PARAM && !value.is_empty())
        {
            return Ok(value);
        }
    }
    if let Some(header) = authorization {
        let mut parts = header.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let value = parts.next().map(str::trim).unwrap_or_default();
        if scheme.eq_ignore_ascii_case("bearer") && !value.is_empty() {
            return Ok(value.to_string());
        }
    }
    Err(TokenError::Missing)
}
