//! Bearer-token verification.
//!
//! Browser widgets authenticate with a short-lived JWT minted by the
//! surrounding platform. SSE clients cannot set headers from
//! `EventSource`, so the token is accepted from either the
//! `Authorization: Bearer` header or the `token` query parameter.

use crate::error::BrokerError;
use http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The authenticated identity behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id (`sub` claim).
    pub user_id: String,
    /// Site the widget belongs to.
    pub site_id: String,
    /// Owning organization.
    pub org_id: String,
    /// Role, informational for now.
    pub role: String,
}

/// JWT claims the broker understands.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    /// Site id.
    #[serde(rename = "siteId")]
    pub site_id: String,
    /// Organization id.
    #[serde(rename = "orgId")]
    pub org_id: String,
    /// Role; defaults to `viewer`.
    #[serde(default = "default_role")]
    pub role: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

fn default_role() -> String {
    "viewer".to_string()
}

/// Verifier configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 shared secret.
    pub secret: String,
    /// Expected issuer; unchecked when `None`.
    pub issuer: Option<String>,
    /// Expected audience; unchecked when `None`.
    pub audience: Option<String>,
}

/// HS256 token verifier.
pub struct AuthVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    /// Create a verifier from config.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and extract the identity.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidToken`] on any verification failure;
    /// the reason is safe to surface (no secrets).
    pub fn verify(&self, token: &str) -> Result<Identity, BrokerError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| BrokerError::InvalidToken(e.to_string()))?;
        Ok(Identity {
            user_id: data.claims.sub,
            site_id: data.claims.site_id,
            org_id: data.claims.org_id,
            role: data.claims.role,
        })
    }
}

/// Pull the bearer token from the Authorization header or `token` query
/// parameter (the SSE fallback).
///
/// # Errors
///
/// Returns [`BrokerError::MissingToken`] when neither is present.
pub fn extract_token(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<String, BrokerError> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Ok(token.to_string());
            }
        }
    }
    query
        .get("token")
        .cloned()
        .ok_or(BrokerError::MissingToken)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-jwt-secret";

    fn config() -> AuthConfig {
        AuthConfig {
            secret: SECRET.to_string(),
            issuer: Some("proofpulse".to_string()),
            audience: None,
        }
    }

    pub(crate) fn token_for(sub: &str, site: &str, org: &str, secret: &str) -> String {
        #[derive(Serialize)]
        struct FullClaims<'a> {
            sub: &'a str,
            #[serde(rename = "siteId")]
            site_id: &'a str,
            #[serde(rename = "orgId")]
            org_id: &'a str,
            role: &'a str,
            exp: i64,
            iss: &'a str,
        }
        encode(
            &Header::default(),
            &FullClaims {
                sub,
                site_id: site,
                org_id: org,
                role: "viewer",
                exp: Utc::now().timestamp() + 600,
                iss: "proofpulse",
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_identity() {
        let verifier = AuthVerifier::new(&config());
        let token = token_for("u-1", "site-1", "org-1", SECRET);

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.site_id, "site-1");
        assert_eq!(identity.org_id, "org-1");
        assert_eq!(identity.role, "viewer");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let verifier = AuthVerifier::new(&config());
        let token = token_for("u-1", "site-1", "org-1", "other-secret");
        assert!(matches!(
            verifier.verify(&token),
            Err(BrokerError::InvalidToken(_))
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let verifier = AuthVerifier::new(&config());
        assert!(verifier.verify("not-a-jwt").is_err());
    }

    #[test]
    fn token_extraction_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer header-token".parse().unwrap(),
        );
        let mut query = HashMap::new();
        query.insert("token".to_string(), "query-token".to_string());

        assert_eq!(extract_token(&headers, &query).unwrap(), "header-token");
    }

    #[test]
    fn token_extraction_falls_back_to_query() {
        let mut query = HashMap::new();
        query.insert("token".to_string(), "query-token".to_string());
        assert_eq!(
            extract_token(&HeaderMap::new(), &query).unwrap(),
            "query-token"
        );
    }

    #[test]
    fn missing_token_is_explicit() {
        assert!(matches!(
            extract_token(&HeaderMap::new(), &HashMap::new()),
            Err(BrokerError::MissingToken)
        ));
    }
}
