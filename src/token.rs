//! Validates bearer tokens presented by clients before an inference stream
//! is produced. Runs in one of two modes: a configured mode that verifies an
//! RS256 signature against the coordinator's public key, and a permissive
//! fallback used before the first successful key fetch.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

const ISSUER: &str = "titancompute-coordinator";
const REQUIRED_CLAIMS: &[&str] = &[
    "agent_id", "client_id", "model", "jti", "iat", "exp", "nbf", "iss",
];

/// Claims extracted from a successfully verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub agent_id: String,
    pub client_id: String,
    pub model: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub iss: String,
}

pub struct TokenValidator {
    decoding_key: Option<DecodingKey>,
}

impl TokenValidator {
    /// Starts in fallback mode; call `set_public_key` once the coordinator's
    /// key has been fetched.
    pub fn new() -> Self {
        Self { decoding_key: None }
    }

    pub fn is_configured(&self) -> bool {
        self.decoding_key.is_some()
    }

    /// Configures RS256 verification with the coordinator's PEM-encoded
    /// public key.
    pub fn set_public_key(&mut self, public_key_pem: &str) -> anyhow::Result<()> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())?;
        self.decoding_key = Some(key);
        Ok(())
    }

    /// Validates a token. In configured mode this verifies the RS256
    /// signature and the full claim set; in fallback mode it accepts any
    /// token longer than 10 characters. Never raises — returns `None` on any
    /// failure, without revealing which check failed.
    pub fn validate(&self, token: &str, expected_agent_id: &str) -> Option<TokenClaims> {
        match &self.decoding_key {
            Some(key) => self.validate_configured(token, expected_agent_id, key),
            None => {
                if token.len() > 10 {
                    tracing::debug!("token validated using fallback method (JWT not configured)");
                    Some(fallback_claims(token, expected_agent_id))
                } else {
                    tracing::warn!("fallback token validation failed: too short");
                    None
                }
            }
        }
    }

    fn validate_configured(
        &self,
        token: &str,
        expected_agent_id: &str,
        key: &DecodingKey,
    ) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(REQUIRED_CLAIMS);
        validation.validate_nbf = true;

        let data = decode::<TokenClaims>(token, key, &validation).ok()?;
        let claims = data.claims;

        if claims.agent_id != expected_agent_id {
            tracing::warn!(
                expected = expected_agent_id,
                got = %claims.agent_id,
                "token agent_id mismatch"
            );
            return None;
        }

        // jsonwebtoken has no validate_iat concept; enforce it by hand.
        if claims.iat > chrono::Utc::now().timestamp() {
            tracing::warn!(iat = claims.iat, "token issued in the future");
            return None;
        }

        tracing::debug!(client_id = %claims.client_id, "token validated");
        Some(claims)
    }

    /// Diagnostic-only: checks expiry without verifying the signature. Must
    /// never be used for authorization decisions.
    pub fn is_expired(&self, token: &str) -> bool {
        match Self::extract_claims_unsafe(token) {
            Some(claims) => {
                let now = chrono::Utc::now().timestamp();
                now > claims.exp
            }
            None => true,
        }
    }

    /// Diagnostic-only: decodes claims without verifying the signature. Must
    /// never be used for authorization decisions.
    pub fn extract_claims_unsafe(token: &str) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        let dummy_key = DecodingKey::from_secret(&[]);
        decode::<TokenClaims>(token, &dummy_key, &validation)
            .ok()
            .map(|d| d.claims)
    }
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn fallback_claims(token: &str, expected_agent_id: &str) -> TokenClaims {
    let now = chrono::Utc::now().timestamp();
    TokenClaims {
        agent_id: expected_agent_id.to_string(),
        client_id: "fallback".to_string(),
        model: String::new(),
        jti: token.to_string(),
        iat: now,
        exp: now,
        nbf: now,
        iss: ISSUER.to_string(),
    }
}
