//! Expiring HMAC-signed capability tokens for out-of-band approve/decline.
//!
//! Wire form is `hex(claims).hex(signature)` where claims are CBOR and the
//! signature is HMAC-SHA256 over the claim bytes under a server-held secret.
//! Tokens are stateless and deliberately not single-use: replay inside the
//! TTL re-enters the ordinary approve/decline path, which already rejects
//! settled requests.
use crate::error::TokenError;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    #[n(0)]
    Approve,
    #[n(1)]
    Decline,
}

/// Wire claims. Everything is optional so an incomplete token surfaces as
/// `MissingFields` rather than a decode failure.
#[derive(minicbor::Encode, minicbor::Decode, Debug)]
struct Claims {
    #[n(0)]
    action: Option<TokenAction>,
    #[n(1)]
    pending_id: Option<String>,
    #[n(2)]
    recipient: Option<String>,
    #[n(3)]
    expires_at: Option<i64>,
}

/// A verified token. `recipient` present means the token is personalized;
/// absent means any authorized role-holder may consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionToken {
    pub action: TokenAction,
    pub pending_id: String,
    pub recipient: Option<String>,
    pub expires_at: i64,
}

impl ActionToken {
    /// Whether a personalized token was issued to this identity. Group
    /// tokens match anyone.
    pub fn permits(&self, identity: &str) -> bool {
        match &self.recipient {
            Some(bound) => bound.eq_ignore_ascii_case(identity.trim()),
            None => true,
        }
    }
}

pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Fresh server secret: two uuid7 values joined with a colon.
    pub fn generate_secret() -> String {
        format!("{}:{}", uuid7::uuid7(), uuid7::uuid7())
    }

    pub fn default_ttl() -> Duration {
        Duration::days(3)
    }

    pub fn issue(
        &self,
        action: TokenAction,
        pending_id: &str,
        recipient: Option<&str>,
        ttl: Duration,
    ) -> anyhow::Result<String> {
        let claims = Claims {
            action: Some(action),
            pending_id: Some(pending_id.to_string()),
            recipient: recipient.map(|r| r.trim().to_lowercase()),
            expires_at: Some((Utc::now() + ttl).timestamp()),
        };
        let payload = minicbor::to_vec(&claims)?;
        let signature = self.sign(&payload);
        Ok(format!("{}.{}", hex::encode(payload), hex::encode(signature)))
    }

    /// Verify structure, signature, required fields and expiry, each with
    /// its own failure.
    pub fn verify(&self, token: &str) -> Result<ActionToken, TokenError> {
        let (payload_hex, signature_hex) =
            token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = hex::decode(payload_hex).map_err(|_| TokenError::Malformed)?;
        let signature = hex::decode(signature_hex).map_err(|_| TokenError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = minicbor::decode(&payload).map_err(|_| TokenError::Malformed)?;
        let (Some(action), Some(pending_id), Some(expires_at)) =
            (claims.action, claims.pending_id, claims.expires_at)
        else {
            return Err(TokenError::MissingFields);
        };
        if pending_id.is_empty() {
            return Err(TokenError::MissingFields);
        }
        if Utc::now().timestamp() > expires_at {
            return Err(TokenError::Expired);
        }

        Ok(ActionToken {
            action,
            pending_id,
            recipient: claims.recipient,
            expires_at,
        })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
