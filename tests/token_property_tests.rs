//! Property-based tests for signed action tokens.
//!
//! Tokens gate approve/decline actions arriving from outside a session, so
//! the properties here are security-shaped: whatever goes in comes back out
//! unchanged under the right secret, and nothing verifies under tampering,
//! foreign secrets or malformed input.

use chrono::Duration;
use procurement_approval::error::TokenError;
use procurement_approval::token::{TokenAction, TokenSigner};
use proptest::prelude::*;

fn action_strategy() -> impl Strategy<Value = TokenAction> {
    prop::bool::ANY.prop_map(|b| {
        if b {
            TokenAction::Approve
        } else {
            TokenAction::Decline
        }
    })
}

fn pending_id_strategy() -> impl Strategy<Value = String> {
    "TRX-[0-9]{6}-P(\\([1-9]\\))?"
}

fn recipient_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-z]{1,10}@[a-z]{1,10}\\.[a-z]{2,4}")
}

proptest! {
    /// verify ∘ issue is the identity on the claims.
    #[test]
    fn roundtrip_preserves_claims(
        action in action_strategy(),
        pending_id in pending_id_strategy(),
        recipient in recipient_strategy(),
        ttl_secs in 1i64..86_400,
    ) {
        let signer = TokenSigner::new("prop-secret");
        let token = signer
            .issue(action, &pending_id, recipient.as_deref(), Duration::seconds(ttl_secs))
            .unwrap();

        let verified = signer.verify(&token).unwrap();
        prop_assert_eq!(verified.action, action);
        prop_assert_eq!(verified.pending_id, pending_id);
        prop_assert_eq!(verified.recipient, recipient);
    }

    /// Flipping any payload character breaks the signature.
    #[test]
    fn payload_tampering_is_detected(
        pending_id in pending_id_strategy(),
        position in 0usize..8,
    ) {
        let signer = TokenSigner::new("prop-secret");
        let token = signer
            .issue(TokenAction::Approve, &pending_id, None, Duration::hours(1))
            .unwrap();

        let (payload, sig) = token.split_once('.').unwrap();
        let idx = position % payload.len();
        let original = payload.as_bytes()[idx] as char;
        // Substitute a different valid hex digit so the failure is the
        // signature, not hex decoding.
        let replacement = if original == '0' { '1' } else { '0' };
        let mut tampered: Vec<u8> = payload.bytes().collect();
        tampered[idx] = replacement as u8;
        let forged = format!("{}.{}", String::from_utf8(tampered).unwrap(), sig);

        prop_assert_eq!(signer.verify(&forged), Err(TokenError::BadSignature));
    }

    /// A token never verifies under a different secret.
    #[test]
    fn foreign_secret_never_verifies(
        pending_id in pending_id_strategy(),
        secret_a in "[a-z0-9]{8,24}",
        secret_b in "[a-z0-9]{8,24}",
    ) {
        prop_assume!(secret_a != secret_b);
        let token = TokenSigner::new(&secret_a)
            .issue(TokenAction::Decline, &pending_id, None, Duration::hours(1))
            .unwrap();
        prop_assert_eq!(
            TokenSigner::new(&secret_b).verify(&token),
            Err(TokenError::BadSignature)
        );
    }

    /// Arbitrary strings are rejected, never panic.
    #[test]
    fn garbage_never_verifies(garbage in ".{0,80}") {
        let signer = TokenSigner::new("prop-secret");
        prop_assert!(signer.verify(&garbage).is_err());
    }

    /// An elapsed TTL is always reported as expiry, not some other failure.
    #[test]
    fn elapsed_ttl_reports_expired(
        pending_id in pending_id_strategy(),
        elapsed_secs in 1i64..100_000,
    ) {
        let signer = TokenSigner::new("prop-secret");
        let token = signer
            .issue(
                TokenAction::Approve,
                &pending_id,
                None,
                Duration::seconds(-elapsed_secs),
            )
            .unwrap();
        prop_assert_eq!(signer.verify(&token), Err(TokenError::Expired));
    }
}
