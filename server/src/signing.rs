//! Signature verification boundary — delegated to whatever concrete
//! primitive a deployment wires in.
//!
//! Signed events in this protocol use schnorr-over-secp256k1 in production,
//! but no such curve library is available here, so the trait below is
//! generic over whatever primitive a deployment wires in, with a default
//! implementation built on `ed25519-dalek`. See DESIGN.md "Signature scheme
//! note".

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub trait SignatureVerifier: Send + Sync {
    /// Verifies that `sig_hex` is a valid signature over `id_hex` under `pubkey_hex`.
    /// Returns `false` (never an error) on any malformed hex input — admission
    /// treats that identically to a failed verification.
    fn verify(&self, id_hex: &str, pubkey_hex: &str, sig_hex: &str) -> bool;
}

#[derive(Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, id_hex: &str, pubkey_hex: &str, sig_hex: &str) -> bool {
        let Ok(id_bytes) = hex::decode(id_hex) else { return false };
        let Ok(pubkey_bytes) = hex::decode(pubkey_hex) else { return false };
        let Ok(sig_bytes) = hex::decode(sig_hex) else { return false };

        let Ok(pubkey_array): Result<[u8; 32], _> = pubkey_bytes.try_into() else { return false };
        let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };

        let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey_array) else { return false };
        let signature = Signature::from_bytes(&sig_array);

        verifying_key.verify(&id_bytes, &signature).is_ok()
    }
}

/// Always-accept verifier, useful for local development/tests where events
/// are synthesized without real keypairs.
#[derive(Default)]
pub struct AlwaysValidVerifier;

impl SignatureVerifier for AlwaysValidVerifier {
    fn verify(&self, _id_hex: &str, _pubkey_hex: &str, _sig_hex: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn ed25519_round_trip_verifies() {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let id_bytes = [7u8; 32];
        let signature = signing_key.sign(&id_bytes);

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(
            &hex::encode(id_bytes),
            &hex::encode(signing_key.verifying_key().to_bytes()),
            &hex::encode(signature.to_bytes()),
        ));
    }

    #[test]
    fn malformed_hex_fails_closed() {
        let verifier = Ed25519Verifier;
        assert!(!verifier.verify("not-hex", "also-not-hex", "nope"));
    }
}
