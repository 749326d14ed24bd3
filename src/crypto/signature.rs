/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Long-term device identity signatures (spec §4.6 step 10, §8).
//!
//! Every message this crate signs is first hashed with SHA-256 and the
//! *digest* is signed, never the raw message. This is a deliberate interop
//! requirement, not a defensive habit: the peer verifying the signature does
//! the same pre-hash before calling into ED25519, and skipping it on either
//! side produces signatures that look valid in isolation but never verify
//! against the other implementation. Getting this backwards is the single
//! easiest way to silently break cross-device auth, which is why it gets its
//! own module instead of being inlined at the two call sites.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

fn prehash(msg: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(msg);
    hasher.finalize().into()
}

pub fn sign(signing_key: &SigningKey, msg: &[u8]) -> [u8; 64] {
    let digest = prehash(msg);
    signing_key.sign(&digest).to_bytes()
}

pub fn verify(verifying_key: &VerifyingKey, msg: &[u8], signature_bytes: &[u8; 64]) -> Result<()> {
    let digest = prehash(msg);
    let signature = Signature::from_bytes(signature_bytes);
    verifying_key
        .verify(&digest, &signature)
        .map_err(|_| AuthError::protocol_violation("device identity signature did not verify"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn sign_then_verify_round_trips() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let sig = sign(&signing_key, b"device-id-exchange payload");
        assert!(verify(&verifying_key, b"device-id-exchange payload", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let sig = sign(&signing_key, b"original");
        assert!(verify(&verifying_key, b"tampered", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let other_key = SigningKey::generate(&mut OsRng);
        let sig = sign(&signing_key, b"payload");
        assert!(verify(&other_key.verifying_key(), b"payload", &sig).is_err());
    }
}
