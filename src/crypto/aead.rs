/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! AES-128-GCM framing used both for the PAKE exchange-request/response
//! envelopes (spec §4.6 step 10) and for at-rest session-key encryption
//! (spec §4.4).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand_core::{OsRng, RngCore};

use crate::error::Result;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under `key`, generating a fresh random nonce and
/// prepending it to the ciphertext: `nonce || ciphertext || tag`. `aad` is
/// authenticated but not encrypted.
pub fn seal(key: &[u8; 16], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, Payload { msg: plaintext, aad })?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]: splits the leading nonce off `sealed` and decrypts
/// the remainder, verifying `aad`.
pub fn open(key: &[u8; 16], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(crate::error::AuthError::crypto("sealed payload shorter than nonce + tag"));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, Payload { msg: ciphertext, aad })?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [7u8; 16];
        let sealed = seal(&key, b"aad", b"hello session").unwrap();
        let opened = open(&key, b"aad", &sealed).unwrap();
        assert_eq!(opened, b"hello session");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [7u8; 16];
        let sealed = seal(&key, b"aad-one", b"payload").unwrap();
        assert!(open(&key, b"aad-two", &sealed).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&[1u8; 16], b"", b"payload").unwrap();
        assert!(open(&[2u8; 16], b"", &sealed).is_err());
    }

    #[test]
    fn truncated_sealed_payload_is_rejected() {
        let key = [9u8; 16];
        let sealed = seal(&key, b"", b"x").unwrap();
        assert!(open(&key, b"", &sealed[..NONCE_LEN]).is_err());
    }
}
