/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! PAKE-V1 primitives (spec §4.6): SPEKE key agreement over Curve25519 with
//! Elligator-2 point hiding, HKDF/HMAC-SHA256 derivation, AES-128-GCM, and
//! ED25519 signing with a mandatory SHA-256 pre-hash.

pub mod aead;
pub mod field25519;
pub mod signature;
pub mod speke;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AuthError, Result};

type HmacSha256 = Hmac<Sha256>;

/// HKDF-Extract-then-Expand, SHA-256, per spec §4.6's key schedule. `info` is
/// the domain-separation label baked into every derivation site so distinct
/// purposes (session key vs. key-confirmation vs. exchange-message key)
/// never share output even when `salt`/`ikm` happen to coincide.
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out)?;
    Ok(out)
}

/// HMAC-SHA256(key, msg), used for the key-confirmation fields of spec §4.6
/// step 7/8.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison of two key-confirmation tags. A non-matching tag
/// is a protocol violation, not a crypto-internal error, since it's the
/// verdict the session FSM needs to act on (spec §4.6 step 9's "else fail").
pub fn verify_hmac(key: &[u8], msg: &[u8], tag: &[u8]) -> Result<()> {
    let expected = hmac_sha256(key, msg);
    if secure_eq(&expected, tag) {
        Ok(())
    } else {
        Err(AuthError::protocol_violation("key confirmation tag mismatch"))
    }
}

/// Constant-time byte-slice comparison. Unequal lengths are rejected outright
/// (that's public information anyway — every tag this crate compares has a
/// fixed length).
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Lowercase hex encoding, used for the binary fields of the PAKE JSON
/// messages (spec §4.6) since `serde_json` has no native byte-string type.
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(AuthError::protocol_violation("odd-length hex string"));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        let byte = u8::from_str_radix(&s[i..i + 2], 16)
            .map_err(|_| AuthError::protocol_violation("invalid hex digit"))?;
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_label_separated() {
        let ikm = b"shared secret material";
        let a = hkdf_sha256(b"salt", ikm, b"session-key", 32).unwrap();
        let b = hkdf_sha256(b"salt", ikm, b"session-key", 32).unwrap();
        let c = hkdf_sha256(b"salt", ikm, b"kcf-key", 32).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hmac_round_trips() {
        let key = b"confirmation key";
        let tag = hmac_sha256(key, b"transcript");
        assert!(verify_hmac(key, b"transcript", &tag).is_ok());
        assert!(verify_hmac(key, b"different transcript", &tag).is_err());
    }

    #[test]
    fn secure_eq_rejects_mismatched_length() {
        assert!(!secure_eq(&[1, 2, 3], &[1, 2]));
    }

    #[test]
    fn hex_round_trips() {
        let bytes = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let hex = hex_encode(&bytes);
        assert_eq!(hex, "deadbeef");
        assert_eq!(hex_decode(&hex).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }
}
