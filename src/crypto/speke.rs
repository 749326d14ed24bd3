/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! SPEKE key agreement (spec §4.6 steps 2, 4): the shared PIN is hashed,
//! together with a fresh per-handshake salt, into a custom Curve25519 base
//! point via Elligator-2, each side contributes an ephemeral Diffie-Hellman
//! exponent over that base, and the resulting shared secret is fed through
//! HKDF to produce a 48-byte union key split into the session key and the
//! key-confirmation key. Using a PIN-derived base point instead of the
//! standard generator is what keeps an off-path attacker who doesn't know the
//! PIN from mounting an offline dictionary search against the transcript.
//!
//! The two HKDF `info` strings and the union-key split below are fixed by
//! the wire protocol, not a design choice of this crate — a peer
//! implementation computes byte-identical values from the same salt and PIN.

use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::field25519::elligator2;
use super::hkdf_sha256;
use crate::error::Result;

const INFO_BASE_POINT: &[u8] = b"hichain_speke_base_info";
const INFO_SESSION_KEY: &[u8] = b"hichain_speke_sessionkey_info";

/// Generate a fresh 16-byte salt for one handshake attempt (spec §4.6 step
/// 2). The server generates this; the client receives it in PAKE_RESPONSE.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the shared SPEKE base point from the PIN and `salt`:
/// `Elligator(HKDF-SHA256(PSK=pin, salt, info="hichain_speke_base_info", L=32))`.
pub fn derive_base_point(pin: &str, salt: &[u8; 16]) -> Result<[u8; 32]> {
    let seed = hkdf_sha256(salt, pin.as_bytes(), INFO_BASE_POINT, 32)?;
    let seed32: [u8; 32] = seed.try_into().expect("hkdf_sha256 was asked for exactly 32 bytes");
    Ok(elligator2(&seed32))
}

/// One side's ephemeral SPEKE key pair, held only for the lifetime of a
/// single handshake attempt.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    esk: [u8; 32],
    #[zeroize(skip)]
    epk: [u8; 32],
}

impl EphemeralKeyPair {
    /// Generate a fresh ephemeral exponent and compute its public point over
    /// `base` (spec §4.6 step 2: `esk` is 32 random bytes, X25519-clamped).
    pub fn generate(base: &[u8; 32]) -> Self {
        let mut esk = [0u8; 32];
        OsRng.fill_bytes(&mut esk);
        clamp_scalar(&mut esk);
        let epk = x25519_dalek::x25519(esk, *base);
        Self { esk, epk }
    }

    pub fn public_point(&self) -> [u8; 32] {
        self.epk
    }

    /// Compute the raw Diffie-Hellman shared point with the peer's ephemeral
    /// public key. Callers must feed this through [`SharedSecret::derive`]
    /// rather than using it directly as key material.
    pub fn agree(&self, peer_epk: &[u8; 32]) -> [u8; 32] {
        x25519_dalek::x25519(self.esk, *peer_epk)
    }
}

fn clamp_scalar(s: &mut [u8; 32]) {
    s[0] &= 0xF8;
    s[31] &= 0x7F;
    s[31] |= 0x40;
}

/// The two secrets split out of the 48-byte `unionKey` (spec §4.6 step 4):
/// `sessionKey = unionKey[0..16]`, `hmacKey = unionKey[16..48]`. Zeroized
/// when the handshake concludes, whether it succeeds or not — `hmacKey` only
/// ever lives inside this struct and `session_key` is copied out to the
/// outer key store before the struct is dropped.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    pub session_key: [u8; 16],
    pub hmac_key: [u8; 32],
}

impl SharedSecret {
    pub fn derive(dh_output: &[u8; 32], salt: &[u8; 16]) -> Result<Self> {
        let union_key = hkdf_sha256(salt, dh_output, INFO_SESSION_KEY, 48)?;
        let mut session_key = [0u8; 16];
        let mut hmac_key = [0u8; 32];
        session_key.copy_from_slice(&union_key[0..16]);
        hmac_key.copy_from_slice(&union_key[16..48]);
        Ok(Self { session_key, hmac_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_salt_and_pin_give_the_same_base_point() {
        let salt = [7u8; 16];
        let a = derive_base_point("888888", &salt).unwrap();
        let b = derive_base_point("888888", &salt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_salts_give_different_base_points() {
        let a = derive_base_point("888888", &[1u8; 16]).unwrap();
        let b = derive_base_point("888888", &[2u8; 16]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn different_pins_give_different_base_points() {
        let salt = [7u8; 16];
        let a = derive_base_point("888888", &salt).unwrap();
        let b = derive_base_point("111111", &salt).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn both_sides_agree_on_the_same_shared_point() {
        let salt = generate_salt();
        let base = derive_base_point("888888", &salt).unwrap();
        let client = EphemeralKeyPair::generate(&base);
        let server = EphemeralKeyPair::generate(&base);

        let client_shared = client.agree(&server.public_point());
        let server_shared = server.agree(&client.public_point());
        assert_eq!(client_shared, server_shared);

        let client_secrets = SharedSecret::derive(&client_shared, &salt).unwrap();
        let server_secrets = SharedSecret::derive(&server_shared, &salt).unwrap();
        assert_eq!(client_secrets.session_key, server_secrets.session_key);
        assert_eq!(client_secrets.hmac_key, server_secrets.hmac_key);
    }

    #[test]
    fn wrong_pin_yields_a_different_session_key() {
        let salt = generate_salt();
        let base_right = derive_base_point("888888", &salt).unwrap();
        let base_wrong = derive_base_point("000000", &salt).unwrap();

        let client = EphemeralKeyPair::generate(&base_right);
        let server = EphemeralKeyPair::generate(&base_wrong);

        let client_shared = client.agree(&server.public_point());
        let server_shared = server.agree(&client.public_point());
        // Base points differ, so even though both sides complete DH without
        // erroring, the resulting secrets silently diverge -- the failure
        // surfaces later at key-confirmation, not here.
        assert_ne!(client_shared, server_shared);
    }
}
