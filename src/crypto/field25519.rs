/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Minimal GF(2^255-19) field arithmetic, used only to compute the
//! Elligator-2 map of spec §4.6. `x25519-dalek`/`curve25519-dalek` don't
//! expose the raw field element needed for that map (their public surface
//! starts and ends at full X25519 Diffie-Hellman), so this module hand-rolls
//! just enough arithmetic — add/sub/mul and variable-time exponentiation —
//! to compute it and nothing else. This is not hardened against timing
//! side-channels; it is only ever run on locally-chosen randomness, never on
//! secret material derived from a remote party.

/// An element of GF(p), p = 2^255 - 19, stored as four little-endian 64-bit
/// limbs. Always kept fully reduced (`< p`) between operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fe(pub [u64; 4]);

/// p = 2^255 - 19.
const P: [u64; 4] = [0xFFFFFFFFFFFFFFED, 0xFFFFFFFFFFFFFFFF, 0xFFFFFFFFFFFFFFFF, 0x7FFFFFFFFFFFFFFF];
/// p - 2, the Fermat inversion exponent.
const P_MINUS_2: [u64; 4] = [0xFFFFFFFFFFFFFFEB, 0xFFFFFFFFFFFFFFFF, 0xFFFFFFFFFFFFFFFF, 0x7FFFFFFFFFFFFFFF];
/// (p - 1) / 2, the Euler's-criterion exponent used for the Legendre symbol.
const P_MINUS_1_OVER_2: [u64; 4] = [0xFFFFFFFFFFFFFFF6, 0xFFFFFFFFFFFFFFFF, 0xFFFFFFFFFFFFFFFF, 0x3FFFFFFFFFFFFFFF];

/// The Montgomery curve coefficient A = 486662.
const CURVE_A: u64 = 486662;

fn adc(a: u64, b: u64, carry: u64) -> (u64, u64) {
    let sum = a as u128 + b as u128 + carry as u128;
    (sum as u64, (sum >> 64) as u64)
}

fn sbb(a: u64, b: u64, borrow: u64) -> (u64, u64) {
    let diff = (a as u128).wrapping_sub(b as u128).wrapping_sub(borrow as u128);
    // The top bit of `diff` is set iff a subtraction underflowed.
    (diff as u64, (diff >> 127) as u64 & 1)
}

/// `a >= b` for two 4-limb numbers.
fn limbs_ge(a: &[u64; 4], b: &[u64; 4]) -> bool {
    for i in (0..4).rev() {
        if a[i] != b[i] {
            return a[i] > b[i];
        }
    }
    true
}

fn limbs_sub(a: &[u64; 4], b: &[u64; 4]) -> [u64; 4] {
    let mut out = [0u64; 4];
    let mut borrow = 0u64;
    for i in 0..4 {
        let (d, b2) = sbb(a[i], b[i], borrow);
        out[i] = d;
        borrow = b2;
    }
    out
}

impl Fe {
    pub const ZERO: Fe = Fe([0, 0, 0, 0]);
    pub const ONE: Fe = Fe([1, 0, 0, 0]);

    pub fn from_u64(v: u64) -> Fe {
        Fe([v, 0, 0, 0])
    }

    /// Load a field element from 32 little-endian bytes, clearing the top bit
    /// of the last byte first (spec §4.6's "after clearing the high bit of
    /// the last byte") and reducing mod p if the remaining 255-bit value is
    /// still >= p.
    pub fn from_bytes_clamped_top_bit(bytes: &[u8; 32]) -> Fe {
        let mut b = *bytes;
        b[31] &= 0x7F;
        let mut limbs = [0u64; 4];
        for i in 0..4 {
            limbs[i] = u64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
        }
        let mut fe = Fe(limbs);
        fe.reduce_once();
        fe
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut canon = *self;
        canon.reduce_once();
        let mut out = [0u8; 32];
        for i in 0..4 {
            out[i * 8..i * 8 + 8].copy_from_slice(&canon.0[i].to_le_bytes());
        }
        out
    }

    /// Subtract p once if `self >= p`. Operations below always leave values
    /// in `[0, 2p)`, so a single conditional subtraction is always enough.
    fn reduce_once(&mut self) {
        if limbs_ge(&self.0, &P) {
            self.0 = limbs_sub(&self.0, &P);
        }
    }

    pub fn add(&self, other: &Fe) -> Fe {
        let mut out = [0u64; 4];
        let mut carry = 0u64;
        for i in 0..4 {
            let (s, c) = adc(self.0[i], other.0[i], carry);
            out[i] = s;
            carry = c;
        }
        // carry can only be 0 or 1 here since both inputs are < p < 2^255.
        let mut fe = if carry == 1 {
            // out (mod 2^256) + 2^256 is the true sum; fold 2^256 = 38 (mod p).
            Fe::fold_carry(out, 1)
        } else {
            Fe(out)
        };
        fe.reduce_once();
        fe
    }

    pub fn sub(&self, other: &Fe) -> Fe {
        let mut borrow = 0u64;
        let mut out = [0u64; 4];
        for i in 0..4 {
            let (d, b) = sbb(self.0[i], other.0[i], borrow);
            out[i] = d;
            borrow = b;
        }
        let mut fe = if borrow == 1 {
            // out is (self - other) mod 2^256; the true value is out - 2^256,
            // which is congruent to out - 38 (mod p).
            Fe(out).sub_small(38)
        } else {
            Fe(out)
        };
        fe.reduce_once();
        fe
    }

    fn sub_small(&self, small: u64) -> Fe {
        let mut borrow = small;
        let mut out = [0u64; 4];
        for i in 0..4 {
            let (d, b) = sbb(self.0[i], borrow & if i == 0 { u64::MAX } else { 0 }, if i == 0 { 0 } else { borrow });
            out[i] = d;
            borrow = b;
        }
        Fe(out)
    }

    fn fold_carry(low: [u64; 4], carry_words: u64) -> Fe {
        // Adds `carry_words * 2^256` back in as `carry_words * 38`.
        let extra = carry_words as u128 * 38;
        let mut out = low;
        let mut carry = extra;
        let mut i = 0;
        while carry != 0 && i < 4 {
            let s = out[i] as u128 + carry;
            out[i] = s as u64;
            carry = s >> 64;
            i += 1;
        }
        Fe(out)
    }

    pub fn neg(&self) -> Fe {
        Fe::ZERO.sub(self)
    }

    pub fn mul(&self, other: &Fe) -> Fe {
        // Schoolbook 4x4-limb multiply into an 8-limb product, carry
        // propagated per row.
        let a = self.0;
        let b = other.0;
        let mut t = [0u64; 8];
        for i in 0..4 {
            let mut carry = 0u64;
            for j in 0..4 {
                let idx = i + j;
                let prod = a[i] as u128 * b[j] as u128 + t[idx] as u128 + carry as u128;
                t[idx] = prod as u64;
                carry = (prod >> 64) as u64;
            }
            t[i + 4] = t[i + 4].wrapping_add(carry);
        }

        // Fold the high 256 bits back in: 2^256 = 38 (mod p).
        let lo: [u64; 4] = t[0..4].try_into().unwrap();
        let hi: [u64; 4] = t[4..8].try_into().unwrap();

        let mut hi38 = [0u64; 5];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let p = hi[i] as u128 * 38 + carry;
            hi38[i] = p as u64;
            carry = p >> 64;
        }
        hi38[4] = carry as u64;

        let mut sum = [0u64; 5];
        let mut carry = 0u128;
        for i in 0..4 {
            let s = lo[i] as u128 + hi38[i] as u128 + carry;
            sum[i] = s as u64;
            carry = s >> 64;
        }
        sum[4] = (hi38[4] as u128 + carry) as u64;

        // sum[4] holds at most a handful of bits; fold once more.
        let top = sum[4];
        let folded: [u64; 4] = sum[0..4].try_into().unwrap();
        let mut fe = Fe::fold_carry(folded, top);
        // fold_carry may have left us with another tiny overflow beyond 4
        // limbs in pathological cases; a couple of conditional subtractions
        // of p bring anything in [0, 4p) back down to canonical range.
        for _ in 0..3 {
            fe.reduce_once();
        }
        fe
    }

    pub fn square(&self) -> Fe {
        self.mul(self)
    }

    /// Variable-time `self^exponent mod p` via square-and-multiply, MSB
    /// first. Only ever called on locally-generated randomness (never on a
    /// remote-controlled secret), so timing variance here is not a concern.
    fn pow_vartime(&self, exponent: &[u64; 4]) -> Fe {
        let mut result = Fe::ONE;
        for limb in exponent.iter().rev() {
            for bit in (0..64).rev() {
                result = result.square();
                if (limb >> bit) & 1 == 1 {
                    result = result.mul(self);
                }
            }
        }
        result
    }

    /// Modular inverse via Fermat's little theorem (`self^(p-2)`). Panics
    /// never; inverting zero yields zero, matching the conventional
    /// "0 has no inverse, define it as 0" choice used throughout this crate's
    /// call sites (the Elligator denominator `1 + 2r^2` is never zero for a
    /// prime field where -1/2 happens to not be a square, but we don't lean
    /// on that property here — a zero denominator simply maps to `u = 0`,
    /// which callers reject the same way they'd reject any other input that
    /// doesn't need special handling).
    pub fn invert(&self) -> Fe {
        self.pow_vartime(&P_MINUS_2)
    }

    /// Euler's criterion: returns `true` if `self` is zero or a nonzero
    /// quadratic residue mod p, `false` if it's a non-residue.
    pub fn is_square(&self) -> bool {
        if *self == Fe::ZERO {
            return true;
        }
        let legendre = self.pow_vartime(&P_MINUS_1_OVER_2);
        legendre == Fe::ONE
    }
}

/// The Elligator-2 map of spec §4.6: maps a uniform 32-byte string to a valid
/// Curve25519 Montgomery u-coordinate.
///
/// `r` should already have had the top bit of its last byte cleared by the
/// caller going through [`Fe::from_bytes_clamped_top_bit`]; this function
/// does that itself so callers can pass the raw HKDF output directly.
pub fn elligator2(hkdf_output: &[u8; 32]) -> [u8; 32] {
    let r = Fe::from_bytes_clamped_top_bit(hkdf_output);
    let a = Fe::from_u64(CURVE_A);

    // u = -A / (1 + 2r^2)
    let two_r2 = r.square().add(&r.square());
    let denom = Fe::ONE.add(&two_r2);
    let u = a.neg().mul(&denom.invert());

    // v^2 = u^3 + A*u^2 + u
    let u2 = u.square();
    let u3 = u2.mul(&u);
    let v2 = u3.add(&a.mul(&u2)).add(&u);

    let chosen = if v2.is_square() { u } else { a.neg().sub(&u) };
    chosen.to_bytes()
}
