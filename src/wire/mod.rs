/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The packet codec (spec §4.1 / §6): a 24-byte little-endian header followed
//! by exactly `length` payload bytes, multiplexing module-addressed streams
//! over one TCP connection.

use crate::config::MAX_PACKET_PAYLOAD;
use crate::error::{AuthError, Result};

/// `0xBABEFACE`, little-endian on the wire.
pub const MAGIC: u32 = 0xBABE_FACE;

pub const HEADER_SIZE: usize = 24;

/// Module identifiers (spec §3).
pub mod module {
    pub const TRUST_ENGINE: i32 = 1;
    pub const AUTH_SDK: i32 = 3;
    pub const AUTH_CONNECTION: i32 = 5;
    pub const AUTH_CHANNEL: i32 = 8;
    pub const AUTH_MSG: i32 = 9;
    pub const META_AUTH: i32 = 21;
}

/// The 24-byte packet header, parsed field-by-field but not otherwise
/// validated — magic checking happens in [`feed_and_extract`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub module: i32,
    pub seq: i64,
    pub flag: i32,
    pub length: u32,
}

impl Header {
    pub fn new(module: i32, seq: i64, flag: i32, length: u32) -> Self {
        Self { magic: MAGIC, module, seq, flag, length }
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `buf`. Does not
    /// validate `magic` or `length` — callers that need wire-safety (i.e.
    /// everyone except tests) should go through [`feed_and_extract`].
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(AuthError::invalid_argument("header buffer shorter than 24 bytes"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let module = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let seq = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let flag = i32::from_le_bytes(buf[16..20].try_into().unwrap());
        let length = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        Ok(Self { magic, module, seq, flag, length })
    }

    fn write_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.module.to_le_bytes());
        out[8..16].copy_from_slice(&self.seq.to_le_bytes());
        out[16..20].copy_from_slice(&self.flag.to_le_bytes());
        out[20..24].copy_from_slice(&self.length.to_le_bytes());
    }
}

/// Frame `header` and `payload` into one contiguous buffer.
///
/// Fails with [`AuthError::InvalidArgument`] if `header.length` doesn't match
/// the actual payload length.
pub fn pack(header: &Header, payload: &[u8]) -> Result<Vec<u8>> {
    if header.length as usize != payload.len() {
        return Err(AuthError::invalid_argument("header.length does not match payload length"));
    }
    let mut out = vec![0u8; HEADER_SIZE + payload.len()];
    header.write_into(&mut out[..HEADER_SIZE]);
    out[HEADER_SIZE..].copy_from_slice(payload);
    Ok(out)
}

/// One fully decoded packet pulled out of a receive buffer.
pub struct DecodedPacket {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Scan `buf[..used]` for complete packets, invoking `on_packet` for each one
/// and returning the number of bytes consumed. The caller is responsible for
/// shifting any unconsumed tail to the front of `buf` before the next call.
///
/// Returns `Err(AuthError::ProtocolViolation)` on a bad magic or an oversize
/// `length` — both are fatal and the caller must drop the connection. This
/// mirrors the `-1` fatal return of spec §4.1's `FeedAndExtract`; a buffer
/// that's merely incomplete (not enough bytes yet) is not an error, it just
/// stops early and reports partial progress.
pub fn feed_and_extract(buf: &[u8], used: usize, mut on_packet: impl FnMut(Header, &[u8])) -> Result<usize> {
    let mut consumed = 0usize;
    loop {
        let remaining = used - consumed;
        if remaining < HEADER_SIZE {
            break;
        }
        let window = &buf[consumed..used];
        let header = Header::unpack(window)?;
        if header.magic != MAGIC {
            return Err(AuthError::protocol_violation("bad magic"));
        }
        if header.length == 0 || header.length as usize > MAX_PACKET_PAYLOAD {
            return Err(AuthError::protocol_violation("oversize or empty payload length"));
        }
        let total = HEADER_SIZE + header.length as usize;
        if total > remaining {
            // Not fatal: we just need more bytes. But if the buffer is full
            // and we still can't make progress, the caller treats that as
            // fatal oversize per spec §4.1.
            break;
        }
        on_packet(header, &window[HEADER_SIZE..total]);
        consumed += total;
    }
    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = Header::new(module::AUTH_SDK, 42, 0, 5);
        let payload = b"hello";
        let framed = pack(&header, payload).unwrap();
        assert_eq!(framed.len(), HEADER_SIZE + 5);

        let parsed = Header::unpack(&framed).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&framed[HEADER_SIZE..], payload);
    }

    #[test]
    fn pack_rejects_length_mismatch() {
        let header = Header::new(module::AUTH_SDK, 0, 0, 4);
        assert!(pack(&header, b"too long").is_err());
    }

    #[test]
    fn feed_and_extract_single_packet() {
        let header = Header::new(module::AUTH_CHANNEL, 1, 0, 3);
        let framed = pack(&header, b"abc").unwrap();
        let mut seen = Vec::new();
        let consumed = feed_and_extract(&framed, framed.len(), |h, p| {
            seen.push((h, p.to_vec()));
        })
        .unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, b"abc");
    }

    #[test]
    fn feed_and_extract_needs_more_bytes() {
        let header = Header::new(module::AUTH_CHANNEL, 1, 0, 10);
        let framed = pack(&header, &[0u8; 10]).unwrap();
        // Only the header plus part of the payload is available.
        let partial = &framed[..HEADER_SIZE + 4];
        let mut seen = 0;
        let consumed = feed_and_extract(partial, partial.len(), |_, _| seen += 1).unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(seen, 0);
    }

    #[test]
    fn feed_and_extract_multiple_packets() {
        let mut buf = Vec::new();
        for i in 0..3i64 {
            let h = Header::new(module::AUTH_MSG, i, 0, 2);
            buf.extend(pack(&h, b"hi").unwrap());
        }
        let mut count = 0;
        let consumed = feed_and_extract(&buf, buf.len(), |_, _| count += 1).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(count, 3);
    }

    #[test]
    fn feed_and_extract_bad_magic_is_fatal() {
        let mut framed = pack(&Header::new(module::AUTH_SDK, 0, 0, 1), b"x").unwrap();
        framed[0] = 0xAD; // corrupt the magic
        framed[1] = 0xDE;
        framed[2] = 0xAD;
        framed[3] = 0xDE;
        assert!(feed_and_extract(&framed, framed.len(), |_, _| {}).is_err());
    }

    #[test]
    fn feed_and_extract_oversize_is_fatal() {
        let mut framed = vec![0u8; HEADER_SIZE];
        let header = Header::new(module::AUTH_SDK, 0, 0, (MAX_PACKET_PAYLOAD + 1) as u32);
        header.write_into(&mut framed);
        assert!(feed_and_extract(&framed, framed.len(), |_, _| {}).is_err());
    }
}
