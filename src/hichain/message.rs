/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The JSON messages the PAKE-V1 handshake exchanges (spec §4.6/§6).
//!
//! The wire shape is fixed by interop, not idiomatic-serde convenience: the
//! variant tag is an *integer* `message` field (not a string), cryptographic
//! fields live under a nested `payload` object, and `requestId` is carried as
//! a decimal string even though it is a 64-bit integer underneath. A plain
//! `#[serde(tag = "message")]` enum can't express that shape directly, so
//! this module builds and parses [`serde_json::Value`] by hand instead of
//! deriving `Serialize`/`Deserialize` on [`HiChainMessage`].

use serde_json::{json, Value};

use crate::crypto::{hex_decode, hex_encode};
use crate::error::{AuthError, Result};

pub const MSG_PAKE_REQUEST: i64 = 1;
pub const MSG_PAKE_RESPONSE: i64 = 0x8001;
pub const MSG_PAKE_CLIENT_CONFIRM: i64 = 2;
pub const MSG_PAKE_SERVER_CONFIRM: i64 = 0x8002;
pub const MSG_PAKE_EXCHANGE_REQUEST: i64 = 3;
pub const MSG_PAKE_EXCHANGE_RESPONSE: i64 = 0x8003;
pub const MSG_ERROR: i64 = 0x8080;

/// `{minVersion, currentVersion}`, carried in PAKE_REQUEST/PAKE_RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub min_version: i32,
    pub current_version: i32,
}

#[derive(Debug, Clone)]
pub enum HiChainMessage {
    /// No cryptographic material yet — the client's SPEKE setup happens on
    /// receipt of `PAKE_RESPONSE`'s `salt` (spec §4.6 step 2, which fires on
    /// the *server* side upon receiving this message), so this is purely an
    /// identity announcement.
    PakeRequest {
        request_id: i64,
        conn_device_id: String,
        peer_device_id: Option<String>,
        version: ProtocolVersion,
        operation_code: i32,
    },
    PakeResponse {
        request_id: i64,
        salt: String,
        epk: String,
        challenge: String,
        version: ProtocolVersion,
    },
    PakeClientConfirm {
        request_id: i64,
        epk: String,
        challenge: String,
        kcf_data: String,
    },
    PakeServerConfirm {
        request_id: i64,
        kcf_data: String,
    },
    PakeExchangeRequest {
        request_id: i64,
        ex_auth_info: String,
    },
    PakeExchangeResponse {
        request_id: i64,
        peer_device_id: String,
        conn_device_id: String,
        ex_auth_info: String,
        peer_user_type: i32,
        peer_auth_id: Option<String>,
    },
    Error {
        request_id: i64,
        error_code: i32,
    },
}

impl HiChainMessage {
    pub fn request_id(&self) -> i64 {
        match self {
            Self::PakeRequest { request_id, .. }
            | Self::PakeResponse { request_id, .. }
            | Self::PakeClientConfirm { request_id, .. }
            | Self::PakeServerConfirm { request_id, .. }
            | Self::PakeExchangeRequest { request_id, .. }
            | Self::PakeExchangeResponse { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::PakeRequest { request_id, conn_device_id, peer_device_id, version, operation_code } => {
                json!({
                    "message": MSG_PAKE_REQUEST,
                    "requestId": request_id.to_string(),
                    "connDeviceId": conn_device_id,
                    "peerDeviceId": peer_device_id,
                    "payload": {
                        "version": {"minVersion": version.min_version, "currentVersion": version.current_version},
                        "support256mod": false,
                        "operationCode": operation_code,
                    },
                })
            }
            Self::PakeResponse { request_id, salt, epk, challenge, version } => json!({
                "message": MSG_PAKE_RESPONSE,
                "requestId": request_id.to_string(),
                "payload": {
                    "salt": salt,
                    "epk": epk,
                    "challenge": challenge,
                    "version": {"minVersion": version.min_version, "currentVersion": version.current_version},
                },
            }),
            Self::PakeClientConfirm { request_id, epk, challenge, kcf_data } => json!({
                "message": MSG_PAKE_CLIENT_CONFIRM,
                "requestId": request_id.to_string(),
                "payload": {"epk": epk, "challenge": challenge, "kcfData": kcf_data},
            }),
            Self::PakeServerConfirm { request_id, kcf_data } => json!({
                "message": MSG_PAKE_SERVER_CONFIRM,
                "requestId": request_id.to_string(),
                "payload": {"kcfData": kcf_data},
            }),
            Self::PakeExchangeRequest { request_id, ex_auth_info } => json!({
                "message": MSG_PAKE_EXCHANGE_REQUEST,
                "requestId": request_id.to_string(),
                "payload": {"exAuthInfo": ex_auth_info},
            }),
            Self::PakeExchangeResponse { request_id, peer_device_id, conn_device_id, ex_auth_info, peer_user_type, peer_auth_id } => {
                json!({
                    "message": MSG_PAKE_EXCHANGE_RESPONSE,
                    "requestId": request_id.to_string(),
                    "peerDeviceId": peer_device_id,
                    "connDeviceId": conn_device_id,
                    "payload": {
                        "exAuthInfo": ex_auth_info,
                        "peerUserType": peer_user_type,
                        "peerAuthId": peer_auth_id,
                    },
                })
            }
            Self::Error { request_id, error_code } => json!({
                "message": MSG_ERROR,
                "requestId": request_id.to_string(),
                "errorCode": error_code,
            }),
        }
    }

    fn from_json(v: Value) -> Result<Self> {
        let message = v
            .get("message")
            .and_then(Value::as_i64)
            .ok_or_else(|| AuthError::protocol_violation("missing or non-integer `message` field"))?;
        let request_id = parse_request_id(&v)?;
        let payload = v.get("payload");

        match message {
            MSG_PAKE_REQUEST => {
                let p = require_payload(payload)?;
                Ok(Self::PakeRequest {
                    request_id,
                    conn_device_id: field_str(&v, "connDeviceId")?,
                    peer_device_id: opt_field_str(&v, "peerDeviceId"),
                    version: parse_version(p)?,
                    operation_code: p.get("operationCode").and_then(Value::as_i64).unwrap_or(0) as i32,
                })
            }
            MSG_PAKE_RESPONSE => {
                let p = require_payload(payload)?;
                Ok(Self::PakeResponse {
                    request_id,
                    salt: field_str(p, "salt")?,
                    epk: field_str(p, "epk")?,
                    challenge: field_str(p, "challenge")?,
                    version: parse_version(p)?,
                })
            }
            MSG_PAKE_CLIENT_CONFIRM => {
                let p = require_payload(payload)?;
                Ok(Self::PakeClientConfirm {
                    request_id,
                    epk: field_str(p, "epk")?,
                    challenge: field_str(p, "challenge")?,
                    kcf_data: field_str(p, "kcfData")?,
                })
            }
            MSG_PAKE_SERVER_CONFIRM => {
                let p = require_payload(payload)?;
                Ok(Self::PakeServerConfirm { request_id, kcf_data: field_str(p, "kcfData")? })
            }
            MSG_PAKE_EXCHANGE_REQUEST => {
                let p = require_payload(payload)?;
                Ok(Self::PakeExchangeRequest { request_id, ex_auth_info: field_str(p, "exAuthInfo")? })
            }
            MSG_PAKE_EXCHANGE_RESPONSE => {
                let p = require_payload(payload)?;
                Ok(Self::PakeExchangeResponse {
                    request_id,
                    peer_device_id: field_str(&v, "peerDeviceId")?,
                    conn_device_id: field_str(&v, "connDeviceId")?,
                    ex_auth_info: field_str(p, "exAuthInfo")?,
                    peer_user_type: p.get("peerUserType").and_then(Value::as_i64).unwrap_or(0) as i32,
                    peer_auth_id: opt_field_str(p, "peerAuthId"),
                })
            }
            MSG_ERROR => Ok(Self::Error {
                request_id,
                error_code: v.get("errorCode").and_then(Value::as_i64).unwrap_or(0) as i32,
            }),
            other => Err(AuthError::protocol_violation(format!("unknown hichain message type {other:#x}"))),
        }
    }

    /// Messages are sent NUL-terminated over the wire (an upstream hichain
    /// convention carried over verbatim, spec §6) so serialize appends one
    /// and deserialize strips a trailing NUL (and anything after it) before
    /// handing the rest to `serde_json`.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(&self.to_json())?;
        bytes.push(0);
        Ok(bytes)
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
        let trimmed = bytes.split(|&b| b == 0).next().unwrap_or(bytes);
        let value: Value = serde_json::from_slice(trimmed)?;
        Self::from_json(value)
    }
}

fn require_payload(payload: Option<&Value>) -> Result<&Value> {
    payload.ok_or_else(|| AuthError::protocol_violation("missing `payload` object"))
}

fn field_str(v: &Value, key: &str) -> Result<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AuthError::protocol_violation(format!("missing or non-string field `{key}`")))
}

fn opt_field_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_request_id(v: &Value) -> Result<i64> {
    let raw = v.get("requestId").ok_or_else(|| AuthError::protocol_violation("missing `requestId` field"))?;
    match raw {
        Value::String(s) => s.parse::<i64>().map_err(|_| AuthError::protocol_violation("requestId was not a decimal string")),
        Value::Number(n) => n.as_i64().ok_or_else(|| AuthError::protocol_violation("requestId out of i64 range")),
        _ => Err(AuthError::protocol_violation("requestId had an unexpected JSON type")),
    }
}

fn parse_version(p: &Value) -> Result<ProtocolVersion> {
    let v = p.get("version").ok_or_else(|| AuthError::protocol_violation("missing `version` field"))?;
    Ok(ProtocolVersion {
        min_version: v.get("minVersion").and_then(Value::as_i64).unwrap_or(0) as i32,
        current_version: v.get("currentVersion").and_then(Value::as_i64).unwrap_or(0) as i32,
    })
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    hex_encode(bytes)
}

pub fn decode_bytes(s: &str) -> Result<Vec<u8>> {
    hex_decode(s)
}

pub fn decode_fixed<const N: usize>(s: &str, field: &str) -> Result<[u8; N]> {
    let bytes = hex_decode(s)?;
    bytes.try_into().map_err(|_| AuthError::protocol_violation(format!("`{field}` field was not {N} bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pake_request_round_trips_through_wire_bytes() {
        let msg = HiChainMessage::PakeRequest {
            request_id: 7,
            conn_device_id: "client-dev".to_string(),
            peer_device_id: Some("server-dev".to_string()),
            version: ProtocolVersion { min_version: 1, current_version: 1 },
            operation_code: 0,
        };
        let bytes = msg.to_wire_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), 0);
        let parsed = HiChainMessage::from_wire_bytes(&bytes).unwrap();
        match parsed {
            HiChainMessage::PakeRequest { request_id, conn_device_id, version, .. } => {
                assert_eq!(request_id, 7);
                assert_eq!(conn_device_id, "client-dev");
                assert_eq!(version.min_version, 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn pake_client_confirm_carries_epk_and_challenge() {
        let msg = HiChainMessage::PakeClientConfirm {
            request_id: 1,
            epk: encode_bytes(&[9u8; 32]),
            challenge: encode_bytes(&[1u8; 16]),
            kcf_data: encode_bytes(&[2u8; 32]),
        };
        let bytes = msg.to_wire_bytes().unwrap();
        let parsed = HiChainMessage::from_wire_bytes(&bytes).unwrap();
        match parsed {
            HiChainMessage::PakeClientConfirm { epk, challenge, .. } => {
                assert_eq!(decode_fixed::<32>(&epk, "epk").unwrap(), [9u8; 32]);
                assert_eq!(decode_fixed::<16>(&challenge, "challenge").unwrap(), [1u8; 16]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn request_id_is_carried_as_a_decimal_string_on_the_wire() {
        let msg = HiChainMessage::PakeServerConfirm { request_id: 123456789, kcf_data: encode_bytes(&[0u8; 32]) };
        let bytes = msg.to_wire_bytes().unwrap();
        let trimmed = bytes.split(|&b| b == 0).next().unwrap();
        let raw: Value = serde_json::from_slice(trimmed).unwrap();
        assert_eq!(raw.get("requestId").unwrap(), &Value::String("123456789".to_string()));
        assert_eq!(raw.get("message").unwrap(), &Value::from(MSG_PAKE_SERVER_CONFIRM));
    }

    #[test]
    fn error_message_round_trips() {
        let msg = HiChainMessage::Error { request_id: 1, error_code: -1 };
        let bytes = msg.to_wire_bytes().unwrap();
        let parsed = HiChainMessage::from_wire_bytes(&bytes).unwrap();
        match parsed {
            HiChainMessage::Error { error_code, request_id } => {
                assert_eq!(error_code, -1);
                assert_eq!(request_id, 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_value_is_rejected() {
        let bad = b"{\"message\":999,\"requestId\":\"1\"}\0";
        assert!(HiChainMessage::from_wire_bytes(bad).is_err());
    }

    #[test]
    fn missing_message_field_is_rejected() {
        let bad = b"{\"requestId\":\"1\"}\0";
        assert!(HiChainMessage::from_wire_bytes(bad).is_err());
    }
}
