/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The Auth-Session FSM (spec §4.5): the per-peer state machine that takes a
//! raw connection from `Init` through an optional device-id sync step to a
//! completed [`crate::hichain::HiChainHandle`] handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::ConnId;
use crate::device_info::{DeviceInfo, DeviceInfoProvider};
use crate::error::{AuthError, Result};
use crate::hichain::handle::{HiChainHandle, HiChainState};
use crate::hichain::{HiChainMessage, HiChainOutcome};
use crate::session::context::PinProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSessionState {
    Init,
    SyncDeviceId,
    DeviceAuth,
    AuthDone,
    Failed,
}

/// The small JSON frame this crate's TRUST_ENGINE path parses (spec.md
/// SPEC_FULL.md §E / OQ-1): sent once by the client right after connect so
/// the server learns the peer's identity before the PAKE base point needs
/// it, instead of relying on the legacy any-first-byte shortcut.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdSyncFrame {
    pub udid: String,
    pub uuid: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
}

/// One per-peer handshake attempt (spec §3). Reachable from the FSM's table
/// by `auth_seq` and, while live, from `by_conn` by `conn_id`.
pub struct AuthSession {
    pub auth_seq: u64,
    pub request_id: i64,
    pub conn_id: ConnId,
    pub is_server: bool,
    pub state: AuthSessionState,
    pub create_time: u64,
    peer_device_id: Option<String>,
    /// Populated by [`AuthSessionFsm::process_dev_id_data`] when the peer
    /// sent a TRUST_ENGINE sync frame; `None` under the legacy fallback
    /// (spec.md Open Question OQ-1) where the peer device id was inferred
    /// from its `PAKE_REQUEST` instead and no udid/uuid were ever supplied.
    peer_udid: Option<String>,
    peer_uuid: Option<String>,
    hichain: Option<HiChainHandle>,
}

impl AuthSession {
    pub fn peer_device_id(&self) -> Option<&str> {
        self.peer_device_id.as_deref()
    }
}

/// What one call to [`AuthSessionFsm::process_auth_data`] (or `start_auth`)
/// produced: bytes to push back out on the wire, and/or a terminal outcome.
/// Both can be set at once — e.g. a server finishing the exchange step sends
/// `PAKE_EXCHANGE_RESPONSE` in the very same step that completes the
/// handshake (spec §4.6 step 10).
#[derive(Default)]
pub struct AuthProgress {
    pub send: Option<Vec<u8>>,
    pub done: bool,
}

/// Notified when a session reaches a terminal state. Mirrors the
/// `OnConnOpened` / `OnConnOpenFailed` upcalls of spec §4.7 — the FSM itself
/// doesn't know about `AuthManager` slots, it just reports the outcome by
/// `auth_seq`/`request_id` and lets the façade map that back to an `authId`.
pub trait AuthSessionCallbacks: Send + Sync {
    fn on_auth_done(&self, auth_seq: u64, request_id: i64, conn_id: ConnId, peer: DeviceInfo, outcome: HiChainOutcome);
    fn on_auth_failed(&self, auth_seq: u64, request_id: i64, conn_id: ConnId, reason: i32);
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Owns every in-flight and just-finished [`AuthSession`] (spec §4.5). A
/// single instance is shared by the client-dial path and the server-accept
/// path; which one a given `auth_seq` took is recorded in `is_server`.
pub struct AuthSessionFsm {
    device_info: Arc<dyn DeviceInfoProvider>,
    pin_provider: Arc<dyn PinProvider>,
    callbacks: Mutex<Option<Arc<dyn AuthSessionCallbacks>>>,
    sessions: Mutex<HashMap<u64, AuthSession>>,
    by_conn: Mutex<HashMap<ConnId, u64>>,
}

impl AuthSessionFsm {
    pub fn new(device_info: Arc<dyn DeviceInfoProvider>, pin_provider: Arc<dyn PinProvider>) -> Self {
        Self {
            device_info,
            pin_provider,
            callbacks: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            by_conn: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn AuthSessionCallbacks>) {
        *self.callbacks.lock().unwrap() = Some(callbacks);
    }

    pub fn state_of(&self, auth_seq: u64) -> Option<AuthSessionState> {
        self.sessions.lock().unwrap().get(&auth_seq).map(|s| s.state)
    }

    pub fn auth_seq_for_conn(&self, conn_id: ConnId) -> Option<u64> {
        self.by_conn.lock().unwrap().get(&conn_id).copied()
    }

    /// This device's `(versionMajor, versionMinor)`, surfaced through
    /// `AuthManager::GetVersion` (spec §4.7). The FSM doesn't track protocol
    /// versions per session — it just forwards the local device's own
    /// version, matching `GetVersion`'s documented behavior of describing
    /// this process, not the peer.
    pub fn device_version(&self) -> (u32, u32) {
        self.device_info.version()
    }

    /// `StartAuth` (spec §4.5). `peer_device_id` is required for the client
    /// role (it names who to run SPEKE against) and optional for the server
    /// role, which learns it later from [`Self::process_dev_id_data`] or,
    /// failing that, from the peer's own `PAKE_REQUEST`.
    pub fn start_auth(
        &self,
        auth_seq: u64,
        request_id: i64,
        conn_id: ConnId,
        peer_device_id: Option<String>,
        is_server: bool,
    ) -> Result<Option<Vec<u8>>> {
        {
            let sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&auth_seq) {
                return Err(AuthError::already_exists(format!("auth session {auth_seq} already started")));
            }
        }

        if is_server {
            let session = AuthSession {
                auth_seq,
                request_id,
                conn_id,
                is_server: true,
                state: AuthSessionState::SyncDeviceId,
                create_time: now_millis(),
                peer_device_id,
                peer_udid: None,
                peer_uuid: None,
                hichain: None,
            };
            self.insert(session);
            debug!(auth_seq, "auth fsm: server session waiting for SyncDeviceId");
            return Ok(None);
        }

        let peer_device_id =
            peer_device_id.ok_or_else(|| AuthError::invalid_argument("client StartAuth requires a peer device id"))?;
        let local = self.device_info.local_device_info();
        let pin = self.pin_provider.pin_for(&peer_device_id);
        let mut hichain = HiChainHandle::new_client(
            request_id,
            local,
            self.device_info.signing_key(),
            peer_device_id.clone(),
            pin,
        );
        let first = hichain.start()?;
        let bytes = first.to_wire_bytes()?;

        let session = AuthSession {
            auth_seq,
            request_id,
            conn_id,
            is_server: false,
            state: AuthSessionState::DeviceAuth,
            create_time: now_millis(),
            peer_device_id: Some(peer_device_id),
            peer_udid: None,
            peer_uuid: None,
            hichain: Some(hichain),
        };
        self.insert(session);
        info!(auth_seq, request_id, "auth fsm: client session started, sent PAKE_REQUEST");
        Ok(Some(bytes))
    }

    fn insert(&self, session: AuthSession) {
        let auth_seq = session.auth_seq;
        let conn_id = session.conn_id;
        self.sessions.lock().unwrap().insert(auth_seq, session);
        self.by_conn.lock().unwrap().insert(conn_id, auth_seq);
    }

    /// `ProcessDevIdData` (spec §4.5): the explicit TRUST_ENGINE device-id
    /// sync frame. Only meaningful for a server session still waiting in
    /// `SyncDeviceId`; once the peer's identity is known, starts HiChain in
    /// the server role the same way `ProcessAuthData`'s legacy fallback
    /// would, just with real data instead of an inference from the first
    /// PAKE message.
    pub fn process_dev_id_data(&self, auth_seq: u64, bytes: &[u8]) -> Result<()> {
        let frame: DeviceIdSyncFrame = serde_json::from_slice(bytes)?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&auth_seq)
            .ok_or_else(|| AuthError::not_found(format!("no auth session {auth_seq}")))?;
        session.peer_device_id = Some(frame.udid.clone());
        session.peer_udid = Some(frame.udid.clone());
        session.peer_uuid = Some(frame.uuid.clone());
        if session.is_server && session.state == AuthSessionState::SyncDeviceId {
            session.state = AuthSessionState::DeviceAuth;
            debug!(auth_seq, peer = %frame.udid, "auth fsm: SyncDeviceId -> DeviceAuth via TRUST_ENGINE frame");
        }
        Ok(())
    }

    /// `ProcessAuthData` (spec §4.5): hand one `AUTH_SDK` payload to the
    /// session's HiChain handle, constructing it lazily on the server side
    /// if this is the very first payload this session has seen.
    pub fn process_auth_data(&self, auth_seq: u64, bytes: &[u8]) -> Result<AuthProgress> {
        let outcome_bits = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&auth_seq)
                .ok_or_else(|| AuthError::not_found(format!("no auth session {auth_seq}")))?;

            if session.state == AuthSessionState::Failed || session.state == AuthSessionState::AuthDone {
                return Err(AuthError::protocol_violation("auth data received after session finished"));
            }

            if session.is_server && session.hichain.is_none() {
                self.bootstrap_server_hichain(session, bytes)?;
            }

            let message = HiChainMessage::from_wire_bytes(bytes)?;
            let hichain = session.hichain.as_mut().expect("server hichain bootstrapped above, client always has one");

            match hichain.process(message) {
                Ok(reply) => {
                    let send = reply.map(|m| m.to_wire_bytes()).transpose()?;
                    let finished = matches!(hichain.state(), HiChainState::Done);
                    if finished {
                        session.state = AuthSessionState::AuthDone;
                    }
                    (send, finished, None::<AuthError>)
                }
                Err(e) => {
                    warn!(auth_seq, error = %e, "auth fsm: handshake step failed");
                    session.state = AuthSessionState::Failed;
                    let error_msg = HiChainMessage::Error { request_id: session.request_id, error_code: -1 };
                    let send = error_msg.to_wire_bytes().ok();
                    (send, true, Some(e))
                }
            }
        };

        let (send, finished, error) = outcome_bits;
        if finished {
            self.finalize(auth_seq, error);
        }
        Ok(AuthProgress { send, done: finished })
    }

    fn bootstrap_server_hichain(&self, session: &mut AuthSession, first_payload: &[u8]) -> Result<()> {
        if session.peer_device_id.is_none() {
            // Legacy fallback (spec.md Open Question OQ-1): no TRUST_ENGINE
            // frame arrived, so pull the peer's self-reported device id
            // straight out of its PAKE_REQUEST instead of refusing to
            // proceed.
            if let Ok(HiChainMessage::PakeRequest { conn_device_id, .. }) = HiChainMessage::from_wire_bytes(first_payload) {
                session.peer_device_id = Some(conn_device_id);
            }
        }
        let peer_device_id = session
            .peer_device_id
            .clone()
            .ok_or_else(|| AuthError::protocol_violation("server could not determine peer device id before PAKE_REQUEST"))?;

        session.state = AuthSessionState::DeviceAuth;
        let local = self.device_info.local_device_info();
        let pin = self.pin_provider.pin_for(&peer_device_id);
        session.hichain =
            Some(HiChainHandle::new_server(session.request_id, local, self.device_info.signing_key(), peer_device_id, pin));
        Ok(())
    }

    fn finalize(&self, auth_seq: u64, error: Option<AuthError>) {
        let session_bits = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&auth_seq) else { return };
            let hichain = session.hichain.take();
            (session.request_id, session.conn_id, session.state, hichain, session.peer_device_id.clone(), session.peer_udid.clone(), session.peer_uuid.clone())
        };
        let (request_id, conn_id, state, hichain, peer_device_id, peer_udid, peer_uuid) = session_bits;
        let callbacks = self.callbacks.lock().unwrap().clone();
        let Some(callbacks) = callbacks else { return };

        match (state, hichain, error) {
            (AuthSessionState::AuthDone, Some(hichain), None) => match hichain.finish() {
                Ok(outcome) => {
                    info!(auth_seq, request_id, "auth fsm: DeviceAuth -> AuthDone");
                    // `peer_device_id` is always set by the time a handshake
                    // reaches AuthDone (either via the TRUST_ENGINE sync
                    // frame or the PAKE_REQUEST fallback in
                    // `bootstrap_server_hichain`). `udid`/`uuid` only ever
                    // come from the sync frame (spec §4.5); absent that,
                    // fall back to the device id itself rather than leaving
                    // them empty.
                    let device_id = peer_device_id.unwrap_or_else(|| outcome.peer_auth_id.clone());
                    let peer = DeviceInfo {
                        udid: peer_udid.unwrap_or_else(|| device_id.clone()),
                        uuid: peer_uuid.unwrap_or_else(|| device_id.clone()),
                        device_id,
                    };
                    callbacks.on_auth_done(auth_seq, request_id, conn_id, peer, outcome);
                }
                Err(e) => {
                    warn!(auth_seq, error = %e, "auth fsm: handshake reported done but outcome extraction failed");
                    callbacks.on_auth_failed(auth_seq, request_id, conn_id, e.conn_open_reason());
                }
            },
            (_, _, Some(e)) => callbacks.on_auth_failed(auth_seq, request_id, conn_id, e.conn_open_reason()),
            _ => callbacks.on_auth_failed(auth_seq, request_id, conn_id, -1),
        }
    }

    /// Removes the FSM session keyed off a closed connection, firing
    /// `on_auth_failed(reason=ConnectionLost)` if it hadn't already reached a
    /// terminal state. Matches spec §3's "connection handle removal cascades
    /// to removing any FSM session".
    pub fn on_connection_closed(&self, conn_id: ConnId) {
        let Some(auth_seq) = self.by_conn.lock().unwrap().remove(&conn_id) else { return };
        let removed = self.sessions.lock().unwrap().remove(&auth_seq);
        let Some(session) = removed else { return };
        if matches!(session.state, AuthSessionState::AuthDone | AuthSessionState::Failed) {
            return;
        }
        if let Some(callbacks) = self.callbacks.lock().unwrap().clone() {
            callbacks.on_auth_failed(auth_seq, session.request_id, conn_id, -3);
        }
    }

    pub fn remove(&self, auth_seq: u64) {
        if let Some(session) = self.sessions.lock().unwrap().remove(&auth_seq) {
            self.by_conn.lock().unwrap().remove(&session.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnType;
    use crate::device_info::test_support::StaticDeviceInfoProvider;
    use crate::session::context::FixedPinProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingCallbacks {
        done: AtomicUsize,
        failed: AtomicUsize,
    }

    impl AuthSessionCallbacks for RecordingCallbacks {
        fn on_auth_done(&self, _auth_seq: u64, _request_id: i64, _conn_id: ConnId, _peer: DeviceInfo, _outcome: HiChainOutcome) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
        fn on_auth_failed(&self, _auth_seq: u64, _request_id: i64, _conn_id: ConnId, _reason: i32) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fsm(device_id: &str) -> (Arc<AuthSessionFsm>, Arc<RecordingCallbacks>) {
        let device_info = Arc::new(StaticDeviceInfoProvider::new(device_id));
        let pin_provider = Arc::new(FixedPinProvider("888888".to_string()));
        let fsm = Arc::new(AuthSessionFsm::new(device_info, pin_provider));
        let cb = Arc::new(RecordingCallbacks { done: AtomicUsize::new(0), failed: AtomicUsize::new(0) });
        fsm.set_callbacks(cb.clone());
        (fsm, cb)
    }

    #[test]
    fn client_and_server_complete_a_full_handshake() {
        let (client_fsm, client_cb) = fsm("client-dev");
        let (server_fsm, server_cb) = fsm("server-dev");

        let conn = ConnId::new(ConnType::Wifi, 1);
        let first = client_fsm
            .start_auth(1, 100, conn, Some("server-dev".to_string()), false)
            .unwrap()
            .expect("client emits PAKE_REQUEST immediately");

        server_fsm.start_auth(1, 0, conn, None, true).unwrap();
        assert_eq!(server_fsm.state_of(1), Some(AuthSessionState::SyncDeviceId));

        let mut next = server_fsm.process_auth_data(1, &first).unwrap().send.unwrap();
        loop {
            let client_progress = client_fsm.process_auth_data(1, &next).unwrap();
            if client_progress.send.is_none() {
                break;
            }
            next = client_progress.send.unwrap();
            let server_progress = server_fsm.process_auth_data(1, &next).unwrap();
            match server_progress.send {
                Some(bytes) => next = bytes,
                None => break,
            }
        }

        assert_eq!(client_cb.done.load(Ordering::SeqCst), 1);
        assert_eq!(server_cb.done.load(Ordering::SeqCst), 1);
        assert_eq!(client_fsm.state_of(1), Some(AuthSessionState::AuthDone));
        assert_eq!(server_fsm.state_of(1), Some(AuthSessionState::AuthDone));
    }

    #[test]
    fn duplicate_auth_seq_is_rejected() {
        let (fsm, _cb) = fsm("dev-a");
        let conn = ConnId::new(ConnType::Wifi, 1);
        fsm.start_auth(1, 1, conn, Some("dev-b".to_string()), false).unwrap();
        assert!(fsm.start_auth(1, 2, conn, Some("dev-b".to_string()), false).is_err());
    }

    #[test]
    fn connection_close_mid_handshake_fires_connection_lost() {
        let (fsm, cb) = fsm("dev-a");
        let conn = ConnId::new(ConnType::Wifi, 7);
        fsm.start_auth(1, 1, conn, None, true).unwrap();
        fsm.on_connection_closed(conn);
        assert_eq!(cb.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dev_id_sync_frame_advances_server_past_sync_device_id() {
        let (fsm, _cb) = fsm("server-dev");
        let conn = ConnId::new(ConnType::Wifi, 2);
        fsm.start_auth(1, 0, conn, None, true).unwrap();
        let frame = serde_json::to_vec(&DeviceIdSyncFrame {
            udid: "client-dev".to_string(),
            uuid: "uuid-client-dev".to_string(),
            device_name: "phone".to_string(),
        })
        .unwrap();
        fsm.process_dev_id_data(1, &frame).unwrap();
        assert_eq!(fsm.state_of(1), Some(AuthSessionState::DeviceAuth));
    }
}
