/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The public façade (spec §4.7): the one object an embedding application
//! talks to. Wires the connection manager, the channel router, and the
//! Auth-Session FSM together behind `OpenConnection` / `PostTransData` /
//! `CloseConnection`, and owns the `authId -> slot` table that survives a
//! single connection's whole lifetime, not just one handshake attempt.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::Config;
use crate::connection::manager::{ConnectionCallbacks, ConnectionManager};
use crate::connection::{ConnId, ConnType};
use crate::device_info::{DeviceInfo, DeviceInfoProvider};
use crate::error::{AuthError, Result};
use crate::group_store::GroupStore;
use crate::hichain::HiChainOutcome;
use crate::keystore::{Persistor, SessionKeyStore};
use crate::router::{ChannelListener, ChannelRouter};
use crate::session::context::{FixedPinProvider, PinProvider};
use crate::session::fsm::{AuthSessionCallbacks, AuthSessionFsm};
use crate::wire::{self, Header};

/// What a caller hands `OpenConnection`: where to dial, who they expect to
/// find there, and over which transport. `peer_device_id` is required up
/// front because the client role of the PAKE-V1 handshake needs it to derive
/// the SPEKE base point (spec §4.6 step 1) before any bytes go on the wire.
/// `conn_type` is checked against the connection manager's actual transport
/// support before dialing — only `ConnType::Wifi` is implemented.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub addr: SocketAddr,
    pub peer_device_id: String,
    pub conn_type: ConnType,
}

/// Failure modes of [`AuthManager::open_connection`].
#[derive(Debug, thiserror::Error)]
pub enum OpenConnectionError {
    #[error("auth manager has not been initialized with Init()")]
    NotInitialized,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Upcalls a caller registers once through [`AuthManager::init`]. Mirrors
/// spec §4.7's `Init(callbacks{...})` surface: two outcomes for a connection
/// attempt (one's own `OpenConnection` or an inbound accept that completed
/// its handshake), and one upcall for every other module's traffic.
pub trait AuthManagerCallbacks: Send + Sync {
    fn on_conn_opened(&self, request_id: i64, auth_id: u64);
    fn on_conn_open_failed(&self, request_id: i64, reason: i32);
    fn on_data_received(&self, auth_id: u64, module: i32, flag: i32, bytes: &[u8]);
}

/// One connection's whole lifetime (spec §3): from `OpenConnection`/accept,
/// through a handshake attempt, past `AuthDone`, until `CloseConnection` or a
/// socket drop. `auth_seq` is kept distinct from `auth_id` in spirit even
/// though this crate allocates them together and never re-handshakes an
/// existing `authId` — see DESIGN.md.
struct AuthManagerSlot {
    auth_id: u64,
    auth_seq: u64,
    conn_id: ConnId,
    conn_info: ConnectionInfo,
    is_server: bool,
    has_auth_passed: bool,
    last_active_time: u64,
    peer_info: Option<DeviceInfo>,
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct AuthManager {
    device_info: Arc<dyn DeviceInfoProvider>,
    connection_manager: Arc<ConnectionManager>,
    router: Arc<ChannelRouter>,
    fsm: Arc<AuthSessionFsm>,
    keystore: Arc<SessionKeyStore>,
    group_store: Arc<GroupStore>,
    slots: Mutex<HashMap<u64, AuthManagerSlot>>,
    conn_index: Mutex<HashMap<ConnId, u64>>,
    next_auth_id: AtomicU64,
    next_packet_seq: AtomicI64,
    callbacks: Mutex<Option<Arc<dyn AuthManagerCallbacks>>>,
}

impl AuthManager {
    /// Builds the façade and wires every internal seam, but does not yet
    /// accept connections — call [`Self::init`] for that, same two-phase
    /// split as spec §4.7's constructor-then-`Init(callbacks)`.
    pub fn new(
        device_info: Arc<dyn DeviceInfoProvider>,
        config: Config,
        pin_provider: Option<Arc<dyn PinProvider>>,
        persistor: Option<Arc<dyn Persistor>>,
        master_key: [u8; 16],
    ) -> Arc<Self> {
        let pin_provider: Arc<dyn PinProvider> =
            pin_provider.unwrap_or_else(|| Arc::new(FixedPinProvider(crate::config::DEFAULT_PIN.to_string())));
        let connection_manager = ConnectionManager::new(config);
        let router = Arc::new(ChannelRouter::new());
        let fsm = Arc::new(AuthSessionFsm::new(device_info.clone(), pin_provider));
        let keystore = Arc::new(SessionKeyStore::new(persistor, master_key));
        let group_store = Arc::new(GroupStore::new());

        Arc::new_cyclic(|weak: &Weak<AuthManager>| {
            router.register(wire::module::AUTH_SDK, Arc::new(FsmChannelAdapter { manager: weak.clone() }));
            router.register(wire::module::TRUST_ENGINE, Arc::new(FsmChannelAdapter { manager: weak.clone() }));
            let generic: Arc<dyn ChannelListener> = Arc::new(GenericChannelAdapter { manager: weak.clone() });
            router.register(wire::module::AUTH_CHANNEL, generic.clone());
            router.register(wire::module::AUTH_MSG, generic.clone());
            router.register(wire::module::AUTH_CONNECTION, generic.clone());
            router.register(wire::module::META_AUTH, generic);

            connection_manager.set_callbacks(Arc::new(ConnectionAdapter { manager: weak.clone(), router: router.clone() }));
            fsm.set_callbacks(Arc::new(FsmCallbackAdapter { manager: weak.clone() }));

            AuthManager {
                device_info,
                connection_manager,
                router,
                fsm,
                keystore,
                group_store,
                slots: Mutex::new(HashMap::new()),
                conn_index: Mutex::new(HashMap::new()),
                next_auth_id: AtomicU64::new(1),
                next_packet_seq: AtomicI64::new(1),
                callbacks: Mutex::new(None),
            }
        })
    }

    pub fn keystore(&self) -> &Arc<SessionKeyStore> {
        &self.keystore
    }

    pub fn group_store(&self) -> &Arc<GroupStore> {
        &self.group_store
    }

    /// `Init(callbacks)`: register the upcall target and start listening.
    pub fn init(&self, callbacks: Arc<dyn AuthManagerCallbacks>, listen_addr: SocketAddr) -> Result<SocketAddr> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        self.connection_manager.start_listen(listen_addr)
    }

    /// Stops accepting new connections and tears every open one down. Not
    /// meant to be followed by further calls — a fresh [`AuthManager::new`]
    /// is the only supported way back up, matching spec §4.7's
    /// process-lifetime `Deinit`.
    pub fn deinit(&self) {
        self.connection_manager.stop_listen();
        let conn_ids: Vec<ConnId> = self.slots.lock().unwrap().values().map(|s| s.conn_id).collect();
        for conn_id in conn_ids {
            self.connection_manager.disconnect(conn_id);
        }
        self.slots.lock().unwrap().clear();
        self.conn_index.lock().unwrap().clear();
    }

    /// `OpenConnection(connInfo, requestId)`: dial out, then immediately kick
    /// off the client side of the handshake over the freshly connected
    /// socket. Blocks for as long as [`ConnectionManager::dial`] does.
    pub fn open_connection(
        &self,
        conn_info: ConnectionInfo,
        request_id: i64,
    ) -> std::result::Result<u64, OpenConnectionError> {
        if self.callbacks.lock().unwrap().is_none() {
            return Err(OpenConnectionError::NotInitialized);
        }

        let conn_id = self.connection_manager.dial(conn_info.addr, conn_info.conn_type)?;
        let auth_id = self.next_auth_id.fetch_add(1, Ordering::Relaxed);

        let slot = AuthManagerSlot {
            auth_id,
            auth_seq: auth_id,
            conn_id,
            conn_info: conn_info.clone(),
            is_server: false,
            has_auth_passed: false,
            last_active_time: now_millis(),
            peer_info: None,
        };
        self.slots.lock().unwrap().insert(auth_id, slot);
        self.conn_index.lock().unwrap().insert(conn_id, auth_id);
        self.send_device_id_sync(conn_id);

        match self.fsm.start_auth(auth_id, request_id, conn_id, Some(conn_info.peer_device_id), false) {
            Ok(first) => {
                if let Some(bytes) = first {
                    self.send_auth_sdk(conn_id, &bytes);
                }
                info!(auth_id, request_id, "auth manager: opened outbound connection");
                Ok(auth_id)
            }
            Err(e) => {
                self.slots.lock().unwrap().remove(&auth_id);
                self.conn_index.lock().unwrap().remove(&conn_id);
                self.connection_manager.disconnect(conn_id);
                Err(OpenConnectionError::Auth(e))
            }
        }
    }

    /// `CloseConnection(authId)`: idempotent, silently a no-op for an
    /// already-closed or unknown `authId`.
    pub fn close_connection(&self, auth_id: u64) {
        let conn_id = self.slots.lock().unwrap().remove(&auth_id).map(|s| s.conn_id);
        if let Some(conn_id) = conn_id {
            self.conn_index.lock().unwrap().remove(&conn_id);
            self.fsm.remove(auth_id);
            self.connection_manager.disconnect(conn_id);
        }
    }

    /// `PostTransData(authId, module, flag, bytes)`. `AUTH_SDK` is reserved
    /// for the FSM's own handshake traffic — callers send everything else
    /// through here once `has_auth_passed` is true, though this crate
    /// doesn't itself enforce that ordering (spec §4.7 leaves it to the
    /// caller to wait for `OnConnOpened`).
    pub fn post_trans_data(&self, auth_id: u64, module: i32, flag: i32, bytes: &[u8]) -> Result<()> {
        if module == wire::module::AUTH_SDK || module == wire::module::TRUST_ENGINE {
            return Err(AuthError::invalid_argument("module is reserved for the auth handshake itself"));
        }
        let conn_id = self
            .slots
            .lock()
            .unwrap()
            .get(&auth_id)
            .map(|s| s.conn_id)
            .ok_or_else(|| AuthError::not_found(format!("no such auth id {auth_id}")))?;
        let seq = self.next_packet_seq.fetch_add(1, Ordering::Relaxed);
        self.connection_manager.send_with_flag(conn_id, module, seq, flag, bytes)
    }

    pub fn get_conn_info(&self, auth_id: u64) -> Result<ConnectionInfo> {
        self.slots
            .lock()
            .unwrap()
            .get(&auth_id)
            .map(|s| s.conn_info.clone())
            .ok_or_else(|| AuthError::not_found(format!("no such auth id {auth_id}")))
    }

    pub fn get_peer_uuid(&self, auth_id: u64) -> Result<String> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(&auth_id).ok_or_else(|| AuthError::not_found(format!("no such auth id {auth_id}")))?;
        slot.peer_info
            .as_ref()
            .map(|d| d.uuid.clone())
            .ok_or_else(|| AuthError::not_found("peer has not completed its handshake yet"))
    }

    pub fn get_version(&self, auth_id: u64) -> Result<(u32, u32)> {
        if !self.slots.lock().unwrap().contains_key(&auth_id) {
            return Err(AuthError::not_found(format!("no such auth id {auth_id}")));
        }
        Ok(self.fsm_device_version())
    }

    fn fsm_device_version(&self) -> (u32, u32) {
        self.fsm.device_version()
    }

    pub fn is_server(&self, auth_id: u64) -> Result<bool> {
        self.slots
            .lock()
            .unwrap()
            .get(&auth_id)
            .map(|s| s.is_server)
            .ok_or_else(|| AuthError::not_found(format!("no such auth id {auth_id}")))
    }

    fn send_auth_sdk(&self, conn_id: ConnId, bytes: &[u8]) {
        let seq = self.next_packet_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.connection_manager.send(conn_id, wire::module::AUTH_SDK, seq, bytes) {
            warn!(error = %e, "auth manager: failed to write AUTH_SDK frame");
        }
    }

    /// Sends this device's own TRUST_ENGINE sync frame (spec.md Open Question
    /// OQ-1): once from `open_connection` right after the client-role slot is
    /// registered, and once from `resolve_or_bootstrap` right after the
    /// server-role slot is. Both call sites send only after their own
    /// bookkeeping for the connection already exists, so a peer's reply can
    /// never race its own `conn_index` entry.
    fn send_device_id_sync(&self, conn_id: ConnId) {
        let local = self.device_info.local_device_info();
        let frame = crate::session::fsm::DeviceIdSyncFrame {
            udid: local.device_id,
            uuid: local.uuid,
            device_name: local.udid,
        };
        let bytes = match serde_json::to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "auth manager: failed to encode device id sync frame");
                return;
            }
        };
        let seq = self.next_packet_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.connection_manager.send(conn_id, wire::module::TRUST_ENGINE, seq, &bytes) {
            warn!(error = %e, "auth manager: failed to write TRUST_ENGINE sync frame");
        }
    }

    /// Returns the `authId` routed traffic on `conn_id` belongs to, creating
    /// a fresh server-role slot and FSM session the first time an unknown
    /// `conn_id` shows up on `AUTH_SDK`/`TRUST_ENGINE` (spec §4.7's inbound
    /// bootstrap path — there is no prior `OpenConnection` call for an
    /// accepted socket).
    fn resolve_or_bootstrap(&self, conn_id: ConnId) -> Option<u64> {
        if let Some(auth_id) = self.conn_index.lock().unwrap().get(&conn_id).copied() {
            return Some(auth_id);
        }

        let auth_id = self.next_auth_id.fetch_add(1, Ordering::Relaxed);
        let peer_addr = self.connection_manager.peer_addr(conn_id).ok()?;
        let conn_info = ConnectionInfo { addr: peer_addr, peer_device_id: String::new(), conn_type: ConnType::Wifi };
        let slot = AuthManagerSlot {
            auth_id,
            auth_seq: auth_id,
            conn_id,
            conn_info,
            is_server: true,
            has_auth_passed: false,
            last_active_time: now_millis(),
            peer_info: None,
        };

        if let Err(e) = self.fsm.start_auth(auth_id, 0, conn_id, None, true) {
            warn!(error = %e, "auth manager: failed to start server-side auth session");
            return None;
        }
        self.slots.lock().unwrap().insert(auth_id, slot);
        self.conn_index.lock().unwrap().insert(conn_id, auth_id);
        self.send_device_id_sync(conn_id);
        info!(auth_id, "auth manager: bootstrapped inbound connection");
        Some(auth_id)
    }

    fn handle_fsm_data(&self, conn_id: ConnId, header: Header, payload: &[u8]) {
        let Some(auth_id) = self.resolve_or_bootstrap(conn_id) else { return };

        if header.module == wire::module::TRUST_ENGINE {
            if let Err(e) = self.fsm.process_dev_id_data(auth_id, payload) {
                warn!(auth_id, error = %e, "auth manager: rejecting malformed SyncDeviceId frame");
            }
            return;
        }

        match self.fsm.process_auth_data(auth_id, payload) {
            Ok(progress) => {
                if let Some(bytes) = progress.send {
                    self.send_auth_sdk(conn_id, &bytes);
                }
            }
            Err(e) => {
                warn!(auth_id, error = %e, "auth manager: handshake step failed, dropping connection");
                self.connection_manager.disconnect(conn_id);
            }
        }
    }

    fn handle_generic_data(&self, conn_id: ConnId, header: Header, payload: &[u8]) {
        let auth_id = self.conn_index.lock().unwrap().get(&conn_id).copied();
        match auth_id {
            Some(auth_id) => {
                if let Some(cb) = self.callbacks.lock().unwrap().clone() {
                    cb.on_data_received(auth_id, header.module, header.flag, payload);
                }
            }
            None => warn!(module = header.module, "auth manager: dropping packet for unrecognized connection"),
        }
    }

    fn handle_disconnected(&self, conn_id: ConnId) {
        self.router.dispatch_disconnect(conn_id);
        self.fsm.on_connection_closed(conn_id);
        if let Some(auth_id) = self.conn_index.lock().unwrap().remove(&conn_id) {
            self.slots.lock().unwrap().remove(&auth_id);
        }
    }

    fn on_fsm_auth_done(&self, auth_seq: u64, request_id: i64, _conn_id: ConnId, peer: DeviceInfo, outcome: HiChainOutcome) {
        let auth_id = auth_seq;
        let peer_device_id = peer.device_id.clone();
        if let Some(slot) = self.slots.lock().unwrap().get_mut(&auth_id) {
            slot.has_auth_passed = true;
            slot.last_active_time = now_millis();
            slot.conn_info.peer_device_id = peer_device_id.clone();
            slot.peer_info = Some(peer);
        }
        if let Err(e) = self.keystore.set(auth_id, outcome.session_key) {
            warn!(auth_id, error = %e, "auth manager: failed to persist negotiated session key");
        }
        self.device_info.pin_peer_key(&outcome.peer_auth_id, outcome.peer_verifying_key);
        if let Some(cb) = self.callbacks.lock().unwrap().clone() {
            cb.on_conn_opened(request_id, auth_id);
        }
    }

    fn on_fsm_auth_failed(&self, auth_seq: u64, request_id: i64, conn_id: ConnId, reason: i32) {
        let auth_id = auth_seq;
        if let Some(slot) = self.slots.lock().unwrap().remove(&auth_id) {
            self.conn_index.lock().unwrap().remove(&slot.conn_id);
        }
        self.connection_manager.disconnect(conn_id);
        if let Some(cb) = self.callbacks.lock().unwrap().clone() {
            cb.on_conn_open_failed(request_id, reason);
        }
    }
}

/// Routes `AUTH_SDK`/`TRUST_ENGINE` traffic into the Auth-Session FSM.
struct FsmChannelAdapter {
    manager: Weak<AuthManager>,
}

impl ChannelListener for FsmChannelAdapter {
    fn on_data_received(&self, conn_id: ConnId, header: Header, payload: &[u8]) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_fsm_data(conn_id, header, payload);
        }
    }

    fn on_disconnected(&self, _conn_id: ConnId) {
        // Connection teardown is driven once from `ConnectionAdapter`
        // (spec §3's "connection handle removal cascades"), not from every
        // module listener the router happens to fan the event out to.
    }
}

/// Routes every other module's traffic up to the embedding application's
/// own `on_data_received`.
struct GenericChannelAdapter {
    manager: Weak<AuthManager>,
}

impl ChannelListener for GenericChannelAdapter {
    fn on_data_received(&self, conn_id: ConnId, header: Header, payload: &[u8]) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_generic_data(conn_id, header, payload);
        }
    }

    fn on_disconnected(&self, _conn_id: ConnId) {}
}

/// Bridges [`ConnectionManager`]'s socket-level events into the router and
/// the façade's own bookkeeping.
struct ConnectionAdapter {
    manager: Weak<AuthManager>,
    router: Arc<ChannelRouter>,
}

impl ConnectionCallbacks for ConnectionAdapter {
    fn on_connected(&self, _conn_id: ConnId, _peer_addr: SocketAddr, _is_server: bool) {
        // Client-role slots are created synchronously by `open_connection`
        // right after `dial()` returns; server-role slots are created
        // lazily on the first `AUTH_SDK`/`TRUST_ENGINE` byte (spec §4.7), so
        // there is nothing to do here for either role.
    }

    fn on_disconnected(&self, conn_id: ConnId) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_disconnected(conn_id);
        }
    }

    fn on_data_received(&self, conn_id: ConnId, header: Header, payload: &[u8]) {
        self.router.dispatch(conn_id, header, payload);
    }
}

/// Bridges [`AuthSessionFsm`]'s terminal-state callbacks back into the
/// façade's slot table and the embedding application's `AuthManagerCallbacks`.
struct FsmCallbackAdapter {
    manager: Weak<AuthManager>,
}

impl AuthSessionCallbacks for FsmCallbackAdapter {
    fn on_auth_done(&self, auth_seq: u64, request_id: i64, conn_id: ConnId, peer: DeviceInfo, outcome: HiChainOutcome) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_fsm_auth_done(auth_seq, request_id, conn_id, peer, outcome);
        }
    }

    fn on_auth_failed(&self, auth_seq: u64, request_id: i64, conn_id: ConnId, reason: i32) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_fsm_auth_failed(auth_seq, request_id, conn_id, reason);
        }
    }
}
