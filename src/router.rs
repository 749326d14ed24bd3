/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The channel router (spec §4.3): dispatches decoded packets to whichever
//! listener registered for the packet's module id, and fans disconnects out
//! to every registered listener regardless of module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::ConnId;
use crate::wire::Header;

/// Registered against one module id (spec §3's `TRUST_ENGINE`, `AUTH_SDK`,
/// etc). [`ChannelRouter`] holds at most one listener per module — a second
/// `register` for the same module id replaces the first, matching the
/// "last registration wins" behavior `RegisterChannelListener` has upstream.
pub trait ChannelListener: Send + Sync {
    fn on_data_received(&self, conn_id: ConnId, header: Header, payload: &[u8]);
    fn on_disconnected(&self, conn_id: ConnId);
}

pub struct ChannelRouter {
    listeners: Mutex<HashMap<i32, Arc<dyn ChannelListener>>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self { listeners: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, module: i32, listener: Arc<dyn ChannelListener>) {
        self.listeners.lock().unwrap().insert(module, listener);
    }

    pub fn unregister(&self, module: i32) {
        self.listeners.lock().unwrap().remove(&module);
    }

    /// Route one decoded packet to its module's listener, if any is
    /// registered. Packets for unregistered modules are dropped silently —
    /// there is no module-agnostic fallback, matching spec §4.3's routing
    /// table semantics.
    pub fn dispatch(&self, conn_id: ConnId, header: Header, payload: &[u8]) {
        let listener = self.listeners.lock().unwrap().get(&header.module).cloned();
        if let Some(listener) = listener {
            listener.on_data_received(conn_id, header, payload);
        }
    }

    /// Fan a disconnect out to every registered module listener: a dropped
    /// TCP connection can be mid-handshake on several modules at once (e.g.
    /// `AUTH_SDK` and `AUTH_CHANNEL` simultaneously), and each one needs the
    /// chance to tear its own session state down.
    pub fn dispatch_disconnect(&self, conn_id: ConnId) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener.on_disconnected(conn_id);
        }
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnType;
    use crate::wire::module;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        received: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl ChannelListener for Counter {
        fn on_data_received(&self, _conn_id: ConnId, _header: Header, _payload: &[u8]) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self, _conn_id: ConnId) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_only_reaches_the_registered_module() {
        let router = ChannelRouter::new();
        let sdk = Arc::new(Counter { received: AtomicUsize::new(0), disconnected: AtomicUsize::new(0) });
        let channel = Arc::new(Counter { received: AtomicUsize::new(0), disconnected: AtomicUsize::new(0) });
        router.register(module::AUTH_SDK, sdk.clone());
        router.register(module::AUTH_CHANNEL, channel.clone());

        let conn_id = ConnId::new(ConnType::Wifi, 1);
        let header = Header::new(module::AUTH_SDK, 0, 0, 1);
        router.dispatch(conn_id, header, b"x");

        assert_eq!(sdk.received.load(Ordering::SeqCst), 1);
        assert_eq!(channel.received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_module_is_dropped_silently() {
        let router = ChannelRouter::new();
        let conn_id = ConnId::new(ConnType::Wifi, 1);
        let header = Header::new(module::META_AUTH, 0, 0, 1);
        // Must not panic even though nothing is registered for META_AUTH.
        router.dispatch(conn_id, header, b"x");
    }

    #[test]
    fn disconnect_fans_out_to_every_listener() {
        let router = ChannelRouter::new();
        let a = Arc::new(Counter { received: AtomicUsize::new(0), disconnected: AtomicUsize::new(0) });
        let b = Arc::new(Counter { received: AtomicUsize::new(0), disconnected: AtomicUsize::new(0) });
        router.register(module::AUTH_SDK, a.clone());
        router.register(module::AUTH_CHANNEL, b.clone());

        router.dispatch_disconnect(ConnId::new(ConnType::Wifi, 1));
        assert_eq!(a.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(b.disconnected.load(Ordering::SeqCst), 1);
    }
}
