/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Local device identity (spec §4.5's "device-id provider"): the stable
//! fields the Auth-Session FSM exchanges during `SyncDeviceId`, and the seam
//! an embedding application uses to supply them.

use ed25519_dalek::{SigningKey, VerifyingKey};

/// The identity fields carried in the `SyncDeviceId` frame. `udid` and
/// `uuid` are both stable identifiers of this device; the protocol carries
/// both because dsoftbus's upstream device model distinguishes a
/// hardware-rooted UDID from an account-scoped UUID, and a peer comparing
/// identity must see the same pair it saw on previous sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub udid: String,
    pub uuid: String,
}

/// Supplies this process's local [`DeviceInfo`] and long-term ED25519
/// signing key. An embedding application implements this once at startup;
/// everything above [`crate::hichain`] treats it as the sole source of
/// identity.
pub trait DeviceInfoProvider: Send + Sync {
    fn local_device_info(&self) -> DeviceInfo;
    fn signing_key(&self) -> SigningKey;

    /// Look up the long-term ED25519 verifying key previously recorded for a
    /// peer device, if this device has ever completed a group join with it.
    /// Returning `None` means "treat as first contact" — the exchange step
    /// of spec §4.6 step 10 then trusts the key the peer presents and the
    /// caller is responsible for pinning it afterward (see
    /// [`crate::group_store::GroupStore`]).
    fn known_peer_key(&self, peer_device_id: &str) -> Option<VerifyingKey>;

    /// Pin a peer's long-term ED25519 key into whatever key cache backs
    /// [`Self::known_peer_key`], keyed by the peer's `authId` (spec §4.6 step
    /// 10, final step: "persist the client public key into the key cache
    /// keyed by its peerAuthId"). Called once a handshake completes. Default
    /// no-op so an embedder that doesn't care about long-term pinning (e.g.
    /// always returning `None` from `known_peer_key`) isn't forced to
    /// implement storage it never reads back.
    fn pin_peer_key(&self, _peer_auth_id: &str, _key: VerifyingKey) {}

    /// This device's `(versionMajor, versionMinor)`, reported through
    /// `AuthManager::GetVersion` (spec §4.7). Defaults to `(1, 0)` since most
    /// embedders never need more than one protocol generation in flight.
    fn version(&self) -> (u32, u32) {
        (1, 0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rand_core::OsRng;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct StaticDeviceInfoProvider {
        info: DeviceInfo,
        key: SigningKey,
        known_peers: Mutex<HashMap<String, VerifyingKey>>,
    }

    impl StaticDeviceInfoProvider {
        pub fn new(device_id: &str) -> Self {
            Self {
                info: DeviceInfo {
                    device_id: device_id.to_string(),
                    udid: format!("udid-{device_id}"),
                    uuid: format!("uuid-{device_id}"),
                },
                key: SigningKey::generate(&mut OsRng),
                known_peers: Mutex::new(HashMap::new()),
            }
        }

        pub fn pin_peer(&self, peer_device_id: &str, key: VerifyingKey) {
            self.known_peers.lock().unwrap().insert(peer_device_id.to_string(), key);
        }
    }

    impl DeviceInfoProvider for StaticDeviceInfoProvider {
        fn local_device_info(&self) -> DeviceInfo {
            self.info.clone()
        }

        fn signing_key(&self) -> SigningKey {
            self.key.clone()
        }

        fn known_peer_key(&self, peer_device_id: &str) -> Option<VerifyingKey> {
            self.known_peers.lock().unwrap().get(peer_device_id).copied()
        }

        fn pin_peer_key(&self, peer_auth_id: &str, key: VerifyingKey) {
            self.pin_peer(peer_auth_id, key);
        }
    }
}
