/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The session-key store (spec §4.4): per-`authId`, densely-indexed session
//! keys surviving process restarts through an application-supplied
//! [`Persistor`].
//!
//! Keys are stored encrypted at rest. Encryption uses a store-wide master
//! key held only in memory — this crate never decides where that master key
//! itself comes from (that's a platform keystore's job), it only defines the
//! on-disk framing around it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::crypto::aead;
use crate::error::{AuthError, Result};

/// One session key plus the monotonic index it was installed at. Indices for
/// a given `authId` are assigned by [`SessionKeyStore::set`] in strictly
/// increasing order starting at 0 and are never reused or renumbered —
/// removing an entry leaves a gap rather than shifting later entries down
/// (spec §8 scenario 5: after `Remove(7, 0)`, `Get(7, 0)` is `NotFound`, not
/// whatever used to be at index 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyEntry {
    pub index: u32,
    pub key: [u8; 16],
}

/// Durable storage for one `authId`'s encrypted key blob. An embedding
/// application backs this with a file, a database row, or platform secure
/// storage; the store itself only ever sees ciphertext.
pub trait Persistor: Send + Sync {
    fn save(&self, auth_id: u64, blob: &[u8]) -> Result<()>;
    fn load(&self, auth_id: u64) -> Result<Option<Vec<u8>>>;
    fn delete(&self, auth_id: u64) -> Result<()>;
}

/// Notified whenever an `authId`'s key list changes. Registered listeners are
/// called synchronously and in registration order, with the store's lock
/// already released — a listener that itself calls back into the store
/// cannot deadlock on it.
pub trait KeyStoreListener: Send + Sync {
    fn on_keys_changed(&self, auth_id: u64, keys: &[SessionKeyEntry]);
}

/// One `authId`'s key list plus the next index [`SessionKeyStore::set`] will
/// assign. Tracked separately from `entries.len()` so a removed index is
/// never handed back out to a later `set`.
#[derive(Default)]
struct AuthIdKeys {
    entries: Vec<SessionKeyEntry>,
    next_index: u32,
}

struct Inner {
    by_auth_id: HashMap<u64, AuthIdKeys>,
    listeners: Vec<Arc<dyn KeyStoreListener>>,
}

pub struct SessionKeyStore {
    inner: Mutex<Inner>,
    persistor: Option<Arc<dyn Persistor>>,
    master_key: [u8; 16],
}

impl SessionKeyStore {
    pub fn new(persistor: Option<Arc<dyn Persistor>>, master_key: [u8; 16]) -> Self {
        Self {
            inner: Mutex::new(Inner { by_auth_id: HashMap::new(), listeners: Vec::new() }),
            persistor,
            master_key,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn KeyStoreListener>) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    /// Append `key` as a new entry for `auth_id`, returning the index it was
    /// assigned (`Set`, spec §4.4): 0 for the first key, then strictly
    /// increasing, regardless of how many earlier entries have since been
    /// removed.
    pub fn set(&self, auth_id: u64, key: [u8; 16]) -> Result<u32> {
        let (index, snapshot, listeners) = {
            let mut guard = self.inner.lock().unwrap();
            let slot = guard.by_auth_id.entry(auth_id).or_default();
            let index = slot.next_index;
            slot.next_index += 1;
            slot.entries.push(SessionKeyEntry { index, key });
            (index, slot.entries.clone(), guard.listeners.clone())
        };
        self.persist(auth_id, &snapshot)?;
        notify(&listeners, auth_id, &snapshot);
        Ok(index)
    }

    pub fn get(&self, auth_id: u64, index: u32) -> Option<SessionKeyEntry> {
        let guard = self.inner.lock().unwrap();
        guard.by_auth_id.get(&auth_id)?.entries.iter().find(|e| e.index == index).cloned()
    }

    /// The entry with the highest index still present (`GetLatest`, spec
    /// §4.4) — not necessarily the last one physically appended, since
    /// indices are never renumbered on removal but insertion order and index
    /// order do coincide in practice (indices only ever increase).
    pub fn get_latest(&self, auth_id: u64) -> Option<SessionKeyEntry> {
        let guard = self.inner.lock().unwrap();
        guard.by_auth_id.get(&auth_id)?.entries.iter().max_by_key(|e| e.index).cloned()
    }

    /// Remove exactly the entry at `index`. Unlike a dense array, the
    /// indices of any remaining entries are left untouched — spec §8
    /// scenario 5 requires `Get` at a just-removed index to come back
    /// `NotFound`, which a repacking remove would silently undo.
    pub fn remove(&self, auth_id: u64, index: u32) -> Result<()> {
        let (snapshot, listeners) = {
            let mut guard = self.inner.lock().unwrap();
            let slot = guard
                .by_auth_id
                .get_mut(&auth_id)
                .ok_or_else(|| AuthError::not_found(format!("no keys stored for auth id {auth_id}")))?;
            let pos = slot
                .entries
                .iter()
                .position(|e| e.index == index)
                .ok_or_else(|| AuthError::not_found(format!("no key at index {index} for auth id {auth_id}")))?;
            slot.entries.remove(pos);
            (slot.entries.clone(), guard.listeners.clone())
        };
        self.persist(auth_id, &snapshot)?;
        notify(&listeners, auth_id, &snapshot);
        Ok(())
    }

    pub fn remove_all(&self, auth_id: u64) -> Result<()> {
        let listeners = {
            let mut guard = self.inner.lock().unwrap();
            guard.by_auth_id.remove(&auth_id);
            guard.listeners.clone()
        };
        if let Some(p) = &self.persistor {
            p.delete(auth_id)?;
        }
        notify(&listeners, auth_id, &[]);
        Ok(())
    }

    /// Load an `authId`'s encrypted blob through the configured [`Persistor`]
    /// and decrypt it into the in-memory table. A no-op (not an error) if no
    /// persistor is configured or nothing has been saved yet.
    pub fn hydrate(&self, auth_id: u64) -> Result<()> {
        let Some(persistor) = &self.persistor else { return Ok(()) };
        let Some(blob) = persistor.load(auth_id)? else { return Ok(()) };
        let entries = decode_entries(&decrypt_blob(&self.master_key, auth_id, &blob)?)?;
        let next_index = entries.iter().map(|e| e.index).max().map(|m| m + 1).unwrap_or(0);
        self.inner.lock().unwrap().by_auth_id.insert(auth_id, AuthIdKeys { entries, next_index });
        Ok(())
    }

    /// Seal `plaintext` under the latest session key for `auth_id` (`Encrypt`,
    /// spec §4.4): `[index_be u32 | AES-GCM(ciphertext+tag)]`. The index
    /// prefix lets [`decrypt`](Self::decrypt) pick the right key generation
    /// back out even after a rekey.
    pub fn encrypt(&self, auth_id: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let entry = self
            .get_latest(auth_id)
            .ok_or_else(|| AuthError::not_found(format!("no session key for auth id {auth_id}")))?;
        let sealed = aead::seal(&entry.key, &[], plaintext)?;
        let mut out = Vec::with_capacity(4 + sealed.len());
        out.extend_from_slice(&entry.index.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Inverse of [`encrypt`](Self::encrypt): reads the big-endian index
    /// prefix, looks up the matching key generation for `auth_id`, and opens
    /// the remainder.
    pub fn decrypt(&self, auth_id: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 4 {
            return Err(AuthError::crypto("truncated session-key ciphertext"));
        }
        let index = u32::from_be_bytes(ciphertext[0..4].try_into().unwrap());
        let entry = self
            .get(auth_id, index)
            .ok_or_else(|| AuthError::not_found(format!("no key at index {index} for auth id {auth_id}")))?;
        aead::open(&entry.key, &[], &ciphertext[4..])
    }

    fn persist(&self, auth_id: u64, entries: &[SessionKeyEntry]) -> Result<()> {
        let Some(persistor) = &self.persistor else { return Ok(()) };
        let blob = encrypt_blob(&self.master_key, auth_id, &encode_entries(entries))?;
        persistor.save(auth_id, &blob)
    }
}

fn notify(listeners: &[Arc<dyn KeyStoreListener>], auth_id: u64, entries: &[SessionKeyEntry]) {
    for l in listeners {
        l.on_keys_changed(auth_id, entries);
    }
}

/// `[count: u32 LE][index: u32 LE][key: 16 bytes]...`
fn encode_entries(entries: &[SessionKeyEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * 20);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.index.to_le_bytes());
        out.extend_from_slice(&e.key);
    }
    out
}

fn decode_entries(buf: &[u8]) -> Result<Vec<SessionKeyEntry>> {
    if buf.len() < 4 {
        return Err(AuthError::crypto("truncated key-store record"));
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        if buf.len() < offset + 20 {
            return Err(AuthError::crypto("truncated key-store record"));
        }
        let index = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        let mut key = [0u8; 16];
        key.copy_from_slice(&buf[offset + 4..offset + 20]);
        out.push(SessionKeyEntry { index, key });
        offset += 20;
    }
    Ok(out)
}

fn encrypt_blob(master_key: &[u8; 16], auth_id: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    aead::seal(master_key, &auth_id.to_be_bytes(), plaintext)
}

fn decrypt_blob(master_key: &[u8; 16], auth_id: u64, sealed: &[u8]) -> Result<Vec<u8>> {
    aead::open(master_key, &auth_id.to_be_bytes(), sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;

    struct MemPersistor(RwLock<HashMap<u64, Vec<u8>>>);

    impl MemPersistor {
        fn new() -> Self {
            Self(RwLock::new(HashMap::new()))
        }
    }

    impl Persistor for MemPersistor {
        fn save(&self, auth_id: u64, blob: &[u8]) -> Result<()> {
            self.0.write().unwrap().insert(auth_id, blob.to_vec());
            Ok(())
        }
        fn load(&self, auth_id: u64) -> Result<Option<Vec<u8>>> {
            Ok(self.0.read().unwrap().get(&auth_id).cloned())
        }
        fn delete(&self, auth_id: u64) -> Result<()> {
            self.0.write().unwrap().remove(&auth_id);
            Ok(())
        }
    }

    #[test]
    fn set_then_get_latest() {
        let store = SessionKeyStore::new(None, [0u8; 16]);
        store.set(1, [1u8; 16]).unwrap();
        store.set(1, [2u8; 16]).unwrap();
        let latest = store.get_latest(1).unwrap();
        assert_eq!(latest.index, 1);
        assert_eq!(latest.key, [2u8; 16]);
    }

    #[test]
    fn remove_leaves_a_gap_without_renumbering() {
        let store = SessionKeyStore::new(None, [0u8; 16]);
        store.set(1, [1u8; 16]).unwrap();
        store.set(1, [2u8; 16]).unwrap();
        store.set(1, [3u8; 16]).unwrap();
        store.remove(1, 0).unwrap();
        assert!(store.get(1, 0).is_none());
        assert_eq!(store.get(1, 1).unwrap().key, [2u8; 16]);
        assert_eq!(store.get(1, 2).unwrap().key, [3u8; 16]);
        assert_eq!(store.get_latest(1).unwrap().key, [3u8; 16]);
    }

    #[test]
    fn index_is_never_reused_after_removal() {
        let store = SessionKeyStore::new(None, [0u8; 16]);
        assert_eq!(store.set(1, [1u8; 16]).unwrap(), 0);
        assert_eq!(store.set(1, [2u8; 16]).unwrap(), 1);
        store.remove(1, 1).unwrap();
        assert_eq!(store.set(1, [3u8; 16]).unwrap(), 2);
        assert!(store.get(1, 1).is_none());
    }

    #[test]
    fn persists_and_hydrates_round_trip() {
        let persistor = Arc::new(MemPersistor::new());
        let store = SessionKeyStore::new(Some(persistor.clone()), [9u8; 16]);
        store.set(1, [5u8; 16]).unwrap();

        let store2 = SessionKeyStore::new(Some(persistor), [9u8; 16]);
        store2.hydrate(1).unwrap();
        assert_eq!(store2.get_latest(1).unwrap().key, [5u8; 16]);
    }

    #[test]
    fn remove_all_clears_and_deletes() {
        let persistor = Arc::new(MemPersistor::new());
        let store = SessionKeyStore::new(Some(persistor.clone()), [1u8; 16]);
        store.set(1, [1u8; 16]).unwrap();
        store.remove_all(1).unwrap();
        assert!(store.get_latest(1).is_none());
        assert!(persistor.load(1).unwrap().is_none());
    }

    #[test]
    fn listener_is_notified_on_change() {
        struct Counter(Mutex<usize>);
        impl KeyStoreListener for Counter {
            fn on_keys_changed(&self, _auth_id: u64, _keys: &[SessionKeyEntry]) {
                *self.0.lock().unwrap() += 1;
            }
        }
        let store = SessionKeyStore::new(None, [0u8; 16]);
        let counter = Arc::new(Counter(Mutex::new(0)));
        store.add_listener(counter.clone());
        store.set(1, [1u8; 16]).unwrap();
        store.remove(1, 0).unwrap();
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }

    /// spec §8 scenario 5, reproduced verbatim against the `authId`-keyed API.
    #[test]
    fn session_key_store_round_trip_scenario() {
        let store = SessionKeyStore::new(None, [0u8; 16]);
        let k = [1u8; 16];
        let k2 = [2u8; 16];

        assert_eq!(store.set(7, k).unwrap(), 0);
        assert_eq!(store.set(7, k2).unwrap(), 1);
        assert_eq!(store.get_latest(7).unwrap().key, k2);
        assert_eq!(store.get(7, 0).unwrap().key, k);

        store.remove(7, 0).unwrap();
        assert!(store.get(7, 0).is_none());
        assert_eq!(store.get_latest(7).unwrap().key, k2);

        store.remove_all(7).unwrap();
        assert!(store.get_latest(7).is_none());
    }

    #[test]
    fn encrypt_decrypt_round_trip_uses_the_latest_key() {
        let store = SessionKeyStore::new(None, [0u8; 16]);
        store.set(1, [1u8; 16]).unwrap();
        let sealed = store.encrypt(1, b"application payload").unwrap();
        assert_eq!(u32::from_be_bytes(sealed[0..4].try_into().unwrap()), 0);
        let opened = store.decrypt(1, &sealed).unwrap();
        assert_eq!(opened, b"application payload");
    }

    #[test]
    fn decrypt_selects_the_key_generation_named_by_the_index_prefix() {
        let store = SessionKeyStore::new(None, [0u8; 16]);
        store.set(1, [1u8; 16]).unwrap();
        let sealed_gen0 = store.encrypt(1, b"first generation").unwrap();
        store.set(1, [2u8; 16]).unwrap();
        let sealed_gen1 = store.encrypt(1, b"second generation").unwrap();

        assert_eq!(store.decrypt(1, &sealed_gen0).unwrap(), b"first generation");
        assert_eq!(store.decrypt(1, &sealed_gen1).unwrap(), b"second generation");
    }
}
