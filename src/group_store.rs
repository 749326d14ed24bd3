/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The Group / Trust Store (spec §4.8): an in-memory record of which devices
//! have joined which groups, plus synchronous change listeners. This is a
//! store, not a membership-protocol implementation — spec.md §1's
//! Non-goals exclude group membership semantics beyond what the PAKE-V1
//! exchange itself needs (pinning a peer's long-term key once a group join
//! has happened).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupType {
    /// Any device holding the group's PIN may join.
    PinBased,
    /// Membership requires an existing member's approval (not itself
    /// modeled here; this crate only records the resulting membership).
    IdentityBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupVisibility {
    Public,
    Private,
}

/// One joined peer device's record within a group (spec §4.8's
/// `deviceId -> DeviceMember`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMember {
    pub device_id: String,
    pub udid: String,
    pub auth_id: u64,
    pub join_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub group_type: GroupType,
    pub visibility: GroupVisibility,
    pub owner_device_id: String,
    members: HashMap<String, DeviceMember>,
}

impl Group {
    pub fn members(&self) -> impl Iterator<Item = &DeviceMember> {
        self.members.values()
    }
}

/// Fired synchronously on every group/membership mutation (spec §4.8).
/// Listeners are called with the store's lock already released, same
/// policy as [`crate::keystore::KeyStoreListener`].
pub trait GroupChangeListener: Send + Sync {
    fn on_group_created(&self, _group: &Group) {}
    fn on_group_deleted(&self, _group_id: &str) {}
    fn on_device_bound(&self, _group_id: &str, _member: &DeviceMember) {}
    fn on_device_unbound(&self, _group_id: &str, _device_id: &str) {}
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct GroupStore {
    groups: Mutex<HashMap<String, Group>>,
    listeners: Mutex<Vec<Arc<dyn GroupChangeListener>>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self { groups: Mutex::new(HashMap::new()), listeners: Mutex::new(Vec::new()) }
    }

    pub fn add_listener(&self, listener: Arc<dyn GroupChangeListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn GroupChangeListener>> {
        self.listeners.lock().unwrap().clone()
    }

    pub fn create_group(
        &self,
        group_id: &str,
        group_type: GroupType,
        visibility: GroupVisibility,
        owner_device_id: &str,
    ) -> Result<()> {
        let group = {
            let mut groups = self.groups.lock().unwrap();
            if groups.contains_key(group_id) {
                return Err(AuthError::already_exists(format!("group {group_id} already exists")));
            }
            let group = Group {
                group_id: group_id.to_string(),
                group_type,
                visibility,
                owner_device_id: owner_device_id.to_string(),
                members: HashMap::new(),
            };
            groups.insert(group_id.to_string(), group.clone());
            group
        };
        for l in self.listeners_snapshot() {
            l.on_group_created(&group);
        }
        Ok(())
    }

    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        {
            let mut groups = self.groups.lock().unwrap();
            groups
                .remove(group_id)
                .ok_or_else(|| AuthError::not_found(format!("no such group {group_id}")))?;
        }
        for l in self.listeners_snapshot() {
            l.on_group_deleted(group_id);
        }
        Ok(())
    }

    pub fn add_member_to_group(&self, group_id: &str, device_id: &str, udid: &str, auth_id: u64) -> Result<()> {
        let member = DeviceMember { device_id: device_id.to_string(), udid: udid.to_string(), auth_id, join_time: now_millis() };
        {
            let mut groups = self.groups.lock().unwrap();
            let group = groups.get_mut(group_id).ok_or_else(|| AuthError::not_found(format!("no such group {group_id}")))?;
            group.members.insert(device_id.to_string(), member.clone());
        }
        for l in self.listeners_snapshot() {
            l.on_device_bound(group_id, &member);
        }
        Ok(())
    }

    pub fn delete_member_from_group(&self, group_id: &str, device_id: &str) -> Result<()> {
        {
            let mut groups = self.groups.lock().unwrap();
            let group = groups.get_mut(group_id).ok_or_else(|| AuthError::not_found(format!("no such group {group_id}")))?;
            group
                .members
                .remove(device_id)
                .ok_or_else(|| AuthError::not_found(format!("device {device_id} is not in group {group_id}")))?;
        }
        for l in self.listeners_snapshot() {
            l.on_device_unbound(group_id, device_id);
        }
        Ok(())
    }

    pub fn get_group_info_by_id(&self, group_id: &str) -> Option<Group> {
        self.groups.lock().unwrap().get(group_id).cloned()
    }

    pub fn get_joined_groups(&self, group_type: GroupType) -> Vec<Group> {
        self.groups.lock().unwrap().values().filter(|g| g.group_type == group_type).cloned().collect()
    }

    /// Every group `peer_device_id` is currently a member of.
    pub fn get_related_groups(&self, peer_device_id: &str) -> Vec<Group> {
        self.groups
            .lock()
            .unwrap()
            .values()
            .filter(|g| g.members.contains_key(peer_device_id))
            .cloned()
            .collect()
    }

    pub fn get_trusted_devices(&self, group_id: &str) -> Vec<DeviceMember> {
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .map(|g| g.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_device_in_group(&self, group_id: &str, device_id: &str) -> bool {
        self.groups.lock().unwrap().get(group_id).map(|g| g.members.contains_key(device_id)).unwrap_or(false)
    }
}

impl Default for GroupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        created: AtomicUsize,
        bound: AtomicUsize,
        unbound: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl GroupChangeListener for Counting {
        fn on_group_created(&self, _group: &Group) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn on_group_deleted(&self, _group_id: &str) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_device_bound(&self, _group_id: &str, _member: &DeviceMember) {
            self.bound.fetch_add(1, Ordering::SeqCst);
        }
        fn on_device_unbound(&self, _group_id: &str, _device_id: &str) {
            self.unbound.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn create_add_remove_delete_round_trip() {
        let store = GroupStore::new();
        store.create_group("g1", GroupType::PinBased, GroupVisibility::Private, "owner-dev").unwrap();
        assert!(store.create_group("g1", GroupType::PinBased, GroupVisibility::Private, "owner-dev").is_err());

        store.add_member_to_group("g1", "dev-a", "udid-a", 7).unwrap();
        assert!(store.is_device_in_group("g1", "dev-a"));
        assert_eq!(store.get_trusted_devices("g1").len(), 1);
        assert_eq!(store.get_related_groups("dev-a").len(), 1);

        store.delete_member_from_group("g1", "dev-a").unwrap();
        assert!(!store.is_device_in_group("g1", "dev-a"));

        store.delete_group("g1").unwrap();
        assert!(store.get_group_info_by_id("g1").is_none());
    }

    #[test]
    fn listeners_fire_synchronously_for_every_mutation() {
        let store = GroupStore::new();
        let counter = Arc::new(Counting {
            created: AtomicUsize::new(0),
            bound: AtomicUsize::new(0),
            unbound: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
        });
        store.add_listener(counter.clone());

        store.create_group("g1", GroupType::PinBased, GroupVisibility::Public, "owner").unwrap();
        store.add_member_to_group("g1", "dev-a", "udid-a", 1).unwrap();
        store.delete_member_from_group("g1", "dev-a").unwrap();
        store.delete_group("g1").unwrap();

        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        assert_eq!(counter.bound.load(Ordering::SeqCst), 1);
        assert_eq!(counter.unbound.load(Ordering::SeqCst), 1);
        assert_eq!(counter.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operations_on_unknown_group_are_not_found() {
        let store = GroupStore::new();
        assert!(store.add_member_to_group("missing", "dev-a", "udid-a", 1).is_err());
        assert!(store.delete_member_from_group("missing", "dev-a").is_err());
        assert!(store.delete_group("missing").is_err());
    }
}
