/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Connection handles (spec §3 / §4.2): a transport-tagged composite id and
//! the fd allocator that keeps server-accepted and client-dialled sockets in
//! disjoint ranges.

pub mod manager;

pub use manager::ConnectionManager;

/// Transport carrying a connection. Only `Wifi` is actually implemented — it
/// is what this crate's plain-TCP [`ConnectionManager`] tags its sockets
/// with — the others exist because the composite `ConnId` must reserve their
/// bit pattern even though this crate only ever drives one transport itself.
/// There is deliberately no zero-valued variant: spec's `connType` is always
/// one of 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ConnType {
    Wifi = 1,
    Br = 2,
    Ble = 3,
    P2p = 4,
    EnhancedP2p = 5,
}

/// The composite connection handle: `(connType << 32) | fd`, matching the
/// 64-bit opaque handle spec §3 hands applications. The upper 32 bits name
/// the transport, the lower 32 the per-transport file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub i64);

impl ConnId {
    pub fn new(conn_type: ConnType, fd: u32) -> Self {
        ConnId(((conn_type as i64) << 32) | fd as i64)
    }

    pub fn conn_type(&self) -> i64 {
        self.0 >> 32
    }

    pub fn fd(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

/// fd ranges are partitioned so a handle's origin (who dialled whom) is
/// recoverable from the fd alone, without consulting any other state: the
/// first 1000 values are reserved for server-accepted sockets, the next
/// 1000 for sockets this process dialled out itself.
const SERVER_FD_BASE: u32 = 0;
const SERVER_FD_COUNT: u32 = 1000;
const CLIENT_FD_BASE: u32 = 1000;
const CLIENT_FD_COUNT: u32 = 1000;

/// Hands out fds from the server- or client-accepted range, wrapping back to
/// the start of its range once exhausted. Wrapping risks handing out an fd
/// still in use by a long-lived connection under sustained churn; the
/// connection manager guards against that by checking the target slot is
/// actually free before reusing it.
pub struct FdAllocator {
    next_server: u32,
    next_client: u32,
}

impl FdAllocator {
    pub fn new() -> Self {
        Self { next_server: SERVER_FD_BASE, next_client: CLIENT_FD_BASE }
    }

    pub fn allocate_server(&mut self) -> u32 {
        let fd = self.next_server;
        self.next_server = SERVER_FD_BASE + (self.next_server - SERVER_FD_BASE + 1) % SERVER_FD_COUNT;
        fd
    }

    pub fn allocate_client(&mut self) -> u32 {
        let fd = self.next_client;
        self.next_client = CLIENT_FD_BASE + (self.next_client - CLIENT_FD_BASE + 1) % CLIENT_FD_COUNT;
        fd
    }
}

impl Default for FdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_id_round_trips_through_bit_packing() {
        let id = ConnId::new(ConnType::Wifi, 42);
        assert_eq!(id.conn_type(), ConnType::Wifi as i64);
        assert_eq!(id.fd(), 42);
    }

    #[test]
    fn server_and_client_fds_stay_in_disjoint_ranges() {
        let mut alloc = FdAllocator::new();
        let server_fd = alloc.allocate_server();
        let client_fd = alloc.allocate_client();
        assert!(server_fd < SERVER_FD_COUNT);
        assert!((CLIENT_FD_BASE..CLIENT_FD_BASE + CLIENT_FD_COUNT).contains(&client_fd));
    }

    #[test]
    fn server_fd_allocator_wraps() {
        let mut alloc = FdAllocator::new();
        for _ in 0..SERVER_FD_COUNT {
            alloc.allocate_server();
        }
        assert_eq!(alloc.next_server, SERVER_FD_BASE);
    }
}
