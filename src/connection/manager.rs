/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The TCP connection manager (spec §4.2): accepts and dials plain TCP
//! sockets, runs one reader thread per socket, and feeds bytes through the
//! packet codec before handing decoded packets up to a [`ConnectionCallbacks`]
//! implementor. Fully synchronous and thread-per-connection, no async
//! runtime — this crate's sessions are short-lived handshakes, not
//! long-running streaming connections, so a thread per socket is cheap
//! enough and keeps the whole stack dependency-free of tokio.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::{Config, RECV_BUFFER_SIZE};
use crate::connection::{ConnId, ConnType, FdAllocator};
use crate::error::{AuthError, Result};
use crate::wire::{self, Header};

/// Upcalls the connection manager makes as socket events happen. Delivered
/// from whichever reader thread observed the event, after that thread's
/// internal locks have been released — a callback is free to call back into
/// the [`ConnectionManager`] (e.g. to `send` a reply) without deadlocking.
pub trait ConnectionCallbacks: Send + Sync {
    fn on_connected(&self, conn_id: ConnId, peer_addr: SocketAddr, is_server: bool);
    fn on_disconnected(&self, conn_id: ConnId);
    fn on_data_received(&self, conn_id: ConnId, header: Header, payload: &[u8]);
}

struct Socket {
    stream: Mutex<TcpStream>,
    alive: AtomicBool,
}

pub struct ConnectionManager {
    config: Config,
    sockets: Mutex<HashMap<ConnId, Arc<Socket>>>,
    fd_alloc: Mutex<FdAllocator>,
    callbacks: Mutex<Option<Arc<dyn ConnectionCallbacks>>>,
    listener_stop: Arc<AtomicBool>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            sockets: Mutex::new(HashMap::new()),
            fd_alloc: Mutex::new(FdAllocator::new()),
            callbacks: Mutex::new(None),
            listener_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn ConnectionCallbacks>) {
        *self.callbacks.lock().unwrap() = Some(callbacks);
    }

    /// Bind `addr` and spawn an accept loop. Each accepted socket gets its
    /// own reader thread, same as a dialled-out connection.
    pub fn start_listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let this = self.clone();
        let stop = self.listener_stop.clone();
        thread::spawn(move || {
            for incoming in listener.incoming() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match incoming {
                    Ok(stream) => this.adopt(stream, true),
                    Err(_) => continue,
                }
            }
        });
        Ok(local_addr)
    }

    pub fn stop_listen(&self) {
        self.listener_stop.store(true, Ordering::Release);
    }

    /// Dial out to `addr`, blocking up to [`Config::connect_timeout`]. Only
    /// `ConnType::Wifi` is actually implemented — the composite `ConnId`
    /// reserves bit patterns for the other four transports, but this plain-
    /// TCP manager has no backend for them, so dialing with anything else is
    /// rejected up front instead of silently opening a `Wifi` socket anyway.
    pub fn dial(self: &Arc<Self>, addr: SocketAddr, conn_type: ConnType) -> Result<ConnId> {
        if conn_type != ConnType::Wifi {
            return Err(AuthError::invalid_argument(format!("connection manager does not implement {conn_type:?}")));
        }
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                AuthError::Timeout
            } else {
                AuthError::Io(e)
            }
        })?;
        Ok(self.adopt(stream, false))
    }

    fn adopt(self: &Arc<Self>, stream: TcpStream, is_server: bool) -> ConnId {
        let peer_addr = stream.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        if let Some(period) = self.config.keepalive_period {
            // TcpStream has no portable keepalive-period setter in std;
            // socket2 would be the real answer but this crate keeps the
            // dependency surface aligned with what the rest of the workspace
            // already pulls in, so keepalive is a documented no-op on this
            // backend for now.
            let _ = period;
        }

        let fd = {
            let mut alloc = self.fd_alloc.lock().unwrap();
            if is_server {
                alloc.allocate_server()
            } else {
                alloc.allocate_client()
            }
        };
        let conn_id = ConnId::new(ConnType::Wifi, fd);

        let reader_stream = stream.try_clone().expect("cloning a live TcpStream handle cannot fail");
        let socket = Arc::new(Socket { stream: Mutex::new(stream), alive: AtomicBool::new(true) });
        self.sockets.lock().unwrap().insert(conn_id, socket.clone());

        if let Some(cb) = self.callbacks.lock().unwrap().clone() {
            cb.on_connected(conn_id, peer_addr, is_server);
        }

        let this = self.clone();
        thread::spawn(move || this.reader_loop(conn_id, socket, reader_stream));

        conn_id
    }

    fn reader_loop(self: Arc<Self>, conn_id: ConnId, socket: Arc<Socket>, mut reader: TcpStream) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut used = 0usize;

        'outer: loop {
            if used == buf.len() {
                // Ring buffer is full and still didn't yield a complete
                // packet: either a genuinely oversize frame (already caught
                // inside feed_and_extract) or a buffer too small for a
                // legitimate packet boundary. Either way, this connection
                // cannot make progress.
                break;
            }
            let n = match reader.read(&mut buf[used..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            used += n;

            let callbacks = self.callbacks.lock().unwrap().clone();
            let consumed = wire::feed_and_extract(&buf, used, |header, payload| {
                if let Some(cb) = &callbacks {
                    cb.on_data_received(conn_id, header, payload);
                }
            });
            match consumed {
                Ok(consumed) => {
                    buf.copy_within(consumed..used, 0);
                    used -= consumed;
                }
                Err(_) => break 'outer,
            }
        }

        socket.alive.store(false, Ordering::Release);
        self.sockets.lock().unwrap().remove(&conn_id);
        if let Some(cb) = self.callbacks.lock().unwrap().clone() {
            cb.on_disconnected(conn_id);
        }
    }

    /// Frame `payload` under `module` and write it to `conn_id`'s socket,
    /// with `flag` set to 0. See [`Self::send_with_flag`] for callers (e.g.
    /// `PostTransData`, spec §4.7) that need to set it themselves.
    pub fn send(&self, conn_id: ConnId, module: i32, seq: i64, payload: &[u8]) -> Result<()> {
        self.send_with_flag(conn_id, module, seq, 0, payload)
    }

    pub fn send_with_flag(&self, conn_id: ConnId, module: i32, seq: i64, flag: i32, payload: &[u8]) -> Result<()> {
        let socket = {
            let sockets = self.sockets.lock().unwrap();
            sockets.get(&conn_id).cloned().ok_or_else(|| AuthError::not_found(format!("no such connection {}", conn_id.0)))?
        };
        let header = Header::new(module, seq, flag, payload.len() as u32);
        let framed = wire::pack(&header, payload)?;
        let mut stream = socket.stream.lock().unwrap();
        stream.write_all(&framed)?;
        Ok(())
    }

    pub fn disconnect(&self, conn_id: ConnId) {
        if let Some(socket) = self.sockets.lock().unwrap().remove(&conn_id) {
            socket.alive.store(false, Ordering::Release);
            let _ = socket.stream.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn peer_addr(&self, conn_id: ConnId) -> Result<SocketAddr> {
        let sockets = self.sockets.lock().unwrap();
        let socket = sockets.get(&conn_id).ok_or_else(|| AuthError::not_found(format!("no such connection {}", conn_id.0)))?;
        Ok(socket.stream.lock().unwrap().peer_addr()?)
    }

    pub fn is_connected(&self, conn_id: ConnId) -> bool {
        self.sockets
            .lock()
            .unwrap()
            .get(&conn_id)
            .map(|s| s.alive.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::module;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Observer {
        tx: Mutex<mpsc::Sender<(ConnId, Vec<u8>)>>,
    }

    impl ConnectionCallbacks for Observer {
        fn on_connected(&self, _conn_id: ConnId, _peer_addr: SocketAddr, _is_server: bool) {}
        fn on_disconnected(&self, _conn_id: ConnId) {}
        fn on_data_received(&self, conn_id: ConnId, _header: Header, payload: &[u8]) {
            let _ = self.tx.lock().unwrap().send((conn_id, payload.to_vec()));
        }
    }

    #[test]
    fn dial_and_exchange_one_packet() {
        let server = ConnectionManager::new(Config::default());
        let client = ConnectionManager::new(Config::default());

        let (tx, rx) = mpsc::channel();
        server.set_callbacks(Arc::new(Observer { tx: Mutex::new(tx) }));

        let addr = server.start_listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_conn = client.dial(addr, ConnType::Wifi).unwrap();

        // Give the server's accept thread a moment to register the socket.
        thread::sleep(Duration::from_millis(50));

        client.send(client_conn, module::AUTH_SDK, 1, b"hello").unwrap();

        let (_, payload) = rx.recv_timeout(Duration::from_secs(2)).expect("server should receive the packet");
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn disconnect_tears_down_the_socket() {
        let server = ConnectionManager::new(Config::default());
        let client = ConnectionManager::new(Config::default());
        let addr = server.start_listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_conn = client.dial(addr, ConnType::Wifi).unwrap();
        assert!(client.is_connected(client_conn));
        client.disconnect(client_conn);
        assert!(!client.is_connected(client_conn));
    }

    #[test]
    fn dialing_a_non_wifi_conn_type_is_rejected() {
        let client = ConnectionManager::new(Config::default());
        let result = client.dial("127.0.0.1:1".parse().unwrap(), ConnType::Ble);
        assert!(matches!(result, Err(AuthError::InvalidArgument(_))));
    }
}
