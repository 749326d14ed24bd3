/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Enumerated configuration knobs (spec §6). Most of these are fixed wire
//! constants rather than runtime-tunable; only the connect timeout and
//! keepalive period are meant to be overridden by an embedding application.

use std::time::Duration;

/// Default PIN used when no [`crate::session::PinProvider`] is registered.
/// A development convenience only — see DESIGN.md Open Question OQ-3.
pub const DEFAULT_PIN: &str = "888888";

/// Fixed per spec §6: the reader task's ring buffer size.
pub const RECV_BUFFER_SIZE: usize = 1536;

/// Fixed per spec §6 / §3: max framed payload length.
pub const MAX_PACKET_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP connect timeout. Default 5s.
    pub connect_timeout: Duration,
    /// TCP keepalive probe period. `None` disables keepalive. Default 10 min.
    pub keepalive_period: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_period: Some(Duration::from_secs(10 * 60)),
        }
    }
}
