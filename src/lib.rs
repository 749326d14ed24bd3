/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Mutual device authentication for a peer-to-peer bus.
//!
//! Three layers, bottom to top:
//! - [`wire`]: a length-prefixed, module-multiplexed packet codec.
//! - [`connection`] + [`router`]: TCP connection handles and module dispatch.
//! - [`session`] + [`hichain`]: the per-peer auth state machine and the
//!   PAKE-V1 EC-SPEKE handshake that turns a short PIN into a shared session
//!   key, followed by an ED25519 long-term identity exchange.
//!
//! [`auth_manager::AuthManager`] is the public façade applications use.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod device_info;
pub mod error;
pub mod group_store;
pub mod hichain;
pub mod keystore;
pub mod router;
pub mod session;
pub mod wire;

mod auth_manager;

pub use auth_manager::{AuthManager, AuthManagerCallbacks, ConnectionInfo, OpenConnectionError};
pub use config::Config;
pub use error::{AuthError, Result};
