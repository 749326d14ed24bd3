/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The per-peer Auth-Session FSM (spec §4.5) and its context store.

pub mod context;
pub mod fsm;

pub use context::PinProvider;
pub use fsm::{AuthSession, AuthSessionState};
