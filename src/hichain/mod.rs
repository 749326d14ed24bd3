/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The PAKE-V1 handshake handle (spec §4.6): drives the SPEKE key agreement
//! and the signed identity exchange that rides on top of it, message by
//! message, independent of the transport or FSM state machine driving it.

pub mod handle;
pub mod message;

pub use handle::{HiChainHandle, HiChainOutcome};
pub use message::HiChainMessage;
