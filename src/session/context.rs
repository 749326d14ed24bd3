/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The PIN-supply seam (spec §4.5) an embedding application hooks into.

/// Supplies the PIN a session should use, given the remote peer's device id.
/// Sessions look this up once, at the point the PAKE handshake starts — a
/// provider that can't produce a PIN yet (e.g. because it's waiting on UI
/// input) should block inside this call rather than returning a guess, since
/// the session has nothing meaningful to fall back to.
pub trait PinProvider: Send + Sync {
    fn pin_for(&self, peer_device_id: &str) -> String;
}

/// A [`PinProvider`] that always returns the same fixed PIN. Used when no
/// provider is registered (see DESIGN.md Open Question OQ-3) and in tests.
pub struct FixedPinProvider(pub String);

impl PinProvider for FixedPinProvider {
    fn pin_for(&self, _peer_device_id: &str) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_pin_provider_always_returns_the_same_pin() {
        let provider = FixedPinProvider("123456".to_string());
        assert_eq!(provider.pin_for("device-a"), "123456");
        assert_eq!(provider.pin_for("device-b"), "123456");
    }
}
