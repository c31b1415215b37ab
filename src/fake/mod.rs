//! In-memory stand-ins for the platform surfaces (adapter, permission
//! launcher, rationale prompt, HID connector), driven entirely by the
//! caller. Useful for testing workflows without a real Bluetooth stack.

mod platform;

pub use platform::{AdapterCall, FakeAdapter, FakeHid, FakeLauncher, FakeRationale};

use std::str::FromStr;

use crate::{Address, DeviceHandle, ScannedDevice};

/// Builds a `ScannedDevice` from literals. Panics on a malformed address,
/// so only suitable for fixtures.
pub fn fake_device(name: &str, address: &str, handle: u32) -> ScannedDevice {
    ScannedDevice { name: name.to_string(),
                    address: Address::from_str(address).unwrap(),
                    handle: DeviceHandle(handle) }
}
