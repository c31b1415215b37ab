use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod jobs;

pub mod permissions;

pub mod scan;

pub mod pairing;

pub mod session;

pub mod hid;

pub mod fake;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(pub(crate) u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}
impl MAC {
    /// The six address octets in transmission order (the order they appear
    /// in the colon-separated string form).
    pub fn octets(&self) -> [u8; 6] {
        let bytes = u64::to_le_bytes(self.0);
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]
    }
}

/// A stable identifier for a Bluetooth device.
///
/// The underlying hardware MAC address is directly exposed on platforms where
/// this is supported.
///
/// An address can be serialized/deserialized such that it's possible for
/// applications to save the address of a known Wiimote and later reconnect
/// to the same device without having to re-scan
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// XXX: should maybe return Result if made public somehow but we don't
// really want any allocations in the 'error' path considering that a valid
// address might not be a MAC address.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if s.contains(':') {
        let mut parts = ArrayVec::<_, 6>::new();
        for part in s.split(':') {
            if let Err(_e) = parts.try_push(part) {
                return None;
            }
        }
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 8];
        for i in 0..6 {
            bytes[i] = match u8::from_str_radix(parts[i], 16) {
                Ok(v) => v,
                Err(_e) => {
                    return None;
                }
            };
        }
        Some(u64::from_le_bytes(bytes))
    } else {
        None
    }
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

#[test]
fn mac_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    let str = addr.to_string();
    // Note: we are also intentionally checking that we format the address octets
    // as uppercase considering that Android is very particular about this and
    // we rely on this to format address strings when keying pairing jobs.
    assert_eq!(str, "F1:E2:D3:C4:B5:A6");

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    let str = addr.to_string();
    assert_eq!(str, "18c2a267-a539-4423-aecc-edeeb2784bcc");
}

/// An opaque, platform-minted reference to a Bluetooth device.
///
/// The adapter facade hands these out and is the only component that can
/// resolve one back to a real platform device object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// A device reported by a discovery scan.
///
/// Immutable once constructed. Equality and hashing only consider the
/// `(name, address)` pair, which is the key used to deduplicate redundant
/// discovery broadcasts for the same device.
#[derive(Clone, Debug)]
pub struct ScannedDevice {
    pub name: String,
    pub address: Address,
    pub handle: DeviceHandle,
}
impl PartialEq for ScannedDevice {
    fn eq(&self, other: &ScannedDevice) -> bool {
        self.name == other.name && self.address == other.address
    }
}
impl Eq for ScannedDevice {}
impl Hash for ScannedDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.address.hash(state);
    }
}

/// Platform bond (persisted pairing) state for a device, as carried by
/// bond-state-change broadcasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Platform broadcast events, as delivered by the host's broadcast receiver
/// glue. The host is expected to translate each platform intent into one of
/// these and feed it to `Session::dispatch`.
#[derive(Clone, Debug)]
pub enum BroadcastEvent {
    DeviceFound(ScannedDevice),
    DiscoveryStarted,
    DiscoveryFinished,
    AdapterStateChanged {
        previous_on: bool,
        now_on: bool,
    },
    PairingRequest {
        device: ScannedDevice,
    },
    BondStateChanged {
        device: ScannedDevice,
        previous: BondState,
        new: BondState,
    },
    ServiceUuids {
        device: ScannedDevice,
        uuids: Vec<Uuid>,
    },
}

/// Events published on the session's public event bus.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    /// The set of Wiimotes found so far by the current scan (or, when sent
    /// at the end of a scan, the final result set).
    #[non_exhaustive]
    ScanResults {
        wiimotes: HashSet<ScannedDevice>,
    },

    /// The discovery window closed (or the platform refused to open one).
    ScanEnded,

    /// The Bluetooth adapter crossed an on/off edge.
    #[non_exhaustive]
    AdapterStateChanged {
        enabled: bool,
    },
}

// Permission failures aren't represented here: gated operations yield
// `None` and log the reason, since callers are expected to retry rather
// than branch on the cause.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("The platform rejected the {0} request")]
    PlatformRejected(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
