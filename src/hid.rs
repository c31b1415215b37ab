//! HID-profile constants for presenting as (and talking to) Wiimote-class
//! gamepads.

/// Report id used by the gamepad report descriptor below.
pub const GAMEPAD_REPORT_ID: u8 = 0x01;

/// Device subclass byte for SDP records that don't claim a boot subclass.
pub const SUBCLASS_NONE: u8 = 0x00;

// Still a hidden profile id on Android; see BluetoothProfile.HID_HOST in
// the platform sources.
pub const HID_HOST_PROFILE: i32 = 4;

/// L2CAP PSMs a Wiimote exposes once its HID service is up.
pub const L2CAP_CONTROL_CHANNEL: u16 = 0x11;
pub const L2CAP_DATA_CHANNEL: u16 = 0x13;

/// Every Wiimote flavour advertises a name starting with this (e.g.
/// "Nintendo RVL-CNT-01" for the original controller, "-TR" and "-UC"
/// suffixed variants for later revisions).
pub const WIIMOTE_NAME_PREFIX: &str = "Nintendo RVL";

pub fn device_name_is_wiimote(name: &str) -> bool {
    name.starts_with(WIIMOTE_NAME_PREFIX)
}

/// HID report descriptor for a Wiimote-shaped gamepad: X/Y axes, thirteen
/// buttons plus 3 bits of padding, four auxiliary axes and an 8-way hat
/// switch, all under `GAMEPAD_REPORT_ID`.
#[rustfmt::skip]
pub const WIIMOTE_HID_DESCRIPTOR: &[u8] = &[
    0x05, 0x01,                     // USAGE_PAGE (Generic Desktop)
    0x09, 0x05,                     // USAGE (Game Pad)
    0xa1, 0x01,                     // COLLECTION (Application)
    0x85, GAMEPAD_REPORT_ID,        //   REPORT_ID
    0x05, 0x01,                     //   USAGE_PAGE (Generic Desktop)
    0x09, 0x30,                     //   USAGE (X)
    0x09, 0x31,                     //   USAGE (Y)
    0x15, 0x00,                     //   LOGICAL_MINIMUM (0)
    0x26, 0xFF, 0x00,               //   LOGICAL_MAXIMUM (255)
    0x75, 0x08,                     //   REPORT_SIZE (8)
    0x95, 0x02,                     //   REPORT_COUNT (2)
    0x81, 0x02,                     //   INPUT (Data,Var,Abs)
    0x05, 0x09,                     //   USAGE_PAGE (Button)
    0x19, 0x01,                     //   USAGE_MINIMUM (Button 1)
    0x29, 0x0D,                     //   USAGE_MAXIMUM (Button 13)
    0x15, 0x00,                     //   LOGICAL_MINIMUM (0)
    0x25, 0x01,                     //   LOGICAL_MAXIMUM (1)
    0x95, 0x0D,                     //   REPORT_COUNT (13)
    0x75, 0x01,                     //   REPORT_SIZE (1)
    0x81, 0x02,                     //   INPUT (Data,Var,Abs)
    0x95, 0x01,                     //   REPORT_COUNT (1)
    0x75, 0x03,                     //   REPORT_SIZE (3)
    0x81, 0x03,                     //   INPUT (Cnst,Var,Abs)
    0x05, 0x01,                     //   USAGE_PAGE (Generic Desktop)
    0x09, 0x32,                     //   USAGE (Z)
    0x09, 0x33,                     //   USAGE (RX)
    0x09, 0x34,                     //   USAGE (RY)
    0x09, 0x35,                     //   USAGE (RZ)
    0x15, 0x00,                     //   LOGICAL_MINIMUM (0)
    0x26, 0xFF, 0x00,               //   LOGICAL_MAXIMUM (255)
    0x75, 0x08,                     //   REPORT_SIZE (8)
    0x95, 0x04,                     //   REPORT_COUNT (4)
    0x81, 0x02,                     //   INPUT (Data,Var,Abs)
    0x05, 0x01,                     //   USAGE_PAGE (Generic Desktop)
    0x09, 0x39,                     //   USAGE (Hat Switch)
    0x15, 0x01,                     //   LOGICAL_MINIMUM (1)
    0x25, 0x08,                     //   LOGICAL_MAXIMUM (8)
    0x35, 0x00,                     //   PHYSICAL_MINIMUM (0)
    0x46, 0x3b, 0x01,               //   PHYSICAL_MAXIMUM (315)
    0x55, 0x00,                     //   UNIT_EXPONENT (0)
    0x65, 0x14,                     //   UNIT (Angular Position)
    0x75, 0x08,                     //   REPORT_SIZE (8)
    0x95, 0x01,                     //   REPORT_COUNT (1)
    0x81, 0x4a,                     //   INPUT (Data,Var,Abs,Wrap,Null)
    0xc0,                           // END_COLLECTION
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiimote_names_match_all_hardware_revisions() {
        assert!(device_name_is_wiimote("Nintendo RVL-CNT-01"));
        assert!(device_name_is_wiimote("Nintendo RVL-CNT-01-TR"));
        assert!(device_name_is_wiimote("Nintendo RVL-CNT-01-UC"));
        assert!(!device_name_is_wiimote("Nintendo Switch Pro Controller"));
        assert!(!device_name_is_wiimote(""));
    }

    #[test]
    fn descriptor_is_a_single_terminated_collection() {
        assert_eq!(WIIMOTE_HID_DESCRIPTOR[0..2], [0x05, 0x01]);
        assert_eq!(*WIIMOTE_HID_DESCRIPTOR.last().unwrap(), 0xc0);
    }
}
