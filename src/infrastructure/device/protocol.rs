//! Braille Cell Protocol
//!
//! Fixed identifiers and timing for the tactile display. Each command is a
//! single [`WireByte`](crate::domain::braille::WireByte) written to one
//! characteristic; see [`crate::domain::braille`] for the bit layout.

use std::time::Duration;

/// Local name the device advertises.
pub const DEVICE_NAME: &str = "BrailleDevice";

/// GATT service exposing the cell characteristic.
pub const SERVICE_UUID: u128 = 0x4fafc201_1fb5_459e_8fcc_c5c9c331914b;

/// Writable characteristic that accepts one cell byte per write.
pub const CELL_CHAR_UUID: u128 = 0xbeb5483e_36e1_4688_b7f5_ea07361b26a8;

/// Settling time the actuators need between two commands.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Format a 128-bit identifier in the usual hyphenated form.
pub fn format_uuid(uuid: u128) -> String {
    let hex = format!("{:032x}", uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
