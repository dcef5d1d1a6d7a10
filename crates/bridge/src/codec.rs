// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Position codec and gateway type map — pure functions, no state.
//!
//! Converts between the gateway's raw `[0.0, 1.0]` position scale (`0.0` is
//! open, `1.0` is closed) and the public `0..=100` scale (`0` is closed,
//! `100` is open), classifies gateway product-type codes into [`DeviceType`],
//! and turns gateway run/status codes into human text.

use serde::{Deserialize, Serialize};

/// Public actuator kind, independent of the gateway's raw product-type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Window,
    Blind,
    Shutter,
    Awning,
    Garage,
    Gate,
    Lock,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Blind => "blind",
            Self::Shutter => "shutter",
            Self::Awning => "awning",
            Self::Garage => "garage",
            Self::Gate => "gate",
            Self::Lock => "lock",
            Self::Unknown => "unknown",
        }
    }
}

/// Convert a raw gateway position (`0.0` open … `1.0` closed) to the public
/// `0..=100` scale (`0` closed … `100` open), clamped to range.
pub fn to_public(raw: f64) -> u8 {
    let pct = ((1.0 - raw) * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Convert a public `0..=100` position to the gateway's raw `[0.0, 1.0]` scale.
pub fn to_raw(pct: u8) -> f64 {
    1.0 - (pct as f64) / 100.0
}

/// Classify a gateway product-type code into a public [`DeviceType`].
///
/// The table follows the actuator-type enumeration documented for the
/// gateway protocol this bridge targets. Any code not in the table —
/// including codes the gateway protocol reserves — maps to `Unknown`.
pub fn classify(product_type_code: u16) -> DeviceType {
    match product_type_code {
        0x0040..=0x0047 => DeviceType::Window,
        0x0080..=0x0087 => DeviceType::Shutter,
        0x0100..=0x010F => DeviceType::Awning,
        0x0180..=0x018F => DeviceType::Window,
        0x0240..=0x024F => DeviceType::Garage,
        0x02C0..=0x02CF => DeviceType::Lock,
        0x0340..=0x034F => DeviceType::Gate,
        0x0400..=0x040F => DeviceType::Blind,
        _ => DeviceType::Unknown,
    }
}

/// A gateway status/run code decoded into human text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText {
    pub is_error: bool,
    pub message: String,
}

/// Decode a gateway status code. Codes `0x00` (unknown) and `0x01` (OK)
/// carry no information worth surfacing and return `None`; any other known
/// code returns a flagged human message; unknown codes still produce a
/// generic, non-error message rather than silently dropping the code.
pub fn status_text(code: u8) -> Option<StatusText> {
    match code {
        0x00 | 0x01 => None,
        0x02 => Some(StatusText { is_error: true, message: "Manually operated".to_owned() }),
        0x03 => Some(StatusText { is_error: true, message: "Blocked".to_owned() }),
        0x04 => Some(StatusText { is_error: true, message: "Target position not reached".to_owned() }),
        0x05 => Some(StatusText { is_error: true, message: "Failure (e.g. blocked by weather)".to_owned() }),
        0x06 => Some(StatusText { is_error: true, message: "Power consumption too high".to_owned() }),
        0x07 => Some(StatusText { is_error: true, message: "Power consumption too low".to_owned() }),
        0x08 => Some(StatusText { is_error: true, message: "Lock position".to_owned() }),
        0x09 => Some(StatusText { is_error: false, message: "Target position reached".to_owned() }),
        0x0A => Some(StatusText { is_error: true, message: "Disconnected".to_owned() }),
        0x0B => Some(StatusText { is_error: true, message: "Wrong system key".to_owned() }),
        other => Some(StatusText { is_error: false, message: format!("Unknown status({other})") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use yare::parameterized;

    proptest! {
        #[test]
        fn round_trip_law(p in 0u8..=100u8) {
            prop_assert_eq!(to_public(to_raw(p)), p);
        }

        #[test]
        fn to_public_always_in_range(raw in 0.0f64..=1.0f64) {
            let pct = to_public(raw);
            prop_assert!(pct <= 100);
        }
    }

    #[test]
    fn to_public_clamps_out_of_range_raw() {
        assert_eq!(to_public(-0.5), 100);
        assert_eq!(to_public(1.5), 0);
    }

    #[test]
    fn fully_open_and_closed_endpoints() {
        assert_eq!(to_public(0.0), 100);
        assert_eq!(to_public(1.0), 0);
        assert_eq!(to_raw(100), 0.0);
        assert_eq!(to_raw(0), 1.0);
    }

    #[parameterized(
        window = { 0x0040, DeviceType::Window },
        shutter = { 0x0080, DeviceType::Shutter },
        awning = { 0x0100, DeviceType::Awning },
        garage = { 0x0240, DeviceType::Garage },
        lock = { 0x02C0, DeviceType::Lock },
        gate = { 0x0340, DeviceType::Gate },
        blind = { 0x0400, DeviceType::Blind },
        reserved = { 0x9999, DeviceType::Unknown },
    )]
    fn classify_maps_known_codes(code: u16, expected: DeviceType) {
        assert_eq!(classify(code), expected);
    }

    #[test]
    fn status_text_unknown_and_ok_are_nil() {
        assert_eq!(status_text(0x00), None);
        assert_eq!(status_text(0x01), None);
    }

    #[test]
    fn status_text_known_error_code() {
        let st = status_text(0x05).unwrap();
        assert!(st.is_error);
        assert_eq!(st.message, "Failure (e.g. blocked by weather)");
    }

    #[test]
    fn status_text_unknown_code_is_informational() {
        let st = status_text(0xEE).unwrap();
        assert!(!st.is_error);
        assert_eq!(st.message, "Unknown status(238)");
    }
}
