// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! BUS topic names and incoming-payload parsing — pure functions, no state.
//!
//! Incoming messages are matched with exact anchored patterns built from
//! `prefix`; anything that doesn't match one of the four patterns is
//! ignored, and payloads that match but don't parse are logged by the
//! caller and discarded (no event).

/// A parsed incoming command, the result of matching a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingCommand {
    Device { node_id: u32, command: DeviceCommand },
    Scene { scene_id: u32 },
    Global(GlobalCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Open,
    Close,
    Stop,
    Position(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCommand {
    Refresh,
    Reconnect,
}

/// Subscription patterns the bridge registers with the broker.
pub fn subscriptions(prefix: &str) -> [String; 4] {
    [
        format!("{prefix}/devices/+/cmd"),
        format!("{prefix}/devices/+/position/set"),
        format!("{prefix}/scenes/+/cmd"),
        format!("{prefix}/cmd"),
    ]
}

pub fn status_topic(prefix: &str) -> String {
    format!("{prefix}/status")
}

pub fn device_state_topic(prefix: &str, node_id: u32) -> String {
    format!("{prefix}/devices/{node_id}/state")
}

pub fn device_position_topic(prefix: &str, node_id: u32) -> String {
    format!("{prefix}/devices/{node_id}/position")
}

pub fn device_moving_topic(prefix: &str, node_id: u32) -> String {
    format!("{prefix}/devices/{node_id}/moving")
}

pub fn scene_state_topic(prefix: &str, scene_id: u32) -> String {
    format!("{prefix}/scenes/{scene_id}/state")
}

pub fn errors_topic(prefix: &str) -> String {
    format!("{prefix}/errors")
}

/// Match an incoming `(topic, payload)` pair against the four subscribed
/// patterns and parse the payload. Returns `None` if the topic doesn't
/// match any pattern, or the payload doesn't parse for a pattern that
/// expects a specific shape.
pub fn parse_incoming(prefix: &str, topic: &str, payload: &str) -> Option<IncomingCommand> {
    let suffix = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = suffix.split('/').collect();

    match parts.as_slice() {
        ["devices", node, "cmd"] => {
            let node_id: u32 = node.parse().ok()?;
            let command = parse_device_command(payload)?;
            Some(IncomingCommand::Device { node_id, command })
        }
        ["devices", node, "position", "set"] => {
            let node_id: u32 = node.parse().ok()?;
            let command = parse_position_only(payload)?;
            Some(IncomingCommand::Device { node_id, command })
        }
        ["scenes", scene, "cmd"] => {
            if payload.trim().eq_ignore_ascii_case("run") {
                let scene_id: u32 = scene.parse().ok()?;
                Some(IncomingCommand::Scene { scene_id })
            } else {
                None
            }
        }
        ["cmd"] => match payload.trim().to_ascii_lowercase().as_str() {
            "refresh" => Some(IncomingCommand::Global(GlobalCommand::Refresh)),
            "reconnect" => Some(IncomingCommand::Global(GlobalCommand::Reconnect)),
            _ => None,
        },
        _ => None,
    }
}

/// `"open"→Open`, `"close"→Close`, `"stop"→Stop`; otherwise parse as an
/// integer in `[0,100]`.
fn parse_device_command(payload: &str) -> Option<DeviceCommand> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "open" => Some(DeviceCommand::Open),
        "close" => Some(DeviceCommand::Close),
        "stop" => Some(DeviceCommand::Stop),
        other => parse_position_only(other),
    }
}

fn parse_position_only(payload: &str) -> Option<DeviceCommand> {
    let pct: i64 = payload.trim().parse().ok()?;
    if (0..=100).contains(&pct) {
        Some(DeviceCommand::Position(pct as u8))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        open = { "open", Some(DeviceCommand::Open) },
        close_mixed_case = { "CLOSE", Some(DeviceCommand::Close) },
        stop_padded = { "  stop  ", Some(DeviceCommand::Stop) },
        position = { "42", Some(DeviceCommand::Position(42)) },
        out_of_range = { "150", None },
        garbage = { "banana", None },
    )]
    fn device_command_parsing(payload: &str, expected: Option<DeviceCommand>) {
        assert_eq!(parse_device_command(payload), expected);
    }

    #[test]
    fn parses_device_cmd_topic() {
        let parsed = parse_incoming("klf200", "klf200/devices/0/cmd", "open").unwrap();
        assert_eq!(parsed, IncomingCommand::Device { node_id: 0, command: DeviceCommand::Open });
    }

    #[test]
    fn parses_position_set_topic() {
        let parsed = parse_incoming("klf200", "klf200/devices/0/position/set", "50").unwrap();
        assert_eq!(parsed, IncomingCommand::Device { node_id: 0, command: DeviceCommand::Position(50) });
    }

    #[test]
    fn position_set_out_of_range_is_discarded() {
        assert!(parse_incoming("klf200", "klf200/devices/0/position/set", "150").is_none());
    }

    #[test]
    fn parses_scene_run_case_insensitively() {
        let parsed = parse_incoming("klf200", "klf200/scenes/3/cmd", "RUN").unwrap();
        assert_eq!(parsed, IncomingCommand::Scene { scene_id: 3 });
    }

    #[test]
    fn scene_cmd_other_than_run_is_discarded() {
        assert!(parse_incoming("klf200", "klf200/scenes/3/cmd", "stop").is_none());
    }

    #[test]
    fn parses_global_commands() {
        assert_eq!(parse_incoming("klf200", "klf200/cmd", "refresh"), Some(IncomingCommand::Global(GlobalCommand::Refresh)));
        assert_eq!(parse_incoming("klf200", "klf200/cmd", "reconnect"), Some(IncomingCommand::Global(GlobalCommand::Reconnect)));
    }

    #[test]
    fn unmatched_topic_is_none() {
        assert!(parse_incoming("klf200", "other/topic", "x").is_none());
        assert!(parse_incoming("klf200", "klf200/devices/abc/cmd", "open").is_none());
    }
}
