// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire framing for the GW's framed binary protocol.
//!
//! Frame: 2-byte big-endian length prefix, then a 1-byte command ID, then a
//! payload. Request/response correlation follows the gateway's own
//! convention: a request command `N` is answered by response command
//! `N + 1`. Notification frames (node/property change, discovery
//! confirmations) are not part of any request/response pair and are
//! dispatched to the session's notification channel independent of
//! whatever request is currently in flight.
//!
//! The exact byte layout of each payload is gateway-specific; this module
//! only commits to the handful of fields the bridge actually needs.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

// -- Command IDs --------------------------------------------------------

pub const CMD_LOGIN_REQ: u8 = 0x01;
pub const CMD_LOGIN_CFM: u8 = 0x02;
pub const CMD_LOGOUT_REQ: u8 = 0x03;
pub const CMD_LOGOUT_CFM: u8 = 0x04;
pub const CMD_ENABLE_STATUS_MONITOR_REQ: u8 = 0x05;
pub const CMD_ENABLE_STATUS_MONITOR_CFM: u8 = 0x06;
pub const CMD_GET_STATE_REQ: u8 = 0x07;
pub const CMD_GET_STATE_CFM: u8 = 0x08;
pub const CMD_LIST_PRODUCTS_REQ: u8 = 0x09;
pub const CMD_LIST_PRODUCTS_CFM: u8 = 0x0A;
pub const CMD_LIST_SCENES_REQ: u8 = 0x0B;
pub const CMD_LIST_SCENES_CFM: u8 = 0x0C;
pub const CMD_SET_TARGET_POSITION_REQ: u8 = 0x0D;
pub const CMD_SET_TARGET_POSITION_CFM: u8 = 0x0E;
pub const CMD_STOP_REQ: u8 = 0x0F;
pub const CMD_STOP_CFM: u8 = 0x10;
pub const CMD_RUN_SCENE_REQ: u8 = 0x11;
pub const CMD_RUN_SCENE_CFM: u8 = 0x12;
/// Unsolicited: a product's static info changed (discovery confirmation
/// also arrives tagged with this command for newly-seen nodes).
pub const CMD_NODE_INFORMATION_CHANGED_NTF: u8 = 0x13;
/// Unsolicited: a product's position/status changed.
pub const CMD_NODE_STATE_POSITION_CHANGED_NTF: u8 = 0x14;

/// The confirmation command ID paired with a given request command ID.
pub fn confirmation_for(request_cmd: u8) -> u8 {
    request_cmd + 1
}

/// Whether `cmd` is one of the asynchronous notification frames, not paired
/// with any in-flight request.
pub fn is_notification(cmd: u8) -> bool {
    matches!(cmd, CMD_NODE_INFORMATION_CHANGED_NTF | CMD_NODE_STATE_POSITION_CHANGED_NTF)
}

const MAX_FRAME_LEN: usize = 64 * 1024;

/// A single framed message: command ID plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    fn encode(&self) -> Vec<u8> {
        let len = (1 + self.payload.len()) as u16;
        let mut buf = Vec::with_capacity(2 + len as usize);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(self.command);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Write this frame to an async writer.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), BridgeError> {
        writer
            .write_all(&self.encode())
            .await
            .map_err(|e| BridgeError::transport(format!("frame write failed: {e}")))
    }

    /// Read the next frame from an async reader.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, BridgeError> {
        let mut len_buf = [0u8; 2];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| BridgeError::transport(format!("frame length read failed: {e}")))?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(BridgeError::transport("frame length is zero (missing command byte)"));
        }
        if len > MAX_FRAME_LEN {
            return Err(BridgeError::transport(format!("frame length {len} exceeds maximum")));
        }
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| BridgeError::transport(format!("frame body read failed: {e}")))?;
        let command = body[0];
        let payload = body[1..].to_vec();
        Ok(Frame { command, payload })
    }
}

// -- Request builders -----------------------------------------------------

pub fn login_request(password: &str) -> Frame {
    Frame::new(CMD_LOGIN_REQ, password.as_bytes().to_vec())
}

pub fn logout_request() -> Frame {
    Frame::new(CMD_LOGOUT_REQ, Vec::new())
}

pub fn enable_status_monitor_request() -> Frame {
    Frame::new(CMD_ENABLE_STATUS_MONITOR_REQ, Vec::new())
}

pub fn get_state_request() -> Frame {
    Frame::new(CMD_GET_STATE_REQ, Vec::new())
}

pub fn list_products_request() -> Frame {
    Frame::new(CMD_LIST_PRODUCTS_REQ, Vec::new())
}

pub fn list_scenes_request() -> Frame {
    Frame::new(CMD_LIST_SCENES_REQ, Vec::new())
}

/// `raw` is the gateway's `[0.0, 1.0]` position scale, encoded on the wire
/// as per-mille (0..=1000).
pub fn set_target_position_request(node_id: u32, raw: f64) -> Frame {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&node_id.to_be_bytes());
    payload.extend_from_slice(&raw_to_wire(raw).to_be_bytes());
    Frame::new(CMD_SET_TARGET_POSITION_REQ, payload)
}

pub fn stop_request(node_id: u32) -> Frame {
    Frame::new(CMD_STOP_REQ, node_id.to_be_bytes().to_vec())
}

pub fn run_scene_request(scene_id: u32) -> Frame {
    Frame::new(CMD_RUN_SCENE_REQ, scene_id.to_be_bytes().to_vec())
}

fn raw_to_wire(raw: f64) -> u16 {
    (raw.clamp(0.0, 1.0) * 1000.0).round() as u16
}

fn wire_to_raw(wire: u16) -> f64 {
    (wire as f64 / 1000.0).clamp(0.0, 1.0)
}

// -- Response / notification parsing --------------------------------------

/// Per-product static info returned by `CMD_LIST_PRODUCTS_CFM`, one entry
/// per actuator plus its current dynamic state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductInfo {
    pub node_id: u32,
    pub name: String,
    pub product_type: u16,
    pub serial_number: String,
    pub current_raw: f64,
    pub target_raw: f64,
    pub run_status: u8,
    pub state: u8,
    pub status_reply: u8,
}

/// Parse a `CMD_LIST_PRODUCTS_CFM` payload into its product entries.
///
/// Layout per entry: `u32 node_id, u16 product_type, u16 name_len, name
/// bytes (utf8), 8 bytes serial (hex-encoded on decode), u16 current_raw,
/// u16 target_raw, u8 run_status, u8 state, u8 status_reply`.
pub fn parse_list_products(payload: &[u8]) -> Result<Vec<ProductInfo>, BridgeError> {
    let mut cursor = payload;
    let mut out = Vec::new();
    while !cursor.is_empty() {
        let entry = parse_one_product(&mut cursor)?;
        out.push(entry);
    }
    Ok(out)
}

fn parse_one_product(cursor: &mut &[u8]) -> Result<ProductInfo, BridgeError> {
    let node_id = take_u32(cursor)?;
    let product_type = take_u16(cursor)?;
    let name_len = take_u16(cursor)? as usize;
    let name_bytes = take_n(cursor, name_len)?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();
    let serial_bytes = take_n(cursor, 8)?;
    let serial_number = hex_encode(serial_bytes);
    let current_raw = wire_to_raw(take_u16(cursor)?);
    let target_raw = wire_to_raw(take_u16(cursor)?);
    let run_status = take_u8(cursor)?;
    let state = take_u8(cursor)?;
    let status_reply = take_u8(cursor)?;
    Ok(ProductInfo { node_id, name, product_type, serial_number, current_raw, target_raw, run_status, state, status_reply })
}

/// A scene entry returned by `CMD_LIST_SCENES_CFM`.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneInfo {
    pub scene_id: u32,
    pub name: String,
    pub product_count: u32,
}

pub fn parse_list_scenes(payload: &[u8]) -> Result<Vec<SceneInfo>, BridgeError> {
    let mut cursor = payload;
    let mut out = Vec::new();
    while !cursor.is_empty() {
        let scene_id = take_u32(&mut cursor)?;
        let name_len = take_u16(&mut cursor)? as usize;
        let name = String::from_utf8_lossy(take_n(&mut cursor, name_len)?).into_owned();
        let product_count = take_u32(&mut cursor)?;
        out.push(SceneInfo { scene_id, name, product_count });
    }
    Ok(out)
}

/// The fields carried by both `CMD_NODE_INFORMATION_CHANGED_NTF` and
/// `CMD_NODE_STATE_POSITION_CHANGED_NTF`: `(nodeId, current, target,
/// runStatus, state, statusReply)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStateChanged {
    pub node_id: u32,
    pub current_raw: f64,
    pub target_raw: f64,
    pub run_status: u8,
    pub state: u8,
    pub status_reply: u8,
}

pub fn parse_node_state_changed(payload: &[u8]) -> Result<NodeStateChanged, BridgeError> {
    let mut cursor = payload;
    let node_id = take_u32(&mut cursor)?;
    let current_raw = wire_to_raw(take_u16(&mut cursor)?);
    let target_raw = wire_to_raw(take_u16(&mut cursor)?);
    let run_status = take_u8(&mut cursor)?;
    let state = take_u8(&mut cursor)?;
    let status_reply = take_u8(&mut cursor)?;
    Ok(NodeStateChanged { node_id, current_raw, target_raw, run_status, state, status_reply })
}

fn take_n<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], BridgeError> {
    if cursor.len() < n {
        return Err(BridgeError::parse("truncated GW payload"));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, BridgeError> {
    Ok(take_n(cursor, 1)?[0])
}

fn take_u16(cursor: &mut &[u8]) -> Result<u16, BridgeError> {
    let bytes = take_n(cursor, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32, BridgeError> {
    let bytes = take_n(cursor, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let frame = Frame::new(CMD_LOGIN_REQ, b"hunter2".to_vec());
        frame.write_to(&mut client).await.unwrap();
        let read = Frame::read_from(&mut server).await.unwrap();
        assert_eq!(read, frame);
    }

    #[test]
    fn confirmation_for_pairs_request_with_next_command() {
        assert_eq!(confirmation_for(CMD_LOGIN_REQ), CMD_LOGIN_CFM);
        assert_eq!(confirmation_for(CMD_SET_TARGET_POSITION_REQ), CMD_SET_TARGET_POSITION_CFM);
    }

    #[test]
    fn notification_commands_are_recognized() {
        assert!(is_notification(CMD_NODE_INFORMATION_CHANGED_NTF));
        assert!(is_notification(CMD_NODE_STATE_POSITION_CHANGED_NTF));
        assert!(!is_notification(CMD_LOGIN_CFM));
    }

    #[test]
    fn raw_wire_round_trip_at_boundaries() {
        assert_eq!(wire_to_raw(raw_to_wire(0.0)), 0.0);
        assert_eq!(wire_to_raw(raw_to_wire(1.0)), 1.0);
        assert_eq!(raw_to_wire(0.5), 500);
    }

    #[test]
    fn parse_node_state_changed_reads_all_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_be_bytes());
        payload.extend_from_slice(&500u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.push(0x00);
        payload.push(0x01);
        payload.push(0x01);
        let parsed = parse_node_state_changed(&payload).unwrap();
        assert_eq!(parsed.node_id, 7);
        assert_eq!(parsed.current_raw, 0.5);
        assert_eq!(parsed.target_raw, 0.0);
        assert_eq!(parsed.run_status, 0);
        assert_eq!(parsed.state, 1);
        assert_eq!(parsed.status_reply, 1);
    }

    #[test]
    fn parse_node_state_changed_rejects_truncated_payload() {
        assert!(parse_node_state_changed(&[0, 0, 0]).is_err());
    }

    #[test]
    fn parse_list_products_round_trips_one_entry() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0x0040u16.to_be_bytes());
        let name = b"Kitchen";
        payload.extend_from_slice(&(name.len() as u16).to_be_bytes());
        payload.extend_from_slice(name);
        payload.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&500u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.push(0);
        payload.push(1);
        payload.push(1);

        let products = parse_list_products(&payload).unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].node_id, 1);
        assert_eq!(products[0].name, "Kitchen");
        assert_eq!(products[0].serial_number, "deadbeef00000000");
        assert_eq!(products[0].current_raw, 0.5);
        assert_eq!(products[0].state, 1);
    }
}
