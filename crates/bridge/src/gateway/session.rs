// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! GW Session: the single authenticated connection to the gateway.
//!
//! One task owns the TLS socket end to end — connect, login, discovery,
//! command dispatch, keepalive, reconnect — matching the "GW I/O task"
//! described in the concurrency model. Public methods send a
//! [`SessionCommand`] over an mpsc channel and await the reply on a oneshot;
//! this gives callers a normal async API while guaranteeing the socket
//! itself is only ever touched by the owning task.
//!
//! The GW permits at most two concurrent sessions; the bridge holds exactly
//! one and serializes every command through this single task, which is
//! already sufficient to guarantee at most one in-flight command per
//! actuator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::Klf200Config;
use crate::error::BridgeError;
use crate::registry::{Device, Scene};
use crate::util::iso8601_now;

use super::protocol::{self, Frame, NodeStateChanged, ProductInfo, SceneInfo};
use super::tls;

/// Observable connection state, matching `spec.md §4.C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Closed,
            _ => Self::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Closed => 4,
        }
    }
}

/// Events emitted by the session, consumed by the daemon orchestrator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    DevicesDiscovered(Vec<Device>),
    DeviceStateChanged(Device),
    ScenesDiscovered(Vec<Scene>),
}

#[derive(Debug, Clone, Default)]
struct StaticInfo {
    name: String,
    product_type: u16,
    serial_number: String,
}

enum SessionCommand {
    Connect { reply: oneshot::Sender<Result<(), BridgeError>> },
    DiscoverDevices { reply: oneshot::Sender<Result<Vec<Device>, BridgeError>> },
    DiscoverScenes { reply: oneshot::Sender<Result<Vec<Scene>, BridgeError>> },
    SetPosition { node_id: u32, pct: u8, reply: oneshot::Sender<Result<(), BridgeError>> },
    Stop { node_id: u32, reply: oneshot::Sender<Result<(), BridgeError>> },
    RunScene { scene_id: u32, reply: oneshot::Sender<Result<(), BridgeError>> },
    Refresh { reply: oneshot::Sender<Result<(), BridgeError>> },
    Reconnect { reply: oneshot::Sender<Result<(), BridgeError>> },
    Close,
}

/// Handle to the GW session. Cheap to clone; all real work happens in the
/// background task spawned by [`GwSession::spawn`].
pub struct GwSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    state: Arc<AtomicU8>,
}

impl GwSession {
    pub fn spawn(config: Klf200Config, cancel: CancellationToken) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(256);
        let state = Arc::new(AtomicU8::new(SessionState::Disconnected.as_u8()));

        let session = Arc::new(Self { cmd_tx, event_tx: event_tx.clone(), state: Arc::clone(&state) });

        tokio::spawn(run(config, cmd_rx, event_tx, state, cancel));
        session
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, BridgeError>>) -> SessionCommand,
    ) -> Result<T, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| BridgeError::transport("GW session task is gone"))?;
        rx.await.map_err(|_| BridgeError::transport("GW session task dropped the reply"))?
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.call(|reply| SessionCommand::Connect { reply }).await
    }

    pub async fn discover_devices(&self) -> Result<Vec<Device>, BridgeError> {
        self.call(|reply| SessionCommand::DiscoverDevices { reply }).await
    }

    pub async fn discover_scenes(&self) -> Result<Vec<Scene>, BridgeError> {
        self.call(|reply| SessionCommand::DiscoverScenes { reply }).await
    }

    pub async fn set_position(&self, node_id: u32, pct: u8) -> Result<(), BridgeError> {
        let pct = pct.min(100);
        self.call(|reply| SessionCommand::SetPosition { node_id, pct, reply }).await
    }

    pub async fn stop(&self, node_id: u32) -> Result<(), BridgeError> {
        self.call(|reply| SessionCommand::Stop { node_id, reply }).await
    }

    pub async fn run_scene(&self, scene_id: u32) -> Result<(), BridgeError> {
        self.call(|reply| SessionCommand::RunScene { scene_id, reply }).await
    }

    pub async fn refresh(&self) -> Result<(), BridgeError> {
        self.call(|reply| SessionCommand::Refresh { reply }).await
    }

    /// Closes the current session and re-enters `Connecting` immediately,
    /// bypassing the backoff schedule.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        self.call(|reply| SessionCommand::Reconnect { reply }).await
    }

    /// Best-effort, never fails from the caller's perspective.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
    }
}

type Reader = ReadHalf<TlsStream<TcpStream>>;
type Writer = WriteHalf<TlsStream<TcpStream>>;

struct Io {
    reader: Reader,
    writer: Writer,
}

async fn run(
    config: Klf200Config,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    let mut io: Option<Io> = None;
    let mut statics: HashMap<u32, StaticInfo> = HashMap::new();
    let mut attempt: u32 = 0;

    set_state(&state, SessionState::Disconnected);

    loop {
        let next_keepalive = if matches!(current(&state), SessionState::Connected) {
            Some(tokio::time::sleep(config.keepalive_interval))
        } else {
            None
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(active) = io.take() {
                    let _ = best_effort_logout(active).await;
                }
                set_state(&state, SessionState::Closed);
                return;
            }

            Some(()) = maybe_sleep(next_keepalive) => {
                if let Some(active) = io.as_mut() {
                    if send_and_await(active, protocol::get_state_request(), protocol::confirmation_for(protocol::CMD_GET_STATE_REQ), &event_tx, &mut statics).await.is_err() {
                        io = None;
                        enter_reconnecting(&state, &event_tx, "keepalive probe failed");
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return };
                match cmd {
                    SessionCommand::Connect { reply } => {
                        match do_connect(&config, &state).await {
                            Ok(new_io) => {
                                io = Some(new_io);
                                attempt = 0;
                                set_state(&state, SessionState::Connected);
                                let _ = event_tx.send(SessionEvent::Connected);
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                set_state(&state, SessionState::Reconnecting);
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    SessionCommand::DiscoverDevices { reply } => {
                        let result = discover_devices(&mut io, &mut statics, &event_tx).await;
                        if let Ok(devices) = &result {
                            let _ = event_tx.send(SessionEvent::DevicesDiscovered(devices.clone()));
                        }
                        if result.is_err() {
                            io = None;
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::DiscoverScenes { reply } => {
                        let result = discover_scenes(&mut io, &event_tx, &mut statics).await;
                        if let Ok(scenes) = &result {
                            let _ = event_tx.send(SessionEvent::ScenesDiscovered(scenes.clone()));
                        }
                        if result.is_err() {
                            io = None;
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::SetPosition { node_id, pct, reply } => {
                        let result = command_set_position(&mut io, &mut statics, &event_tx, node_id, pct).await;
                        if matches!(result, Err(ref e) if e.kind != crate::error::ErrorKind::Command) {
                            io = None;
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::Stop { node_id, reply } => {
                        let result = command_stop(&mut io, &mut statics, &event_tx, node_id).await;
                        if matches!(result, Err(ref e) if e.kind != crate::error::ErrorKind::Command) {
                            io = None;
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::RunScene { scene_id, reply } => {
                        let result = command_run_scene(&mut io, &mut statics, &event_tx, scene_id).await;
                        if result.is_err() {
                            io = None;
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::Refresh { reply } => {
                        let devices = discover_devices(&mut io, &mut statics, &event_tx).await;
                        let scenes = discover_scenes(&mut io, &event_tx, &mut statics).await;
                        if let Ok(devices) = &devices {
                            let _ = event_tx.send(SessionEvent::DevicesDiscovered(devices.clone()));
                        }
                        if let Ok(scenes) = &scenes {
                            let _ = event_tx.send(SessionEvent::ScenesDiscovered(scenes.clone()));
                        }
                        let result = devices.map(|_| ()).and(scenes.map(|_| ()));
                        if result.is_err() {
                            io = None;
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::Reconnect { reply } => {
                        if let Some(old) = io.take() {
                            let _ = best_effort_logout(old).await;
                        }
                        match do_connect(&config, &state).await {
                            Ok(new_io) => {
                                io = Some(new_io);
                                attempt = 0;
                                set_state(&state, SessionState::Connected);
                                let _ = event_tx.send(SessionEvent::Connected);
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                set_state(&state, SessionState::Reconnecting);
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    SessionCommand::Close => {
                        if let Some(active) = io.take() {
                            let _ = best_effort_logout(active).await;
                        }
                        set_state(&state, SessionState::Closed);
                        return;
                    }
                }
            }

            () = reconnect_tick(&config, attempt), if matches!(current(&state), SessionState::Reconnecting) => {
                match do_connect(&config, &state).await {
                    Ok(new_io) => {
                        io = Some(new_io);
                        attempt = 0;
                        set_state(&state, SessionState::Connected);
                        let _ = event_tx.send(SessionEvent::Connected);
                        if let Ok(devices) = discover_devices(&mut io, &mut statics, &event_tx).await {
                            let _ = event_tx.send(SessionEvent::DevicesDiscovered(devices));
                        }
                        if let Ok(scenes) = discover_scenes(&mut io, &event_tx, &mut statics).await {
                            let _ = event_tx.send(SessionEvent::ScenesDiscovered(scenes));
                        }
                    }
                    Err(_) => {
                        attempt += 1;
                        // stays Reconnecting; next tick backs off further
                    }
                }
            }
        }
    }
}

fn current(state: &Arc<AtomicU8>) -> SessionState {
    SessionState::from_u8(state.load(Ordering::Relaxed))
}

fn set_state(state: &Arc<AtomicU8>, new: SessionState) {
    state.store(new.as_u8(), Ordering::Relaxed);
}

fn enter_reconnecting(state: &Arc<AtomicU8>, event_tx: &broadcast::Sender<SessionEvent>, reason: &str) {
    set_state(state, SessionState::Reconnecting);
    let _ = event_tx.send(SessionEvent::Disconnected { reason: reason.to_owned() });
}

async fn maybe_sleep(sleep: Option<tokio::time::Sleep>) -> Option<()> {
    match sleep {
        Some(s) => {
            s.await;
            Some(())
        }
        None => std::future::pending::<Option<()>>().await,
    }
}

/// Backoff-aware reconnect timer: `delay = min(base * 2^attempt, max)`,
/// where `attempt` is the number of reconnect attempts already made (0 for
/// the first wait).
async fn reconnect_tick(config: &Klf200Config, attempt: u32) {
    let shift = attempt.min(32);
    let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay = config.reconnect_base_delay.saturating_mul(factor.min(u32::MAX as u64) as u32).min(config.reconnect_max_delay);
    tokio::time::sleep(delay).await;
}

async fn do_connect(config: &Klf200Config, state: &Arc<AtomicU8>) -> Result<Io, BridgeError> {
    set_state(state, SessionState::Connecting);

    let tcp = tokio::time::timeout(config.connection_timeout, TcpStream::connect((config.host.as_str(), config.port)))
        .await
        .map_err(|_| BridgeError::transport("TCP connect timed out"))?
        .map_err(|e| BridgeError::transport(format!("TCP connect failed: {e}")))?;

    let tls_config = tls::client_config(config.tls_fingerprint.as_deref())?;
    let connector = TlsConnector::from(tls_config);
    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| BridgeError::transport(format!("invalid GW host name: {e}")))?;

    let tls_stream = tokio::time::timeout(config.connection_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| BridgeError::transport("TLS handshake timed out"))?
        .map_err(|e| BridgeError::transport(format!("TLS handshake failed: {e}")))?;

    let (reader, writer) = split(tls_stream);
    let mut io = Io { reader, writer };

    login(&mut io, &config.password).await.map_err(|e| BridgeError::auth(e.message))?;
    enable_status_monitor(&mut io).await?;

    Ok(io)
}

async fn login(io: &mut Io, password: &str) -> Result<(), BridgeError> {
    protocol::login_request(password).write_to(&mut io.writer).await?;
    let response = Frame::read_from(&mut io.reader).await?;
    if response.command != protocol::CMD_LOGIN_CFM {
        return Err(BridgeError::auth("unexpected response to login"));
    }
    if response.payload.first() == Some(&0) {
        return Err(BridgeError::auth("GW rejected password"));
    }
    Ok(())
}

async fn enable_status_monitor(io: &mut Io) -> Result<(), BridgeError> {
    protocol::enable_status_monitor_request().write_to(&mut io.writer).await?;
    let response = Frame::read_from(&mut io.reader).await?;
    if response.command != protocol::CMD_ENABLE_STATUS_MONITOR_CFM {
        return Err(BridgeError::transport("unexpected response enabling status monitor"));
    }
    Ok(())
}

async fn best_effort_logout(mut io: Io) -> Result<(), BridgeError> {
    let _ = protocol::logout_request().write_to(&mut io.writer).await;
    Ok(())
}

/// Write `request`, then read frames until the matching `expected_cfm`
/// arrives, dispatching any notification frames encountered along the way.
/// Returns the confirmation payload.
async fn send_and_await(
    io: &mut Io,
    request: Frame,
    expected_cfm: u8,
    event_tx: &broadcast::Sender<SessionEvent>,
    statics: &mut HashMap<u32, StaticInfo>,
) -> Result<Vec<u8>, BridgeError> {
    request.write_to(&mut io.writer).await?;
    loop {
        let frame = Frame::read_from(&mut io.reader).await?;
        if protocol::is_notification(frame.command) {
            dispatch_notification(&frame, event_tx, statics);
            continue;
        }
        if frame.command == expected_cfm {
            return Ok(frame.payload);
        }
        // A confirmation for something else arrived unexpectedly; drop it
        // rather than blocking forever.
        tracing::debug!(command = frame.command, "dropping unrelated GW confirmation");
    }
}

fn dispatch_notification(frame: &Frame, event_tx: &broadcast::Sender<SessionEvent>, statics: &mut HashMap<u32, StaticInfo>) {
    if frame.command != protocol::CMD_NODE_INFORMATION_CHANGED_NTF
        && frame.command != protocol::CMD_NODE_STATE_POSITION_CHANGED_NTF
    {
        return;
    }
    let Ok(changed) = protocol::parse_node_state_changed(&frame.payload) else {
        tracing::debug!("dropping unparseable GW notification frame");
        return;
    };
    match build_device(statics, &changed) {
        Some(device) => {
            let _ = event_tx.send(SessionEvent::DeviceStateChanged(device));
        }
        None => tracing::debug!(node_id = changed.node_id, "notification for undiscovered node, ignoring"),
    }
}

fn build_device(statics: &HashMap<u32, StaticInfo>, changed: &NodeStateChanged) -> Option<Device> {
    let info = statics.get(&changed.node_id)?;
    Some(device_from_parts(
        changed.node_id,
        info,
        changed.current_raw,
        changed.target_raw,
        changed.run_status,
        changed.state,
        changed.status_reply,
    ))
}

#[allow(clippy::too_many_arguments)]
fn device_from_parts(
    node_id: u32,
    info: &StaticInfo,
    current_raw: f64,
    target_raw: f64,
    run_status: u8,
    state: u8,
    status_reply: u8,
) -> Device {
    let status = codec::status_text(status_reply);
    Device {
        node_id,
        name: info.name.clone(),
        device_type: codec::classify(info.product_type),
        position: codec::to_public(current_raw),
        target_position: codec::to_public(target_raw),
        moving: run_status == 0 && current_raw != target_raw,
        online: state == 1,
        error: status.filter(|s| s.is_error).map(|s| s.message),
        limitation_min: 0,
        limitation_max: 100,
        serial_number: info.serial_number.clone(),
        product_type: info.product_type,
        last_update: iso8601_now(),
    }
}

async fn discover_devices(
    io: &mut Option<Io>,
    statics: &mut HashMap<u32, StaticInfo>,
    event_tx: &broadcast::Sender<SessionEvent>,
) -> Result<Vec<Device>, BridgeError> {
    let active = io.as_mut().ok_or_else(|| BridgeError::transport("GW not connected"))?;
    let payload =
        send_and_await(active, protocol::list_products_request(), protocol::confirmation_for(protocol::CMD_LIST_PRODUCTS_REQ), event_tx, statics).await?;
    let products: Vec<ProductInfo> = protocol::parse_list_products(&payload)?;

    let mut devices = Vec::with_capacity(products.len());
    for p in &products {
        let info = StaticInfo { name: p.name.clone(), product_type: p.product_type, serial_number: p.serial_number.clone() };
        devices.push(device_from_parts(p.node_id, &info, p.current_raw, p.target_raw, p.run_status, p.state, p.status_reply));
        statics.insert(p.node_id, info);
    }
    Ok(devices)
}

async fn discover_scenes(
    io: &mut Option<Io>,
    event_tx: &broadcast::Sender<SessionEvent>,
    statics: &mut HashMap<u32, StaticInfo>,
) -> Result<Vec<Scene>, BridgeError> {
    let active = io.as_mut().ok_or_else(|| BridgeError::transport("GW not connected"))?;
    let payload =
        send_and_await(active, protocol::list_scenes_request(), protocol::confirmation_for(protocol::CMD_LIST_SCENES_REQ), event_tx, statics).await?;
    let scenes: Vec<SceneInfo> = protocol::parse_list_scenes(&payload)?;
    Ok(scenes
        .into_iter()
        .map(|s| Scene { scene_id: s.scene_id, name: s.name, product_count: s.product_count })
        .collect())
}

async fn command_set_position(
    io: &mut Option<Io>,
    statics: &mut HashMap<u32, StaticInfo>,
    event_tx: &broadcast::Sender<SessionEvent>,
    node_id: u32,
    pct: u8,
) -> Result<(), BridgeError> {
    if !statics.contains_key(&node_id) {
        return Err(BridgeError::command(format!("unknown node {node_id}")));
    }
    let active = io.as_mut().ok_or_else(|| BridgeError::transport("GW not connected"))?;
    let raw = codec::to_raw(pct);
    let _ = send_and_await(active, protocol::set_target_position_request(node_id, raw), protocol::confirmation_for(protocol::CMD_SET_TARGET_POSITION_REQ), event_tx, statics).await?;
    Ok(())
}

async fn command_stop(
    io: &mut Option<Io>,
    statics: &mut HashMap<u32, StaticInfo>,
    event_tx: &broadcast::Sender<SessionEvent>,
    node_id: u32,
) -> Result<(), BridgeError> {
    if !statics.contains_key(&node_id) {
        return Err(BridgeError::command(format!("unknown node {node_id}")));
    }
    let active = io.as_mut().ok_or_else(|| BridgeError::transport("GW not connected"))?;
    let _ = send_and_await(active, protocol::stop_request(node_id), protocol::confirmation_for(protocol::CMD_STOP_REQ), event_tx, statics).await?;
    Ok(())
}

async fn command_run_scene(
    io: &mut Option<Io>,
    statics: &mut HashMap<u32, StaticInfo>,
    event_tx: &broadcast::Sender<SessionEvent>,
    scene_id: u32,
) -> Result<(), BridgeError> {
    let active = io.as_mut().ok_or_else(|| BridgeError::transport("GW not connected"))?;
    let _ = send_and_await(active, protocol::run_scene_request(scene_id), protocol::confirmation_for(protocol::CMD_RUN_SCENE_REQ), event_tx, statics).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_info() -> StaticInfo {
        StaticInfo { name: "Kitchen".to_owned(), product_type: 0x0040, serial_number: "deadbeef".to_owned() }
    }

    #[test]
    fn device_from_parts_moving_when_positions_differ_and_running() {
        let device = device_from_parts(0, &static_info(), 0.5, 0.0, 0, 1, 0);
        assert!(device.moving);
        assert_eq!(device.device_type, crate::codec::DeviceType::Window);
    }

    #[test]
    fn device_from_parts_not_moving_when_positions_equal() {
        let device = device_from_parts(0, &static_info(), 0.5, 0.5, 0, 1, 0);
        assert!(!device.moving);
    }

    #[test]
    fn device_from_parts_carries_error_from_status_reply() {
        let device = device_from_parts(0, &static_info(), 0.5, 0.5, 0, 1, 0x05);
        assert_eq!(device.error.as_deref(), Some("Failure (e.g. blocked by weather)"));
    }

    #[test]
    fn device_from_parts_online_reflects_state() {
        let online = device_from_parts(0, &static_info(), 0.5, 0.5, 0, 1, 0);
        assert!(online.online);
        let offline = device_from_parts(0, &static_info(), 0.5, 0.5, 0, 0, 0);
        assert!(!offline.online);
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let base = 5u32;
        let max = 60u32;
        let delays: Vec<u32> = (0..6u32)
            .map(|attempt| {
                let shift = attempt.min(32);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX) as u32;
                base.saturating_mul(factor).min(max)
            })
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }
}
