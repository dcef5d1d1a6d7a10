// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon orchestrator (spec.md §4.E): runs the startup sequence, wires GW
//! events into the registry and the registry's change events onto the bus,
//! translates incoming bus commands into GW calls, and drives the periodic
//! poll loop. Holds no socket itself — each collaborator owns its own I/O.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::topics::{self, DeviceCommand, GlobalCommand, IncomingCommand};
use crate::bus::{BusClient, IncomingMessage};
use crate::config::Config;
use crate::error::BridgeError;
use crate::gateway::{GwSession, SessionEvent, SessionState};
use crate::registry::{Registry, RegistryEvent};

/// Run the bridge until `cancel` fires, then shut down every collaborator
/// best-effort and return.
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let registry = Registry::load(config.snapshot_path(), cancel.clone()).await;

    let (bus, incoming_rx) = BusClient::connect(&config.mqtt, cancel.clone());
    let bus = Arc::new(bus);
    if let Err(e) = bus.publish_status("online").await {
        tracing::warn!(err = %e, "failed to publish initial online status");
    }

    let gw = GwSession::spawn(config.klf200.clone(), cancel.clone());
    if let Err(e) = gw.connect().await {
        tracing::warn!(err = %e, "initial GW connect failed, reconnect schedule will retry");
        let _ = bus.publish_error(&e.to_error_record("gateway")).await;
    }

    if config.features.auto_discovery {
        discover(&gw, &registry).await;
    }
    if config.features.publish_on_startup {
        publish_all(&registry, &bus).await;
    }

    let gw_events = spawn_gw_event_task(Arc::clone(&gw), Arc::clone(&registry), Arc::clone(&bus), cancel.clone());
    let registry_events =
        spawn_registry_publish_task(Arc::clone(&registry), Arc::clone(&bus), cancel.clone());
    let bus_commands = spawn_bus_command_task(
        incoming_rx,
        Arc::clone(&gw),
        Arc::clone(&registry),
        Arc::clone(&bus),
        config.clone(),
        cancel.clone(),
    );
    let poll = config
        .polling
        .enabled
        .then(|| spawn_poll_task(Arc::clone(&gw), Arc::clone(&registry), config.polling.interval, cancel.clone()));

    cancel.cancelled().await;
    shutdown(&gw, &bus, &registry).await;

    let _ = gw_events.await;
    let _ = registry_events.await;
    let _ = bus_commands.await;
    if let Some(poll) = poll {
        let _ = poll.await;
    }

    Ok(())
}

async fn shutdown(gw: &Arc<GwSession>, bus: &Arc<BusClient>, registry: &Arc<Registry>) {
    gw.close().await;
    bus.close().await;
    registry.close().await;
}

/// Re-run discovery for both devices and scenes, replacing the registry's
/// full sets. Failures are logged; they do not abort startup.
async fn discover(gw: &Arc<GwSession>, registry: &Arc<Registry>) {
    match gw.discover_devices().await {
        Ok(devices) => registry.replace_all(devices).await,
        Err(e) => tracing::warn!(err = %e, "device discovery failed"),
    }
    match gw.discover_scenes().await {
        Ok(scenes) => registry.scene_replace_all(scenes).await,
        Err(e) => tracing::warn!(err = %e, "scene discovery failed"),
    }
}

/// Publish every currently-registered device and scene, independent of
/// change detection — used for the startup `publishOnStartup` step.
async fn publish_all(registry: &Arc<Registry>, bus: &Arc<BusClient>) {
    for device in registry.list().await {
        if let Err(e) = bus.publish_device(&device).await {
            tracing::warn!(err = %e, node_id = device.node_id, "failed to publish device on startup");
        }
    }
    for scene in registry.list_scenes().await {
        if let Err(e) = bus.publish_scene(&scene).await {
            tracing::warn!(err = %e, scene_id = scene.scene_id, "failed to publish scene on startup");
        }
    }
}

/// `GW.deviceStateChanged → Registry.update`, `GW.connected →
/// BUS.publishStatus("online")`, `GW.disconnected → BUS.publishError`, and
/// rediscovery replaces the registry's device/scene sets.
fn spawn_gw_event_task(
    gw: Arc<GwSession>,
    registry: Arc<Registry>,
    bus: Arc<BusClient>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = gw.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::Connected) => {
                            if let Err(e) = bus.publish_status("online").await {
                                tracing::warn!(err = %e, "failed to publish online status");
                            }
                        }
                        Ok(SessionEvent::Disconnected { reason }) => {
                            let record = BridgeError::transport(reason).to_error_record("gateway");
                            let _ = bus.publish_error(&record).await;
                        }
                        Ok(SessionEvent::DeviceStateChanged(device)) => {
                            registry.update(device).await;
                        }
                        Ok(SessionEvent::DevicesDiscovered(devices)) => {
                            registry.replace_all(devices).await;
                        }
                        Ok(SessionEvent::ScenesDiscovered(scenes)) => {
                            registry.scene_replace_all(scenes).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "GW event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    })
}

/// `Registry` change events become retained bus publications.
fn spawn_registry_publish_task(
    registry: Arc<Registry>,
    bus: Arc<BusClient>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = registry.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(RegistryEvent::StateChanged { curr, .. }) => {
                            if let Err(e) = bus.publish_device(&curr).await {
                                tracing::warn!(err = %e, node_id = curr.node_id, "failed to publish device state");
                            }
                        }
                        Ok(RegistryEvent::SceneChanged { curr }) => {
                            if let Err(e) = bus.publish_scene(&curr).await {
                                tracing::warn!(err = %e, scene_id = curr.scene_id, "failed to publish scene state");
                            }
                        }
                        Ok(RegistryEvent::DevicesUpdated { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "registry event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    })
}

/// Incoming bus commands translated into GW calls, per spec.md §4.E.
fn spawn_bus_command_task(
    mut incoming_rx: tokio::sync::mpsc::Receiver<IncomingMessage>,
    gw: Arc<GwSession>,
    registry: Arc<Registry>,
    bus: Arc<BusClient>,
    config: Config,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let prefix = config.mqtt.topic_prefix.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = incoming_rx.recv() => {
                    let Some(msg) = msg else { return };
                    match topics::parse_incoming(&prefix, &msg.topic, &msg.payload) {
                        Some(command) => handle_command(command, &gw, &registry, &bus, &config).await,
                        None => tracing::debug!(topic = %msg.topic, "discarding unmatched or unparseable BUS message"),
                    }
                }
            }
        }
    })
}

async fn handle_command(
    command: IncomingCommand,
    gw: &Arc<GwSession>,
    registry: &Arc<Registry>,
    bus: &Arc<BusClient>,
    config: &Config,
) {
    match command {
        IncomingCommand::Device { node_id, command } => {
            let result = match command {
                DeviceCommand::Open => gw.set_position(node_id, 100).await,
                DeviceCommand::Close => gw.set_position(node_id, 0).await,
                DeviceCommand::Stop => gw.stop(node_id).await,
                DeviceCommand::Position(pct) => gw.set_position(node_id, pct).await,
            };
            if let Err(e) = result {
                tracing::warn!(err = %e, node_id, "device command failed");
                let _ = bus.publish_error(&e.to_error_record("gateway")).await;
            }
        }
        IncomingCommand::Scene { scene_id } => {
            let known = registry.list_scenes().await.iter().any(|s| s.scene_id == scene_id);
            if !known {
                tracing::warn!(scene_id, "scene command for unknown scene");
                let record = BridgeError::command(format!("unknown scene {scene_id}")).to_error_record("bus");
                let _ = bus.publish_error(&record).await;
                return;
            }
            if let Err(e) = gw.run_scene(scene_id).await {
                tracing::warn!(err = %e, scene_id, "run_scene failed");
                let _ = bus.publish_error(&e.to_error_record("gateway")).await;
            }
        }
        IncomingCommand::Global(GlobalCommand::Refresh) => {
            if let Err(e) = gw.refresh().await {
                tracing::warn!(err = %e, "refresh failed");
                let _ = bus.publish_error(&e.to_error_record("gateway")).await;
            }
        }
        IncomingCommand::Global(GlobalCommand::Reconnect) => {
            // No intermediate `offline` is published here: the operator
            // status topic tracks the bridge process, not the GW session.
            if let Err(e) = gw.reconnect().await {
                tracing::warn!(err = %e, "reconnect failed");
                let _ = bus.publish_error(&e.to_error_record("gateway")).await;
            } else if config.features.auto_discovery {
                discover(gw, registry).await;
            }
        }
    }
}

/// While connected, periodically re-query all device states and fold them
/// into the registry via `replace_all`.
fn spawn_poll_task(
    gw: Arc<GwSession>,
    registry: Arc<Registry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if gw.state() != SessionState::Connected {
                        continue;
                    }
                    match gw.discover_devices().await {
                        Ok(devices) => registry.replace_all(devices).await,
                        Err(e) => tracing::debug!(err = %e, "poll failed to query device states"),
                    }
                }
            }
        }
    })
}
