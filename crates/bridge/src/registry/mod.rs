// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device Registry — the authoritative in-memory snapshot of actuator and
//! scene state, with semantic change detection and debounced disk
//! persistence.
//!
//! Mutations serialize through a single `tokio::sync::Mutex`, matching the
//! teacher's "registry task" model: there is never a concurrent writer, so
//! persistence can assume exclusive access to the snapshot file.

mod snapshot;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::DeviceType;
use crate::util::iso8601_now;

pub use snapshot::Snapshot;

const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

/// A single actuator's last-known state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub node_id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub position: u8,
    pub target_position: u8,
    pub moving: bool,
    pub online: bool,
    pub error: Option<String>,
    pub limitation_min: u8,
    pub limitation_max: u8,
    pub serial_number: String,
    pub product_type: u16,
    pub last_update: String,
}

/// The subset of `Device` fields whose change triggers a `stateChanged` event.
#[derive(PartialEq)]
struct SemanticKey<'a> {
    position: u8,
    target_position: u8,
    moving: bool,
    online: bool,
    error: &'a Option<String>,
    name: &'a str,
}

impl Device {
    fn semantic_key(&self) -> SemanticKey<'_> {
        SemanticKey {
            position: self.position,
            target_position: self.target_position,
            moving: self.moving,
            online: self.online,
            error: &self.error,
            name: &self.name,
        }
    }
}

/// An externally-managed scene preset. The bridge reads these, never writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub scene_id: u32,
    pub name: String,
    pub product_count: u32,
}

/// A change notification emitted by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was inserted or a semantic field changed.
    StateChanged { prev: Option<Device>, curr: Device },
    /// A bulk `replaceAll` finished; carries the full new device set.
    DevicesUpdated { devices: Vec<Device> },
    /// A scene was inserted or updated.
    SceneChanged { curr: Scene },
}

struct Inner {
    devices: BTreeMap<u32, Device>,
    scenes: BTreeMap<u32, Scene>,
    last_refresh: String,
    dirty: bool,
}

/// Authoritative device/scene state, with change detection and debounced
/// atomic persistence to `{dataDir}/devices.json`.
pub struct Registry {
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<RegistryEvent>,
    snapshot_path: PathBuf,
    cancel: CancellationToken,
    debounce_armed: Mutex<bool>,
}

impl Registry {
    /// Load the registry from `snapshot_path` if present and well-formed,
    /// otherwise start empty. Spawns the persistence debounce task.
    pub async fn load(snapshot_path: PathBuf, cancel: CancellationToken) -> Arc<Self> {
        let (devices, scenes, last_refresh) = match snapshot::load(&snapshot_path).await {
            Ok(Some(snap)) => (snap.devices, snap.scenes, snap.last_refresh),
            Ok(None) => (BTreeMap::new(), BTreeMap::new(), iso8601_now()),
            Err(e) => {
                tracing::warn!(err = %e, path = %snapshot_path.display(), "ignoring unreadable snapshot");
                (BTreeMap::new(), BTreeMap::new(), iso8601_now())
            }
        };

        let (event_tx, _) = broadcast::channel(256);
        let registry = Arc::new(Self {
            inner: Mutex::new(Inner { devices, scenes, last_refresh, dirty: false }),
            event_tx,
            snapshot_path,
            cancel,
            debounce_armed: Mutex::new(false),
        });
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get(&self, node_id: u32) -> Option<Device> {
        self.inner.lock().await.devices.get(&node_id).cloned()
    }

    /// Devices in stable `nodeId` order.
    pub async fn list(&self) -> Vec<Device> {
        self.inner.lock().await.devices.values().cloned().collect()
    }

    pub async fn list_scenes(&self) -> Vec<Scene> {
        self.inner.lock().await.scenes.values().cloned().collect()
    }

    /// Insert or update a device. Emits `StateChanged` only when there was
    /// no previous entry, or a semantic field differs from it.
    pub async fn update(self: &Arc<Self>, device: Device) {
        let event = {
            let mut inner = self.inner.lock().await;
            let prev = inner.devices.get(&device.node_id).cloned();
            let changed = match &prev {
                None => true,
                Some(p) => p.semantic_key() != device.semantic_key(),
            };
            if !changed {
                return;
            }
            inner.devices.insert(device.node_id, device.clone());
            inner.last_refresh = iso8601_now();
            inner.dirty = true;
            RegistryEvent::StateChanged { prev, curr: device }
        };
        let _ = self.event_tx.send(event);
        self.arm_debounce();
    }

    /// Bulk replace. Emits one `StateChanged` per changed device, then a
    /// single `DevicesUpdated` summary.
    pub async fn replace_all(self: &Arc<Self>, devices: Vec<Device>) {
        let (changes, snapshot) = {
            let mut inner = self.inner.lock().await;
            let mut changes = Vec::new();
            for device in &devices {
                let prev = inner.devices.get(&device.node_id).cloned();
                let changed = match &prev {
                    None => true,
                    Some(p) => p.semantic_key() != device.semantic_key(),
                };
                if changed {
                    changes.push((prev, device.clone()));
                }
            }
            for device in &devices {
                inner.devices.insert(device.node_id, device.clone());
            }
            if !changes.is_empty() {
                inner.last_refresh = iso8601_now();
                inner.dirty = true;
            }
            (changes, devices)
        };
        for (prev, curr) in changes {
            let _ = self.event_tx.send(RegistryEvent::StateChanged { prev, curr });
        }
        let _ = self.event_tx.send(RegistryEvent::DevicesUpdated { devices: snapshot });
        self.arm_debounce();
    }

    pub async fn scene_update(self: &Arc<Self>, scene: Scene) {
        {
            let mut inner = self.inner.lock().await;
            inner.scenes.insert(scene.scene_id, scene.clone());
            inner.dirty = true;
        }
        let _ = self.event_tx.send(RegistryEvent::SceneChanged { curr: scene });
        self.arm_debounce();
    }

    pub async fn scene_replace_all(self: &Arc<Self>, scenes: Vec<Scene>) {
        {
            let mut inner = self.inner.lock().await;
            inner.scenes = scenes.into_iter().map(|s| (s.scene_id, s)).collect();
            inner.dirty = true;
        }
        self.arm_debounce();
    }

    /// Counts and dirty flag, for logging/health purposes only.
    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats { devices: inner.devices.len(), scenes: inner.scenes.len(), dirty: inner.dirty }
    }

    /// Force immediate persistence regardless of the debounce timer.
    pub async fn flush(&self) {
        self.persist_if_dirty().await;
    }

    /// Flush and stop the debounce timer.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.flush().await;
    }

    fn arm_debounce(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut armed = registry.debounce_armed.lock().await;
                if *armed {
                    return;
                }
                *armed = true;
            }
            tokio::select! {
                _ = registry.cancel.cancelled() => {}
                _ = tokio::time::sleep(PERSIST_DEBOUNCE) => {
                    registry.persist_if_dirty().await;
                }
            }
            *registry.debounce_armed.lock().await = false;
        });
    }

    async fn persist_if_dirty(&self) {
        let snap = {
            let mut inner = self.inner.lock().await;
            if !inner.dirty {
                return;
            }
            inner.dirty = false;
            Snapshot {
                devices: inner.devices.clone(),
                scenes: inner.scenes.clone(),
                last_refresh: inner.last_refresh.clone(),
            }
        };
        if let Err(e) = snapshot::save(&self.snapshot_path, &snap).await {
            let err = crate::error::BridgeError::persistence(e.to_string());
            tracing::warn!(err = %err, path = %self.snapshot_path.display(), "snapshot persistence failed");
            // Leave dirty so the next mutation retries the write.
            self.inner.lock().await.dirty = true;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub devices: usize,
    pub scenes: usize,
    pub dirty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(node_id: u32, position: u8) -> Device {
        Device {
            node_id,
            name: "Kitchen".to_owned(),
            device_type: DeviceType::Window,
            position,
            target_position: position,
            moving: false,
            online: true,
            error: None,
            limitation_min: 0,
            limitation_max: 100,
            serial_number: "deadbeef".to_owned(),
            product_type: 0x0040,
            last_update: iso8601_now(),
        }
    }

    async fn new_registry() -> Arc<Registry> {
        let dir = tempfile::tempdir().unwrap();
        Registry::load(dir.path().join("devices.json"), CancellationToken::new()).await
    }

    #[tokio::test]
    async fn update_emits_state_changed_on_first_insert() {
        let registry = new_registry().await;
        let mut rx = registry.subscribe();
        registry.update(device(0, 50)).await;
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, RegistryEvent::StateChanged { prev: None, .. }));
    }

    #[tokio::test]
    async fn idempotent_update_emits_no_second_event() {
        let registry = new_registry().await;
        registry.update(device(0, 50)).await;
        let mut rx = registry.subscribe();
        registry.update(device(0, 50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_with_changed_position_emits_event() {
        let registry = new_registry().await;
        registry.update(device(0, 50)).await;
        let mut rx = registry.subscribe();
        registry.update(device(0, 100)).await;
        let event = rx.try_recv().unwrap();
        match event {
            RegistryEvent::StateChanged { prev: Some(p), curr } => {
                assert_eq!(p.position, 50);
                assert_eq!(curr.position, 100);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_ignoring_non_semantic_field_change_is_noop() {
        let registry = new_registry().await;
        registry.update(device(0, 50)).await;
        let mut rx = registry.subscribe();
        let mut changed_limits = device(0, 50);
        changed_limits.limitation_max = 90;
        changed_limits.last_update = "2099-01-01T00:00:00Z".to_owned();
        registry.update(changed_limits).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn replace_all_emits_one_state_changed_per_change_then_summary() {
        let registry = new_registry().await;
        registry.update(device(0, 50)).await;
        let mut rx = registry.subscribe();
        registry.replace_all(vec![device(0, 60), device(1, 0)]).await;
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, RegistryEvent::StateChanged { .. }));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, RegistryEvent::StateChanged { .. }));
        let third = rx.try_recv().unwrap();
        assert!(matches!(third, RegistryEvent::DevicesUpdated { .. }));
    }

    #[tokio::test]
    async fn list_is_sorted_by_node_id() {
        let registry = new_registry().await;
        registry.update(device(5, 0)).await;
        registry.update(device(1, 0)).await;
        registry.update(device(3, 0)).await;
        let ids: Vec<u32> = registry.list().await.iter().map(|d| d.node_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn flush_persists_and_clears_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let registry = Registry::load(path.clone(), CancellationToken::new()).await;
        registry.update(device(0, 50)).await;
        registry.flush().await;
        assert!(path.exists());
        let stats = registry.stats().await;
        assert!(!stats.dirty);
    }

    #[tokio::test]
    async fn reload_recovers_persisted_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let registry = Registry::load(path.clone(), CancellationToken::new()).await;
        registry.update(device(0, 42)).await;
        registry.flush().await;

        let reloaded = Registry::load(path, CancellationToken::new()).await;
        let devices = reloaded.list().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].position, 42);
    }
}
