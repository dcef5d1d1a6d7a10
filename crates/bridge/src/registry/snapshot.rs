// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk registry snapshot: `{devices:{id→Device}, scenes:{id→Scene},
//! lastRefresh}`, written atomically (temp file + rename) and carrying a
//! schema `version` so future format changes can be detected. A missing or
//! mismatched version is treated the same as a missing file: start empty
//! rather than fail startup.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Device, Scene};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
struct OnDisk {
    version: u32,
    devices: BTreeMap<u32, Device>,
    scenes: BTreeMap<u32, Scene>,
    #[serde(rename = "lastRefresh")]
    last_refresh: String,
}

/// An in-memory view of the snapshot, used between the registry and the
/// persistence layer.
pub struct Snapshot {
    pub devices: BTreeMap<u32, Device>,
    pub scenes: BTreeMap<u32, Scene>,
    pub last_refresh: String,
}

/// Load a snapshot from `path`. Returns `Ok(None)` if the file is absent,
/// unparseable, or carries an unexpected `version` — all treated as "start
/// with an empty registry", never a startup failure.
pub async fn load(path: &Path) -> io::Result<Option<Snapshot>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let on_disk: OnDisk = match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(err = %e, "snapshot file is not valid JSON, starting empty");
            return Ok(None);
        }
    };

    if on_disk.version != SNAPSHOT_VERSION {
        tracing::warn!(
            found = on_disk.version,
            expected = SNAPSHOT_VERSION,
            "snapshot schema version mismatch, starting empty"
        );
        return Ok(None);
    }

    Ok(Some(Snapshot { devices: on_disk.devices, scenes: on_disk.scenes, last_refresh: on_disk.last_refresh }))
}

/// Atomically write `snapshot` to `path`: serialize to a temp file in the
/// same directory, then rename over the target.
pub async fn save(path: &Path, snapshot: &Snapshot) -> io::Result<()> {
    let on_disk = OnDisk {
        version: SNAPSHOT_VERSION,
        devices: snapshot.devices.clone(),
        scenes: snapshot.scenes.clone(),
        last_refresh: snapshot.last_refresh.clone(),
    };
    let body = serde_json::to_vec_pretty(&on_disk)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("devices.json")
    ));
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeviceType;

    fn sample_device() -> Device {
        Device {
            node_id: 0,
            name: "Kitchen".to_owned(),
            device_type: DeviceType::Window,
            position: 50,
            target_position: 50,
            moving: false,
            online: true,
            error: None,
            limitation_min: 0,
            limitation_max: 100,
            serial_number: "deadbeef".to_owned(),
            product_type: 0x0040,
            last_update: "2026-01-01T00:00:00Z".to_owned(),
        }
    }

    #[tokio::test]
    async fn round_trips_devices_and_scenes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let mut devices = BTreeMap::new();
        devices.insert(0, sample_device());
        let snap = Snapshot { devices, scenes: BTreeMap::new(), last_refresh: "2026-01-01T00:00:00Z".to_owned() };
        save(&path, &snap).await.unwrap();

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[&0].position, 50);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        assert!(load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn version_mismatch_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        tokio::fs::write(&path, r#"{"version":99,"devices":{},"scenes":{},"lastRefresh":""}"#)
            .await
            .unwrap();
        assert!(load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(load(&path).await.unwrap().is_none());
    }
}
