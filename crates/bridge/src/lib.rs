// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! klf200-bridge: a long-running daemon bridging a window/blind/shutter
//! gateway to an MQTT-semantics bus.
//!
//! Module map, leaves first: [`codec`] is the pure position/type-map
//! library (§4.A); [`registry`] is the authoritative device/scene snapshot
//! with change detection and debounced persistence (§4.B); [`gateway`]
//! owns the single authenticated gateway session (§4.C); [`bus`] owns the
//! MQTT broker connection (§4.D); [`daemon`] is the orchestrator that
//! wires the three together (§4.E). [`config`], [`error`], [`logging`],
//! and [`signals`] are the ambient stack around that core.

pub mod bus;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod registry;
pub mod signals;
mod util;

use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Run the bridge daemon until a termination signal is received.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(signals::wait_for_shutdown_signal(cancel.clone()));

    daemon::run(config, cancel).await?;

    signal_task.abort();
    Ok(())
}
