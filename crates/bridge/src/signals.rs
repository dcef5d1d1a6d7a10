// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SIGTERM/SIGINT handling. Either signal triggers graceful shutdown via
//! the daemon's `CancellationToken`, the same cooperative-cancellation
//! primitive used throughout the bridge's tasks.

use tokio_util::sync::CancellationToken;

/// Wait for SIGTERM or SIGINT (Ctrl-C), then cancel `token`. Returns once
/// the signal has been observed and cancellation requested.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to install SIGTERM handler, SIGINT only");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
    token.cancel();
}
