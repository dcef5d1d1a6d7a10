// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use klf200_bridge::config::{Cli, Config};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            debug_assert!(e.kind.is_fatal_at_startup(), "Config::load only returns Config-kind errors");
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = klf200_bridge::logging::init(&config);

    if cli.print_config {
        let pretty = serde_json::to_string_pretty(&config.redacted()).unwrap_or_else(|_| "{}".to_owned());
        println!("{pretty}");
        return;
    }

    if let Err(e) = klf200_bridge::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
