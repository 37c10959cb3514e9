/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use anyhow::Result;
use ringmad::config::DaemonConfig;
use ringmad::Daemon;
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; info otherwise
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <config-file>", args[0]);
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    info!("Starting ringmad with config: {}", config_path.display());

    let config = DaemonConfig::from_file(&config_path)?;
    info!(
        address = %config.address,
        port = config.port,
        seeds = config.seeds.len(),
        "Configuration loaded successfully"
    );

    let daemon = Daemon::new(config).await?;
    daemon.start().await?;
    info!(peer = %daemon.local_name(), "ringmad started successfully");

    daemon.wait_for_shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
