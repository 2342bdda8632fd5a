/*
 * Copyright (C) 2025 The Cirrus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use cirrus::cirrus::cloud::fake::FakeCloudProvider;
use cirrus::cirrus::cloud::InstanceType;
use cirrus::cirrus::cluster::client::ClusterClient;
use cirrus::cirrus::config::Options;
use cirrus::cirrus::logger::{self, LogFormat};
use cirrus::cirrus::observability::health::{self, HealthState};
use cirrus::cirrus::operator::Operator;

/// Cluster-node autoscaler for a container orchestrator.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cirrus {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the autoscaling controllers
    Controller(ControllerArgs),

    /// Print the effective configuration and exit
    Options,
}

#[derive(Args)]
struct ControllerArgs {
    /// Port serving Prometheus metrics
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Port serving the liveness and readiness probes
    #[arg(long)]
    health_probe_port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,

    /// Upper bound on the pending-pod batch window, e.g. "10s"
    #[arg(long)]
    batch_max_duration: Option<String>,

    /// Idle gap that closes the batch window, e.g. "1s"
    #[arg(long)]
    batch_idle_duration: Option<String>,

    /// Turn the drift feature gate off
    #[arg(long)]
    disable_drift: bool,

    /// JSON file with the instance-type catalog served by the built-in
    /// reference provider
    #[arg(long)]
    instance_catalog: Option<PathBuf>,
}

impl ControllerArgs {
    fn apply(&self, options: &mut Options) -> Result<(), Box<dyn Error>> {
        if let Some(port) = self.metrics_port {
            options.metrics_port = port;
        }
        if let Some(port) = self.health_probe_port {
            options.health_probe_port = port;
        }
        if let Some(level) = &self.log_level {
            options.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            LogFormat::from_str(format)?;
            options.log_format = format.clone();
        }
        if let Some(value) = &self.batch_max_duration {
            options.batch_max_duration = humantime::parse_duration(value)?;
        }
        if let Some(value) = &self.batch_idle_duration {
            options.batch_idle_duration = humantime::parse_duration(value)?;
        }
        if self.disable_drift {
            options.feature_gates.drift = false;
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cirrus::parse();
    match cli.command {
        Commands::Options => {
            let options = Options::from_env();
            println!("{}", serde_json::to_string_pretty(&options)?);
            Ok(())
        }
        Commands::Controller(args) => {
            let mut options = Options::from_env();
            args.apply(&mut options)?;
            options.validate()?;
            let format = LogFormat::from_str(&options.log_format).unwrap_or(LogFormat::Text);
            logger::init(&options.log_level, format);
            run_controller(options, args.instance_catalog)
        }
    }
}

#[tokio::main]
async fn run_controller(
    options: Options,
    catalog_path: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let cloud = Arc::new(match catalog_path {
        Some(path) => {
            let payload = std::fs::read(&path)?;
            let catalog: Vec<InstanceType> = serde_json::from_slice(&payload)?;
            FakeCloudProvider::new(catalog)
        }
        None => FakeCloudProvider::with_default_catalog(),
    });
    let client = Arc::new(ClusterClient::new());
    let operator = Operator::start(&options, client, cloud.clone());

    let health_state = HealthState {
        cloud,
        cluster: operator.state.clone(),
    };
    let probe_addr = SocketAddr::from(([0, 0, 0, 0], options.health_probe_port));
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], options.metrics_port));
    let probe_listener = tokio::net::TcpListener::bind(probe_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let probe_router = health::router(health_state.clone());
    let metrics_router = health::router(health_state);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(probe_listener, probe_router).await {
            log::error!("probe server failed: {}", err);
        }
    });
    tokio::spawn(async move {
        if let Err(err) = axum::serve(metrics_listener, metrics_router).await {
            log::error!("metrics server failed: {}", err);
        }
    });
    log::info!(
        "serving probes on :{} and metrics on :{}",
        options.health_probe_port,
        options.metrics_port
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    operator.shutdown().await;
    Ok(())
}
