// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether device binary.
//!
//! Runs the device kernel with a small demo application. With
//! `TETHER_CLOUD_URL` set (and the `http` feature enabled) it talks to a real
//! cloud actor; otherwise an in-process loopback cloud sends it a
//! `down → up → recover` bundle every second.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use tether_core::bundle::{Bundle, StartHint};
use tether_core::cloud::{CloudSession, LoopbackCloud};
use tether_core::config::{DeviceConfig, KernelConfig};
use tether_core::handler::{Application, MethodTable, TxContext};
use tether_core::runtime::DeviceRuntime;

/// Margin the loopback cloud adds to every bundle start.
const DEMO_BUNDLE_MARGIN_MS: u64 = 100;
/// How often the loopback cloud sends a new bundle.
const DEMO_BUNDLE_INTERVAL: Duration = Duration::from_secs(1);

struct DemoApplication;

#[async_trait]
impl Application for DemoApplication {
    async fn setup(&self, ctx: &mut TxContext<'_>) -> anyhow::Result<()> {
        ctx.to_cloud.set("status", json!("ready"))?;
        Ok(())
    }

    async fn pulse(&self, ctx: &mut TxContext<'_>) -> anyhow::Result<()> {
        debug!(now_ms = ctx.now_ms(), "loop");
        Ok(())
    }
}

fn demo_methods() -> MethodTable {
    let mut methods = MethodTable::new();
    methods
        .register_fn("down", |ctx, args| {
            info!(now_ms = ctx.now_ms(), speed = ?args.first(), "Down");
            ctx.to_cloud.set("position", json!("down"))?;
            Ok(Value::Null)
        })
        .register_fn("up", |ctx, args| {
            info!(now_ms = ctx.now_ms(), speed = ?args.first(), "Up");
            ctx.to_cloud.set("position", json!("up"))?;
            Ok(Value::Null)
        })
        .register_fn("recover", |ctx, args| {
            warn!(now_ms = ctx.now_ms(), msg = ?args.first(), "Recovering");
            ctx.to_cloud.set("position", json!("home"))?;
            Ok(Value::Null)
        });
    methods
}

fn demo_bundle() -> Result<Bundle> {
    let mut bundle = Bundle::new(DEMO_BUNDLE_MARGIN_MS);
    bundle
        .append("down", 0, vec![json!(1)])?
        .append("up", 300, vec![json!(1)])?
        .append("recover", 5000, vec![json!("go home")])?;
    bundle.freeze(StartHint::Current)?;
    Ok(bundle)
}

/// Play the cloud actor: a fresh bundle and a notification every interval.
async fn drive_loopback(cloud: LoopbackCloud) {
    let mut counter: u64 = 0;
    let mut ticker = tokio::time::interval(DEMO_BUNDLE_INTERVAL);
    loop {
        ticker.tick().await;
        counter += 1;
        let sent = demo_bundle().map_err(anyhow::Error::from).and_then(|bundle| {
            cloud
                .send_bundle(&bundle)
                .map_err(anyhow::Error::from)
        });
        match sent {
            Ok(index) => debug!(index, counter, "Loopback cloud sent bundle"),
            Err(e) => {
                warn!(error = %e, "Loopback cloud stopped sending bundles");
                break;
            }
        }
        let acks = cloud.acks();
        if let Some(last) = acks.last().filter(|ack| !ack.result) {
            info!(index = last.index, "Last bundle was late");
        }
        cloud.notify(json!([counter]));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether_core=info".parse()?)
                .add_directive("tether_device=info".parse()?),
        )
        .init();

    info!("Starting Tether device");

    let config = KernelConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let device = DeviceConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        device_id = %device.device_id,
        cloud_url = device.cloud_url.as_deref().unwrap_or("loopback"),
        pulse_interval_ms = config.pulse_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let (cloud, demo): (Arc<dyn CloudSession>, Option<LoopbackCloud>) = match &device.cloud_url {
        #[cfg(feature = "http")]
        Some(url) => {
            let session = tether_core::cloud::HttpCloudSession::new(url, &device.device_id)?;
            (Arc::new(session), None)
        }
        #[cfg(not(feature = "http"))]
        Some(url) => {
            warn!(url = %url, "Built without the http feature, using loopback cloud");
            let loopback = LoopbackCloud::new();
            (Arc::new(loopback.clone()), Some(loopback))
        }
        None => {
            let loopback = LoopbackCloud::new();
            (Arc::new(loopback.clone()), Some(loopback))
        }
    };

    let runtime = DeviceRuntime::builder()
        .config(config)
        .cloud(cloud)
        .application(Arc::new(DemoApplication))
        .methods(demo_methods())
        .build()?
        .start()
        .await?;

    let driver = demo.map(|cloud| tokio::spawn(drive_loopback(cloud)));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        }
        reason = runtime.wait() => {
            warn!(reason = %reason, "Device runtime stopped");
        }
    }

    if let Some(driver) = driver {
        driver.abort();
    }
    let reason = runtime.shutdown().await?;
    info!(reason = %reason, "Tether device stopped");
    Ok(())
}
