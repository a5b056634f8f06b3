// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tether-core integration tests.
//!
//! Provides TestContext wiring a loopback cloud, a manual clock and a
//! recording method table into a device runtime.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use tether_core::bundle::{Bundle, StartHint};
use tether_core::clock::{Clock, ManualClock};
use tether_core::cloud::LoopbackCloud;
use tether_core::config::KernelConfig;
use tether_core::error::TransactionFault;
use tether_core::handler::{
    Application, ErrorDisposition, Method, MethodTable, NoopApplication, TxContext,
};
use tether_core::runtime::DeviceRuntime;

/// Device wall clock at the start of every test.
pub const T0: i64 = 1_700_000_000_000;

/// Method calls seen by the recording methods, in execution order.
pub type CallLog = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

/// Never finishes.
pub struct Hang;

#[async_trait]
impl Method for Hang {
    async fn call(&self, _ctx: &mut TxContext<'_>, _args: Vec<Value>) -> anyhow::Result<Value> {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    }
}

/// Application that absorbs every fault and remembers its code.
#[derive(Default)]
pub struct AbsorbingApplication {
    pub faults: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Application for AbsorbingApplication {
    fn on_error(&self, fault: &TransactionFault) -> ErrorDisposition {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault.error_code());
        }
        ErrorDisposition::Absorb
    }
}

/// Kernel settings that keep background timers out of the way.
pub fn quiet_config() -> KernelConfig {
    KernelConfig::default()
        .with_pulse_interval(Duration::from_secs(3600))
        .with_watchdog_interval(Duration::from_secs(3600))
}

/// Methods that record their calls, plus a few that misbehave.
pub fn recording_methods(log: &CallLog) -> MethodTable {
    let mut methods = MethodTable::new();
    for name in ["down", "up", "recover"] {
        let log = log.clone();
        methods.register_fn(name, move |ctx, args| {
            log.lock().unwrap().push((name.to_string(), args.clone()));
            ctx.to_cloud.set("position", json!(name))?;
            Ok(Value::Null)
        });
    }
    methods
        .register_fn("touch", |ctx, args| {
            let value = args.first().cloned().unwrap_or(Value::Null);
            ctx.to_cloud.set("touched", value.clone())?;
            ctx.state["touched"] = value.clone();
            Ok(value)
        })
        .register_fn("explode", |ctx, _args| {
            ctx.state["dirty"] = json!(true);
            ctx.to_cloud.set("dirty", json!(true))?;
            anyhow::bail!("kaboom")
        })
        .register_fn("panic", |_ctx, _args| panic!("handler exploded"))
        .register_fn("read_state", |ctx, _args| Ok(ctx.state.clone()))
        .register_fn("nap", |ctx, args| {
            let secs = args.first().and_then(Value::as_u64).unwrap_or(0);
            Ok(json!(ctx.halt_and_restart(Duration::from_secs(secs))))
        })
        .register("hang", Arc::new(Hang));
    methods
}

/// Build a frozen `down → up → recover` bundle starting `margin_ms` after `now_ms`.
pub fn down_up_recover(margin_ms: u64, now_ms: i64) -> Bundle {
    let mut bundle = Bundle::new(margin_ms);
    bundle
        .append("down", 0, vec![json!(1)])
        .unwrap()
        .append("up", 300, vec![json!(1)])
        .unwrap()
        .append("recover", 5000, vec![json!("go home")])
        .unwrap();
    bundle.freeze_at(StartHint::Current, now_ms).unwrap();
    bundle
}

/// Loopback cloud, manual clock and call log for one device.
pub struct TestContext {
    pub cloud: LoopbackCloud,
    pub clock: Arc<ManualClock>,
    pub calls: CallLog,
    pub exit_code: Arc<AtomicI32>,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            cloud: LoopbackCloud::new(),
            clock: Arc::new(ManualClock::new(T0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            exit_code: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Start a runtime with the recording methods and a no-op application.
    pub async fn start(&self, config: KernelConfig) -> DeviceRuntime {
        self.start_with(config, Arc::new(NoopApplication)).await
    }

    /// Start a runtime with the recording methods and `application`.
    pub async fn start_with(
        &self,
        config: KernelConfig,
        application: Arc<dyn Application>,
    ) -> DeviceRuntime {
        let exit_code = self.exit_code.clone();
        let clock: Arc<dyn Clock> = self.clock.clone();
        DeviceRuntime::builder()
            .config(config)
            .cloud(Arc::new(self.cloud.clone()))
            .application(application)
            .methods(recording_methods(&self.calls))
            .clock(clock)
            .exit_hook(move |code| exit_code.store(code, Ordering::SeqCst))
            .build()
            .expect("runtime config")
            .start()
            .await
            .expect("runtime start")
    }

    /// Method names called so far.
    pub fn called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Arguments of every call so far.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

/// Let spawned tasks run without moving time by more than a millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
