// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end bundle delivery and scheduling through a running device.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{T0, TestContext, down_up_recover, quiet_config, settle};
use tether_core::bundle::{Bundle, StartHint};
use tether_core::cloud::BundleAck;
use tether_core::scheduler::BundleState;

fn single(method: &str, arg: i64, hint: StartHint, now_ms: i64) -> Bundle {
    let mut bundle = Bundle::new(100);
    bundle.append(method, 0, vec![json!(arg)]).unwrap();
    bundle.freeze_at(hint, now_ms).unwrap();
    bundle
}

#[tokio::test(start_paused = true)]
async fn test_unattended_bundle_runs_to_recover() {
    let ctx = TestContext::new();
    ctx.cloud.send_bundle(&down_up_recover(100, T0)).unwrap();

    let runtime = ctx.start(quiet_config()).await;
    assert_eq!(runtime.acks(), vec![BundleAck { index: 0, result: true }]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(ctx.called(), vec!["down"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ctx.called(), vec!["down", "up"]);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(
        ctx.calls(),
        vec![
            ("down".to_string(), vec![json!(1)]),
            ("up".to_string(), vec![json!(1)]),
            ("recover".to_string(), vec![json!("go home")]),
        ]
    );

    settle().await;
    assert_eq!(ctx.cloud.device_value("position"), Some(json!("recover")));
    assert_eq!(ctx.cloud.acks(), vec![BundleAck { index: 0, result: true }]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_new_bundle_supersedes_remaining_commands() {
    let ctx = TestContext::new();
    let first = down_up_recover(100, T0);
    ctx.cloud.send_bundle(&first).unwrap();
    let runtime = ctx.start(quiet_config()).await;

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(ctx.called(), vec!["down", "up"]);

    // Keep the device on a short leash: a fresh bundle cancels `recover`.
    let second = single("down", 2, StartHint::Current, T0);
    ctx.cloud.send_bundle(&second).unwrap();
    ctx.cloud.notify(json!([1]));

    tokio::time::sleep(Duration::from_millis(6000)).await;
    assert_eq!(
        ctx.calls(),
        vec![
            ("down".to_string(), vec![json!(1)]),
            ("up".to_string(), vec![json!(1)]),
            ("down".to_string(), vec![json!(2)]),
        ]
    );

    let history = runtime.scheduler().history();
    let first_id = first.id().unwrap();
    let second_id = second.id().unwrap();
    assert!(history.contains(&(first_id, BundleState::Superseded)));
    assert!(history.contains(&(second_id, BundleState::Completed)));
    assert_eq!(runtime.scheduler().active(), None);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_late_bundle_is_rejected_on_corrected_clock() {
    let ctx = TestContext::new();
    // The cloud is ten seconds ahead of the device.
    ctx.cloud.set_time_offset_ms(10_000);
    let late = single("down", 1, StartHint::At(T0 + 5_000), T0);
    ctx.cloud.send_bundle(&late).unwrap();

    let runtime = ctx.start(quiet_config()).await;
    assert_eq!(runtime.clock().now_ms(), T0 + 10_000);
    assert_eq!(runtime.acks(), vec![BundleAck { index: 0, result: false }]);
    assert_eq!(
        runtime.scheduler().state(&late.id().unwrap()),
        Some(BundleState::Rejected)
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(ctx.called().is_empty());

    settle().await;
    assert_eq!(ctx.cloud.acks(), vec![BundleAck { index: 0, result: false }]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_small_clock_offset_is_ignored() {
    let ctx = TestContext::new();
    ctx.cloud.set_time_offset_ms(20);
    let runtime = ctx.start(quiet_config()).await;

    assert_eq!(runtime.clock().offset_ms(), 20);
    assert_eq!(runtime.clock().now_ms(), T0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stale_now_safe_bundle_is_skipped() {
    let ctx = TestContext::new();
    let stale = single("up", 1, StartHint::NowSafe { staleness_ms: 1_000 }, T0 - 5_000);
    let fresh = single("down", 1, StartHint::Now, T0);
    ctx.cloud.send_bundle(&stale).unwrap();
    ctx.cloud.send_bundle(&fresh).unwrap();

    let runtime = ctx.start(quiet_config()).await;
    assert_eq!(
        runtime.acks(),
        vec![
            BundleAck { index: 0, result: false },
            BundleAck { index: 1, result: true },
        ]
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ctx.called(), vec!["down"]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ack_history_keeps_most_recent() {
    let ctx = TestContext::new();
    for arg in 1..=3 {
        ctx.cloud
            .send_bundle(&single("down", arg, StartHint::Current, T0))
            .unwrap();
    }

    let runtime = ctx.start(quiet_config().with_ack_history_size(2)).await;
    let indices: Vec<u64> = runtime.acks().iter().map(|ack| ack.index).collect();
    assert_eq!(indices, vec![1, 2]);

    settle().await;
    assert_eq!(ctx.cloud.acks().len(), 3);
    assert_eq!(ctx.cloud.undelivered(), 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pulse_cron_picks_up_bundles_without_notification() {
    let ctx = TestContext::new();
    let config = quiet_config().with_pulse_interval(Duration::from_millis(500));
    let runtime = ctx.start(config).await;

    ctx.cloud
        .send_bundle(&single("down", 7, StartHint::Now, T0))
        .unwrap();

    // One pulse uploads and fetches the bundle, the next one delivers it.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(ctx.calls(), vec![("down".to_string(), vec![json!(7)])]);

    runtime.shutdown().await.unwrap();
}
