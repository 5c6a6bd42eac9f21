//! Delivery against a local collector: ordering, blocking and framing.

mod common;

use axum::http::Method;
use common::{Collector, Reply};
use pulse_sdk::device::{AdvertisingIdSource, IdentityUnavailable};
use pulse_sdk::{
    BlockReason, DeliveryState, DeviceIdStrategy, MemoryStore, Pulse, UserProfile,
};
use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;

fn build(config: pulse_core::PulseConfig) -> Arc<Pulse> {
    Pulse::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_failed_head_blocks_queue_until_it_succeeds() {
    let collector = Collector::start(Reply::ServerError).await;
    let pulse = build(collector.config());

    pulse.on_start(None).unwrap();
    pulse.on_stop().unwrap();
    pulse
        .set_user_data(&UserProfile {
            name: Some("Ada".into()),
            ..Default::default()
        })
        .unwrap();
    let queued = pulse.pending_snapshot().unwrap();
    assert_eq!(queued.len(), 3);

    assert_eq!(
        pulse.flush().await,
        DeliveryState::Blocked(BlockReason::DeliveryFailed)
    );
    assert_eq!(pulse.pending_snapshot().unwrap(), queued);
    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].param("begin_session").as_deref(), Some("1"));

    collector.set_reply(Reply::Success);
    assert_eq!(pulse.flush().await, DeliveryState::Idle);
    assert_eq!(pulse.pending_requests().unwrap(), 0);

    let received = collector.received();
    assert_eq!(received.len(), 4);
    assert_eq!(received[1].param("begin_session").as_deref(), Some("1"));
    assert_eq!(received[2].param("end_session").as_deref(), Some("1"));
    assert!(received[3].param("user_details").is_some());
    for request in &received {
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.param("device_id").as_deref(), Some("dev-1"));
        assert_eq!(request.param("app_key").as_deref(), Some("K"));
    }
}

#[tokio::test]
async fn test_rejected_and_malformed_replies_block() {
    let collector = Collector::start(Reply::Rejected).await;
    let pulse = build(collector.config());
    pulse.record_crash("trace", false).unwrap();

    assert_eq!(
        pulse.flush().await,
        DeliveryState::Blocked(BlockReason::DeliveryFailed)
    );
    collector.set_reply(Reply::Malformed);
    assert_eq!(
        pulse.flush().await,
        DeliveryState::Blocked(BlockReason::DeliveryFailed)
    );
    assert_eq!(pulse.pending_requests().unwrap(), 1);

    collector.set_reply(Reply::SuccessUppercase);
    assert_eq!(pulse.flush().await, DeliveryState::Idle);
    assert_eq!(pulse.pending_requests().unwrap(), 0);
    assert_eq!(collector.received().len(), 3);
}

#[tokio::test]
async fn test_crash_report_is_posted() {
    let collector = Collector::start(Reply::Success).await;
    let pulse = build(collector.config());
    pulse.record_crash("panic at main.rs:3", true).unwrap();
    assert_eq!(pulse.flush().await, DeliveryState::Idle);

    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, Method::POST);
    assert!(received[0].query.is_empty());
    let crash: serde_json::Value =
        serde_json::from_str(&received[0].param("crash").unwrap()).unwrap();
    assert_eq!(crash["_error"], "panic at main.rs:3");
    assert_eq!(received[0].param("device_id").as_deref(), Some("dev-1"));
}

#[tokio::test]
async fn test_picture_is_uploaded_as_multipart() {
    let collector = Collector::start(Reply::Success).await;
    let pulse = build(collector.config());

    let mut picture = tempfile::NamedTempFile::new().unwrap();
    picture.write_all(b"PNGDATA").unwrap();
    let path = picture.path().to_string_lossy().into_owned();
    pulse
        .set_user_data(&UserProfile {
            name: Some("Ada".into()),
            picture_path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(pulse.flush().await, DeliveryState::Idle);

    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, Method::POST);
    assert_eq!(received[0].param("picturePath"), Some(path));
    let body = received[0].body_text();
    assert!(body.contains("name=\"binaryFile\""));
    assert!(body.contains("PNGDATA"));
}

struct GatedAdvertisingId {
    gate: std::sync::Mutex<mpsc::Receiver<()>>,
}

impl AdvertisingIdSource for GatedAdvertisingId {
    fn is_available(&self) -> bool {
        true
    }

    fn fetch(&self) -> Result<String, IdentityUnavailable> {
        let gate = self.gate.lock().map_err(|_| IdentityUnavailable("poisoned".into()))?;
        gate.recv()
            .map_err(|_| IdentityUnavailable("gate closed".into()))?;
        Ok("gaid-7".to_string())
    }
}

#[tokio::test]
async fn test_nothing_is_sent_before_identity_resolves() {
    let collector = Collector::start(Reply::Success).await;
    let (release, gate) = mpsc::channel();
    let mut config = collector.config();
    config.device_id = None;
    let pulse = Pulse::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .device_id_strategy(DeviceIdStrategy::AdvertisingId)
        .advertising_id_source(Arc::new(GatedAdvertisingId {
            gate: std::sync::Mutex::new(gate),
        }))
        .build()
        .unwrap();

    pulse.on_start(None).unwrap();
    assert_eq!(pulse.device_id(), None);
    assert_eq!(
        pulse.flush().await,
        DeliveryState::Blocked(BlockReason::AwaitingIdentity)
    );
    assert!(collector.received().is_empty());
    assert_eq!(pulse.pending_requests().unwrap(), 1);

    release.send(()).unwrap();
    assert_eq!(pulse.resolved_device_id().await, "gaid-7");
    assert_eq!(pulse.flush().await, DeliveryState::Idle);

    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].param("device_id").as_deref(), Some("gaid-7"));
}
