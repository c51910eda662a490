//! End-to-end reconcile ticks against a real directory tree and an in-memory
//! claim source.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pvc_usage_monitor::claims::{ClaimRecord, ClaimSource, ClaimSourceError};
use pvc_usage_monitor::error::{TickError, TickStage};
use pvc_usage_monitor::inventory::{
    DirectoryInventory, InventoryError, VolumeInventory, VolumeSizes,
};
use pvc_usage_monitor::metrics::{
    MetricRecord, MetricSink, MetricsRegistry, TickOutcome, VolumeLabels,
};
use pvc_usage_monitor::reconciler::Reconciler;
use tempfile::TempDir;
use tokio::sync::watch;

/// Claim source returning a fixed list, or an API error when `failing` is set
#[derive(Default)]
struct StaticClaims {
    claims: Mutex<Vec<ClaimRecord>>,
    failing: Mutex<bool>,
    calls: AtomicUsize,
}

impl StaticClaims {
    fn new(claims: Vec<ClaimRecord>) -> Self {
        Self {
            claims: Mutex::new(claims),
            ..Default::default()
        }
    }

    fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl ClaimSource for StaticClaims {
    async fn list(&self) -> Result<Vec<ClaimRecord>, ClaimSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(ClaimSourceError::Api(kube::Error::Api(
                kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "etcdserver: request timed out".to_string(),
                    reason: "Timeout".to_string(),
                    code: 504,
                },
            )));
        }
        Ok(self.claims.lock().unwrap().clone())
    }
}

/// Sink that keeps every record it was handed
#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<MetricRecord>>,
}

impl MetricSink for RecordingSink {
    fn publish(&self, record: &MetricRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

/// Inventory whose walks block until the sender side of `release` is dropped
struct StalledInventory {
    release: Mutex<std::sync::mpsc::Receiver<()>>,
    calls: AtomicUsize,
}

impl VolumeInventory for StalledInventory {
    fn snapshot(&self) -> Result<VolumeSizes, InventoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.release.lock().unwrap().recv();
        Ok(VolumeSizes::new())
    }
}

fn make_volume(root: &Path, name: &str, bytes: usize) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("data"), vec![0u8; bytes]).unwrap();
}

fn claim(pvc: &str, ns: &str, volume: &str, class: &str, storage: &str) -> ClaimRecord {
    ClaimRecord {
        pvc_name: pvc.to_string(),
        namespace: ns.to_string(),
        storage_class_name: Some(class.to_string()),
        volume_name: Some(volume.to_string()),
        requested_storage: Some(storage.to_string()),
    }
}

fn pvc1_labels() -> VolumeLabels {
    VolumeLabels {
        pvc_name: "pvc1".to_string(),
        namespace: "ns1".to_string(),
        storage_class_name: "local-path".to_string(),
        volume_name: "vol1".to_string(),
    }
}

#[tokio::test]
async fn test_matching_claim_is_published() {
    let tmp = TempDir::new().unwrap();
    make_volume(tmp.path(), "vol1_ns1_pvc1", 1_000_000);

    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        Arc::new(StaticClaims::new(vec![claim(
            "pvc1",
            "ns1",
            "vol1",
            "local-path",
            "2Gi",
        )])),
        sink.clone(),
        "local-path",
    );

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.volumes, 1);
    assert_eq!(report.claims, 1);

    let records = sink.records.lock().unwrap();
    assert_eq!(
        *records,
        vec![MetricRecord {
            labels: pvc1_labels(),
            requested_bytes: 2_147_483_648.0,
            used_bytes: 1_000_000.0,
        }]
    );
}

#[tokio::test]
async fn test_other_storage_class_is_not_published() {
    let tmp = TempDir::new().unwrap();
    make_volume(tmp.path(), "vol1_ns1_pvc1", 1_000_000);

    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        Arc::new(StaticClaims::new(vec![claim(
            "pvc1",
            "ns1",
            "vol1",
            "other-class",
            "2Gi",
        )])),
        sink.clone(),
        "local-path",
    );

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.published, 0);
    assert!(sink.records.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreadable_root_keeps_previous_values() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("volumes");
    make_volume(&root, "vol1_ns1_pvc1", 1_000_000);

    let registry = MetricsRegistry::new().unwrap();
    let claims = Arc::new(StaticClaims::new(vec![claim(
        "pvc1",
        "ns1",
        "vol1",
        "local-path",
        "2Gi",
    )]));
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(&root)),
        claims.clone(),
        Arc::new(registry.pvc_metrics().clone()),
        "local-path",
    )
    .with_monitor_metrics(registry.monitor_metrics().clone());

    reconciler.tick().await.unwrap();
    assert_eq!(registry.pvc_metrics().used(&pvc1_labels()), 1_000_000.0);

    std::fs::remove_dir_all(&root).unwrap();

    let err = reconciler.tick().await.unwrap_err();
    assert!(matches!(err, TickError::Probe(_)));
    assert_eq!(err.stage(), TickStage::Probing);

    // Stale values stay exported, and listing was not attempted
    assert_eq!(registry.pvc_metrics().used(&pvc1_labels()), 1_000_000.0);
    assert_eq!(
        registry.pvc_metrics().requested(&pvc1_labels()),
        2_147_483_648.0
    );
    assert_eq!(claims.calls.load(Ordering::SeqCst), 1);

    let monitor = registry.monitor_metrics();
    assert_eq!(monitor.ticks(TickOutcome::Published), 1);
    assert_eq!(monitor.ticks(TickOutcome::ProbeFailed), 1);
}

#[tokio::test]
async fn test_list_failure_keeps_previous_values() {
    let tmp = TempDir::new().unwrap();
    make_volume(tmp.path(), "vol1_ns1_pvc1", 100);

    let registry = MetricsRegistry::new().unwrap();
    let claims = Arc::new(StaticClaims::new(vec![claim(
        "pvc1",
        "ns1",
        "vol1",
        "local-path",
        "1Gi",
    )]));
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        claims.clone(),
        Arc::new(registry.pvc_metrics().clone()),
        "local-path",
    )
    .with_monitor_metrics(registry.monitor_metrics().clone());

    reconciler.tick().await.unwrap();

    // Volume grows, but the cluster is unavailable for this tick
    make_volume(tmp.path(), "vol1_ns1_pvc1", 5_000);
    claims.set_failing(true);

    let err = reconciler.tick().await.unwrap_err();
    assert!(matches!(err, TickError::List(_)));
    assert_eq!(registry.pvc_metrics().used(&pvc1_labels()), 100.0);

    // Next tick recovers without intervention
    claims.set_failing(false);
    reconciler.tick().await.unwrap();
    assert_eq!(registry.pvc_metrics().used(&pvc1_labels()), 5_000.0);
    assert_eq!(
        registry.monitor_metrics().ticks(TickOutcome::ListFailed),
        1
    );
}

#[tokio::test]
async fn test_removed_claim_keeps_last_value() {
    let tmp = TempDir::new().unwrap();
    make_volume(tmp.path(), "vol1_ns1_pvc1", 100);

    let registry = MetricsRegistry::new().unwrap();
    let claims = Arc::new(StaticClaims::new(vec![claim(
        "pvc1",
        "ns1",
        "vol1",
        "local-path",
        "1Gi",
    )]));
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        claims.clone(),
        Arc::new(registry.pvc_metrics().clone()),
        "local-path",
    );

    reconciler.tick().await.unwrap();
    claims.claims.lock().unwrap().clear();
    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.published, 0);
    assert_eq!(registry.pvc_metrics().used(&pvc1_labels()), 100.0);
    assert!(registry.encode_text().unwrap().contains(r#"pvcname="pvc1""#));
}

#[tokio::test]
async fn test_malformed_request_skips_single_claim() {
    let tmp = TempDir::new().unwrap();
    make_volume(tmp.path(), "vol1_ns1_pvc1", 10);
    make_volume(tmp.path(), "vol2_ns1_pvc2", 20);

    let registry = MetricsRegistry::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        Arc::new(StaticClaims::new(vec![
            claim("pvc1", "ns1", "vol1", "local-path", "two gigs"),
            claim("pvc2", "ns1", "vol2", "local-path", "1Mi"),
        ])),
        sink.clone(),
        "local-path",
    )
    .with_monitor_metrics(registry.monitor_metrics().clone());

    let report = reconciler.tick().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(report.skipped, 1);
    let records = sink.records.lock().unwrap();
    assert_eq!(records[0].labels.pvc_name, "pvc2");
    assert_eq!(records[0].requested_bytes, 1_048_576.0);
    assert_eq!(
        registry.monitor_metrics().skipped("invalid_quantity"),
        1
    );
}

#[tokio::test]
async fn test_run_ticks_until_shutdown() {
    let tmp = TempDir::new().unwrap();
    make_volume(tmp.path(), "vol1_ns1_pvc1", 10);

    let claims = Arc::new(StaticClaims::new(vec![claim(
        "pvc1",
        "ns1",
        "vol1",
        "local-path",
        "1Gi",
    )]));
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        claims.clone(),
        sink.clone(),
        "local-path",
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        reconciler
            .run(Duration::from_millis(20), shutdown_rx)
            .await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop should stop after shutdown")
        .unwrap();

    assert!(claims.calls.load(Ordering::SeqCst) >= 2);
    assert!(sink.records.lock().unwrap().len() >= 2);
}

#[tokio::test]
async fn test_run_survives_failing_ticks() {
    let tmp = TempDir::new().unwrap();
    let claims = Arc::new(StaticClaims::new(vec![]));
    claims.set_failing(true);

    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(tmp.path())),
        claims.clone(),
        Arc::new(RecordingSink::default()),
        "local-path",
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        reconciler
            .run(Duration::from_millis(20), shutdown_rx)
            .await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished());
    assert!(claims.calls.load(Ordering::SeqCst) >= 2);

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop should stop when the shutdown sender is dropped")
        .unwrap();
}

#[tokio::test]
async fn test_timed_out_walk_is_not_restarted_while_running() {
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let inventory = Arc::new(StalledInventory {
        release: Mutex::new(release_rx),
        calls: AtomicUsize::new(0),
    });
    let registry = MetricsRegistry::new().unwrap();
    let reconciler = Reconciler::new(
        inventory.clone(),
        Arc::new(StaticClaims::new(vec![])),
        Arc::new(RecordingSink::default()),
        "local-path",
    )
    .with_source_timeout(Some(Duration::from_millis(50)))
    .with_monitor_metrics(registry.monitor_metrics().clone());

    let err = reconciler.tick().await.unwrap_err();
    assert!(matches!(
        err,
        TickError::Timeout {
            stage: TickStage::Probing,
            ..
        }
    ));

    // The first walk is still blocked, so no second walk is started
    let err = reconciler.tick().await.unwrap_err();
    assert!(matches!(err, TickError::WalkInFlight));
    assert_eq!(err.stage(), TickStage::Probing);
    assert_eq!(inventory.calls.load(Ordering::SeqCst), 1);

    drop(release_tx);

    let mut recovered = false;
    for _ in 0..100 {
        match reconciler.tick().await {
            Ok(_) => {
                recovered = true;
                break;
            }
            Err(TickError::WalkInFlight) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("unexpected tick error: {e}"),
        }
    }
    assert!(recovered, "walk flag was never cleared");
    assert_eq!(inventory.calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.monitor_metrics().ticks(TickOutcome::Published), 1);
}
