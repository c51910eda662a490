//! Reconcile loop joining local volume sizes with cluster claim metadata.
//!
//! Each tick runs probing -> listing -> joining -> publishing and then sleeps
//! until the next interval. A failure in probing or listing ends the tick
//! early; gauges written by earlier ticks stay exported unchanged. A claim that
//! cannot be converted is dropped on its own without affecting the others.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::claims::{ClaimRecord, ClaimSource};
use crate::error::{RecordError, TickError, TickStage};
use crate::inventory::{VolumeInventory, VolumeSizes};
use crate::metrics::{MetricRecord, MetricSink, MonitorMetrics, TickOutcome, VolumeLabels};
use crate::quantity;

/// A claim that matched a local volume but could not be turned into a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedClaim {
    pub pvc_name: String,
    pub namespace: String,
    pub error: RecordError,
}

/// Result of joining one tick's inventory and claim list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOutcome {
    pub records: Vec<MetricRecord>,
    pub skipped: Vec<SkippedClaim>,
}

/// Join local volume sizes with claims of `storage_class`.
///
/// A record is produced only for a claim of the target class whose identity
/// key has a measured volume. Claims without a class, unbound claims and
/// volumes without a claim are silently left out. Output order follows
/// `claims`.
pub fn join(sizes: &VolumeSizes, claims: &[ClaimRecord], storage_class: &str) -> JoinOutcome {
    let mut outcome = JoinOutcome::default();

    for claim in claims {
        let class = match claim.storage_class_name.as_deref() {
            Some(class) => class,
            None => {
                tracing::debug!(
                    pvc = %claim.pvc_name,
                    namespace = %claim.namespace,
                    "Claim has no storage class, ignoring"
                );
                continue;
            }
        };
        if class != storage_class {
            continue;
        }

        let Some(key) = claim.identity_key() else {
            continue;
        };
        let Some(&used_bytes) = sizes.get(&key) else {
            continue;
        };

        match requested_bytes(claim) {
            Ok(requested) => outcome.records.push(MetricRecord {
                labels: VolumeLabels {
                    pvc_name: claim.pvc_name.clone(),
                    namespace: claim.namespace.clone(),
                    storage_class_name: class.to_string(),
                    volume_name: claim.volume_name.clone().unwrap_or_default(),
                },
                requested_bytes: requested as f64,
                used_bytes: used_bytes as f64,
            }),
            Err(error) => outcome.skipped.push(SkippedClaim {
                pvc_name: claim.pvc_name.clone(),
                namespace: claim.namespace.clone(),
                error,
            }),
        }
    }

    outcome
}

fn requested_bytes(claim: &ClaimRecord) -> Result<u64, RecordError> {
    let raw = claim
        .requested_storage
        .as_deref()
        .ok_or(RecordError::MissingRequest)?;
    Ok(quantity::parse_bytes(raw)?)
}

/// Counts from a completed tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub volumes: usize,
    pub claims: usize,
    pub published: usize,
    pub skipped: usize,
}

/// Drives the periodic join and writes results to a [`MetricSink`]
pub struct Reconciler {
    inventory: Arc<dyn VolumeInventory>,
    claims: Arc<dyn ClaimSource>,
    sink: Arc<dyn MetricSink>,
    storage_class: String,
    source_timeout: Option<Duration>,
    monitor: Option<MonitorMetrics>,
    walk_in_flight: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        inventory: Arc<dyn VolumeInventory>,
        claims: Arc<dyn ClaimSource>,
        sink: Arc<dyn MetricSink>,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            claims,
            sink,
            storage_class: storage_class.into(),
            source_timeout: None,
            monitor: None,
            walk_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bound the inventory snapshot and the claim list separately.
    ///
    /// A walk that times out cannot be cancelled and keeps its blocking thread
    /// until the filesystem answers. While it runs, later ticks fail with
    /// [`TickError::WalkInFlight`] instead of starting another walk.
    pub fn with_source_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn with_monitor_metrics(mut self, monitor: MonitorMetrics) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Run a single probe/list/join/publish pass
    pub async fn tick(&self) -> Result<TickReport, TickError> {
        let started = Instant::now();

        let sizes = match self.probe().await {
            Ok(sizes) => sizes,
            Err(e) => {
                self.finish(TickOutcome::ProbeFailed, started);
                return Err(e);
            }
        };

        let claims = match self.list().await {
            Ok(claims) => claims,
            Err(e) => {
                self.finish(TickOutcome::ListFailed, started);
                return Err(e);
            }
        };

        let outcome = join(&sizes, &claims, &self.storage_class);

        for skipped in &outcome.skipped {
            tracing::warn!(
                pvc = %skipped.pvc_name,
                namespace = %skipped.namespace,
                error = %skipped.error,
                "Skipping claim for this tick"
            );
            if let Some(monitor) = &self.monitor {
                monitor.record_skipped(skipped.error.reason());
            }
        }

        for record in &outcome.records {
            self.sink.publish(record);
        }

        self.finish(TickOutcome::Published, started);

        Ok(TickReport {
            volumes: sizes.len(),
            claims: claims.len(),
            published: outcome.records.len(),
            skipped: outcome.skipped.len(),
        })
    }

    /// Tick every `interval` until `shutdown` flips to true.
    ///
    /// The first tick fires immediately. Shutdown is only observed between
    /// ticks; a tick in progress always runs to completion.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            tracing::debug!(
                                volumes = report.volumes,
                                claims = report.claims,
                                published = report.published,
                                skipped = report.skipped,
                                "Reconcile tick completed"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                stage = %e.stage(),
                                "Reconcile tick failed, previous values stay exported"
                            );
                        }
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Reconcile loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn probe(&self) -> Result<VolumeSizes, TickError> {
        let guard = WalkGuard::acquire(&self.walk_in_flight)?;
        let inventory = Arc::clone(&self.inventory);
        // Walking volume trees is blocking filesystem work
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            inventory.snapshot()
        });
        let sizes = bounded(self.source_timeout, TickStage::Probing, task).await???;
        Ok(sizes)
    }

    async fn list(&self) -> Result<Vec<ClaimRecord>, TickError> {
        let claims = bounded(self.source_timeout, TickStage::Listing, self.claims.list()).await??;
        Ok(claims)
    }

    fn finish(&self, outcome: TickOutcome, started: Instant) {
        if let Some(monitor) = &self.monitor {
            monitor.tick_finished(outcome, started.elapsed().as_secs_f64());
        }
    }
}

/// Marks a volume walk as running until dropped on the blocking thread
struct WalkGuard(Arc<AtomicBool>);

impl WalkGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, TickError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(TickError::WalkInFlight);
        }
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for WalkGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn bounded<F: Future>(
    limit: Option<Duration>,
    stage: TickStage,
    fut: F,
) -> Result<F::Output, TickError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TickError::Timeout { stage, limit }),
        None => Ok(fut.await),
    }
}
