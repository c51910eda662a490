//! Error types, split by how far a failure is allowed to reach.
//!
//! - [`StartupError`] ends the process before the first tick.
//! - [`TickError`] skips the rest of one tick; the loop carries on.
//! - [`RecordError`] drops a single claim from one tick's join.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::claims::ClaimSourceError;
use crate::config::ConfigError;
use crate::inventory::InventoryError;
use crate::metrics::MetricsError;
use crate::quantity::QuantityError;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Kubernetes API unavailable: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("failed to bind metrics endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Phase of a reconcile tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStage {
    Probing,
    Listing,
}

impl fmt::Display for TickStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TickStage::Probing => "probing",
            TickStage::Listing => "listing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("volume inventory failed: {0}")]
    Probe(#[from] InventoryError),

    #[error("listing claims failed: {0}")]
    List(#[from] ClaimSourceError),

    #[error("{stage} did not finish within {limit:?}")]
    Timeout { stage: TickStage, limit: Duration },

    #[error("volume walk from an earlier tick is still running")]
    WalkInFlight,

    #[error("volume inventory task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl TickError {
    pub fn stage(&self) -> TickStage {
        match self {
            TickError::Probe(_) | TickError::TaskJoin(_) | TickError::WalkInFlight => {
                TickStage::Probing
            }
            TickError::List(_) => TickStage::Listing,
            TickError::Timeout { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("claim has no storage request")]
    MissingRequest,

    #[error("invalid storage request: {0}")]
    Quantity(#[from] QuantityError),
}

impl RecordError {
    /// Label value for `pvc_usage_monitor_skipped_records_total`
    pub fn reason(&self) -> &'static str {
        match self {
            RecordError::MissingRequest => "missing_request",
            RecordError::Quantity(_) => "invalid_quantity",
        }
    }
}
