//! Node-local PersistentVolumeClaim usage exporter.
//!
//! Runs beside a local-path style provisioner and exports, for every claim of
//! the configured storage class whose volume lives on this node, how many bytes
//! the claim requested and how many its volume directory currently uses.
//!
//! ## Architecture
//!
//! 1. **Volume Inventory** (`inventory`, `probe`) - Lists the provisioner root
//!    and walks each volume directory to compute used bytes.
//!
//! 2. **Claim Source** (`claims`) - Lists PVCs across all namespaces from the
//!    Kubernetes API server.
//!
//! 3. **Reconciler** (`reconciler`) - Joins both views on the volume identity
//!    key (`identity`) every interval and writes gauges to the metric sink.
//!
//! 4. **Exposition** (`metrics`, `server`) - Prometheus registry served over
//!    HTTP at `/metrics`.
//!
//! ## Usage
//!
//! Run as a DaemonSet with the provisioner's host path mounted:
//!
//! ```bash
//! DEFAULT_PATH=/opt/local-path-provisioner \
//! NODE_NAME=worker-1 \
//! pvc-usage-monitor --delay-seconds 30 --storage-class local-path
//! ```

pub mod claims;
pub mod config;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod metrics;
pub mod probe;
pub mod quantity;
pub mod reconciler;
pub mod server;
