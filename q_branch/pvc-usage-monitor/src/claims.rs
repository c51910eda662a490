//! Kubernetes API client for PersistentVolumeClaim metadata.
//!
//! Lists every PVC in the cluster (all namespaces) on each tick. Only the
//! fields needed for the usage join are kept; everything else in the object is
//! dropped right after the list call.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::{Api, ListParams},
    Client,
};

use crate::identity::IdentityKey;

/// Default number of PVCs requested per list page
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// The parts of a PVC the reconciler needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    /// Claim name (e.g., "data-postgres-0")
    pub pvc_name: String,
    /// Claim namespace (e.g., "databases")
    pub namespace: String,
    /// `spec.storageClassName`; absent on claims relying on a default class
    pub storage_class_name: Option<String>,
    /// `spec.volumeName`; absent until the claim is bound
    pub volume_name: Option<String>,
    /// Raw `spec.resources.requests.storage` quantity (e.g., "2Gi")
    pub requested_storage: Option<String>,
}

impl ClaimRecord {
    /// Join key for this claim, or None while it is unbound
    pub fn identity_key(&self) -> Option<IdentityKey> {
        self.volume_name
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|volume| IdentityKey::new(volume, &self.namespace, &self.pvc_name))
    }

    /// Extract a record from an API object; returns None for objects without a name
    pub fn from_pvc(pvc: PersistentVolumeClaim) -> Option<Self> {
        let metadata = pvc.metadata;
        let pvc_name = metadata.name?;
        let namespace = metadata.namespace.unwrap_or_default();

        let spec = pvc.spec.unwrap_or_default();
        let requested_storage = spec
            .resources
            .and_then(|r| r.requests)
            .and_then(|mut requests| requests.remove("storage"))
            .map(|q| q.0);

        Some(Self {
            pvc_name,
            namespace,
            storage_class_name: spec.storage_class_name,
            volume_name: spec.volume_name,
            requested_storage,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimSourceError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

/// Source of the cluster's current PVC set
#[async_trait]
pub trait ClaimSource: Send + Sync {
    /// List every claim across all namespaces
    async fn list(&self) -> Result<Vec<ClaimRecord>, ClaimSourceError>;
}

/// Claim source backed by the Kubernetes API server
pub struct KubernetesClaimSource {
    client: Client,
    page_size: u32,
}

impl KubernetesClaimSource {
    pub fn new(client: Client, page_size: u32) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl ClaimSource for KubernetesClaimSource {
    async fn list(&self) -> Result<Vec<ClaimRecord>, ClaimSourceError> {
        let pvcs: Api<PersistentVolumeClaim> = Api::all(self.client.clone());

        let mut records = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let mut params = ListParams::default().limit(self.page_size);
            if let Some(token) = continue_token.as_deref() {
                params = params.continue_token(token);
            }

            let page = pvcs.list(&params).await?;
            pages += 1;
            continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());
            records.extend(page.items.into_iter().filter_map(ClaimRecord::from_pvc));

            if continue_token.is_none() {
                break;
            }
        }

        tracing::debug!(claims = records.len(), pages, "Listed PersistentVolumeClaims");

        Ok(records)
    }
}
