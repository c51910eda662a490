//! Join key between on-disk volume directories and PVC metadata.
//!
//! The local-path provisioner names each volume directory
//! `<volumeName>_<namespace>_<pvcName>`. The same triple, in the same order and
//! with the same separator, is derived from every PVC returned by the cluster,
//! so both sides of the join go through [`IdentityKey::new`].

use std::borrow::Borrow;
use std::fmt;

/// Separator placed between the volume, namespace and claim name
pub const SEPARATOR: char = '_';

/// Identity of one provisioned volume, shared by the filesystem and the cluster view
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Build the key for a volume bound to `namespace/pvc_name`
    pub fn new(volume_name: &str, namespace: &str, pvc_name: &str) -> Self {
        Self(format!(
            "{volume_name}{SEPARATOR}{namespace}{SEPARATOR}{pvc_name}"
        ))
    }

    /// Wrap a directory name found under the provisioner root.
    ///
    /// No validation happens here: a directory that does not follow the naming
    /// convention simply never matches a claim.
    pub fn from_dir_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for IdentityKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
