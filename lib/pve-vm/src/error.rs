// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use pve_api_types::VmId;
use thiserror::Error;

use crate::lifecycle::TransitionError;

pub use pve_client::Error as ApiError;

/// Errors produced by the lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The management API or its transport failed.
    #[error("remote request failed: {0}")]
    Remote(#[from] ApiError),

    /// A bounded wait ran out of time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Missing SCSI device {index} (scsi{index})")]
    MissingDiskSlot { index: usize },

    #[error("invalid disk size {raw:?}")]
    InvalidDiskSize { raw: String },

    #[error("too many {kind}: {count} given, {max} slots available")]
    TooManyDevices { kind: &'static str, count: usize, max: usize },

    #[error("invalid disk image reference {0:?}, expected <datastore>:<path>")]
    InvalidFileId(String),

    /// A creation-only attribute differs from what was created.
    #[error("{attribute} cannot be changed on an existing VM")]
    ReplacementRequired { attribute: String },

    #[error("node name is not set")]
    MissingNodeName,

    #[error("document does not reference a VM")]
    MissingId,

    /// The delete call succeeded but the VM can still be observed.
    #[error("VM {id} is still present after deletion")]
    StillPresent { id: VmId },

    #[error("disk import on node {node} failed: {source}")]
    Import {
        node: String,
        #[source]
        source: ApiError,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl Error {
    /// Whether the error is the remote side reporting the VM as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Remote(e) if e.is_not_found())
    }
}
