// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of declarative VM descriptions against a Proxmox VE
//! cluster.
//!
//! A [`document::DocumentAccessor`] carries the desired [`model::VmSpec`]
//! and what was last applied. The [`orchestrator::Orchestrator`] turns the
//! difference into management API calls through [`remote::HypervisorApi`]
//! and writes the observed remote state back into the document.

pub mod cloudinit;
pub mod defaults;
pub mod document;
mod error;
pub mod import;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod poll;
pub mod readback;
pub mod reconcile;
pub mod remote;
pub mod size;
pub mod slots;

#[cfg(test)]
mod fake;

pub use document::{ComputedAttributes, DocumentAccessor, VmDocument};
pub use error::{ApiError, Error};
pub use model::{Section, VmIdentity, VmSpec};
pub use orchestrator::Orchestrator;
pub use remote::{HypervisorApi, NodeCommandExecutor};
