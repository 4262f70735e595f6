// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the caller's desired-state document.

use pve_api_types::VmId;
use serde::{Deserialize, Serialize};

use crate::model::{Section, VmSpec};

/// Values populated from the remote side that the caller cannot set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputedAttributes {
    /// One entry per network device slot; empty for disabled devices.
    pub mac_addresses: Vec<String>,
    /// Addresses reported by the guest agent, one list per interface.
    pub ipv4_addresses: Vec<Vec<String>>,
    pub ipv6_addresses: Vec<Vec<String>>,
    pub network_interface_names: Vec<String>,
}

/// The typed view of a desired-state document that the lifecycle
/// operations read from and write back into.
pub trait DocumentAccessor {
    /// The identifier of the VM the document manages, once it exists.
    fn id(&self) -> Option<VmId>;
    fn set_id(&mut self, id: Option<VmId>);

    fn desired(&self) -> &VmSpec;

    /// What was last applied to or observed on the VM.
    fn state(&self) -> Option<&VmSpec>;
    fn set_state(&mut self, state: Option<VmSpec>);

    fn computed(&self) -> &ComputedAttributes;
    fn set_computed(&mut self, computed: ComputedAttributes);

    /// Whether `section` changed since it was last applied.
    fn has_change(&self, section: Section) -> bool {
        match self.state() {
            Some(state) => section.differs(self.desired(), state),
            None => section.differs(self.desired(), &VmSpec::default()),
        }
    }

    fn changed_sections(&self) -> Vec<Section> {
        Section::ALL.into_iter().filter(|s| self.has_change(*s)).collect()
    }
}

/// A self-contained document, as kept in a state file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VmDocument {
    pub desired: VmSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<VmSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<VmId>,
    #[serde(default)]
    pub computed: ComputedAttributes,
}

impl VmDocument {
    pub fn new(desired: VmSpec) -> Self {
        Self { desired, ..Default::default() }
    }
}

impl DocumentAccessor for VmDocument {
    fn id(&self) -> Option<VmId> {
        self.id
    }

    fn set_id(&mut self, id: Option<VmId>) {
        self.id = id;
    }

    fn desired(&self) -> &VmSpec {
        &self.desired
    }

    fn state(&self) -> Option<&VmSpec> {
        self.state.as_ref()
    }

    fn set_state(&mut self, state: Option<VmSpec>) {
        self.state = state;
    }

    fn computed(&self) -> &ComputedAttributes {
        &self.computed
    }

    fn set_computed(&mut self, computed: ComputedAttributes) {
        self.computed = computed;
    }
}
