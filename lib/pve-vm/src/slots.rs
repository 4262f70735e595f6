// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping between ordered lists and the hypervisor's numbered slots.
//!
//! A list entry at index `i` always lands in slot `i`. Expanding turns a
//! list (where `None` marks an entry that should leave its slot empty) into
//! a fixed array; compacting turns the array back into a list, dropping
//! everything after the last populated slot.

use pve_api_types::{StorageDevice, VmId};

use crate::Error;

/// A fixed number of device slots, each possibly empty.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotArray<T, const N: usize> {
    slots: [Option<T>; N],
}

impl<T, const N: usize> Default for SlotArray<T, N> {
    fn default() -> Self {
        Self { slots: std::array::from_fn(|_| None) }
    }
}

impl<T, const N: usize> SlotArray<T, N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places each item in the slot matching its position. Fails if there
    /// are more items than slots.
    pub fn expand<I>(items: I, kind: &'static str) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Option<T>>,
    {
        let mut array = Self::new();
        let mut count = 0;
        for item in items {
            if count < N {
                array.slots[count] = item;
            }
            count += 1;
        }
        if count > N {
            return Err(Error::TooManyDevices { kind, count, max: N });
        }
        Ok(array)
    }

    pub fn from_slots(slots: [Option<T>; N]) -> Self {
        Self { slots }
    }

    pub fn into_slots(self) -> [Option<T>; N] {
        self.slots
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Populated slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn last_populated(&self) -> Option<usize> {
        self.slots.iter().rposition(Option::is_some)
    }

    /// Converts back to a list, filling interior gaps with `filler` and
    /// truncating after the last populated slot.
    pub fn compact_with<F>(self, mut filler: F) -> Vec<T>
    where
        F: FnMut(usize) -> T,
    {
        let len = self.last_populated().map_or(0, |i| i + 1);
        self.slots
            .into_iter()
            .take(len)
            .enumerate()
            .map(|(i, s)| s.unwrap_or_else(|| filler(i)))
            .collect()
    }
}

/// What currently sits in IDE slot 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ide2Occupant<'a> {
    Empty,
    Cdrom(&'a StorageDevice),
    CloudInit(&'a StorageDevice),
}

/// The volume reference that asks for a cloud-init drive on `datastore`.
pub fn cloud_init_volume(datastore: &str) -> String {
    format!("{}:cloudinit", datastore)
}

/// Whether `volume` is the cloud-init drive of VM `id`, either as requested
/// (`local-lvm:cloudinit`) or as allocated (`local-lvm:vm-100-cloudinit`).
pub fn is_cloud_init_volume(volume: &str, id: VmId) -> bool {
    volume.contains(&format!("vm-{}-cloudinit", id))
        || volume.ends_with(":cloudinit")
}

/// Classifies the device in IDE slot 2 by its media reference.
pub fn ide2_occupant(
    dev: Option<&StorageDevice>,
    id: VmId,
) -> Ide2Occupant<'_> {
    match dev {
        None => Ide2Occupant::Empty,
        Some(d) if is_cloud_init_volume(&d.file_volume, id) => {
            Ide2Occupant::CloudInit(d)
        }
        Some(d) if d.is_cdrom() => Ide2Occupant::Cdrom(d),
        Some(_) => Ide2Occupant::Empty,
    }
}
