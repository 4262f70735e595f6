// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Default values, and the rules for when an observed value is worth
//! recording.
//!
//! Every optional attribute in [`crate::model::VmSpec`] resolves to one of
//! the constants below when unset, and every singleton block's `Default`
//! impl is built from them.

pub const ACPI: bool = true;
pub const BIOS: &str = "seabios";
pub const DESCRIPTION: &str = "";
pub const KEYBOARD_LAYOUT: &str = "en-us";
pub const NAME: &str = "";
pub const POOL_ID: &str = "";
pub const STARTED: bool = true;
pub const TABLET_DEVICE: bool = true;

pub const AGENT_ENABLED: bool = false;
pub const AGENT_TRIM: bool = false;
pub const AGENT_TYPE: &str = "virtio";

pub const CDROM_ENABLED: bool = false;
/// Media reference of an empty CD-ROM drive.
pub const CDROM_EMPTY_MEDIA: &str = "cdrom";

pub const CPU_ARCHITECTURE: &str = "x86_64";
pub const CPU_CORES: u32 = 1;
pub const CPU_HOTPLUGGED: u32 = 0;
pub const CPU_SOCKETS: u32 = 1;
pub const CPU_TYPE: &str = "qemu64";
pub const CPU_UNITS: u32 = 1024;

pub const DISK_DATASTORE: &str = "local-lvm";
pub const DISK_FILE_FORMAT: &str = "qcow2";
/// Gigabytes.
pub const DISK_SIZE: u64 = 8;

pub const CLOUD_INIT_DATASTORE: &str = "local-lvm";

/// MiB.
pub const MEMORY_DEDICATED: u64 = 512;
pub const MEMORY_FLOATING: u64 = 0;
pub const MEMORY_SHARED: u64 = 0;

pub const NETWORK_BRIDGE: &str = "vmbr0";
pub const NETWORK_ENABLED: bool = true;
pub const NETWORK_MODEL: &str = "virtio";

pub const OS_TYPE: &str = "other";

pub const VGA_ENABLED: bool = true;
/// MiB.
pub const VGA_MEMORY: u32 = 16;
pub const VGA_TYPE: &str = "std";

/// When an attribute may be changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutability {
    /// Only honoured when the VM is created.
    CreateOnly,
    /// Can be updated on an existing VM.
    Always,
}

/// Resolves an optional attribute to its effective value.
pub fn resolve<T: Clone>(explicit: &Option<T>, default: T) -> T {
    explicit.clone().unwrap_or(default)
}

/// Decides whether an observed value is recorded: only when the section was
/// already tracked, or when the value differs from its default.
pub fn write_back<T: PartialEq>(
    tracked: bool,
    observed: T,
    default: &T,
) -> Option<T> {
    if tracked || observed != *default {
        Some(observed)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_defaults() {
        assert_eq!(resolve(&None, CPU_CORES), 1);
        assert_eq!(resolve(&Some(4), CPU_CORES), 4);
        assert_eq!(resolve(&Some(false), ACPI), false);
    }

    #[test]
    fn write_back_rule() {
        // untracked and default-equal: nothing is written
        assert_eq!(write_back(false, 512, &MEMORY_DEDICATED), None);
        // untracked but different: written
        assert_eq!(write_back(false, 1024, &MEMORY_DEDICATED), Some(1024));
        // tracked: always written
        assert_eq!(write_back(true, 512, &MEMORY_DEDICATED), Some(512));
    }
}
