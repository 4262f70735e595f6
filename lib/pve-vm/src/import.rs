// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node-side import of disk images.
//!
//! The management API has no call for turning an existing image into a VM
//! disk, so disks with a `file_id` are left out of the create request and
//! attached afterwards by a shell script run on the node.

use pve_api_types::VmId;

use crate::model::Disk;
use crate::size::format_disk_size;
use crate::Error;

/// Resolves the filesystem path of a storage from the node's storage
/// configuration.
fn storage_path(storage: &str) -> String {
    format!(
        concat!(
            r"$(grep -Pzo ': {}\s+path\s+[^\s]+' /etc/pve/storage.cfg",
            r" | grep -Pzo '/[^\s]*' | tr -d '\000')",
        ),
        storage
    )
}

/// The path of `volume` relative to its storage root.
fn volume_path(volume: &str) -> String {
    if volume.starts_with("iso/") {
        format!("/template/{}", volume)
    } else {
        format!("/{}", volume)
    }
}

fn throughput_options(disk: &Disk) -> String {
    let limits = [
        ("mbps_rd", disk.speed.read),
        ("mbps_rd_max", disk.speed.read_burstable),
        ("mbps_wr", disk.speed.write),
        ("mbps_wr_max", disk.speed.write_burstable),
    ];
    limits
        .iter()
        .filter_map(|(k, v)| {
            v.filter(|v| *v > 0).map(|v| format!(",{}={}", k, v))
        })
        .collect()
}

fn import_source(disk: &Disk) -> Option<&str> {
    disk.file_id.as_deref().filter(|f| !f.is_empty())
}

/// Builds the script that imports every disk with a `file_id` into VM `id`.
///
/// Each disk stays in the SCSI slot matching its list position. Volume
/// numbers continue after the ones the create request allocated for plain
/// disks. The script stops at the first failing command. Returns an empty
/// list when there is nothing to import.
pub fn disk_import_commands(
    id: VmId,
    disks: &[Disk],
) -> Result<Vec<String>, Error> {
    let plain = disks.iter().filter(|d| import_source(d).is_none()).count();

    let imports = disks
        .iter()
        .enumerate()
        .filter_map(|(slot, d)| import_source(d).map(|f| (slot, d, f)));

    let mut commands = Vec::new();
    for (imported, (slot, disk, file_id)) in imports.enumerate() {
        let (storage, volume) = file_id
            .split_once(':')
            .filter(|(s, v)| !s.is_empty() && !v.is_empty())
            .ok_or_else(|| Error::InvalidFileId(file_id.to_string()))?;

        let number = plain + imported;
        let scratch =
            format!("/tmp/vm-{}-disk-{}.{}", id, number, disk.file_format);

        commands.push(format!(
            r#"cp "{}{}" {}"#,
            storage_path(storage),
            volume_path(volume),
            scratch
        ));
        commands.push(format!(
            "qemu-img resize {} {}",
            scratch,
            format_disk_size(disk.size)
        ));
        commands.push(format!(
            "qm importdisk {} {} {} -format {}",
            id, scratch, disk.datastore_id, disk.file_format
        ));
        commands.push(format!(
            "qm set {} -scsi{} {}:vm-{}-disk-{}{}",
            id,
            slot,
            disk.datastore_id,
            id,
            number,
            throughput_options(disk)
        ));
        commands.push(format!("rm -f {}", scratch));
    }

    if !commands.is_empty() {
        commands.insert(0, "set -e".to_string());
    }
    Ok(commands)
}
