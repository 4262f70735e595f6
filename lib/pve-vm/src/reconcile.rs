// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Computing the requests that move the remote VM toward the desired
//! state.
//!
//! Create requests carry every managed attribute. Update requests carry
//! only the sections that changed since the last apply, plus the options
//! that have to be removed remotely; unchanged sections are never re-sent.

use pve_api_types::{
    self as api, AgentSettings, CpuEmulation, SharedMemory, StorageDevice,
    VgaDevice, VmConfig, VmCreateRequest, VmId, VmUpdateRequest,
    NETWORK_SLOTS, SCSI_SLOTS,
};

use crate::cloudinit;
use crate::defaults::Mutability;
use crate::document::DocumentAccessor;
use crate::model::{
    Agent, Cdrom, Cpu, Disk, Memory, NetworkDevice, Section, Vga, VmSpec,
};
use crate::slots::{
    cloud_init_volume, ide2_occupant, Ide2Occupant, SlotArray,
};
use crate::Error;

const BOOT_DISK: &str = "scsi0";
const SCSI_CONTROLLER: &str = "virtio-scsi-pci";
const SERIAL_DEVICE: &str = "socket";
const VGA_NONE: &str = "none";

/// The outcome of comparing a document against the remote configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reconciliation {
    /// Values to set and options to delete. May be empty.
    pub request: VmUpdateRequest,
    /// Sections that differ from the last applied state.
    pub changed: Vec<Section>,
    /// Whether any changed section only takes effect after a reboot.
    pub reboot_required: bool,
}

fn agent_settings(agent: &Agent) -> AgentSettings {
    AgentSettings {
        enabled: agent.enabled,
        trim_cloned_disks: Some(agent.trim),
        agent_type: Some(agent.agent_type.clone()),
        extra: Vec::new(),
    }
}

fn apply_cpu(config: &mut VmConfig, cpu: &Cpu) {
    config.arch = Some(cpu.architecture.clone());
    config.cores = Some(cpu.cores);
    config.sockets = Some(cpu.sockets);
    config.cpuunits = Some(cpu.units);
    config.cpu = Some(CpuEmulation {
        cpu_type: cpu.cpu_type.clone(),
        flags: cpu.flags.clone(),
        extra: Vec::new(),
    });
    if cpu.hotplugged > 0 {
        config.vcpus = Some(cpu.hotplugged);
    }
}

fn shared_memory_name(id: VmId) -> String {
    format!("vm-{}-ivshmem", id)
}

fn apply_memory(config: &mut VmConfig, memory: &Memory, id: VmId) {
    config.memory = Some(memory.dedicated);
    config.balloon = Some(memory.floating);
    if memory.shared > 0 {
        config.ivshmem = Some(SharedMemory {
            size: memory.shared,
            name: Some(shared_memory_name(id)),
        });
    }
}

fn vga_device(vga: &Vga) -> VgaDevice {
    let vga_type = if vga.enabled { vga.vga_type.as_str() } else { VGA_NONE };
    VgaDevice {
        vga_type: Some(vga_type.to_string()),
        memory: Some(vga.memory),
        extra: Vec::new(),
    }
}

fn storage_device(disk: &Disk) -> StorageDevice {
    StorageDevice {
        file_volume: format!("{}:{}", disk.datastore_id, disk.size),
        format: Some(disk.file_format.clone()),
        mbps_rd: disk.speed.read,
        mbps_rd_max: disk.speed.read_burstable,
        mbps_wr: disk.speed.write,
        mbps_wr_max: disk.speed.write_burstable,
        ..Default::default()
    }
}

fn network_device(
    dev: &NetworkDevice,
    mac: Option<String>,
) -> api::NetworkDevice {
    api::NetworkDevice {
        model: dev.model.clone(),
        mac_address: mac,
        bridge: Some(dev.bridge.clone()),
        rate: dev.rate_limit,
        tag: dev.vlan_id,
        ..Default::default()
    }
}

fn desired_mac(dev: &NetworkDevice) -> Option<String> {
    dev.mac_address.clone().filter(|m| !m.is_empty())
}

fn network_slots(
    devices: &[NetworkDevice],
) -> Result<SlotArray<NetworkDevice, NETWORK_SLOTS>, Error> {
    SlotArray::expand(
        devices.iter().map(|d| d.enabled.then(|| d.clone())),
        "network devices",
    )
}

/// Whether the CD-ROM drive occupies IDE slot 2. A cloud-init drive
/// displaces it.
fn cdrom_in_use(desired: &VmSpec) -> Option<Cdrom> {
    let cdrom = desired.cdrom_or_default();
    (cdrom.enabled && desired.initialization.is_none()).then_some(cdrom)
}

/// Builds the request that creates VM `id`.
///
/// Disks with an image `file_id` are left out; they are attached by the
/// import step once the VM exists.
pub fn create_request(
    desired: &VmSpec,
    id: VmId,
) -> Result<VmCreateRequest, Error> {
    let cdrom = cdrom_in_use(desired);
    let mut config = VmConfig {
        acpi: Some(desired.acpi()),
        agent: Some(agent_settings(&desired.agent_or_default())),
        bios: Some(desired.bios()),
        boot: Some(if cdrom.is_some() { "cd" } else { "c" }.to_string()),
        bootdisk: Some(BOOT_DISK.to_string()),
        keyboard: Some(desired.keyboard_layout()),
        onboot: Some(desired.started()),
        ostype: Some(desired.operating_system_or_default().os_type),
        scsihw: Some(SCSI_CONTROLLER.to_string()),
        serial0: Some(SERIAL_DEVICE.to_string()),
        tablet: Some(desired.tablet_device()),
        vga: Some(vga_device(&desired.vga_or_default())),
        ..Default::default()
    };

    let description = desired.description();
    if !description.is_empty() {
        config.description = Some(description);
    }
    let name = desired.name();
    if !name.is_empty() {
        config.name = Some(name);
    }

    apply_cpu(&mut config, &desired.cpu_or_default());
    apply_memory(&mut config, &desired.memory_or_default(), id);

    config.scsi = SlotArray::<StorageDevice, SCSI_SLOTS>::expand(
        desired.disks.iter().map(|d| match &d.file_id {
            Some(f) if !f.is_empty() => None,
            _ => Some(storage_device(d)),
        }),
        "disks",
    )?
    .into_slots();

    config.ide[2] = match (&desired.initialization, cdrom) {
        (Some(init), _) => {
            Some(StorageDevice::cdrom(cloud_init_volume(&init.datastore_id)))
        }
        (None, Some(cdrom)) => Some(StorageDevice::cdrom(cdrom.media())),
        (None, None) => None,
    };
    if let Some(init) = &desired.initialization {
        cloudinit::build(init)?.apply(&mut config);
    }

    let nets = network_slots(&desired.network_devices)?;
    for (i, dev) in nets.iter() {
        config.net[i] = Some(network_device(dev, desired_mac(dev)));
    }

    let pool = desired.pool_id();
    Ok(VmCreateRequest {
        vmid: id,
        pool: (!pool.is_empty()).then_some(pool),
        config,
    })
}

/// Rejects changes that can only be honoured by recreating the VM. A
/// document with no recorded state has nothing to compare against.
pub fn check_mutability<D: DocumentAccessor + ?Sized>(
    doc: &D,
) -> Result<(), Error> {
    let Some(state) = doc.state() else {
        return Ok(());
    };
    for section in Section::ALL {
        if section.mutability() == Mutability::CreateOnly
            && doc.has_change(section)
        {
            return Err(Error::ReplacementRequired {
                attribute: section.name().to_string(),
            });
        }
    }

    let disks = doc.desired().disks.iter().zip(&state.disks);
    for (i, (want, have)) in disks.enumerate() {
        let fields = [
            ("datastore_id", want.datastore_id != have.datastore_id),
            ("file_id", want.file_id != have.file_id),
            ("file_format", want.file_format != have.file_format),
            ("size", want.size != have.size),
        ];
        if let Some((field, _)) = fields.iter().find(|(_, changed)| *changed) {
            return Err(Error::ReplacementRequired {
                attribute: format!("{}.{}.{}", Section::Disks, i, field),
            });
        }
    }
    Ok(())
}

/// Compares the document against `remote`, the configuration of VM `id`
/// as read at the start of the update.
///
/// While cloud-init is wanted the CD-ROM block has no effect, so a change
/// to it alone is not a change.
pub fn diff<D: DocumentAccessor + ?Sized>(
    doc: &D,
    remote: &VmConfig,
    id: VmId,
) -> Result<Reconciliation, Error> {
    let desired = doc.desired();
    let cloud_init = desired.initialization.is_some();
    let changed: Vec<Section> = doc
        .changed_sections()
        .into_iter()
        .filter(|s| s.mutability() == Mutability::Always)
        .filter(|s| !(cloud_init && *s == Section::Cdrom))
        .collect();

    let mut config = VmConfig::default();
    let mut delete = Vec::new();

    for section in &changed {
        match section {
            Section::Acpi => config.acpi = Some(desired.acpi()),
            Section::Bios => config.bios = Some(desired.bios()),
            Section::KeyboardLayout => {
                config.keyboard = Some(desired.keyboard_layout())
            }
            Section::TabletDevice => {
                config.tablet = Some(desired.tablet_device())
            }
            Section::Description => {
                let description = desired.description();
                if description.is_empty() {
                    delete.push("description".to_string());
                } else {
                    config.description = Some(description);
                }
            }
            Section::Name => {
                let name = desired.name();
                if name.is_empty() {
                    delete.push("name".to_string());
                } else {
                    config.name = Some(name);
                }
            }
            Section::Agent => {
                config.agent = Some(agent_settings(&desired.agent_or_default()))
            }
            Section::OperatingSystem => {
                let os = desired.operating_system_or_default();
                config.ostype = Some(os.os_type)
            }
            Section::Vga => {
                config.vga = Some(vga_device(&desired.vga_or_default()))
            }
            Section::Cpu => {
                let cpu = desired.cpu_or_default();
                apply_cpu(&mut config, &cpu);
                if cpu.hotplugged == 0 {
                    delete.push("vcpus".to_string());
                }
            }
            Section::Memory => {
                let memory = desired.memory_or_default();
                apply_memory(&mut config, &memory, id);
                if memory.shared == 0 && remote.ivshmem.is_some() {
                    delete.push("ivshmem".to_string());
                }
            }
            Section::Disks => {
                for (index, disk) in desired.disks.iter().enumerate() {
                    let Some(Some(current)) = remote.scsi.get(index)
                    else {
                        return Err(Error::MissingDiskSlot { index });
                    };
                    config.scsi[index] = Some(StorageDevice {
                        mbps_rd: disk.speed.read,
                        mbps_rd_max: disk.speed.read_burstable,
                        mbps_wr: disk.speed.write,
                        mbps_wr_max: disk.speed.write_burstable,
                        ..current.clone()
                    });
                }
            }
            Section::NetworkDevices => {
                let nets = network_slots(&desired.network_devices)?;
                for i in 0..NETWORK_SLOTS {
                    match (nets.get(i), &remote.net[i]) {
                        (Some(dev), current) => {
                            let assigned = current
                                .as_ref()
                                .and_then(|c| c.mac_address.clone());
                            let mac = desired_mac(dev).or(assigned);
                            config.net[i] = Some(network_device(dev, mac));
                        }
                        (None, Some(_)) => delete.push(format!("net{}", i)),
                        (None, None) => {}
                    }
                }
            }
            Section::Cdrom | Section::Initialization => {}
            Section::Started
            | Section::NodeName
            | Section::VmId
            | Section::PoolId => {}
        }
    }

    let media_changed = changed.contains(&Section::Cdrom)
        || changed.contains(&Section::Initialization);
    if media_changed {
        let occupant = ide2_occupant(remote.ide[2].as_ref(), id);
        match &desired.initialization {
            Some(init) => {
                let prefix = format!("{}:", init.datastore_id);
                let in_place = matches!(
                    occupant,
                    Ide2Occupant::CloudInit(d)
                        if d.file_volume.starts_with(&prefix)
                );
                if !in_place {
                    let volume = cloud_init_volume(&init.datastore_id);
                    config.ide[2] = Some(StorageDevice::cdrom(volume));
                }
            }
            None => match cdrom_in_use(desired) {
                Some(cdrom) => {
                    config.ide[2] = Some(StorageDevice::cdrom(cdrom.media()))
                }
                None if matches!(occupant, Ide2Occupant::Cdrom(_)) => {
                    delete.push("ide2".to_string())
                }
                None => {}
            },
        }
    }

    if changed.contains(&Section::Initialization) {
        if let Some(init) = &desired.initialization {
            let descriptor = cloudinit::build(init)?;
            descriptor.apply(&mut config);
            delete.extend(descriptor.stale_options(remote));
        }
    }

    let reboot_required = changed.iter().any(Section::requires_reboot);
    Ok(Reconciliation {
        request: VmUpdateRequest { config, delete },
        changed,
        reboot_required,
    })
}
