// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation of the remote configuration back into a [`VmSpec`].
//!
//! Scalars and singleton blocks go through [`defaults::write_back`]: a value
//! that equals its default is only recorded for sections the document
//! already tracks.

use pve_api_types::{
    self as api, AgentNetworkInterface, IpAddressType, VmConfig, VmId,
    VmStatus,
};

use crate::cloudinit;
use crate::defaults::{self, write_back};
use crate::document::ComputedAttributes;
use crate::model::{
    Agent, Cdrom, Cpu, Disk, DiskSpeed, Memory, NetworkDevice,
    OperatingSystem, Vga, VmIdentity, VmSpec,
};
use crate::size::parse_disk_size;
use crate::slots::{ide2_occupant, Ide2Occupant, SlotArray};
use crate::Error;

const VGA_NONE: &str = "none";

fn scalar<T: Clone + PartialEq>(
    tracked: &Option<T>,
    observed: Option<T>,
    default: T,
) -> Option<T> {
    let observed = observed.unwrap_or_else(|| default.clone());
    write_back(tracked.is_some(), observed, &default)
}

fn block<T: Default + PartialEq>(
    tracked: &Option<T>,
    observed: T,
) -> Option<T> {
    write_back(tracked.is_some(), observed, &T::default())
}

fn observe_agent(config: &VmConfig) -> Agent {
    let default = Agent::default();
    match &config.agent {
        None => default,
        Some(a) => Agent {
            enabled: a.enabled,
            trim: a.trim_cloned_disks.unwrap_or(default.trim),
            agent_type: a.agent_type.clone().unwrap_or(default.agent_type),
        },
    }
}

fn observe_cdrom(config: &VmConfig, id: VmId) -> Cdrom {
    match ide2_occupant(config.ide[2].as_ref(), id) {
        Ide2Occupant::Cdrom(dev) => {
            let empty = dev.file_volume == defaults::CDROM_EMPTY_MEDIA
                || dev.file_volume == "none";
            Cdrom {
                enabled: true,
                file_id: (!empty).then(|| dev.file_volume.clone()),
            }
        }
        Ide2Occupant::CloudInit(_) | Ide2Occupant::Empty => Cdrom::default(),
    }
}

fn observe_cpu(config: &VmConfig) -> Cpu {
    let default = Cpu::default();
    Cpu {
        architecture: config.arch.clone().unwrap_or(default.architecture),
        cores: config.cores.unwrap_or(default.cores),
        flags: config.cpu.as_ref().map(|c| c.flags.clone()).unwrap_or_default(),
        hotplugged: config.vcpus.unwrap_or(default.hotplugged),
        sockets: config.sockets.unwrap_or(default.sockets),
        cpu_type: config
            .cpu
            .as_ref()
            .map(|c| c.cpu_type.clone())
            .unwrap_or(default.cpu_type),
        units: config.cpuunits.unwrap_or(default.units),
    }
}

fn observe_memory(config: &VmConfig) -> Memory {
    let default = Memory::default();
    Memory {
        dedicated: config.memory.unwrap_or(default.dedicated),
        floating: config.balloon.unwrap_or(default.floating),
        shared: config.ivshmem.as_ref().map_or(default.shared, |m| m.size),
    }
}

fn observe_vga(config: &VmConfig, current: &VmSpec) -> Vga {
    let default = Vga::default();
    let Some(vga) = &config.vga else {
        return default;
    };
    let memory = vga.memory.unwrap_or(default.memory);
    match vga.vga_type.as_deref() {
        Some(VGA_NONE) => Vga {
            enabled: false,
            memory,
            vga_type: current.vga_or_default().vga_type,
        },
        t => Vga {
            enabled: true,
            memory,
            vga_type: t.map_or(default.vga_type, str::to_string),
        },
    }
}

fn observe_disks(
    config: &VmConfig,
    current: &VmSpec,
) -> Result<Vec<Disk>, Error> {
    let default = Disk::default();
    // Disk `n` of the document lives in slot `n`, so tracked values are
    // looked up by slot even when earlier slots are empty.
    SlotArray::from_slots(config.scsi.clone())
        .iter()
        .filter(|(_, dev)| !dev.is_cdrom())
        .map(|(slot, dev)| -> Result<Disk, Error> {
            let tracked = current.disks.get(slot);
            let size = match &dev.size {
                Some(raw) => parse_disk_size(raw)?,
                None => tracked.map_or(default.size, |d| d.size),
            };
            let datastore_id = match dev.file_volume.split_once(':') {
                Some((ds, _)) => ds.to_string(),
                None => default.datastore_id.clone(),
            };
            Ok(Disk {
                datastore_id,
                file_id: tracked.and_then(|d| d.file_id.clone()),
                file_format: dev
                    .format
                    .clone()
                    .or_else(|| tracked.map(|d| d.file_format.clone()))
                    .unwrap_or_else(|| default.file_format.clone()),
                size,
                speed: DiskSpeed {
                    read: dev.mbps_rd,
                    read_burstable: dev.mbps_rd_max,
                    write: dev.mbps_wr,
                    write_burstable: dev.mbps_wr_max,
                },
            })
        })
        .collect()
}

fn network_device(dev: &api::NetworkDevice) -> NetworkDevice {
    let default = NetworkDevice::default();
    NetworkDevice {
        bridge: dev.bridge.clone().unwrap_or(default.bridge),
        enabled: true,
        mac_address: dev.mac_address.as_deref().map(str::to_uppercase),
        model: dev.model.clone(),
        rate_limit: dev.rate,
        vlan_id: dev.tag,
    }
}

fn observe_network_devices(config: &VmConfig) -> Vec<NetworkDevice> {
    let slots: [Option<NetworkDevice>; api::NETWORK_SLOTS] =
        std::array::from_fn(|i| config.net[i].as_ref().map(network_device));
    SlotArray::from_slots(slots).compact_with(|_| NetworkDevice::disabled())
}

/// Builds the state of VM `id` from its remote configuration and run state.
///
/// `current` is what the document last recorded; it decides which default
/// values are written back and supplies the attributes the hypervisor does
/// not report (node, pool, disk image references).
pub fn observe(
    current: &VmSpec,
    config: &VmConfig,
    status: VmStatus,
    id: VmId,
) -> Result<VmSpec, Error> {
    let has_cloud_init = matches!(
        ide2_occupant(config.ide[2].as_ref(), id),
        Ide2Occupant::CloudInit(_)
    ) || config.ciuser.is_some()
        || config.sshkeys.is_some()
        || config.ipconfig.iter().any(Option::is_some);

    Ok(VmSpec {
        node_name: current.node_name.clone(),
        vm_id: VmIdentity::Fixed(id),
        pool_id: current.pool_id.clone(),

        acpi: scalar(&current.acpi, config.acpi, defaults::ACPI),
        bios: scalar(
            &current.bios,
            config.bios.clone(),
            defaults::BIOS.to_string(),
        ),
        description: scalar(
            &current.description,
            config.description.clone(),
            defaults::DESCRIPTION.to_string(),
        ),
        keyboard_layout: scalar(
            &current.keyboard_layout,
            config.keyboard.clone(),
            defaults::KEYBOARD_LAYOUT.to_string(),
        ),
        name: scalar(
            &current.name,
            config.name.clone(),
            defaults::NAME.to_string(),
        ),
        started: scalar(
            &current.started,
            Some(status == VmStatus::Running),
            defaults::STARTED,
        ),
        tablet_device: scalar(
            &current.tablet_device,
            config.tablet,
            defaults::TABLET_DEVICE,
        ),

        agent: block(&current.agent, observe_agent(config)),
        cdrom: block(&current.cdrom, observe_cdrom(config, id)),
        cpu: block(&current.cpu, observe_cpu(config)),
        initialization: has_cloud_init.then(|| {
            cloudinit::observe(config, current.initialization.as_ref())
        }),
        memory: block(&current.memory, observe_memory(config)),
        operating_system: block(
            &current.operating_system,
            OperatingSystem {
                os_type: config
                    .ostype
                    .clone()
                    .unwrap_or_else(|| defaults::OS_TYPE.to_string()),
            },
        ),
        vga: block(&current.vga, observe_vga(config, current)),

        disks: observe_disks(config, current)?,
        network_devices: observe_network_devices(config),
    })
}

/// The MAC address of each network device slot, empty for disabled ones.
pub fn mac_addresses(spec: &VmSpec) -> Vec<String> {
    spec.network_devices
        .iter()
        .map(|d| match (&d.mac_address, d.enabled) {
            (Some(mac), true) => mac.clone(),
            _ => String::new(),
        })
        .collect()
}

/// Fills the guest agent outputs of `computed` from the interfaces the
/// agent reports.
pub fn agent_outputs(
    interfaces: &[AgentNetworkInterface],
    computed: &mut ComputedAttributes,
) {
    let addresses = |iface: &AgentNetworkInterface, family: IpAddressType| {
        iface
            .ip_addresses
            .iter()
            .filter(|a| a.address_type == family)
            .map(|a| a.address.clone())
            .collect::<Vec<_>>()
    };
    computed.ipv4_addresses =
        interfaces.iter().map(|i| addresses(i, IpAddressType::Ipv4)).collect();
    computed.ipv6_addresses =
        interfaces.iter().map(|i| addresses(i, IpAddressType::Ipv6)).collect();
    computed.network_interface_names =
        interfaces.iter().map(|i| i.name.clone()).collect();
}

#[cfg(test)]
mod test {
    use super::*;
    use pve_api_types::{AgentIpAddress, StorageDevice};
    use serde_json::json;

    fn config(value: serde_json::Value) -> VmConfig {
        serde_json::from_value(value).unwrap()
    }

    fn observe_untracked(cfg: &VmConfig, id: VmId) -> VmSpec {
        observe(&VmSpec::default(), cfg, VmStatus::Running, id).unwrap()
    }

    #[test]
    fn defaults_are_not_written_for_untracked_sections() {
        let cfg = config(json!({
            "acpi": 1,
            "bios": "seabios",
            "cores": 1,
            "sockets": 1,
            "cpu": "qemu64",
            "cpuunits": 1024,
            "arch": "x86_64",
            "memory": 512,
            "balloon": 0,
            "ostype": "other",
            "vga": "std,memory=16",
            "agent": "0,fstrim_cloned_disks=0,type=virtio",
        }));
        let current =
            VmSpec { node_name: "pve".to_string(), ..Default::default() };
        let seen = observe(&current, &cfg, VmStatus::Running, 100).unwrap();
        assert_eq!(
            seen,
            VmSpec {
                node_name: "pve".to_string(),
                vm_id: VmIdentity::Fixed(100),
                ..Default::default()
            }
        );
    }

    #[test]
    fn tracked_sections_are_written_even_at_defaults() {
        let cfg = config(json!({ "memory": 512 }));
        let current = VmSpec {
            acpi: Some(true),
            memory: Some(Memory::default()),
            ..Default::default()
        };
        let seen = observe(&current, &cfg, VmStatus::Stopped, 100).unwrap();
        assert_eq!(seen.acpi, Some(true));
        assert_eq!(seen.memory, Some(Memory::default()));
        assert_eq!(seen.started, Some(false));
    }

    #[test]
    fn cloud_init_hides_cdrom() {
        let cfg = config(json!({
            "ide2": "local-lvm:vm-100-cloudinit,media=cdrom",
            "ipconfig0": "ip=dhcp",
        }));
        let current = VmSpec {
            cdrom: Some(Cdrom { enabled: true, file_id: None }),
            ..Default::default()
        };
        let seen = observe(&current, &cfg, VmStatus::Running, 100).unwrap();
        assert_eq!(seen.cdrom, Some(Cdrom { enabled: false, file_id: None }));
        let init = seen.initialization.unwrap();
        assert_eq!(init.datastore_id, "local-lvm");
        assert_eq!(init.ip_config.len(), 1);
    }

    #[test]
    fn cdrom_media() {
        let mut cfg = VmConfig::default();
        cfg.ide[2] = Some(StorageDevice::cdrom("local:iso/debian.iso"));
        let seen = observe_untracked(&cfg, 9);
        assert_eq!(
            seen.cdrom,
            Some(Cdrom {
                enabled: true,
                file_id: Some("local:iso/debian.iso".to_string())
            })
        );

        cfg.ide[2] = Some(StorageDevice::cdrom("cdrom"));
        let seen = observe_untracked(&cfg, 9);
        assert_eq!(seen.cdrom, Some(Cdrom { enabled: true, file_id: None }));
    }

    #[test]
    fn disks_and_network_devices() {
        let cfg = config(json!({
            "scsi0": "ceph:vm-100-disk-0,format=raw,size=1500M,mbps_rd=50",
            "scsi2": "local-lvm:vm-100-disk-1,size=2T",
            "net0": "virtio=bc:24:11:aa:bb:cc,bridge=vmbr1,tag=20",
            "net2": "e1000=BC:24:11:00:00:02,bridge=vmbr0,rate=12.5",
        }));
        let current = VmSpec {
            disks: vec![Disk {
                file_id: Some("local:iso/jammy.qcow2".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let seen = observe(&current, &cfg, VmStatus::Running, 100).unwrap();

        assert_eq!(seen.disks.len(), 2);
        assert_eq!(seen.disks[0].datastore_id, "ceph");
        assert_eq!(seen.disks[0].size, 2);
        assert_eq!(seen.disks[0].file_format, "raw");
        assert_eq!(seen.disks[0].speed.read, Some(50));
        assert_eq!(
            seen.disks[0].file_id.as_deref(),
            Some("local:iso/jammy.qcow2")
        );
        assert_eq!(seen.disks[1].size, 2048);
        assert_eq!(seen.disks[1].file_format, "qcow2");

        assert_eq!(seen.network_devices.len(), 3);
        assert_eq!(
            seen.network_devices[0].mac_address.as_deref(),
            Some("BC:24:11:AA:BB:CC")
        );
        assert_eq!(seen.network_devices[0].vlan_id, Some(20));
        assert!(!seen.network_devices[1].enabled);
        assert_eq!(seen.network_devices[2].rate_limit, Some(12.5));
        assert_eq!(
            mac_addresses(&seen),
            vec!["BC:24:11:AA:BB:CC", "", "BC:24:11:00:00:02"]
        );
    }

    #[test]
    fn tracked_disk_values_follow_slot_numbers() {
        let cfg = config(json!({
            "scsi0": "local-lvm:vm-100-disk-0,size=8G",
            "scsi2": "local-lvm:vm-100-disk-1",
        }));
        let current = VmSpec {
            disks: vec![
                Disk::default(),
                Disk {
                    size: 5,
                    file_format: "vmdk".to_string(),
                    ..Default::default()
                },
                Disk {
                    size: 40,
                    file_format: "raw".to_string(),
                    file_id: Some("local:iso/jammy.qcow2".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let seen = observe(&current, &cfg, VmStatus::Running, 100).unwrap();

        assert_eq!(seen.disks.len(), 2);
        assert_eq!(seen.disks[0].size, 8);
        assert_eq!(seen.disks[1].size, 40);
        assert_eq!(seen.disks[1].file_format, "raw");
        assert_eq!(
            seen.disks[1].file_id.as_deref(),
            Some("local:iso/jammy.qcow2")
        );
    }

    #[test]
    fn bad_disk_size_is_an_error() {
        let cfg = config(json!({ "scsi0": "local-lvm:vm-1-disk-0,size=5X" }));
        assert!(matches!(
            observe(&VmSpec::default(), &cfg, VmStatus::Running, 1),
            Err(Error::InvalidDiskSize { .. })
        ));
    }

    #[test]
    fn disabled_vga() {
        let cfg = config(json!({ "vga": "none" }));
        let seen = observe_untracked(&cfg, 1);
        let disabled = Vga { enabled: false, ..Default::default() };
        assert_eq!(seen.vga, Some(disabled));
    }

    #[test]
    fn agent_interfaces() {
        let addr = |address: &str, address_type| AgentIpAddress {
            address: address.to_string(),
            address_type,
            prefix: 24,
        };
        let ifaces = vec![
            AgentNetworkInterface {
                name: "lo".to_string(),
                mac_address: None,
                ip_addresses: vec![
                    addr("127.0.0.1", IpAddressType::Ipv4),
                    addr("::1", IpAddressType::Ipv6),
                ],
            },
            AgentNetworkInterface {
                name: "eth0".to_string(),
                mac_address: Some("bc:24:11:00:00:01".to_string()),
                ip_addresses: vec![addr("10.0.0.5", IpAddressType::Ipv4)],
            },
        ];
        let mut computed = ComputedAttributes::default();
        agent_outputs(&ifaces, &mut computed);
        assert_eq!(computed.network_interface_names, vec!["lo", "eth0"]);
        assert_eq!(
            computed.ipv4_addresses,
            vec![vec!["127.0.0.1".to_string()], vec!["10.0.0.5".to_string()]]
        );
        assert_eq!(
            computed.ipv6_addresses,
            vec![vec!["::1".to_string()], vec![]]
        );
    }
}
