// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exchanged with the Proxmox VE management API's
//! QEMU endpoints.
//!
//! The hypervisor exposes a VM's configuration as one flat object in which
//! numbered devices occupy fixed slots (`scsi0`..`scsi13`, `net0`..`net7`,
//! ...). [`VmConfig`] keeps that flat shape but gathers each slot family into
//! a fixed-size array.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod devices;
mod wire;

pub use devices::{
    AgentSettings, CloudInitFiles, CpuEmulation, DeviceParseError,
    IpConfig, NetworkDevice, SharedMemory, SshKeys, StorageDevice, VgaDevice,
};

/// Number of SCSI disk slots.
pub const SCSI_SLOTS: usize = 14;
/// Number of network device slots.
pub const NETWORK_SLOTS: usize = 8;
/// Number of cloud-init IP configuration slots.
pub const IP_CONFIG_SLOTS: usize = 8;
/// Number of IDE slots.
pub const IDE_SLOTS: usize = 3;

/// Numeric identifier of a VM within a cluster.
pub type VmId = u32;

/// The configuration of a VM, as returned by
/// `GET /nodes/{node}/qemu/{vmid}/config` and as sent (in part) on create and
/// update. Every field is optional: `None` means the hypervisor default
/// applies, or that the field is being left alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawVmConfig", into = "RawVmConfig")]
pub struct VmConfig {
    pub acpi: Option<bool>,
    pub agent: Option<AgentSettings>,
    pub arch: Option<String>,
    pub balloon: Option<u64>,
    pub bios: Option<String>,
    pub boot: Option<String>,
    pub bootdisk: Option<String>,
    pub cicustom: Option<CloudInitFiles>,
    pub cipassword: Option<String>,
    pub ciuser: Option<String>,
    pub cores: Option<u32>,
    pub cpu: Option<CpuEmulation>,
    pub cpuunits: Option<u32>,
    pub description: Option<String>,
    pub ivshmem: Option<SharedMemory>,
    pub keyboard: Option<String>,
    pub memory: Option<u64>,
    pub name: Option<String>,
    pub nameserver: Option<String>,
    pub onboot: Option<bool>,
    pub ostype: Option<String>,
    pub scsihw: Option<String>,
    pub searchdomain: Option<String>,
    pub serial0: Option<String>,
    pub sockets: Option<u32>,
    pub sshkeys: Option<SshKeys>,
    pub tablet: Option<bool>,
    pub vcpus: Option<u32>,
    pub vga: Option<VgaDevice>,

    pub ide: [Option<StorageDevice>; IDE_SLOTS],
    pub ipconfig: [Option<IpConfig>; IP_CONFIG_SLOTS],
    pub net: [Option<NetworkDevice>; NETWORK_SLOTS],
    pub scsi: [Option<StorageDevice>; SCSI_SLOTS],
}

/// The wire shape of [`VmConfig`]: scalar options are named, slot devices
/// are collected from the remaining keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RawVmConfig {
    #[serde(
        default,
        with = "wire::opt_bool",
        skip_serializing_if = "Option::is_none"
    )]
    acpi: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<AgentSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arch: Option<String>,
    #[serde(
        default,
        with = "wire::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    balloon: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bios: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    boot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootdisk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cicustom: Option<CloudInitFiles>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cipassword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ciuser: Option<String>,
    #[serde(
        default,
        with = "wire::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu: Option<CpuEmulation>,
    #[serde(
        default,
        with = "wire::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    cpuunits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ivshmem: Option<SharedMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keyboard: Option<String>,
    #[serde(
        default,
        with = "wire::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nameserver: Option<String>,
    #[serde(
        default,
        with = "wire::opt_bool",
        skip_serializing_if = "Option::is_none"
    )]
    onboot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ostype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scsihw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    searchdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serial0: Option<String>,
    #[serde(
        default,
        with = "wire::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    sockets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sshkeys: Option<SshKeys>,
    #[serde(
        default,
        with = "wire::opt_bool",
        skip_serializing_if = "Option::is_none"
    )]
    tablet: Option<bool>,
    #[serde(
        default,
        with = "wire::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    vcpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vga: Option<VgaDevice>,

    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

/// Looks up `{prefix}{index}` keys in `other` and parses each into its slot.
fn collect_slots<T, const N: usize>(
    other: &BTreeMap<String, serde_json::Value>,
    prefix: &str,
) -> Result<[Option<T>; N], DeviceParseError>
where
    T: std::str::FromStr<Err = DeviceParseError>,
{
    let mut slots: [Option<T>; N] = std::array::from_fn(|_| None);
    for (i, slot) in slots.iter_mut().enumerate() {
        if let Some(serde_json::Value::String(s)) =
            other.get(&format!("{}{}", prefix, i))
        {
            *slot = Some(s.parse()?);
        }
    }
    Ok(slots)
}

fn store_slots<T: ToString>(
    other: &mut BTreeMap<String, serde_json::Value>,
    prefix: &str,
    slots: &[Option<T>],
) {
    for (i, slot) in slots.iter().enumerate() {
        if let Some(dev) = slot {
            other.insert(
                format!("{}{}", prefix, i),
                serde_json::Value::String(dev.to_string()),
            );
        }
    }
}

impl TryFrom<RawVmConfig> for VmConfig {
    type Error = DeviceParseError;

    fn try_from(raw: RawVmConfig) -> Result<Self, Self::Error> {
        Ok(VmConfig {
            ide: collect_slots(&raw.other, "ide")?,
            ipconfig: collect_slots(&raw.other, "ipconfig")?,
            net: collect_slots(&raw.other, "net")?,
            scsi: collect_slots(&raw.other, "scsi")?,
            acpi: raw.acpi,
            agent: raw.agent,
            arch: raw.arch,
            balloon: raw.balloon,
            bios: raw.bios,
            boot: raw.boot,
            bootdisk: raw.bootdisk,
            cicustom: raw.cicustom,
            cipassword: raw.cipassword,
            ciuser: raw.ciuser,
            cores: raw.cores,
            cpu: raw.cpu,
            cpuunits: raw.cpuunits,
            description: raw.description,
            ivshmem: raw.ivshmem,
            keyboard: raw.keyboard,
            memory: raw.memory,
            name: raw.name,
            nameserver: raw.nameserver,
            onboot: raw.onboot,
            ostype: raw.ostype,
            scsihw: raw.scsihw,
            searchdomain: raw.searchdomain,
            serial0: raw.serial0,
            sockets: raw.sockets,
            sshkeys: raw.sshkeys,
            tablet: raw.tablet,
            vcpus: raw.vcpus,
            vga: raw.vga,
        })
    }
}

impl From<VmConfig> for RawVmConfig {
    fn from(cfg: VmConfig) -> Self {
        let mut other = BTreeMap::new();
        store_slots(&mut other, "ide", &cfg.ide);
        store_slots(&mut other, "ipconfig", &cfg.ipconfig);
        store_slots(&mut other, "net", &cfg.net);
        store_slots(&mut other, "scsi", &cfg.scsi);
        RawVmConfig {
            acpi: cfg.acpi,
            agent: cfg.agent,
            arch: cfg.arch,
            balloon: cfg.balloon,
            bios: cfg.bios,
            boot: cfg.boot,
            bootdisk: cfg.bootdisk,
            cicustom: cfg.cicustom,
            cipassword: cfg.cipassword,
            ciuser: cfg.ciuser,
            cores: cfg.cores,
            cpu: cfg.cpu,
            cpuunits: cfg.cpuunits,
            description: cfg.description,
            ivshmem: cfg.ivshmem,
            keyboard: cfg.keyboard,
            memory: cfg.memory,
            name: cfg.name,
            nameserver: cfg.nameserver,
            onboot: cfg.onboot,
            ostype: cfg.ostype,
            scsihw: cfg.scsihw,
            searchdomain: cfg.searchdomain,
            serial0: cfg.serial0,
            sockets: cfg.sockets,
            sshkeys: cfg.sshkeys,
            tablet: cfg.tablet,
            vcpus: cfg.vcpus,
            vga: cfg.vga,
            other,
        }
    }
}

/// Body of `POST /nodes/{node}/qemu`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VmCreateRequest {
    pub vmid: VmId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(flatten)]
    pub config: VmConfig,
}

/// Body of `PUT /nodes/{node}/qemu/{vmid}/config`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VmUpdateRequest {
    #[serde(flatten)]
    pub config: VmConfig,
    /// Options to remove from the configuration.
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "wire::comma_list"
    )]
    pub delete: Vec<String>,
}

impl VmUpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.config == VmConfig::default()
    }
}

/// Body of `POST /nodes/{node}/qemu/{vmid}/status/shutdown`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VmShutdownRequest {
    #[serde(
        rename = "forceStop",
        skip_serializing_if = "Option::is_none",
        with = "wire::opt_bool"
    )]
    pub force_stop: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Body of `POST /nodes/{node}/qemu/{vmid}/status/reboot`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VmRebootRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Run state reported by the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// Response of `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatusResponse {
    pub status: VmStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qmpstatus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        with = "wire::opt_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent: Option<bool>,
}

/// Address family of an interface address reported by the guest agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    Ipv4,
    Ipv6,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub address: String,
    #[serde(rename = "ip-address-type")]
    pub address_type: IpAddressType,
    #[serde(default)]
    pub prefix: u8,
}

/// One guest network interface as published by the guest agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNetworkInterface {
    pub name: String,
    #[serde(
        rename = "hardware-address",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mac_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

/// Response of `GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNetworkInterfaces {
    #[serde(default)]
    pub result: Vec<AgentNetworkInterface>,
}

/// The `{"data": ...}` envelope wrapped around every API response.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}
