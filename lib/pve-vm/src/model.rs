// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The desired-state model of a VM.
//!
//! Scalar attributes are `Option`s that resolve to the constants in
//! [`crate::defaults`]. Singleton blocks are `Option<Block>`: `None` leaves
//! that part of the VM unmanaged, while `Some(Block::default())` actively
//! manages it to the defaults. Slotted collections are plain `Vec`s whose
//! position is the remote slot index.

use std::fmt;

use pve_api_types::VmId;
use serde::{Deserialize, Serialize};

use crate::defaults::{self, resolve, Mutability};

/// How the VM identifier is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum VmIdentity {
    /// Take the next free identifier from the cluster at creation time.
    /// Written as `-1` in documents.
    #[default]
    Allocate,
    Fixed(VmId),
}

impl TryFrom<i64> for VmIdentity {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(VmIdentity::Allocate),
            v if v > 0 => VmId::try_from(v)
                .map(VmIdentity::Fixed)
                .map_err(|_| format!("VM identifier {} out of range", v)),
            v => Err(format!("invalid VM identifier {}", v)),
        }
    }
}

impl From<VmIdentity> for i64 {
    fn from(id: VmIdentity) -> Self {
        match id {
            VmIdentity::Allocate => -1,
            VmIdentity::Fixed(id) => i64::from(id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    pub enabled: bool,
    /// Run fstrim after cloning or moving a disk.
    pub trim: bool,
    #[serde(rename = "type")]
    pub agent_type: String,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            enabled: defaults::AGENT_ENABLED,
            trim: defaults::AGENT_TRIM,
            agent_type: defaults::AGENT_TYPE.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cdrom {
    pub enabled: bool,
    /// Media volume, e.g. `local:iso/debian.iso`. `None` is an empty drive.
    pub file_id: Option<String>,
}

impl Default for Cdrom {
    fn default() -> Self {
        Self { enabled: defaults::CDROM_ENABLED, file_id: None }
    }
}

impl Cdrom {
    /// The media reference placed in the drive.
    pub fn media(&self) -> &str {
        self.file_id.as_deref().unwrap_or(defaults::CDROM_EMPTY_MEDIA)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cpu {
    pub architecture: String,
    pub cores: u32,
    pub flags: Vec<String>,
    /// Number of hotplugged vCPUs; zero leaves all cores online.
    pub hotplugged: u32,
    pub sockets: u32,
    #[serde(rename = "type")]
    pub cpu_type: String,
    /// Relative CPU weight.
    pub units: u32,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            architecture: defaults::CPU_ARCHITECTURE.to_string(),
            cores: defaults::CPU_CORES,
            flags: Vec::new(),
            hotplugged: defaults::CPU_HOTPLUGGED,
            sockets: defaults::CPU_SOCKETS,
            cpu_type: defaults::CPU_TYPE.to_string(),
            units: defaults::CPU_UNITS,
        }
    }
}

/// Throughput limits in MB/s. `None` is unlimited.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpeed {
    pub read: Option<u64>,
    pub read_burstable: Option<u64>,
    pub write: Option<u64>,
    pub write_burstable: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disk {
    pub datastore_id: String,
    /// Image to import as this disk, e.g. `local:iso/jammy.qcow2`.
    pub file_id: Option<String>,
    pub file_format: String,
    /// Gigabytes.
    pub size: u64,
    pub speed: DiskSpeed,
}

impl Default for Disk {
    fn default() -> Self {
        Self {
            datastore_id: defaults::DISK_DATASTORE.to_string(),
            file_id: None,
            file_format: defaults::DISK_FILE_FORMAT.to_string(),
            size: defaults::DISK_SIZE,
            speed: DiskSpeed::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dns {
    pub domain: Option<String>,
    pub server: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    /// Address in CIDR form, or `dhcp` (`auto`/`dhcp` for IPv6).
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    pub ipv4: Option<IpAddress>,
    pub ipv6: Option<IpAddress>,
}

impl IpConfig {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAccount {
    pub keys: Vec<String>,
    pub password: Option<String>,
    pub username: Option<String>,
}

/// Cloud-init settings, delivered to the guest through a drive in IDE
/// slot 2.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Initialization {
    /// Datastore holding the cloud-init drive.
    pub datastore_id: String,
    pub dns: Option<Dns>,
    /// One entry per network device, by index.
    pub ip_config: Vec<IpConfig>,
    pub user_account: Option<UserAccount>,
    /// Custom user-data snippet, e.g. `local:snippets/user.yml`.
    pub user_data_file_id: Option<String>,
}

impl Default for Initialization {
    fn default() -> Self {
        Self {
            datastore_id: defaults::CLOUD_INIT_DATASTORE.to_string(),
            dns: None,
            ip_config: Vec::new(),
            user_account: None,
            user_data_file_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Memory {
    /// MiB.
    pub dedicated: u64,
    /// Balloon target in MiB; zero disables ballooning.
    pub floating: u64,
    /// Shared memory device size in MiB; zero means no device.
    pub shared: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            dedicated: defaults::MEMORY_DEDICATED,
            floating: defaults::MEMORY_FLOATING,
            shared: defaults::MEMORY_SHARED,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDevice {
    pub bridge: String,
    pub enabled: bool,
    /// `None` (or an empty string) accepts whatever address the hypervisor
    /// assigns.
    pub mac_address: Option<String>,
    pub model: String,
    /// MB/s.
    pub rate_limit: Option<f64>,
    pub vlan_id: Option<u16>,
}

impl Default for NetworkDevice {
    fn default() -> Self {
        Self {
            bridge: defaults::NETWORK_BRIDGE.to_string(),
            enabled: defaults::NETWORK_ENABLED,
            mac_address: None,
            model: defaults::NETWORK_MODEL.to_string(),
            rate_limit: None,
            vlan_id: None,
        }
    }
}

impl NetworkDevice {
    /// Placeholder for an unpopulated slot below the last populated one.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatingSystem {
    #[serde(rename = "type")]
    pub os_type: String,
}

impl Default for OperatingSystem {
    fn default() -> Self {
        Self { os_type: defaults::OS_TYPE.to_string() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vga {
    pub enabled: bool,
    /// MiB.
    pub memory: u32,
    #[serde(rename = "type")]
    pub vga_type: String,
}

impl Default for Vga {
    fn default() -> Self {
        Self {
            enabled: defaults::VGA_ENABLED,
            memory: defaults::VGA_MEMORY,
            vga_type: defaults::VGA_TYPE.to_string(),
        }
    }
}

/// A VM as described by the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    pub node_name: String,
    pub vm_id: VmIdentity,
    pub pool_id: Option<String>,

    pub acpi: Option<bool>,
    pub bios: Option<String>,
    pub description: Option<String>,
    pub keyboard_layout: Option<String>,
    pub name: Option<String>,
    pub started: Option<bool>,
    pub tablet_device: Option<bool>,

    pub agent: Option<Agent>,
    pub cdrom: Option<Cdrom>,
    pub cpu: Option<Cpu>,
    pub initialization: Option<Initialization>,
    pub memory: Option<Memory>,
    pub operating_system: Option<OperatingSystem>,
    pub vga: Option<Vga>,

    pub disks: Vec<Disk>,
    pub network_devices: Vec<NetworkDevice>,
}

impl VmSpec {
    pub fn acpi(&self) -> bool {
        resolve(&self.acpi, defaults::ACPI)
    }

    pub fn bios(&self) -> String {
        resolve(&self.bios, defaults::BIOS.to_string())
    }

    pub fn description(&self) -> String {
        resolve(&self.description, defaults::DESCRIPTION.to_string())
    }

    pub fn keyboard_layout(&self) -> String {
        resolve(&self.keyboard_layout, defaults::KEYBOARD_LAYOUT.to_string())
    }

    pub fn name(&self) -> String {
        resolve(&self.name, defaults::NAME.to_string())
    }

    pub fn pool_id(&self) -> String {
        resolve(&self.pool_id, defaults::POOL_ID.to_string())
    }

    pub fn started(&self) -> bool {
        resolve(&self.started, defaults::STARTED)
    }

    pub fn tablet_device(&self) -> bool {
        resolve(&self.tablet_device, defaults::TABLET_DEVICE)
    }

    pub fn agent_or_default(&self) -> Agent {
        self.agent.clone().unwrap_or_default()
    }

    pub fn cdrom_or_default(&self) -> Cdrom {
        self.cdrom.clone().unwrap_or_default()
    }

    pub fn cpu_or_default(&self) -> Cpu {
        self.cpu.clone().unwrap_or_default()
    }

    pub fn memory_or_default(&self) -> Memory {
        self.memory.clone().unwrap_or_default()
    }

    pub fn operating_system_or_default(&self) -> OperatingSystem {
        self.operating_system.clone().unwrap_or_default()
    }

    pub fn vga_or_default(&self) -> Vga {
        self.vga.clone().unwrap_or_default()
    }
}

/// The independently reconciled parts of a [`VmSpec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    NodeName,
    VmId,
    PoolId,
    Acpi,
    Agent,
    Bios,
    Cdrom,
    Cpu,
    Description,
    Disks,
    Initialization,
    KeyboardLayout,
    Memory,
    Name,
    NetworkDevices,
    OperatingSystem,
    Started,
    TabletDevice,
    Vga,
}

impl Section {
    pub const ALL: [Section; 19] = [
        Section::NodeName,
        Section::VmId,
        Section::PoolId,
        Section::Acpi,
        Section::Agent,
        Section::Bios,
        Section::Cdrom,
        Section::Cpu,
        Section::Description,
        Section::Disks,
        Section::Initialization,
        Section::KeyboardLayout,
        Section::Memory,
        Section::Name,
        Section::NetworkDevices,
        Section::OperatingSystem,
        Section::Started,
        Section::TabletDevice,
        Section::Vga,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Section::NodeName => "node_name",
            Section::VmId => "vm_id",
            Section::PoolId => "pool_id",
            Section::Acpi => "acpi",
            Section::Agent => "agent",
            Section::Bios => "bios",
            Section::Cdrom => "cdrom",
            Section::Cpu => "cpu",
            Section::Description => "description",
            Section::Disks => "disk",
            Section::Initialization => "initialization",
            Section::KeyboardLayout => "keyboard_layout",
            Section::Memory => "memory",
            Section::Name => "name",
            Section::NetworkDevices => "network_device",
            Section::OperatingSystem => "operating_system",
            Section::Started => "started",
            Section::TabletDevice => "tablet_device",
            Section::Vga => "vga",
        }
    }

    /// Whether a change to this section only takes effect after the guest
    /// is rebooted.
    pub fn requires_reboot(&self) -> bool {
        match self {
            Section::Acpi
            | Section::Agent
            | Section::Bios
            | Section::Cdrom
            | Section::Cpu
            | Section::Disks
            | Section::Initialization
            | Section::KeyboardLayout
            | Section::Memory
            | Section::NetworkDevices
            | Section::OperatingSystem
            | Section::TabletDevice
            | Section::Vga => true,
            Section::NodeName
            | Section::VmId
            | Section::PoolId
            | Section::Description
            | Section::Name
            | Section::Started => false,
        }
    }

    pub fn mutability(&self) -> Mutability {
        match self {
            Section::NodeName | Section::VmId | Section::PoolId => {
                Mutability::CreateOnly
            }
            _ => Mutability::Always,
        }
    }

    /// Whether `desired` asks for something other than what `state`
    /// records for this section. Unmanaged blocks and empty collections
    /// never differ.
    pub fn differs(&self, desired: &VmSpec, state: &VmSpec) -> bool {
        fn block<T: Clone + Default + PartialEq>(
            desired: &Option<T>,
            state: &Option<T>,
        ) -> bool {
            match desired {
                None => false,
                Some(d) => *d != state.clone().unwrap_or_default(),
            }
        }

        match self {
            Section::NodeName => desired.node_name != state.node_name,
            Section::VmId => match (desired.vm_id, state.vm_id) {
                (VmIdentity::Fixed(d), VmIdentity::Fixed(s)) => d != s,
                _ => false,
            },
            Section::PoolId => desired.pool_id() != state.pool_id(),
            Section::Acpi => desired.acpi() != state.acpi(),
            Section::Bios => desired.bios() != state.bios(),
            Section::Description => {
                desired.description() != state.description()
            }
            Section::KeyboardLayout => {
                desired.keyboard_layout() != state.keyboard_layout()
            }
            Section::Name => desired.name() != state.name(),
            Section::Started => desired.started() != state.started(),
            Section::TabletDevice => {
                desired.tablet_device() != state.tablet_device()
            }
            Section::Agent => block(&desired.agent, &state.agent),
            Section::Cdrom => block(&desired.cdrom, &state.cdrom),
            Section::Cpu => block(&desired.cpu, &state.cpu),
            Section::Memory => block(&desired.memory, &state.memory),
            Section::OperatingSystem => {
                block(&desired.operating_system, &state.operating_system)
            }
            Section::Vga => block(&desired.vga, &state.vga),
            Section::Initialization => match &desired.initialization {
                None => false,
                Some(d) => initialization_differs(
                    d,
                    &state.initialization.clone().unwrap_or_default(),
                ),
            },
            Section::Disks => {
                !desired.disks.is_empty() && desired.disks != state.disks
            }
            Section::NetworkDevices => {
                !desired.network_devices.is_empty()
                    && network_devices_differ(
                        &desired.network_devices,
                        &state.network_devices,
                    )
            }
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The hypervisor reports stored passwords masked with asterisks.
pub(crate) fn is_masked_password(p: &str) -> bool {
    !p.is_empty() && p.chars().all(|c| c == '*')
}

fn initialization_differs(
    desired: &Initialization,
    state: &Initialization,
) -> bool {
    let mut state = state.clone();
    let accounts = (&desired.user_account, &mut state.user_account);
    if let (Some(d), Some(s)) = accounts {
        if s.password.as_deref().map_or(false, is_masked_password) {
            s.password = d.password.clone();
        }
    }
    *desired != state
}

fn network_devices_differ(
    desired: &[NetworkDevice],
    state: &[NetworkDevice],
) -> bool {
    if desired.len() != state.len() {
        return true;
    }
    desired.iter().zip(state).any(|(d, s)| {
        let mut s = s.clone();
        match d.mac_address.as_ref().filter(|m| !m.is_empty()) {
            None => s.mac_address = d.mac_address.clone(),
            Some(mac) => {
                let same = s
                    .mac_address
                    .as_deref()
                    .map_or(false, |m| m.eq_ignore_ascii_case(mac));
                if same {
                    s.mac_address = Some(mac.clone());
                }
            }
        }
        *d != s
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_sentinel_round_trips() {
        let spec: VmSpec =
            serde_json::from_value(json!({ "vm_id": -1 })).unwrap();
        assert_eq!(spec.vm_id, VmIdentity::Allocate);
        let spec: VmSpec =
            serde_json::from_value(json!({ "vm_id": 4321 })).unwrap();
        assert_eq!(spec.vm_id, VmIdentity::Fixed(4321));
        let zero = json!({ "vm_id": 0 });
        assert!(serde_json::from_value::<VmSpec>(zero).is_err());
        assert_eq!(
            serde_json::to_value(VmSpec::default()).unwrap()["vm_id"],
            json!(-1)
        );
    }

    #[test]
    fn empty_blocks_take_defaults() {
        let spec: VmSpec = serde_json::from_value(json!({
            "node_name": "pve",
            "cpu": {},
            "memory": { "dedicated": 2048 },
        }))
        .unwrap();
        assert_eq!(spec.cpu, Some(Cpu::default()));
        assert_eq!(spec.cpu_or_default().architecture, "x86_64");
        assert_eq!(spec.memory.as_ref().unwrap().dedicated, 2048);
        assert_eq!(spec.memory.as_ref().unwrap().floating, 0);
        assert!(spec.vga.is_none());
        assert_eq!(spec.cdrom_or_default().media(), "cdrom");
        assert!(spec.started());
    }

    #[test]
    fn unmanaged_blocks_never_differ() {
        let desired = VmSpec::default();
        let state = VmSpec {
            cpu: Some(Cpu { cores: 8, ..Default::default() }),
            ..Default::default()
        };
        assert!(!Section::Cpu.differs(&desired, &state));

        let desired =
            VmSpec { cpu: Some(Cpu::default()), ..Default::default() };
        assert!(Section::Cpu.differs(&desired, &state));
        // an untracked state block means the remote side matches defaults
        assert!(!Section::Cpu.differs(&desired, &VmSpec::default()));
    }

    #[test]
    fn scalars_compare_resolved_values() {
        let desired = VmSpec { acpi: Some(true), ..Default::default() };
        assert!(!Section::Acpi.differs(&desired, &VmSpec::default()));
        let desired = VmSpec { name: Some("web".into()), ..Default::default() };
        assert!(Section::Name.differs(&desired, &VmSpec::default()));
    }

    #[test]
    fn assigned_mac_addresses_are_not_a_change() {
        let desired = VmSpec {
            network_devices: vec![NetworkDevice::default()],
            ..Default::default()
        };
        let state = VmSpec {
            network_devices: vec![NetworkDevice {
                mac_address: Some("BC:24:11:00:00:01".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!Section::NetworkDevices.differs(&desired, &state));

        let pinned = VmSpec {
            network_devices: vec![NetworkDevice {
                mac_address: Some("bc:24:11:00:00:01".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!Section::NetworkDevices.differs(&pinned, &state));

        let other = VmSpec {
            network_devices: vec![NetworkDevice {
                mac_address: Some("BC:24:11:00:00:02".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(Section::NetworkDevices.differs(&other, &state));
    }

    #[test]
    fn masked_password_is_not_a_change() {
        let account = |password: &str| Initialization {
            user_account: Some(UserAccount {
                password: Some(password.to_string()),
                username: Some("ops".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let desired = VmSpec {
            initialization: Some(account("hunter2")),
            ..Default::default()
        };
        let state = VmSpec {
            initialization: Some(account("**********")),
            ..Default::default()
        };
        assert!(!Section::Initialization.differs(&desired, &state));
    }

    #[test]
    fn reboot_classification() {
        assert!(!Section::Name.requires_reboot());
        assert!(!Section::Description.requires_reboot());
        assert!(!Section::PoolId.requires_reboot());
        assert!(Section::Cpu.requires_reboot());
        assert!(Section::Memory.requires_reboot());
        assert_eq!(Section::PoolId.mutability(), Mutability::CreateOnly);
        assert_eq!(Section::Memory.mutability(), Mutability::Always);
    }
}
