// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property strings for individual VM devices.
//!
//! The management API encodes most devices as a single string of
//! comma-separated options, e.g. `virtio=BC:24:11:00:00:01,bridge=vmbr0,tag=5`.
//! Each type here parses that form with [`FromStr`], renders it back with
//! [`Display`], and (de)serializes through the string form.
//!
//! Options the types do not model are kept verbatim in an `extra` list so
//! that rewriting a device read from the remote side does not drop them.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing a device property string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceParseError {
    #[error("empty device string")]
    Empty,

    #[error("invalid value {value:?} for option {key:?} in {input:?}")]
    InvalidValue { key: String, value: String, input: String },

    #[error("missing {what} in {input:?}")]
    Missing { what: &'static str, input: String },
}

impl DeviceParseError {
    fn invalid(key: &str, value: &str, input: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            input: input.to_string(),
        }
    }
}

/// Extra options carried through unmodified.
pub type ExtraOptions = Vec<(String, String)>;

/// Splits a property string into `(key, value)` pairs. Tokens without an
/// `=` are returned with no key.
fn options(s: &str) -> impl Iterator<Item = (Option<&str>, &str)> {
    s.split(',').map(str::trim).filter(|t| !t.is_empty()).map(|t| {
        match t.split_once('=') {
            Some((k, v)) => (Some(k), v),
            None => (None, t),
        }
    })
}

fn parse_flag(
    key: &str,
    value: &str,
    input: &str,
) -> Result<bool, DeviceParseError> {
    match value {
        "1" | "on" | "yes" | "true" => Ok(true),
        "0" | "off" | "no" | "false" => Ok(false),
        _ => Err(DeviceParseError::invalid(key, value, input)),
    }
}

fn parse_num<T: FromStr>(
    key: &str,
    value: &str,
    input: &str,
) -> Result<T, DeviceParseError> {
    value.parse().map_err(|_| DeviceParseError::invalid(key, value, input))
}

fn flag(b: bool) -> u8 {
    u8::from(b)
}

/// Writes `,key=value` for each present option.
struct OptionWriter<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
    first: bool,
}

impl<'a, 'b> OptionWriter<'a, 'b> {
    fn new(f: &'a mut fmt::Formatter<'b>) -> Self {
        Self { f, first: true }
    }

    fn sep(&mut self) -> fmt::Result {
        if !self.first {
            write!(self.f, ",")?;
        }
        self.first = false;
        Ok(())
    }

    fn bare(&mut self, value: impl Display) -> fmt::Result {
        self.sep()?;
        write!(self.f, "{}", value)
    }

    fn opt<T: Display>(&mut self, key: &str, value: Option<T>) -> fmt::Result {
        match value {
            Some(v) => {
                self.sep()?;
                write!(self.f, "{}={}", key, v)
            }
            None => Ok(()),
        }
    }

    fn extra(&mut self, extra: &ExtraOptions) -> fmt::Result {
        for (k, v) in extra {
            self.opt(k, Some(v))?;
        }
        Ok(())
    }
}

macro_rules! string_serde {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Serialize for $ty {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: Serializer,
                {
                    serializer.serialize_str(&self.to_string())
                }
            }

            impl<'d> Deserialize<'d> for $ty {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: Deserializer<'d>,
                {
                    let s = String::deserialize(deserializer)?;
                    FromStr::from_str(&s).map_err(de::Error::custom)
                }
            }
        )*
    };
}

string_serde!(
    StorageDevice,
    NetworkDevice,
    IpConfig,
    AgentSettings,
    VgaDevice,
    CpuEmulation,
    SharedMemory,
    CloudInitFiles,
    SshKeys,
);

/// A block device attached to a SCSI or IDE slot.
///
/// The leading volume is either an allocated volume
/// (`local-lvm:vm-100-disk-0`), a new-volume request (`local-lvm:8`), a
/// cloud-init drive (`local-lvm:cloudinit`) or a removable-media reference
/// (`cdrom`, `none`, `local:iso/image.iso`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageDevice {
    pub file_volume: String,
    pub media: Option<String>,
    pub format: Option<String>,
    pub size: Option<String>,
    pub mbps_rd: Option<u64>,
    pub mbps_rd_max: Option<u64>,
    pub mbps_wr: Option<u64>,
    pub mbps_wr_max: Option<u64>,
    pub extra: ExtraOptions,
}

impl StorageDevice {
    /// A removable-media drive holding `file_volume`.
    pub fn cdrom(file_volume: impl Into<String>) -> Self {
        Self {
            file_volume: file_volume.into(),
            media: Some("cdrom".to_string()),
            ..Default::default()
        }
    }

    pub fn is_cdrom(&self) -> bool {
        self.media.as_deref() == Some("cdrom")
    }
}

impl FromStr for StorageDevice {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut dev = StorageDevice::default();
        for (key, value) in options(s) {
            match key {
                None | Some("file") if dev.file_volume.is_empty() => {
                    dev.file_volume = value.to_string();
                }
                Some("media") => dev.media = Some(value.to_string()),
                Some("format") => dev.format = Some(value.to_string()),
                Some("size") => dev.size = Some(value.to_string()),
                Some(k @ "mbps_rd") => {
                    dev.mbps_rd = Some(parse_num(k, value, s)?)
                }
                Some(k @ "mbps_rd_max") => {
                    dev.mbps_rd_max = Some(parse_num(k, value, s)?)
                }
                Some(k @ "mbps_wr") => {
                    dev.mbps_wr = Some(parse_num(k, value, s)?)
                }
                Some(k @ "mbps_wr_max") => {
                    dev.mbps_wr_max = Some(parse_num(k, value, s)?)
                }
                Some(k) => dev.extra.push((k.to_string(), value.to_string())),
                None => {
                    return Err(DeviceParseError::invalid("file", value, s))
                }
            }
        }
        if dev.file_volume.is_empty() {
            return Err(DeviceParseError::Missing {
                what: "volume",
                input: s.to_string(),
            });
        }
        Ok(dev)
    }
}

impl Display for StorageDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        w.bare(&self.file_volume)?;
        w.opt("media", self.media.as_ref())?;
        w.opt("format", self.format.as_ref())?;
        w.opt("size", self.size.as_ref())?;
        w.opt("mbps_rd", self.mbps_rd)?;
        w.opt("mbps_rd_max", self.mbps_rd_max)?;
        w.opt("mbps_wr", self.mbps_wr)?;
        w.opt("mbps_wr_max", self.mbps_wr_max)?;
        w.extra(&self.extra)
    }
}

const NIC_MODELS: &[&str] = &[
    "e1000",
    "e1000-82540em",
    "e1000-82544gc",
    "e1000-82545em",
    "i82551",
    "i82557b",
    "i82559er",
    "ne2k_isa",
    "ne2k_pci",
    "pcnet",
    "rtl8139",
    "virtio",
    "vmxnet3",
];

/// A network interface card.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkDevice {
    pub model: String,
    pub mac_address: Option<String>,
    pub bridge: Option<String>,
    pub firewall: Option<bool>,
    pub link_down: Option<bool>,
    /// Rate limit in MB/s.
    pub rate: Option<f64>,
    pub tag: Option<u16>,
    pub extra: ExtraOptions,
}

impl FromStr for NetworkDevice {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut dev = NetworkDevice::default();
        for (key, value) in options(s) {
            match key {
                Some("model") => dev.model = value.to_string(),
                Some("macaddr") => dev.mac_address = Some(value.to_string()),
                Some("bridge") => dev.bridge = Some(value.to_string()),
                Some(k @ "firewall") => {
                    dev.firewall = Some(parse_flag(k, value, s)?)
                }
                Some(k @ "link_down") => {
                    dev.link_down = Some(parse_flag(k, value, s)?)
                }
                Some(k @ "rate") => dev.rate = Some(parse_num(k, value, s)?),
                Some(k @ "tag") => dev.tag = Some(parse_num(k, value, s)?),
                Some(k) if dev.model.is_empty() && NIC_MODELS.contains(&k) => {
                    dev.model = k.to_string();
                    dev.mac_address = Some(value.to_string());
                }
                Some(k) => dev.extra.push((k.to_string(), value.to_string())),
                None if dev.model.is_empty() => dev.model = value.to_string(),
                None => {
                    return Err(DeviceParseError::invalid("model", value, s))
                }
            }
        }
        if dev.model.is_empty() {
            return Err(DeviceParseError::Missing {
                what: "model",
                input: s.to_string(),
            });
        }
        Ok(dev)
    }
}

impl Display for NetworkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        match &self.mac_address {
            Some(mac) => w.opt(&self.model, Some(mac))?,
            None => w.bare(&self.model)?,
        }
        w.opt("bridge", self.bridge.as_ref())?;
        w.opt("firewall", self.firewall.map(flag))?;
        w.opt("link_down", self.link_down.map(flag))?;
        w.opt("rate", self.rate)?;
        w.opt("tag", self.tag)?;
        w.extra(&self.extra)
    }
}

/// Cloud-init IP configuration for one network interface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpConfig {
    pub ipv4: Option<String>,
    pub gateway4: Option<String>,
    pub ipv6: Option<String>,
    pub gateway6: Option<String>,
}

impl IpConfig {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none()
            && self.gateway4.is_none()
            && self.ipv6.is_none()
            && self.gateway6.is_none()
    }
}

impl FromStr for IpConfig {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cfg = IpConfig::default();
        for (key, value) in options(s) {
            match key {
                Some("ip") => cfg.ipv4 = Some(value.to_string()),
                Some("gw") => cfg.gateway4 = Some(value.to_string()),
                Some("ip6") => cfg.ipv6 = Some(value.to_string()),
                Some("gw6") => cfg.gateway6 = Some(value.to_string()),
                Some(k) => return Err(DeviceParseError::invalid(k, value, s)),
                None => return Err(DeviceParseError::invalid("ip", value, s)),
            }
        }
        Ok(cfg)
    }
}

impl Display for IpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        w.opt("ip", self.ipv4.as_ref())?;
        w.opt("gw", self.gateway4.as_ref())?;
        w.opt("ip6", self.ipv6.as_ref())?;
        w.opt("gw6", self.gateway6.as_ref())
    }
}

/// QEMU guest agent settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentSettings {
    pub enabled: bool,
    pub trim_cloned_disks: Option<bool>,
    pub agent_type: Option<String>,
    pub extra: ExtraOptions,
}

impl FromStr for AgentSettings {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut agent = AgentSettings::default();
        let mut seen_enabled = false;
        for (key, value) in options(s) {
            match key {
                None | Some("enabled") if !seen_enabled => {
                    agent.enabled = parse_flag("enabled", value, s)?;
                    seen_enabled = true;
                }
                Some(k @ "fstrim_cloned_disks") => {
                    agent.trim_cloned_disks = Some(parse_flag(k, value, s)?)
                }
                Some("type") => agent.agent_type = Some(value.to_string()),
                Some(k) => agent.extra.push((k.to_string(), value.to_string())),
                None => {
                    return Err(DeviceParseError::invalid("enabled", value, s))
                }
            }
        }
        if !seen_enabled {
            return Err(DeviceParseError::Missing {
                what: "enabled",
                input: s.to_string(),
            });
        }
        Ok(agent)
    }
}

impl Display for AgentSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        w.opt("enabled", Some(flag(self.enabled)))?;
        w.opt("fstrim_cloned_disks", self.trim_cloned_disks.map(flag))?;
        w.opt("type", self.agent_type.as_ref())?;
        w.extra(&self.extra)
    }
}

/// The emulated display adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VgaDevice {
    pub vga_type: Option<String>,
    /// Video memory in MiB.
    pub memory: Option<u32>,
    pub extra: ExtraOptions,
}

impl FromStr for VgaDevice {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut vga = VgaDevice::default();
        for (key, value) in options(s) {
            match key {
                None | Some("type") if vga.vga_type.is_none() => {
                    vga.vga_type = Some(value.to_string())
                }
                Some(k @ "memory") => {
                    vga.memory = Some(parse_num(k, value, s)?)
                }
                Some(k) => vga.extra.push((k.to_string(), value.to_string())),
                None => return Err(DeviceParseError::invalid("type", value, s)),
            }
        }
        Ok(vga)
    }
}

impl Display for VgaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        if let Some(t) = &self.vga_type {
            w.bare(t)?;
        }
        w.opt("memory", self.memory)?;
        w.extra(&self.extra)
    }
}

/// The emulated CPU model and its feature flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuEmulation {
    pub cpu_type: String,
    /// Feature flags such as `+aes` or `-pcid`.
    pub flags: Vec<String>,
    pub extra: ExtraOptions,
}

impl FromStr for CpuEmulation {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cpu = CpuEmulation::default();
        for (key, value) in options(s) {
            match key {
                None | Some("cputype") if cpu.cpu_type.is_empty() => {
                    cpu.cpu_type = value.to_string()
                }
                Some("flags") => {
                    cpu.flags = value
                        .split(';')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                Some(k) => cpu.extra.push((k.to_string(), value.to_string())),
                None => {
                    return Err(DeviceParseError::invalid("cputype", value, s))
                }
            }
        }
        if cpu.cpu_type.is_empty() {
            return Err(DeviceParseError::Missing {
                what: "cputype",
                input: s.to_string(),
            });
        }
        Ok(cpu)
    }
}

impl Display for CpuEmulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        w.bare(&self.cpu_type)?;
        if !self.flags.is_empty() {
            w.opt("flags", Some(self.flags.join(";")))?;
        }
        w.extra(&self.extra)
    }
}

/// An inter-VM shared memory device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SharedMemory {
    /// Size in MiB.
    pub size: u64,
    pub name: Option<String>,
}

impl FromStr for SharedMemory {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut size = None;
        let mut name = None;
        for (key, value) in options(s) {
            match key {
                None | Some("size") if size.is_none() => {
                    size = Some(parse_num("size", value, s)?)
                }
                Some("name") => name = Some(value.to_string()),
                Some(k) => return Err(DeviceParseError::invalid(k, value, s)),
                None => return Err(DeviceParseError::invalid("size", value, s)),
            }
        }
        let size = size.ok_or_else(|| DeviceParseError::Missing {
            what: "size",
            input: s.to_string(),
        })?;
        Ok(SharedMemory { size, name })
    }
}

impl Display for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        w.opt("size", Some(self.size))?;
        w.opt("name", self.name.as_ref())
    }
}

/// Custom cloud-init files, each a volume reference such as
/// `local:snippets/user.yml`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudInitFiles {
    pub user: Option<String>,
    pub meta: Option<String>,
    pub network: Option<String>,
    pub vendor: Option<String>,
}

impl FromStr for CloudInitFiles {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut files = CloudInitFiles::default();
        for (key, value) in options(s) {
            match key {
                Some("user") => files.user = Some(value.to_string()),
                Some("meta") => files.meta = Some(value.to_string()),
                Some("network") => files.network = Some(value.to_string()),
                Some("vendor") => files.vendor = Some(value.to_string()),
                Some(k) => return Err(DeviceParseError::invalid(k, value, s)),
                None => return Err(DeviceParseError::invalid("user", value, s)),
            }
        }
        Ok(files)
    }
}

impl Display for CloudInitFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = OptionWriter::new(f);
        w.opt("user", self.user.as_ref())?;
        w.opt("meta", self.meta.as_ref())?;
        w.opt("network", self.network.as_ref())?;
        w.opt("vendor", self.vendor.as_ref())
    }
}

/// Public SSH keys injected by cloud-init. On the wire this is the
/// newline-separated key list, URL-encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SshKeys(pub Vec<String>);

impl FromStr for SshKeys {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = urlencoding::decode(s)
            .map_err(|_| DeviceParseError::invalid("sshkeys", s, s))?;
        Ok(SshKeys(
            decoded
                .lines()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

impl Display for SshKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", urlencoding::encode(&self.0.join("\n")))
    }
}
