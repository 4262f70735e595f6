// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cloud-init settings.
//!
//! The hypervisor renders the `ci*`, `ipconfigN`, `nameserver`,
//! `searchdomain` and `sshkeys` options into a single configuration drive,
//! so they are built and applied together.

use pve_api_types::{
    self as api, CloudInitFiles, SshKeys, StorageDevice, VmConfig,
    IP_CONFIG_SLOTS,
};

use crate::model::{Dns, Initialization, IpAddress, IpConfig, UserAccount};
use crate::slots::{cloud_init_volume, SlotArray};
use crate::Error;

/// The cloud-init options derived from an [`Initialization`] block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudInitDescriptor {
    pub drive: StorageDevice,
    pub ip_configs: [Option<api::IpConfig>; IP_CONFIG_SLOTS],
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssh_keys: Option<SshKeys>,
    pub files: Option<CloudInitFiles>,
}

fn to_wire(cfg: &IpConfig) -> Option<api::IpConfig> {
    if cfg.is_empty() {
        return None;
    }
    Some(api::IpConfig {
        ipv4: cfg.ipv4.as_ref().map(|a| a.address.clone()),
        gateway4: cfg.ipv4.as_ref().and_then(|a| a.gateway.clone()),
        ipv6: cfg.ipv6.as_ref().map(|a| a.address.clone()),
        gateway6: cfg.ipv6.as_ref().and_then(|a| a.gateway.clone()),
    })
}

fn from_wire(cfg: &api::IpConfig) -> IpConfig {
    IpConfig {
        ipv4: cfg.ipv4.as_ref().map(|address| IpAddress {
            address: address.clone(),
            gateway: cfg.gateway4.clone(),
        }),
        ipv6: cfg.ipv6.as_ref().map(|address| IpAddress {
            address: address.clone(),
            gateway: cfg.gateway6.clone(),
        }),
    }
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref().filter(|s| !s.is_empty()).cloned()
}

/// Builds the cloud-init options for `init`.
pub fn build(init: &Initialization) -> Result<CloudInitDescriptor, Error> {
    let ip_configs = SlotArray::<api::IpConfig, IP_CONFIG_SLOTS>::expand(
        init.ip_config.iter().map(to_wire),
        "IP configurations",
    )?
    .into_slots();

    let dns = init.dns.clone().unwrap_or_default();
    let account = init.user_account.clone().unwrap_or_default();

    Ok(CloudInitDescriptor {
        drive: StorageDevice::cdrom(cloud_init_volume(&init.datastore_id)),
        ip_configs,
        nameserver: non_empty(&dns.server),
        searchdomain: non_empty(&dns.domain),
        user: non_empty(&account.username),
        password: non_empty(&account.password),
        ssh_keys: (!account.keys.is_empty()).then(|| SshKeys(account.keys)),
        files: non_empty(&init.user_data_file_id).map(|user| CloudInitFiles {
            user: Some(user),
            ..Default::default()
        }),
    })
}

impl CloudInitDescriptor {
    /// Writes the options (not the drive) into `config`.
    pub fn apply(&self, config: &mut VmConfig) {
        config.ipconfig = self.ip_configs.clone();
        config.nameserver = self.nameserver.clone();
        config.searchdomain = self.searchdomain.clone();
        config.ciuser = self.user.clone();
        config.cipassword = self.password.clone();
        config.sshkeys = self.ssh_keys.clone();
        config.cicustom = self.files.clone();
    }

    /// Options set in `remote` that this descriptor no longer sets.
    pub fn stale_options(&self, remote: &VmConfig) -> Vec<String> {
        let mut stale = Vec::new();
        for (i, (want, have)) in
            self.ip_configs.iter().zip(&remote.ipconfig).enumerate()
        {
            if want.is_none() && have.is_some() {
                stale.push(format!("ipconfig{}", i));
            }
        }
        let pairs = [
            ("nameserver", self.nameserver.is_none(), &remote.nameserver),
            ("searchdomain", self.searchdomain.is_none(), &remote.searchdomain),
            ("ciuser", self.user.is_none(), &remote.ciuser),
            ("cipassword", self.password.is_none(), &remote.cipassword),
        ];
        for (key, unset, have) in pairs {
            if unset && have.is_some() {
                stale.push(key.to_string());
            }
        }
        if self.ssh_keys.is_none() && remote.sshkeys.is_some() {
            stale.push("sshkeys".to_string());
        }
        if self.files.is_none() && remote.cicustom.is_some() {
            stale.push("cicustom".to_string());
        }
        stale
    }
}

/// Reads the cloud-init options back out of `config`. IPv4 and IPv6 are
/// read independently for every slot.
pub fn observe(
    config: &VmConfig,
    current: Option<&Initialization>,
) -> Initialization {
    let datastore_id = config.ide[2]
        .as_ref()
        .and_then(|d| d.file_volume.split_once(':'))
        .map(|(ds, _)| ds.to_string())
        .or_else(|| current.map(|c| c.datastore_id.clone()))
        .unwrap_or_else(|| Initialization::default().datastore_id);

    let ip_config = SlotArray::from_slots(config.ipconfig.clone())
        .compact_with(|_| api::IpConfig::default())
        .iter()
        .map(from_wire)
        .collect();

    let dns = (config.nameserver.is_some() || config.searchdomain.is_some())
        .then(|| Dns {
            domain: config.searchdomain.clone(),
            server: config.nameserver.clone(),
        });

    let user_account = (config.ciuser.is_some()
        || config.cipassword.is_some()
        || config.sshkeys.is_some())
    .then(|| UserAccount {
        keys: config.sshkeys.clone().map(|k| k.0).unwrap_or_default(),
        password: config.cipassword.clone(),
        username: config.ciuser.clone(),
    });

    Initialization {
        datastore_id,
        dns,
        ip_config,
        user_account,
        user_data_file_id: config
            .cicustom
            .as_ref()
            .and_then(|f| f.user.clone()),
    }
}
