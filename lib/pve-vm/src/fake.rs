// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the hypervisor and the node shell.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pve_api_types::{
    AgentIpAddress, AgentNetworkInterface, AgentNetworkInterfaces,
    IpAddressType, StorageDevice, VmConfig, VmCreateRequest, VmId,
    VmRebootRequest, VmShutdownRequest, VmStatus, VmStatusResponse,
    VmUpdateRequest,
};
use serde_json::Value;

use crate::remote::{HypervisorApi, NodeCommandExecutor};
use crate::ApiError;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    NextId,
    Create(VmId),
    GetVm(VmId),
    Update(VmId, Value),
    Delete(VmId),
    Status(VmId),
    Start(VmId),
    Shutdown { id: VmId, force_stop: bool, timeout: u32 },
    Reboot(VmId),
    AgentInterfaces(VmId),
}

struct Vm {
    config: VmConfig,
    status: VmStatus,
    next_disk: usize,
    /// Agent queries left to answer with no interfaces.
    agent_down: usize,
}

#[derive(Default)]
struct State {
    next_id: VmId,
    vms: BTreeMap<VmId, Vm>,
    lingering: BTreeSet<VmId>,
    never_runs: bool,
    linger_after_delete: bool,
    calls: Vec<Call>,
}

fn not_found(id: VmId) -> ApiError {
    ApiError::Status {
        code: 500,
        message: format!(
            "Configuration file 'nodes/pve/qemu-server/{}.conf' does not exist",
            id
        ),
    }
}

/// Replaces new-volume requests with allocated volumes and assigns MAC
/// addresses, the way the hypervisor does when it applies a config.
fn allocate(id: VmId, vm: &mut Vm) {
    for dev in vm.config.scsi.iter_mut().flatten() {
        if let Some((ds, size)) = dev.file_volume.split_once(':') {
            if size.parse::<u64>().is_ok() {
                dev.size = Some(format!("{}G", size));
                dev.file_volume =
                    format!("{}:vm-{}-disk-{}", ds, id, vm.next_disk);
                vm.next_disk += 1;
            }
        }
    }
    if let Some(dev) = vm.config.ide[2].as_mut() {
        if let Some(ds) = dev.file_volume.strip_suffix(":cloudinit") {
            dev.file_volume = format!("{}:vm-{}-cloudinit", ds, id);
        }
    }
    for (slot, dev) in vm.config.net.iter_mut().enumerate() {
        if let Some(dev) = dev.as_mut() {
            if dev.mac_address.is_none() {
                dev.mac_address = Some(format!(
                    "bc:24:11:{:02x}:{:02x}:{:02x}",
                    (id >> 8) & 0xff,
                    id & 0xff,
                    slot
                ));
            }
        }
    }
}

/// A single-node hypervisor holding VMs in memory.
#[derive(Clone)]
pub struct FakeHypervisor {
    state: Arc<Mutex<State>>,
}

impl FakeHypervisor {
    /// `next_id` is what identifier allocation hands out.
    pub fn new(next_id: VmId) -> Self {
        let state = State { next_id, ..Default::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Started VMs stay stopped.
    pub fn set_never_runs(&self, v: bool) {
        self.state.lock().unwrap().never_runs = v;
    }

    /// Deleted VMs keep answering status queries.
    pub fn set_linger_after_delete(&self, v: bool) {
        self.state.lock().unwrap().linger_after_delete = v;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn status_of(&self, id: VmId) -> Option<VmStatus> {
        self.state.lock().unwrap().vms.get(&id).map(|vm| vm.status)
    }

    /// Attaches an imported volume, as `qm set` does on the node.
    fn attach(&self, id: VmId, slot: usize, dev: StorageDevice) {
        let mut state = self.state.lock().unwrap();
        if let Some(vm) = state.vms.get_mut(&id) {
            vm.config.scsi[slot] = Some(dev);
            vm.next_disk += 1;
        }
    }

    fn with_vm<T>(
        &self,
        id: VmId,
        call: Call,
        f: impl FnOnce(&mut Vm) -> T,
    ) -> Result<T, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.vms.get_mut(&id) {
            Some(vm) => Ok(f(vm)),
            None => Err(not_found(id)),
        }
    }
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    async fn create_vm(
        &self,
        _node: &str,
        request: &VmCreateRequest,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let id = request.vmid;
        state.calls.push(Call::Create(id));
        if state.vms.contains_key(&id) {
            return Err(ApiError::Status {
                code: 500,
                message: format!("VM {} already exists", id),
            });
        }
        let mut vm = Vm {
            config: request.config.clone(),
            status: VmStatus::Stopped,
            next_disk: 0,
            agent_down: 0,
        };
        allocate(id, &mut vm);
        state.vms.insert(id, vm);
        Ok(())
    }

    async fn get_vm(
        &self,
        _node: &str,
        id: VmId,
    ) -> Result<VmConfig, ApiError> {
        self.with_vm(id, Call::GetVm(id), |vm| {
            let mut config = vm.config.clone();
            if config.cipassword.is_some() {
                config.cipassword = Some("**********".to_string());
            }
            config
        })
    }

    async fn update_vm(
        &self,
        _node: &str,
        id: VmId,
        request: &VmUpdateRequest,
    ) -> Result<(), ApiError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ApiError::Response(e.to_string()))?;
        let res = self.with_vm(id, Call::Update(id, body), |vm| {
            let current = serde_json::to_value(&vm.config)?;
            let Value::Object(mut merged) = current else {
                unreachable!("a config serializes as a map");
            };
            let Value::Object(changes) = serde_json::to_value(&request.config)?
            else {
                unreachable!("a config serializes as a map");
            };
            merged.extend(changes);
            for key in &request.delete {
                merged.remove(key);
            }
            vm.config = serde_json::from_value(Value::Object(merged))?;
            allocate(id, vm);
            Ok::<_, serde_json::Error>(())
        })?;
        res.map_err(|e| ApiError::Response(e.to_string()))
    }

    async fn delete_vm(&self, _node: &str, id: VmId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete(id));
        if state.vms.remove(&id).is_none() {
            return Err(not_found(id));
        }
        if state.linger_after_delete {
            state.lingering.insert(id);
        }
        Ok(())
    }

    async fn get_status(
        &self,
        _node: &str,
        id: VmId,
    ) -> Result<VmStatusResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Status(id));
        let status = match state.vms.get(&id) {
            Some(vm) => vm.status,
            None if state.lingering.contains(&id) => VmStatus::Stopped,
            None => return Err(not_found(id)),
        };
        Ok(VmStatusResponse {
            status,
            qmpstatus: None,
            name: None,
            agent: None,
        })
    }

    async fn start_vm(&self, _node: &str, id: VmId) -> Result<(), ApiError> {
        let never_runs = self.state.lock().unwrap().never_runs;
        self.with_vm(id, Call::Start(id), |vm| {
            if !never_runs {
                vm.status = VmStatus::Running;
            }
        })
    }

    async fn shutdown_vm(
        &self,
        _node: &str,
        id: VmId,
        request: &VmShutdownRequest,
    ) -> Result<(), ApiError> {
        let call = Call::Shutdown {
            id,
            force_stop: request.force_stop.unwrap_or(false),
            timeout: request.timeout.unwrap_or(0),
        };
        self.with_vm(id, call, |vm| vm.status = VmStatus::Stopped)
    }

    async fn reboot_vm(
        &self,
        _node: &str,
        id: VmId,
        _request: &VmRebootRequest,
    ) -> Result<(), ApiError> {
        self.with_vm(id, Call::Reboot(id), |vm| vm.agent_down = 2)
    }

    async fn next_vm_id(&self) -> Result<VmId, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::NextId);
        Ok(state.next_id)
    }

    async fn agent_network_interfaces(
        &self,
        _node: &str,
        id: VmId,
    ) -> Result<AgentNetworkInterfaces, ApiError> {
        let res = self.with_vm(id, Call::AgentInterfaces(id), |vm| {
            let enabled = vm.config.agent.as_ref().is_some_and(|a| a.enabled);
            if !enabled || vm.status != VmStatus::Running {
                return None;
            }
            if vm.agent_down > 0 {
                vm.agent_down -= 1;
                return Some(Vec::new());
            }
            let mac =
                vm.config.net[0].as_ref().and_then(|n| n.mac_address.clone());
            Some(vec![AgentNetworkInterface {
                name: "eth0".to_string(),
                mac_address: mac,
                ip_addresses: vec![AgentIpAddress {
                    address: format!("10.0.0.{}", id % 250),
                    address_type: IpAddressType::Ipv4,
                    prefix: 24,
                }],
            }])
        })?;
        match res {
            Some(result) => Ok(AgentNetworkInterfaces { result }),
            None => Err(ApiError::Status {
                code: 500,
                message: "QEMU guest agent is not running".to_string(),
            }),
        }
    }
}

/// Records node scripts and, when attached to a [`FakeHypervisor`], applies
/// the `qm set` disk attachments they contain.
#[derive(Default)]
pub struct FakeExecutor {
    hypervisor: Option<FakeHypervisor>,
    fail: bool,
    scripts: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeExecutor {
    pub fn attached(hypervisor: FakeHypervisor) -> Self {
        Self { hypervisor: Some(hypervisor), ..Default::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn scripts(&self) -> Vec<(String, Vec<String>)> {
        self.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeCommandExecutor for FakeExecutor {
    async fn execute_node_commands(
        &self,
        node: &str,
        commands: &[String],
    ) -> Result<(), ApiError> {
        let script = (node.to_string(), commands.to_vec());
        self.scripts.lock().unwrap().push(script);
        if self.fail {
            return Err(ApiError::Command {
                node: node.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "qemu-img: Could not open image".to_string(),
            });
        }
        let Some(hypervisor) = &self.hypervisor else {
            return Ok(());
        };

        let mut size = None;
        let mut format = None;
        for cmd in commands {
            let words: Vec<&str> = cmd.split_whitespace().collect();
            match words.as_slice() {
                ["qemu-img", "resize", _, s] => size = Some(s.to_string()),
                ["qm", "importdisk", .., "-format", f] => {
                    format = Some(f.to_string())
                }
                ["qm", "set", id, opt, volume] => {
                    let id: VmId = id.parse().unwrap();
                    let slot: usize =
                        opt.trim_start_matches("-scsi").parse().unwrap();
                    let mut dev: StorageDevice = volume.parse().unwrap();
                    dev.size = size.take();
                    dev.format = format.take();
                    hypervisor.attach(id, slot, dev);
                }
                _ => {}
            }
        }
        Ok(())
    }
}
