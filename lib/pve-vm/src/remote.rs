// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote collaborators: the management API and the node shell.

use async_trait::async_trait;
use pve_api_types::{
    AgentNetworkInterface, AgentNetworkInterfaces, VmConfig, VmCreateRequest,
    VmId, VmRebootRequest, VmShutdownRequest, VmStatus, VmStatusResponse,
    VmUpdateRequest,
};
use pve_client::{Client, NodeShell};
use pve_vm_config::PollPolicy;
use slog::{debug, Logger};

use crate::poll::poll_until;
use crate::{ApiError, Error};

/// Operations of the hypervisor management endpoint.
///
/// The `wait_for_*` methods are built on the status and guest agent
/// queries and only re-read state; they never repeat a mutating call.
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    async fn create_vm(
        &self,
        node: &str,
        request: &VmCreateRequest,
    ) -> Result<(), ApiError>;

    async fn get_vm(&self, node: &str, id: VmId) -> Result<VmConfig, ApiError>;

    async fn update_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmUpdateRequest,
    ) -> Result<(), ApiError>;

    async fn delete_vm(&self, node: &str, id: VmId) -> Result<(), ApiError>;

    async fn get_status(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<VmStatusResponse, ApiError>;

    async fn start_vm(&self, node: &str, id: VmId) -> Result<(), ApiError>;

    async fn shutdown_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmShutdownRequest,
    ) -> Result<(), ApiError>;

    async fn reboot_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmRebootRequest,
    ) -> Result<(), ApiError>;

    async fn next_vm_id(&self) -> Result<VmId, ApiError>;

    async fn agent_network_interfaces(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<AgentNetworkInterfaces, ApiError>;

    /// Waits until the VM reports the `want` run state.
    async fn wait_for_status(
        &self,
        node: &str,
        id: VmId,
        want: VmStatus,
        policy: &PollPolicy,
        log: &Logger,
    ) -> Result<(), Error> {
        let what = format!("VM {} to be {:?}", id, want);
        poll_until(policy, &what, log, || async move {
            let status = self.get_status(node, id).await?;
            Ok((status.status == want).then_some(()))
        })
        .await
    }

    /// Waits until the status query fails, which is how a deleted VM
    /// shows.
    async fn wait_for_absence(
        &self,
        node: &str,
        id: VmId,
        policy: &PollPolicy,
        log: &Logger,
    ) -> Result<(), Error> {
        let what = format!("VM {} to disappear", id);
        poll_until(policy, &what, log, || async move {
            match self.get_status(node, id).await {
                Ok(_) => Ok(None),
                Err(e) => {
                    debug!(log, "status query failed"; "error" => %e);
                    Ok(Some(()))
                }
            }
        })
        .await
    }

    /// Waits for the guest agent to publish at least one network
    /// interface. An agent that does not answer yet counts as pending.
    async fn wait_for_agent_interfaces(
        &self,
        node: &str,
        id: VmId,
        policy: &PollPolicy,
        log: &Logger,
    ) -> Result<Vec<AgentNetworkInterface>, Error> {
        let what = format!("guest agent of VM {} to publish interfaces", id);
        poll_until(policy, &what, log, || async move {
            match self.agent_network_interfaces(node, id).await {
                Ok(r) if !r.result.is_empty() => Ok(Some(r.result)),
                Ok(_) => Ok(None),
                Err(e) => {
                    debug!(log, "guest agent not answering"; "error" => %e);
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Waits for the guest agent to stop publishing network interfaces,
    /// i.e. for the guest to have actually gone down for a reboot.
    async fn wait_for_no_agent_interfaces(
        &self,
        node: &str,
        id: VmId,
        policy: &PollPolicy,
        log: &Logger,
    ) -> Result<(), Error> {
        let what = format!("guest agent of VM {} to withdraw interfaces", id);
        poll_until(policy, &what, log, || async move {
            match self.agent_network_interfaces(node, id).await {
                Ok(r) => Ok(r.result.is_empty().then_some(())),
                Err(_) => Ok(Some(())),
            }
        })
        .await
    }
}

/// Runs command batches on a node.
#[async_trait]
pub trait NodeCommandExecutor: Send + Sync {
    /// Runs `commands` in order as one script. Either the whole script
    /// succeeds or an error is returned.
    async fn execute_node_commands(
        &self,
        node: &str,
        commands: &[String],
    ) -> Result<(), ApiError>;
}

#[async_trait]
impl HypervisorApi for Client {
    async fn create_vm(
        &self,
        node: &str,
        request: &VmCreateRequest,
    ) -> Result<(), ApiError> {
        Client::create_vm(self, node, request).await
    }

    async fn get_vm(&self, node: &str, id: VmId) -> Result<VmConfig, ApiError> {
        Client::get_vm(self, node, id).await
    }

    async fn update_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmUpdateRequest,
    ) -> Result<(), ApiError> {
        Client::update_vm(self, node, id, request).await
    }

    async fn delete_vm(&self, node: &str, id: VmId) -> Result<(), ApiError> {
        Client::delete_vm(self, node, id).await
    }

    async fn get_status(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<VmStatusResponse, ApiError> {
        Client::get_vm_status(self, node, id).await
    }

    async fn start_vm(&self, node: &str, id: VmId) -> Result<(), ApiError> {
        Client::start_vm(self, node, id).await
    }

    async fn shutdown_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmShutdownRequest,
    ) -> Result<(), ApiError> {
        Client::shutdown_vm(self, node, id, request).await
    }

    async fn reboot_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmRebootRequest,
    ) -> Result<(), ApiError> {
        Client::reboot_vm(self, node, id, request).await
    }

    async fn next_vm_id(&self) -> Result<VmId, ApiError> {
        Client::next_vm_id(self).await
    }

    async fn agent_network_interfaces(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<AgentNetworkInterfaces, ApiError> {
        Client::agent_network_interfaces(self, node, id).await
    }
}

#[async_trait]
impl NodeCommandExecutor for NodeShell {
    async fn execute_node_commands(
        &self,
        node: &str,
        commands: &[String],
    ) -> Result<(), ApiError> {
        self.execute(node, commands).await
    }
}
