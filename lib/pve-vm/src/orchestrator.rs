// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The four lifecycle operations: create, read, update and delete.
//!
//! Each operation runs start to finish as one flow. The remote side is the
//! authority: every successful create and update ends with a read that
//! replaces the document's state with what the hypervisor reports.

use pve_api_types::{VmId, VmRebootRequest, VmShutdownRequest, VmStatus};
use pve_vm_config::Timeouts;
use slog::{info, o, warn, Logger};

use crate::document::{ComputedAttributes, DocumentAccessor};
use crate::import::disk_import_commands;
use crate::lifecycle::{Lifecycle, Transition, VmState};
use crate::model::{Section, VmIdentity, VmSpec};
use crate::readback;
use crate::reconcile;
use crate::remote::{HypervisorApi, NodeCommandExecutor};
use crate::Error;

/// Drives VMs through their lifecycle using the given collaborators.
pub struct Orchestrator<A, E> {
    api: A,
    executor: E,
    timeouts: Timeouts,
    log: Logger,
}

/// Treats a not-found answer as `None`.
fn found<T>(res: Result<T, crate::ApiError>) -> Result<Option<T>, Error> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn node_name(spec: &VmSpec) -> Result<String, Error> {
    if spec.node_name.is_empty() {
        return Err(Error::MissingNodeName);
    }
    Ok(spec.node_name.clone())
}

/// The state recorded once `desired` has been applied to VM `id`.
fn applied(desired: &VmSpec, id: VmId) -> VmSpec {
    VmSpec { vm_id: VmIdentity::Fixed(id), ..desired.clone() }
}

impl<A: HypervisorApi, E: NodeCommandExecutor> Orchestrator<A, E> {
    pub fn new(api: A, executor: E, timeouts: Timeouts, log: Logger) -> Self {
        Self { api, executor, timeouts, log }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn vm_log(&self, node: &str, id: VmId) -> Logger {
        self.log.new(o!("node" => node.to_string(), "vm" => id))
    }

    async fn start(
        &self,
        node: &str,
        id: VmId,
        lifecycle: &mut Lifecycle,
        log: &Logger,
    ) -> Result<(), Error> {
        lifecycle.apply(Transition::Start)?;
        info!(log, "starting VM");
        self.api.start_vm(node, id).await?;
        let policy = &self.timeouts.start;
        self.api
            .wait_for_status(node, id, VmStatus::Running, policy, log)
            .await?;
        lifecycle.apply(Transition::ReachedRunning)?;
        Ok(())
    }

    /// Graceful shutdown that the hypervisor escalates to a hard stop once
    /// the shutdown timeout passes.
    async fn shutdown(
        &self,
        node: &str,
        id: VmId,
        lifecycle: &mut Lifecycle,
        log: &Logger,
    ) -> Result<(), Error> {
        lifecycle.apply(Transition::Shutdown)?;
        info!(log, "shutting down VM"; "timeout" => self.timeouts.shutdown);
        let request = VmShutdownRequest {
            force_stop: Some(true),
            timeout: Some(self.timeouts.shutdown),
        };
        self.api.shutdown_vm(node, id, &request).await?;
        let policy = &self.timeouts.stop;
        self.api
            .wait_for_status(node, id, VmStatus::Stopped, policy, log)
            .await?;
        lifecycle.apply(Transition::ReachedStopped)?;
        Ok(())
    }

    /// Creates the VM described by `doc`, imports its image-backed disks
    /// and, unless asked not to, starts it.
    pub async fn create<D: DocumentAccessor + ?Sized>(
        &self,
        doc: &mut D,
    ) -> Result<(), Error> {
        let desired = doc.desired().clone();
        let node = node_name(&desired)?;

        let id = match desired.vm_id {
            VmIdentity::Fixed(id) => id,
            VmIdentity::Allocate => {
                let id = self.api.next_vm_id().await?;
                info!(self.log, "allocated VM identifier"; "vm" => id);
                id
            }
        };
        let log = self.vm_log(&node, id);
        let mut lifecycle = Lifecycle::new(VmState::Absent, log.clone());

        let request = reconcile::create_request(&desired, id)?;
        let imports = disk_import_commands(id, &desired.disks)?;

        lifecycle.apply(Transition::Create)?;
        info!(log, "creating VM");
        self.api.create_vm(&node, &request).await?;
        doc.set_id(Some(id));
        let has_imports = !imports.is_empty();
        lifecycle.apply(Transition::Created { has_imports })?;

        if has_imports {
            info!(log, "importing disks"; "commands" => imports.len());
            self.executor
                .execute_node_commands(&node, &imports)
                .await
                .map_err(|source| Error::Import {
                    node: node.clone(),
                    source,
                })?;
            lifecycle.apply(Transition::DisksImported)?;
        }
        doc.set_state(Some(applied(&desired, id)));

        if desired.started() {
            self.start(&node, id, &mut lifecycle, &log).await?;
        }

        self.read(doc).await
    }

    /// Replaces the document's state with what the hypervisor reports. A VM
    /// that no longer exists clears the document's identifier.
    pub async fn read<D: DocumentAccessor + ?Sized>(
        &self,
        doc: &mut D,
    ) -> Result<(), Error> {
        let Some(id) = doc.id() else {
            return Ok(());
        };
        let node = node_name(doc.desired())?;
        let log = self.vm_log(&node, id);

        let config = match found(self.api.get_vm(&node, id).await)? {
            Some(config) => config,
            None => {
                warn!(log, "VM no longer exists");
                doc.set_id(None);
                doc.set_state(None);
                return Ok(());
            }
        };
        let status = match found(self.api.get_status(&node, id).await)? {
            Some(status) => status.status,
            None => {
                warn!(log, "VM no longer exists");
                doc.set_id(None);
                doc.set_state(None);
                return Ok(());
            }
        };

        let current = doc.state().unwrap_or(doc.desired()).clone();
        let spec = readback::observe(&current, &config, status, id)?;

        let mut computed = ComputedAttributes {
            mac_addresses: readback::mac_addresses(&spec),
            ..Default::default()
        };
        if spec.agent_or_default().enabled && status == VmStatus::Running {
            let policy = &self.timeouts.agent;
            let res = self
                .api
                .wait_for_agent_interfaces(&node, id, policy, &log)
                .await;
            match res {
                Ok(interfaces) => {
                    readback::agent_outputs(&interfaces, &mut computed)
                }
                Err(Error::Timeout { after, .. }) => {
                    warn!(log, "guest agent published no interfaces";
                        "waited" => ?after);
                }
                Err(e) => return Err(e),
            }
        }

        doc.set_state(Some(spec));
        doc.set_computed(computed);
        Ok(())
    }

    /// Applies the changes between the document's state and its desired
    /// state, then settles the run state and reboots if a change needs it.
    pub async fn update<D: DocumentAccessor + ?Sized>(
        &self,
        doc: &mut D,
    ) -> Result<(), Error> {
        let id = doc.id().ok_or(Error::MissingId)?;
        let node = node_name(doc.desired())?;
        let log = self.vm_log(&node, id);

        reconcile::check_mutability(doc)?;

        let remote = self.api.get_vm(&node, id).await?;
        let status = self.api.get_status(&node, id).await?;
        let mut lifecycle = Lifecycle::observed(status.status, log.clone());
        // The agent that has to withdraw its interfaces across a reboot is
        // the one running before this update.
        let agent_was_enabled =
            remote.agent.as_ref().is_some_and(|a| a.enabled);

        let rec = reconcile::diff(doc, &remote, id)?;
        if !rec.request.is_empty() {
            let changed: Vec<_> =
                rec.changed.iter().map(Section::name).collect();
            info!(log, "updating VM configuration";
                "sections" => ?changed,
                "delete" => ?rec.request.delete
            );
            self.api.update_vm(&node, id, &rec.request).await?;
        }
        lifecycle.apply(Transition::ConfigApplied {
            reboot_required: rec.reboot_required,
        })?;

        if doc.has_change(Section::Started) {
            match (doc.desired().started(), lifecycle.is_stopped()) {
                (true, true) => {
                    self.start(&node, id, &mut lifecycle, &log).await?
                }
                (false, false) => {
                    self.shutdown(&node, id, &mut lifecycle, &log).await?
                }
                _ => {}
            }
        }

        if lifecycle.reboot_pending() {
            lifecycle.apply(Transition::Reboot)?;
            info!(log, "rebooting VM"; "timeout" => self.timeouts.reboot);
            let request =
                VmRebootRequest { timeout: Some(self.timeouts.reboot) };
            self.api.reboot_vm(&node, id, &request).await?;
            if agent_was_enabled {
                self.api
                    .wait_for_no_agent_interfaces(
                        &node,
                        id,
                        &self.timeouts.agent_gone,
                        &log,
                    )
                    .await?;
            }
            lifecycle.apply(Transition::Rebooted)?;
        }

        let state = applied(doc.desired(), id);
        doc.set_state(Some(state));
        self.read(doc).await
    }

    /// Stops and destroys the VM. Succeeds only once the hypervisor no
    /// longer reports it.
    pub async fn delete<D: DocumentAccessor + ?Sized>(
        &self,
        doc: &mut D,
    ) -> Result<(), Error> {
        let Some(id) = doc.id() else {
            return Ok(());
        };
        let node = node_name(doc.desired())?;
        let log = self.vm_log(&node, id);

        let Some(status) = found(self.api.get_status(&node, id).await)? else {
            warn!(log, "VM already gone");
            doc.set_id(None);
            doc.set_state(None);
            return Ok(());
        };
        let mut lifecycle = Lifecycle::observed(status.status, log.clone());
        if !lifecycle.is_stopped() {
            self.shutdown(&node, id, &mut lifecycle, &log).await?;
        }

        lifecycle.apply(Transition::Delete)?;
        info!(log, "deleting VM");
        if found(self.api.delete_vm(&node, id).await)?.is_none() {
            warn!(log, "VM vanished before it was deleted");
        }

        match self
            .api
            .wait_for_absence(&node, id, &self.timeouts.delete, &log)
            .await
        {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                return Err(Error::StillPresent { id })
            }
            Err(e) => return Err(e),
        }
        lifecycle.apply(Transition::Vanished)?;

        doc.set_id(None);
        doc.set_state(None);
        doc.set_computed(ComputedAttributes::default());
        Ok(())
    }

    /// The current run state, or `None` if the document references no
    /// existing VM.
    pub async fn status<D: DocumentAccessor + ?Sized>(
        &self,
        doc: &D,
    ) -> Result<Option<VmStatus>, Error> {
        let Some(id) = doc.id() else {
            return Ok(None);
        };
        let node = node_name(doc.desired())?;
        Ok(found(self.api.get_status(&node, id).await)?.map(|s| s.status))
    }
}
