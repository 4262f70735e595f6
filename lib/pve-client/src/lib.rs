// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making requests to the Proxmox VE management API.

use pve_api_types::{
    AgentNetworkInterfaces, ApiResponse, VmConfig, VmCreateRequest, VmId,
    VmRebootRequest, VmShutdownRequest, VmStatusResponse, VmUpdateRequest,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{info, o, Logger};
use thiserror::Error;

mod shell;

pub use shell::NodeShell;

/// Errors which may be returned from the management API client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Bad Status: {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Invalid API token: {0}")]
    Token(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Unexpected response: {0}")]
    Response(String),

    #[error("Command on node {node} failed ({status}): {stderr}")]
    Command { node: String, status: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the addressed VM does not exist: a 404, or
    /// the 500 the API answers with when a VM's configuration file is
    /// missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Status { code: 404, .. } => true,
            Error::Status { code: 500, message } => {
                message.contains("does not exist")
            }
            _ => false,
        }
    }
}

/// Client-side connection to the management API.
pub struct Client {
    client: reqwest::Client,
    log: Logger,
    base_url: String,
}

// Sends "request", awaits "response", and returns an error on any
// non-success status code.
async fn send_and_check_ok(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, Error> {
    let response = request.send().await.map_err(Error::from)?;

    if !response.status().is_success() {
        let code = response.status().as_u16();
        // The API puts the human readable reason in the body.
        let message = response.text().await.unwrap_or_default();
        return Err(Error::Status { code, message });
    }

    Ok(response)
}

// Sends a "request", awaits "response", and unwraps the "data" envelope
// into a deserializable type.
async fn send_and_parse_response<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, Error> {
    let envelope: ApiResponse<T> =
        send_and_check_ok(request).await?.json().await?;
    Ok(envelope.data)
}

fn parse_vm_id(data: &serde_json::Value) -> Result<VmId, Error> {
    let id = match data {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => {
            n.as_u64().and_then(|n| VmId::try_from(n).ok())
        }
        _ => None,
    };
    id.ok_or_else(|| Error::Response(format!("invalid VM id {}", data)))
}

impl Client {
    /// Creates a client for the API rooted at `base_url`, authenticating
    /// with an API token if one is given.
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        insecure: bool,
        log: Logger,
    ) -> Result<Client, Error> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut value =
                HeaderValue::from_str(&format!("PVEAPIToken={}", token))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(insecure)
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Client {
            client,
            log: log.new(o!("pve_client endpoint" => base_url.clone())),
            base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn vm_path(node: &str, id: VmId, rest: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", node, id, rest)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        info!(self.log, "GET request to {}", path);
        send_and_parse_response(self.client.get(self.url(path))).await
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), Error> {
        info!(self.log, "POST request to {}", path);
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }

        send_and_check_ok(request).await?;
        Ok(())
    }

    async fn put<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), Error> {
        info!(self.log, "PUT request to {}", path);
        let request = self.client.put(self.url(path)).json(body);

        send_and_check_ok(request).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        info!(self.log, "DELETE request to {}", path);
        send_and_check_ok(self.client.delete(self.url(path))).await?;
        Ok(())
    }

    /// Creates a VM on `node`.
    pub async fn create_vm(
        &self,
        node: &str,
        request: &VmCreateRequest,
    ) -> Result<(), Error> {
        self.post(&format!("/nodes/{}/qemu", node), Some(request)).await
    }

    /// Returns the current configuration of a VM.
    pub async fn get_vm(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<VmConfig, Error> {
        self.get(&Self::vm_path(node, id, "/config")).await
    }

    /// Applies a configuration change synchronously.
    pub async fn update_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmUpdateRequest,
    ) -> Result<(), Error> {
        self.put(&Self::vm_path(node, id, "/config"), request).await
    }

    pub async fn delete_vm(&self, node: &str, id: VmId) -> Result<(), Error> {
        self.delete(&Self::vm_path(node, id, "")).await
    }

    pub async fn get_vm_status(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<VmStatusResponse, Error> {
        self.get(&Self::vm_path(node, id, "/status/current")).await
    }

    pub async fn start_vm(&self, node: &str, id: VmId) -> Result<(), Error> {
        self.post::<()>(&Self::vm_path(node, id, "/status/start"), None).await
    }

    pub async fn shutdown_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmShutdownRequest,
    ) -> Result<(), Error> {
        self.post(&Self::vm_path(node, id, "/status/shutdown"), Some(request))
            .await
    }

    pub async fn reboot_vm(
        &self,
        node: &str,
        id: VmId,
        request: &VmRebootRequest,
    ) -> Result<(), Error> {
        self.post(&Self::vm_path(node, id, "/status/reboot"), Some(request))
            .await
    }

    /// Asks the cluster for the next free VM identifier.
    pub async fn next_vm_id(&self) -> Result<VmId, Error> {
        let data: serde_json::Value = self.get("/cluster/nextid").await?;
        parse_vm_id(&data)
    }

    /// Returns the network interfaces published by the guest agent.
    pub async fn agent_network_interfaces(
        &self,
        node: &str,
        id: VmId,
    ) -> Result<AgentNetworkInterfaces, Error> {
        self.get(&Self::vm_path(node, id, "/agent/network-get-interfaces"))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn status(code: u16, message: &str) -> Error {
        Error::Status { code, message: message.to_string() }
    }

    #[test]
    fn not_found_classification() {
        assert!(status(404, "").is_not_found());
        assert!(status(
            500,
            "Configuration file 'nodes/pve/qemu-server/100.conf' does not exist"
        )
        .is_not_found());
        assert!(!status(500, "VM is locked (backup)").is_not_found());
        assert!(!status(403, "does not exist").is_not_found());
        assert!(!Error::Response("does not exist".to_string()).is_not_found());
    }

    #[test]
    fn next_id_accepts_string_or_number() {
        assert_eq!(parse_vm_id(&json!("101")).unwrap(), 101);
        assert_eq!(parse_vm_id(&json!(102)).unwrap(), 102);
        assert!(parse_vm_id(&json!(null)).is_err());
        assert!(parse_vm_id(&json!("next")).is_err());
    }

    #[test]
    fn paths_are_rooted_at_base_url() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let client = Client::new(
            "https://pve.lab:8006/api2/json/",
            Some("ci@pve!token=secret"),
            true,
            log,
        )
        .unwrap();
        assert_eq!(
            client.url(&Client::vm_path("pve", 100, "/status/current")),
            "https://pve.lab:8006/api2/json/nodes/pve/qemu/100/status/current"
        );
    }

    #[test]
    fn bad_token_is_rejected() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let res = Client::new("https://pve", Some("bad\ntoken"), false, log);
        assert!(matches!(res, Err(Error::Token(_))));
    }
}
